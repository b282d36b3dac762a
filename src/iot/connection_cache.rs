use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::AsyncCache;
use crate::error::Result;

use super::{ConnectionFactory, DeviceConnection, DeviceContext};

/// Live device connections keyed by device id.
///
/// Concurrent requests for one device share a single connect; an entry is
/// only dropped by invalidation after a send against it has failed.
pub struct DeviceConnectionCache {
    factory: Arc<dyn ConnectionFactory>,
    connections: AsyncCache<u32, Arc<dyn DeviceConnection>>,
}

impl DeviceConnectionCache {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            connections: AsyncCache::new(),
        }
    }

    pub async fn get_or_add(&self, context: &DeviceContext) -> Result<Arc<dyn DeviceConnection>> {
        self.connections
            .get_or_try_insert_with(context.device_id, || async move {
                debug!(device_id = context.device_id, "No cached connection, connecting");
                self.factory.connect(context).await
            })
            .await
    }

    /// Drop the cached connection for `device_id`, whatever it is. A connect
    /// still in progress is not interrupted.
    pub async fn invalidate(&self, device_id: u32) {
        if let Some(connection) = self.connections.invalidate(&device_id) {
            info!(device_id, "Connection invalidated");
            connection.close().await;
        }
    }

    /// Drop `failed` from the cache unless it has already been replaced.
    pub async fn invalidate_connection(&self, failed: &Arc<dyn DeviceConnection>) {
        let device_id = failed.device_id();
        if let Some(connection) = self
            .connections
            .invalidate_if(&device_id, |current| Arc::ptr_eq(current, failed))
        {
            info!(device_id, "Connection invalidated");
            connection.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
