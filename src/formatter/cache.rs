use std::sync::Arc;

use crate::cache::AsyncCache;
use crate::error::Result;

use super::{CompiledFormatter, Direction, FormatterKey, FormatterResolver};

/// Process-wide compiled formatters keyed by direction and application id.
///
/// Successful compiles are kept for the life of the process; failures are
/// not remembered, so a corrected formatter is picked up on the next call.
pub struct FormatterCache {
    resolver: FormatterResolver,
    formatters: AsyncCache<FormatterKey, Arc<CompiledFormatter>>,
}

impl FormatterCache {
    pub fn new(resolver: FormatterResolver) -> Self {
        Self {
            resolver,
            formatters: AsyncCache::new(),
        }
    }

    pub async fn get(
        &self,
        direction: Direction,
        application_id: u16,
    ) -> Result<Arc<CompiledFormatter>> {
        let key = FormatterKey::new(direction, application_id);
        self.formatters
            .get_or_try_insert_with(key, || async move {
                self.resolver.resolve(key).await.map(Arc::new)
            })
            .await
    }

    pub async fn uplink(&self, application_id: u16) -> Result<Arc<CompiledFormatter>> {
        self.get(Direction::Uplink, application_id).await
    }

    pub async fn downlink(&self, application_id: u16) -> Result<Arc<CompiledFormatter>> {
        self.get(Direction::Downlink, application_id).await
    }

    pub fn len(&self) -> usize {
        self.formatters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formatters.is_empty()
    }
}
