//! Start-up: hive login and optional connection pre-warm

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::hive::HiveApi;
use crate::iot::{DeviceConnectionCache, DeviceContext};

pub struct StartupService {
    hive: Arc<dyn HiveApi>,
    connections: Arc<DeviceConnectionCache>,
    organisation_id: u32,
    prewarm: bool,
}

impl StartupService {
    pub fn new(
        hive: Arc<dyn HiveApi>,
        connections: Arc<DeviceConnectionCache>,
        organisation_id: u32,
        prewarm: bool,
    ) -> Self {
        Self {
            hive,
            connections,
            organisation_id,
            prewarm,
        }
    }

    /// Log in, then open a connection for every hive device if pre-warm is
    /// on. Returns how many connections were opened.
    pub async fn run(&self, cancel: CancellationToken) -> Result<usize> {
        self.hive.login().await?;
        if !self.prewarm {
            return Ok(0);
        }

        let devices = self.hive.device_list().await?;
        info!("Pre-warming connections for {} devices", devices.len());

        let mut opened = 0;
        for device in devices {
            if cancel.is_cancelled() {
                info!("Pre-warm cancelled after {} connections", opened);
                break;
            }

            let context = DeviceContext {
                organisation_id: self.organisation_id,
                device_id: device.device_id,
                device_type: device.device_type,
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Pre-warm cancelled after {} connections", opened);
                    break;
                }
                result = self.connections.get_or_add(&context) => result,
            };

            match result {
                Ok(_) => opened += 1,
                Err(e) => warn!(
                    device_id = device.device_id,
                    device_type = device.device_type,
                    "Pre-warm connect failed: {}",
                    e
                ),
            }
        }

        info!("Pre-warm opened {} connections", opened);
        Ok(opened)
    }
}
