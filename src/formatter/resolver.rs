use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{ConnectorError, Result};

use super::{CompiledFormatter, FormatterKey, FormatterSource};

/// Locates and compiles the formatter for a key, falling back to the
/// configured default for its direction.
#[derive(Clone)]
pub struct FormatterResolver {
    source: Arc<dyn FormatterSource>,
}

impl FormatterResolver {
    pub fn new(source: Arc<dyn FormatterSource>) -> Self {
        Self { source }
    }

    pub async fn resolve(&self, key: FormatterKey) -> Result<CompiledFormatter> {
        let source = match self.source.load(key).await? {
            Some(source) => source,
            None => {
                debug!(
                    "No {} formatter for application {}, using default",
                    key.direction, key.application_id
                );
                self.source
                    .load_default(key.direction)
                    .await?
                    .ok_or(ConnectorError::FormatterNotFound {
                        direction: key.direction,
                        application_id: key.application_id,
                    })?
            }
        };

        CompiledFormatter::compile(key.direction, source.name.as_str(), &source.text).inspect_err(
            |e| {
                error!(
                    application_id = key.application_id,
                    "Formatter compile failed: {}", e
                );
            },
        )
    }
}
