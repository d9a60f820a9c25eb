//! Configuration loading for gateway binaries.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{FrameworkError, Result};
use crate::{Format, LoggingConfig, ZenohConfig};

/// Implemented by a gateway's top-level configuration.
///
/// ```ignore
/// impl GatewayConfig for MyConfig {
///     fn zenoh(&self) -> &ZenohConfig { &self.zenoh }
///     fn logging(&self) -> &LoggingConfig { &self.logging }
///     fn key_prefix(&self) -> &str { &self.gateway.key_prefix }
/// }
///
/// let config = MyConfig::load("gateway.json5")?;
/// ```
pub trait GatewayConfig: Sized + DeserializeOwned {
    fn zenoh(&self) -> &ZenohConfig;

    fn logging(&self) -> &LoggingConfig;

    /// Prefix of every key expression the gateway publishes on.
    fn key_prefix(&self) -> &str;

    /// Wire format for telemetry payloads.
    fn format(&self) -> Format {
        Format::Json
    }

    /// Called after loading.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load a JSON5 file and validate it.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(FrameworkError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse JSON5 text and validate it.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.zenoh().validate()?;
        fieldgate_common::validate_prefix(config.key_prefix())?;
        config.validate()?;
        Ok(config)
    }
}
