//! Fieldgate common library
//!
//! Shared pieces used by the gateway runtime and the Modbus core:
//!
//! - [`telemetry`] - Published value model (`TelemetryPoint`, `TelemetryValue`)
//! - [`serialization`] - JSON/CBOR encoding and decoding
//! - [`config`] - JSON5 configuration loading, Zenoh and logging sections
//! - [`session`] - Zenoh session management
//! - [`keyexpr`] - Key expression builder
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod keyexpr;
pub mod serialization;
pub mod session;
pub mod telemetry;

pub use config::{LogFormat, LoggingConfig, ZenohConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use keyexpr::{KEY_PREFIX, KeyExprBuilder, sanitize_segment, validate_prefix};
pub use serialization::{Format, decode, encode};
pub use session::connect;
pub use telemetry::{TelemetryPoint, TelemetryValue, current_timestamp_millis};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` wins over the configured level when it is set.
///
/// ```ignore
/// use fieldgate_common::{LoggingConfig, LogFormat, init_tracing};
///
/// init_tracing(&LoggingConfig { level: "debug".into(), format: LogFormat::Json })?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
