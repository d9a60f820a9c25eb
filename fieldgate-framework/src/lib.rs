//! fieldgate gateway framework
//!
//! Runtime plumbing shared by gateway binaries:
//!
//! - [`GatewayArgs`] for command-line parsing
//! - [`GatewayConfig`] for JSON5 loading and validation
//! - [`GatewayRunner`] for logging, the Zenoh session, workers and shutdown
//! - [`Publisher`] for telemetry
//! - [`StatusPublisher`] for the status heartbeat
//! - [`LivelinessManager`] and [`GatewayHealth`] for per-device link state

mod args;
mod config;
mod error;
mod health;
mod liveliness;
mod publisher;
mod runner;
mod status;

pub use args::GatewayArgs;
pub use config::GatewayConfig;
pub use error::{FrameworkError, Result};
pub use health::{DeviceHealth, DeviceStatus, GatewayHealth, HealthSnapshot};
pub use liveliness::LivelinessManager;
pub use publisher::{PublishStats, Publisher};
pub use runner::{GatewayRunner, shutdown_signal};
pub use status::{DEFAULT_HEARTBEAT, GatewayStatus, MetadataFn, StatusPublisher};

pub use fieldgate_common::{
    Format, KeyExprBuilder, LoggingConfig, TelemetryPoint, TelemetryValue, ZenohConfig,
};
