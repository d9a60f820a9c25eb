//! Modbus RTU/TCP telemetry and control gateway.
//!
//! Devices, points and collection rules come from an [`inventory`]. For each
//! enabled device a [`task::TaskProcessor`] opens a [`connector`], cycles its
//! poll groups (built by the [`scheduler`]) and hands decoded values to the
//! registered callbacks. Control commands arrive as
//! [`command::ControlCarrier`]s and are routed by the [`task::TaskPool`].
//!
//! # Key Expressions
//!
//! ```text
//! fieldgate/modbus/<device>/<tag>          telemetry
//! fieldgate/modbus/@/alive/<device>        liveliness, while linked
//! fieldgate/modbus/@/health                link health
//! fieldgate/modbus/@/status                heartbeat
//! fieldgate/modbus/@/commands/control      control queryable
//! ```

pub mod binder;
pub mod codec;
pub mod command;
pub mod config;
pub mod connector;
pub mod correlation;
pub mod decoder;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod script;
pub mod snapshot;
pub mod task;

pub use command::{ControlCarrier, OperateCmd, SignType};
pub use config::ModbusGatewayConfig;
pub use connector::{Connector, ConnectorOptions};
pub use error::{
    CodecError, CommandError, ConnectorError, ControlError, DecodeError, PoolError,
    ProcessorError, RegistryError,
};
pub use inventory::{Inventory, MemoryInventory};
pub use model::{CollectionRule, Device, Point};
pub use registry::{CodecOptions, Registry};
pub use task::{CallbackSet, RetryPolicy, TaskPool, TaskProcessor};
