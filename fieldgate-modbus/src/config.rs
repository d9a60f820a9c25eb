//! Configuration for the Modbus gateway.
//!
//! ```json5
//! {
//!   zenoh: { mode: "peer" },
//!   logging: { level: "info" },
//!   gateway: {
//!     key_prefix: "fieldgate/modbus",
//!     poll_interval_ms: 2000,
//!     devices: [
//!       { id: "plc1", interface_type: "tcp_client", protocol_type: "modbus_tcp",
//!         address: "10.0.0.5:502", table: "boiler" },
//!     ],
//!     points: [
//!       { id: "p1", device_id: "plc1", tag: "supply_temp", function_code: 3,
//!         address: 0, data_type: "int16", multiplier: 0.1 },
//!     ],
//!   },
//! }
//! ```

use fieldgate_common::{Format, KEY_PREFIX, LoggingConfig, ZenohConfig};
use fieldgate_framework::{FrameworkError, GatewayConfig, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::codec::is_read;
use crate::connector::ConnectorOptions;
use crate::inventory::MemoryInventory;
use crate::model::{CollectionRule, Device, Point};
use crate::registry::{CodecOptions, MODBUS_RTU};
use crate::task::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusGatewayConfig {
    #[serde(default)]
    pub zenoh: ZenohConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub serialization: Format,

    /// Pause between two poll requests of one device.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Poll requests in flight per TCP link.
    #[serde(default = "default_correlation_capacity")]
    pub correlation_capacity: usize,

    #[serde(default = "default_transaction_id_wrap")]
    pub transaction_id_wrap: u16,

    /// Consecutive serial timeouts before the port is reopened.
    #[serde(default = "default_serial_failure_threshold")]
    pub serial_failure_threshold: u32,

    /// Reply timeout for commands that carry none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub points: Vec<Point>,

    #[serde(default)]
    pub rules: Vec<CollectionRule>,
}

fn default_key_prefix() -> String {
    KEY_PREFIX.to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_correlation_capacity() -> usize {
    50
}

fn default_transaction_id_wrap() -> u16 {
    0xFFFF
}

fn default_serial_failure_threshold() -> u32 {
    6
}

fn default_timeout_ms() -> u64 {
    5000
}

impl GatewaySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions {
            queue_capacity: self.correlation_capacity,
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            failure_threshold: self.serial_failure_threshold,
        }
    }

    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            transaction_wrap: self.transaction_id_wrap,
        }
    }

    pub fn inventory(&self) -> MemoryInventory {
        MemoryInventory::new(self.devices.clone(), self.points.clone(), self.rules.clone())
    }

    fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(FrameworkError::validation(
                "At least one device must be configured",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(FrameworkError::validation("poll_interval_ms must be positive"));
        }
        if self.correlation_capacity == 0 {
            return Err(FrameworkError::validation(
                "correlation_capacity must be positive",
            ));
        }
        if self.transaction_id_wrap == 0 {
            return Err(FrameworkError::validation(
                "transaction_id_wrap must be positive",
            ));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            validate_device(device)?;
            if !ids.insert(device.id.as_str()) {
                return Err(FrameworkError::validation(format!(
                    "Device id '{}' is used twice",
                    device.id
                )));
            }
        }

        let mut tags = HashSet::new();
        for point in &self.points {
            if !ids.contains(point.device_id.as_str()) {
                return Err(FrameworkError::validation(format!(
                    "Point '{}' references unknown device '{}'",
                    point.id, point.device_id
                )));
            }
            if !is_read(point.function_code) {
                return Err(FrameworkError::validation(format!(
                    "Point '{}': function code {} cannot be polled",
                    point.id, point.function_code
                )));
            }
            if !tags.insert((point.device_id.as_str(), point.tag.as_str())) {
                return Err(FrameworkError::validation(format!(
                    "Point tag '{}' is used twice on device '{}'",
                    point.tag, point.device_id
                )));
            }
        }

        for rule in &self.rules {
            if !ids.contains(rule.device_id.as_str()) {
                return Err(FrameworkError::validation(format!(
                    "Collection rule '{}' references unknown device '{}'",
                    rule.id, rule.device_id
                )));
            }
        }
        Ok(())
    }
}

fn validate_device(device: &Device) -> Result<()> {
    if device.id.trim().is_empty() {
        return Err(FrameworkError::validation("Device id cannot be empty"));
    }
    if device.address.trim().is_empty() {
        return Err(FrameworkError::validation(format!(
            "Device '{}': address cannot be empty",
            device.id
        )));
    }
    if device.protocol_type.eq_ignore_ascii_case(MODBUS_RTU)
        && !(1..=247).contains(&device.device_address)
    {
        return Err(FrameworkError::validation(format!(
            "Device '{}': slave id must be 1-247",
            device.id
        )));
    }
    if !(5..=8).contains(&device.data_bits) {
        return Err(FrameworkError::validation(format!(
            "Device '{}': data bits must be 5-8",
            device.id
        )));
    }
    if !matches!(device.stop_bits, 1 | 2) {
        return Err(FrameworkError::validation(format!(
            "Device '{}': stop bits must be 1 or 2",
            device.id
        )));
    }
    match device.parity.to_ascii_uppercase().as_str() {
        "N" | "NONE" | "E" | "EVEN" | "O" | "ODD" | "M" | "MARK" | "S" | "SPACE" => Ok(()),
        other => Err(FrameworkError::validation(format!(
            "Device '{}': invalid parity '{}'",
            device.id, other
        ))),
    }
}

impl GatewayConfig for ModbusGatewayConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.gateway.key_prefix
    }

    fn format(&self) -> Format {
        self.gateway.serialization
    }

    fn validate(&self) -> Result<()> {
        self.gateway.validate()
    }
}
