//! Device, point and collection-rule records.
//!
//! These rows come from the configuration store. They are read-only while a
//! task processor runs; changing one means rebuilding the processor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// A field device reachable over TCP or a serial line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub code: String,

    /// Table flag, an alternative routing key for control commands.
    #[serde(default)]
    pub table: String,

    /// Cut-in flag. Disabled devices are neither polled nor controlled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Transport, resolved through the connector registry
    /// ("tcp_client", "tcp_client_reuse", "serial").
    pub interface_type: String,

    /// Wire protocol, resolved through the codec registry
    /// ("modbus_tcp", "modbus_rtu").
    pub protocol_type: String,

    /// `host:port` for TCP, device path for serial.
    pub address: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// "N", "E", "O", "M", "S" or the spelled-out names.
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Modbus slave / unit id.
    #[serde(default = "default_device_address")]
    pub device_address: u8,

    /// Per-read deadline in milliseconds, 0 disables it.
    #[serde(default)]
    pub read_timeout_ms: u64,

    /// Per-write deadline in milliseconds, 0 uses the gateway default.
    #[serde(default)]
    pub write_timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_device_address() -> u8 {
    1
}

impl Device {
    /// Identity used in logs and link events: `id_name_code`.
    pub fn identifier(&self) -> String {
        format!("{}_{}_{}", self.id, self.name, self.code)
    }

    /// Bits on the wire per byte: start + data + parity + stop.
    pub fn bits_per_byte(&self) -> u32 {
        let parity = match self.parity.to_ascii_uppercase().as_str() {
            "N" | "NONE" | "" => 0,
            _ => 1,
        };
        1 + self.data_bits as u32 + parity + self.stop_bits as u32
    }
}

/// A measurement point read from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: String,

    pub device_id: String,

    /// Key of the value in decoded telemetry maps.
    pub tag: String,

    pub function_code: u8,

    pub address: u16,

    pub data_type: DataType,

    /// Element count for arrays, byte count for strings.
    #[serde(default = "default_length")]
    pub length: u16,

    #[serde(default)]
    pub endianness: Endianness,

    #[serde(default)]
    pub bit_calculation: BitCalculation,

    #[serde(default)]
    pub start_bit: u8,

    #[serde(default)]
    pub end_bit: u8,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default)]
    pub offset: f64,

    /// Numeric transform applied last, with the value bound to `value`.
    #[serde(default)]
    pub expression: Option<String>,

    #[serde(default)]
    pub priority: u8,

    #[serde(default)]
    pub unit: Option<String>,
}

fn default_length() -> u16 {
    1
}

fn default_multiplier() -> f64 {
    1.0
}

impl Point {
    /// Bytes this point occupies in a response payload whose items are
    /// `item_width` bytes wide. A bit point takes one whole item.
    pub fn byte_len(&self, item_width: usize) -> usize {
        let length = self.length.max(1) as usize;
        match self.data_type {
            DataType::Bit => item_width.max(1),
            DataType::Scalar(kind) => kind.width(),
            DataType::Array(kind) => kind.width() * length,
            DataType::String => length,
        }
    }

    /// Addresses this point spans, given the protocol item width in bytes.
    pub fn extent(&self, item_width: usize) -> u16 {
        let width = item_width.max(1);
        self.byte_len(width).div_ceil(width).max(1) as u16
    }
}

/// Explicit batch boundaries for one function code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRule {
    #[serde(default)]
    pub id: String,

    pub device_id: String,

    pub function_code: u8,

    /// Inclusive.
    pub start: u16,

    /// Inclusive.
    pub end: u16,
}

/// Fixed-width numeric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Int8,
    Byte,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl ScalarType {
    pub fn width(&self) -> usize {
        match self {
            ScalarType::Int8 | ScalarType::Byte => 1,
            ScalarType::Int16 | ScalarType::Uint16 => 2,
            ScalarType::Int32 | ScalarType::Uint32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::Uint64 | ScalarType::Float64 => 8,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarType::Int8 => "int8",
            ScalarType::Byte => "byte",
            ScalarType::Int16 => "int16",
            ScalarType::Uint16 => "uint16",
            ScalarType::Int32 => "int32",
            ScalarType::Uint32 => "uint32",
            ScalarType::Int64 => "int64",
            ScalarType::Uint64 => "uint64",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
        }
    }
}

impl FromStr for ScalarType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "int8" => ScalarType::Int8,
            "byte" | "uint8" => ScalarType::Byte,
            "int16" => ScalarType::Int16,
            "uint16" => ScalarType::Uint16,
            "int32" => ScalarType::Int32,
            "uint32" => ScalarType::Uint32,
            "int64" => ScalarType::Int64,
            "uint64" => ScalarType::Uint64,
            "float32" | "float" => ScalarType::Float32,
            "float64" | "double" => ScalarType::Float64,
            _ => return Err(DecodeError::UnsupportedDataType(s.to_string())),
        })
    }
}

/// Declared type of a point, written as `"uint16"`, `"float32[]"`, `"bit"`,
/// `"string"` in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Bit,
    Scalar(ScalarType),
    Array(ScalarType),
    String,
}

impl FromStr for DataType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "bit" | "bool" => Ok(DataType::Bit),
            "string" => Ok(DataType::String),
            other => match other.strip_suffix("[]") {
                Some(element) => element
                    .parse()
                    .map(DataType::Array)
                    .map_err(|_| DecodeError::UnsupportedDataType(s.to_string())),
                None => other.parse().map(DataType::Scalar),
            },
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bit => f.write_str("bit"),
            DataType::String => f.write_str("string"),
            DataType::Scalar(kind) => f.write_str(kind.as_str()),
            DataType::Array(kind) => write!(f, "{}[]", kind.as_str()),
        }
    }
}

/// Byte order of a multi-byte window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

impl FromStr for Endianness {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "big" | "" => Ok(Endianness::Big),
            "little" => Ok(Endianness::Little),
            _ => Err(DecodeError::UnsupportedEndianness(s.to_string())),
        }
    }
}

impl TryFrom<String> for Endianness {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endianness> for String {
    fn from(value: Endianness) -> Self {
        match value {
            Endianness::Big => "big".to_string(),
            Endianness::Little => "little".to_string(),
        }
    }
}

/// How bits are carved out of the raw integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitCalculation {
    #[default]
    All,
    Single,
    Multiple,
}
