//! Error types for the gateway core.

use std::io;
use thiserror::Error;

/// Framing and protocol faults. The stream resynchronizes and drops the frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protocol id {0:#06x} is not Modbus")]
    ProtocolId(u16),

    #[error("unexpected unit id {actual} (expected {expected})")]
    UnitId { expected: u8, actual: u8 },

    #[error("unsupported function code {0:#04x}")]
    FunctionCode(u8),

    #[error("declared length {declared} does not match {actual} payload bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("CRC mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    Crc { received: u16, computed: u16 },

    #[error("slave id {0} is outside 1..=247")]
    SlaveId(u8),

    #[error("response does not echo the request: {0}")]
    EchoMismatch(String),

    #[error("point group is empty")]
    EmptyGroup,

    #[error("point group spans {0} items, more than one request can carry")]
    GroupTooLarge(usize),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Faults turning raw bytes into a typed point value.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("need {needed} bytes at offset {offset}, response has {available}")]
    InsufficientData {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported endianness {0:?}")]
    UnsupportedEndianness(String),

    #[error("unsupported data type {0:?}")]
    UnsupportedDataType(String),

    #[error("bit {bit} is outside a {width}-bit value")]
    BitOutOfRange { bit: u8, width: usize },

    #[error("start bit {start} is after end bit {end}")]
    InvalidBitRange { start: u8, end: u8 },

    #[error("point {tag} sits before the group start address")]
    AddressBeforeGroup { tag: String },

    #[error("expression {expression:?} failed: {message}")]
    Script { expression: String, message: String },
}

/// Malformed control commands, rejected before any I/O.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("missing command value {0:?}")]
    MissingValue(&'static str),

    #[error("invalid value {value:?} for {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("function code {0:#04x} is not valid for this command")]
    FunctionCode(u8),

    #[error("declared length {declared} does not match {actual} values")]
    LengthMismatch { declared: u16, actual: usize },

    #[error("{count} items in one write, at most {max} allowed")]
    WriteQuantity { count: usize, max: usize },

    #[error("carrier is missing {0}")]
    MissingField(&'static str),

    #[error("carrier expired at {deadline} (now {now})")]
    Expired { deadline: i64, now: i64 },
}

/// Transport faults, timeouts, and device exceptions.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("connector is not linked")]
    NotLinked,

    #[error("reply channel closed before a response arrived")]
    Closed,

    #[error("device answered function {function:#04x} with exception code {code:#04x}")]
    Exception { function: u8, code: u8 },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid transport setting: {0}")]
    Setting(String),
}

impl ConnectorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectorError::DeadlineExceeded)
    }
}

/// Unknown interface or protocol names at construction.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown interface type {0:?}")]
    UnknownInterface(String),

    #[error("unknown protocol type {0:?}")]
    UnknownProtocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("device {0} is not linked")]
    NotLinked(String),

    #[error("device {0} has no points to poll")]
    NoPoints(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no task processor for {sign_type} {sign:?}")]
    NotFound { sign_type: String, sign: String },

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Faults answering a control query.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed control carrier: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}
