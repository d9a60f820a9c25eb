//! Operator control commands and the carrier that routes them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::CommandError;

/// Value map key: first address of a read or write.
pub const START_ADDRESS: &str = "start_address";
/// Value map key: item count.
pub const LENGTH: &str = "length";
/// Value map key: written value(s), or hex PDU for passthrough.
pub const VALUE: &str = "value";

/// Default validity window of a carrier built by [`ControlCarrier::new`].
pub const DEFAULT_VALIDITY_MS: i64 = 10_000;

/// Most coils one fc 0x0F request may carry.
pub const MAX_WRITE_COILS: usize = 1968;
/// Most registers one fc 0x10 request may carry.
pub const MAX_WRITE_REGISTERS: usize = 123;

/// What kind of request a command turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdType {
    /// Read coils, discrete inputs, holding or input registers.
    CopyRead,
    /// Single or multiple coil/register write.
    Set,
    /// Hex PDU sent as-is.
    Passthrough,
}

/// A control command against one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperateCmd {
    /// Reply timeout; 0 uses the gateway default.
    #[serde(default)]
    pub timeout_ms: u64,

    pub cmd_type: CmdType,

    #[serde(default)]
    pub function_code: u8,

    #[serde(default)]
    pub value: HashMap<String, String>,
}

impl OperateCmd {
    fn new(cmd_type: CmdType, function_code: u8) -> Self {
        Self {
            timeout_ms: 0,
            cmd_type,
            function_code,
            value: HashMap::new(),
        }
    }

    fn with_value(mut self, key: &str, value: impl ToString) -> Self {
        self.value.insert(key.to_string(), value.to_string());
        self
    }

    /// Read `length` items starting at `start`.
    pub fn copy_read(function_code: u8, start: u16, length: u16) -> Self {
        Self::new(CmdType::CopyRead, function_code)
            .with_value(START_ADDRESS, start)
            .with_value(LENGTH, length)
    }

    /// Write one coil (fc 0x05, `0xFF00` = on) or one register (fc 0x06).
    pub fn set_single(function_code: u8, address: u16, value: u16) -> Self {
        Self::new(CmdType::Set, function_code)
            .with_value(START_ADDRESS, address)
            .with_value(VALUE, value)
    }

    /// Write consecutive coils (fc 0x0F).
    pub fn set_coils(address: u16, coils: &[bool]) -> Self {
        let bits: Vec<&str> = coils.iter().map(|c| if *c { "1" } else { "0" }).collect();
        Self::new(CmdType::Set, 0x0F)
            .with_value(START_ADDRESS, address)
            .with_value(VALUE, bits.join(","))
    }

    /// Write consecutive holding registers (fc 0x10).
    pub fn set_registers(address: u16, registers: &[u16]) -> Self {
        let values: Vec<String> = registers.iter().map(u16::to_string).collect();
        Self::new(CmdType::Set, 0x10)
            .with_value(START_ADDRESS, address)
            .with_value(LENGTH, registers.len())
            .with_value(VALUE, values.join(","))
    }

    /// Send a raw PDU (function code + data).
    pub fn passthrough(pdu: &[u8]) -> Self {
        Self::new(CmdType::Passthrough, pdu.first().copied().unwrap_or_default())
            .with_value(VALUE, hex::encode(pdu))
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Check the command is well formed without building a frame.
    pub fn validate(&self) -> Result<(), CommandError> {
        match (self.cmd_type, self.function_code) {
            (CmdType::CopyRead, 0x01..=0x04) => {
                self.start_address()?;
                self.length()?;
            }
            (CmdType::Set, 0x05 | 0x06) => {
                self.start_address()?;
                self.single_value()?;
            }
            (CmdType::Set, 0x0F) => {
                self.start_address()?;
                self.coil_bits()?;
            }
            (CmdType::Set, 0x10) => {
                self.start_address()?;
                self.register_values()?;
            }
            (CmdType::Passthrough, _) => {
                self.passthrough_pdu()?;
            }
            (_, fc) => return Err(CommandError::FunctionCode(fc)),
        }
        Ok(())
    }

    fn field(&self, key: &'static str) -> Result<&str, CommandError> {
        self.value
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or(CommandError::MissingValue(key))
    }

    pub fn start_address(&self) -> Result<u16, CommandError> {
        parse_u16(START_ADDRESS, self.field(START_ADDRESS)?)
    }

    pub fn length(&self) -> Result<u16, CommandError> {
        parse_u16(LENGTH, self.field(LENGTH)?)
    }

    pub fn single_value(&self) -> Result<u16, CommandError> {
        parse_u16(VALUE, self.field(VALUE)?)
    }

    /// Coil states packed most-significant-bit first, left-padded to a byte
    /// boundary, together with the coil count.
    pub fn coil_bits(&self) -> Result<(u16, Vec<u8>), CommandError> {
        let raw = self.field(VALUE)?;
        let mut bits = Vec::new();
        for item in raw.split(',') {
            match item.trim() {
                "0" => bits.push(false),
                "1" => bits.push(true),
                other => {
                    return Err(CommandError::InvalidValue {
                        field: VALUE,
                        value: other.to_string(),
                    });
                }
            }
        }

        let count = write_quantity(bits.len(), MAX_WRITE_COILS)?;

        let padding = (8 - bits.len() % 8) % 8;
        let padded: Vec<bool> = std::iter::repeat_n(false, padding).chain(bits).collect();
        let packed = padded
            .chunks(8)
            .map(|chunk| chunk.iter().fold(0u8, |acc, bit| (acc << 1) | *bit as u8))
            .collect();

        Ok((count, packed))
    }

    /// Register values as big-endian pairs with the register count. The
    /// declared length must equal the number of values.
    pub fn register_values(&self) -> Result<(u16, Vec<u8>), CommandError> {
        let declared = self.length()?;
        let values = self
            .field(VALUE)?
            .split(',')
            .map(|v| parse_u16(VALUE, v.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        if values.len() != declared as usize {
            return Err(CommandError::LengthMismatch {
                declared,
                actual: values.len(),
            });
        }
        write_quantity(values.len(), MAX_WRITE_REGISTERS)?;

        Ok((declared, values.iter().flat_map(|v| v.to_be_bytes()).collect()))
    }

    pub fn passthrough_pdu(&self) -> Result<Vec<u8>, CommandError> {
        let raw = self.field(VALUE)?;
        let pdu = hex::decode(raw.trim_start_matches("0x")).map_err(|_| {
            CommandError::InvalidValue {
                field: VALUE,
                value: raw.to_string(),
            }
        })?;
        if pdu.is_empty() {
            return Err(CommandError::MissingValue(VALUE));
        }
        Ok(pdu)
    }
}

/// The byte-count field of a multiple write is one byte wide, so the item
/// count must stay within `1..=max`.
fn write_quantity(count: usize, max: usize) -> Result<u16, CommandError> {
    if count == 0 || count > max {
        return Err(CommandError::WriteQuantity { count, max });
    }
    Ok(count as u16)
}

/// How a carrier names its target processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignType {
    Id,
    TableFlag,
}

impl SignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignType::Id => "id",
            SignType::TableFlag => "table_flag",
        }
    }
}

/// Envelope submitted to the task pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCarrier {
    pub unique_identifier: String,

    /// Extra attempts after the first failure.
    #[serde(default)]
    pub reply_size: u32,

    #[serde(default)]
    pub sign_type: Option<SignType>,

    #[serde(default)]
    pub sign: String,

    /// Unix epoch milliseconds.
    #[serde(default)]
    pub send_time: i64,

    /// Milliseconds after `send_time` the carrier stays valid.
    #[serde(default)]
    pub validity_period: i64,

    #[serde(default)]
    pub cmd: Option<OperateCmd>,
}

impl ControlCarrier {
    /// New carrier with a random identifier, stamped now, valid for
    /// [`DEFAULT_VALIDITY_MS`].
    pub fn new(cmd: OperateCmd) -> Self {
        Self {
            unique_identifier: Uuid::new_v4().to_string(),
            reply_size: 0,
            sign_type: None,
            sign: String::new(),
            send_time: chrono::Utc::now().timestamp_millis(),
            validity_period: DEFAULT_VALIDITY_MS,
            cmd: Some(cmd),
        }
    }

    pub fn by_device_id(mut self, id: impl Into<String>) -> Self {
        self.sign_type = Some(SignType::Id);
        self.sign = id.into();
        self
    }

    pub fn by_table_flag(mut self, table: impl Into<String>) -> Self {
        self.sign_type = Some(SignType::TableFlag);
        self.sign = table.into();
        self
    }

    pub fn with_reply_size(mut self, reply_size: u32) -> Self {
        self.reply_size = reply_size;
        self
    }

    /// Validate the envelope and its command at `now` (epoch millis).
    pub fn check(&self, now: i64) -> Result<&OperateCmd, CommandError> {
        if self.unique_identifier.trim().is_empty() {
            return Err(CommandError::MissingField("unique identifier"));
        }
        if self.sign_type.is_none() {
            return Err(CommandError::MissingField("sign type"));
        }
        if self.sign.trim().is_empty() {
            return Err(CommandError::MissingField("sign"));
        }
        let cmd = self
            .cmd
            .as_ref()
            .ok_or(CommandError::MissingField("command"))?;
        cmd.validate()?;

        if self.send_time > 0 && self.validity_period > 0 {
            let deadline = self.send_time.saturating_add(self.validity_period);
            if now > deadline {
                return Err(CommandError::Expired { deadline, now });
            }
        }
        Ok(cmd)
    }
}

/// Parse an unsigned 16-bit value, accepting `0x`, `0o` and `0b` prefixes.
fn parse_u16(field: &'static str, raw: &str) -> Result<u16, CommandError> {
    let lower = raw.to_ascii_lowercase();
    let parsed = if let Some(digits) = lower.strip_prefix("0x") {
        u16::from_str_radix(digits, 16)
    } else if let Some(digits) = lower.strip_prefix("0o") {
        u16::from_str_radix(digits, 8)
    } else if let Some(digits) = lower.strip_prefix("0b") {
        u16::from_str_radix(digits, 2)
    } else {
        lower.parse::<u16>()
    };
    parsed.map_err(|_| CommandError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carrier() -> ControlCarrier {
        ControlCarrier::new(OperateCmd::copy_read(0x03, 0, 4)).by_device_id("7")
    }

    #[test]
    fn test_expired_carrier() {
        let mut carrier = carrier();
        carrier.send_time = 1000;
        carrier.validity_period = 500;

        let err = carrier.check(2000).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Expired {
                deadline: 1500,
                now: 2000
            }
        ));
        assert!(carrier.check(1500).is_ok());
    }

    #[test]
    fn test_validity_skipped_without_times() {
        let mut carrier = carrier();
        carrier.send_time = 0;
        assert!(carrier.check(i64::MAX).is_ok());

        carrier.send_time = 1000;
        carrier.validity_period = 0;
        assert!(carrier.check(i64::MAX).is_ok());
    }

    #[test]
    fn test_missing_fields() {
        let mut c = carrier();
        c.unique_identifier.clear();
        assert!(matches!(
            c.check(0),
            Err(CommandError::MissingField("unique identifier"))
        ));

        let mut c = carrier();
        c.sign_type = None;
        assert!(matches!(c.check(0), Err(CommandError::MissingField("sign type"))));

        let mut c = carrier();
        c.sign = " ".into();
        assert!(matches!(c.check(0), Err(CommandError::MissingField("sign"))));

        let mut c = carrier();
        c.cmd = None;
        assert!(matches!(c.check(0), Err(CommandError::MissingField("command"))));
    }

    #[test]
    fn test_default_carrier() {
        let carrier = ControlCarrier::new(OperateCmd::copy_read(0x01, 0, 8))
            .by_table_flag("pumps")
            .with_reply_size(2);
        assert!(Uuid::parse_str(&carrier.unique_identifier).is_ok());
        assert_eq!(carrier.sign_type, Some(SignType::TableFlag));
        assert_eq!(carrier.validity_period, DEFAULT_VALIDITY_MS);
        assert_eq!(carrier.reply_size, 2);
    }

    #[test]
    fn test_prefixed_numbers() {
        let mut cmd = OperateCmd::copy_read(0x03, 0, 1);
        cmd.value.insert(START_ADDRESS.into(), "0x10".into());
        cmd.value.insert(LENGTH.into(), "0b101".into());
        assert_eq!(cmd.start_address().unwrap(), 16);
        assert_eq!(cmd.length().unwrap(), 5);

        cmd.value.insert(LENGTH.into(), "70000".into());
        assert!(matches!(
            cmd.length(),
            Err(CommandError::InvalidValue { field: LENGTH, .. })
        ));
    }

    #[test]
    fn test_coil_packing_msb_first_left_padded() {
        let cmd = OperateCmd::set_coils(0x13, &[true, false, true]);
        let (count, packed) = cmd.coil_bits().unwrap();
        assert_eq!(count, 3);
        assert_eq!(packed, vec![0b0000_0101]);

        let cmd = OperateCmd::set_coils(0, &[true; 9]);
        let (count, packed) = cmd.coil_bits().unwrap();
        assert_eq!(count, 9);
        assert_eq!(packed, vec![0b0000_0001, 0xFF]);
    }

    #[test]
    fn test_bad_coil_value() {
        let mut cmd = OperateCmd::set_coils(0, &[true]);
        cmd.value.insert(VALUE.into(), "1,2".into());
        assert!(matches!(cmd.validate(), Err(CommandError::InvalidValue { .. })));
    }

    #[test]
    fn test_register_values_length_must_match() {
        let cmd = OperateCmd::set_registers(1, &[0x000A, 0x0102]);
        let (count, data) = cmd.register_values().unwrap();
        assert_eq!(count, 2);
        assert_eq!(data, vec![0x00, 0x0A, 0x01, 0x02]);

        let mut cmd = cmd;
        cmd.value.insert(LENGTH.into(), "3".into());
        assert!(matches!(
            cmd.validate(),
            Err(CommandError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_write_quantity_limits() {
        let (count, packed) = OperateCmd::set_coils(0, &[true; MAX_WRITE_COILS])
            .coil_bits()
            .unwrap();
        assert_eq!(count as usize, MAX_WRITE_COILS);
        assert_eq!(packed.len(), 246);
        assert!(matches!(
            OperateCmd::set_coils(0, &[true; MAX_WRITE_COILS + 1]).validate(),
            Err(CommandError::WriteQuantity { count: 1969, max: 1968 })
        ));

        let (count, data) = OperateCmd::set_registers(0, &[7; MAX_WRITE_REGISTERS])
            .register_values()
            .unwrap();
        assert_eq!(count as usize, MAX_WRITE_REGISTERS);
        assert_eq!(data.len(), 246);
        assert!(matches!(
            OperateCmd::set_registers(0, &[7; MAX_WRITE_REGISTERS + 1]).validate(),
            Err(CommandError::WriteQuantity { count: 124, max: 123 })
        ));
    }

    #[test]
    fn test_function_code_must_fit_type() {
        let mut cmd = OperateCmd::copy_read(0x03, 0, 1);
        cmd.function_code = 0x06;
        assert!(matches!(cmd.validate(), Err(CommandError::FunctionCode(0x06))));
    }

    #[test]
    fn test_passthrough() {
        let cmd = OperateCmd::passthrough(&[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(cmd.value[VALUE], "0300000001");
        assert_eq!(cmd.passthrough_pdu().unwrap(), vec![3, 0, 0, 0, 1]);

        let mut cmd = cmd;
        cmd.value.insert(VALUE.into(), "zz".into());
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_carrier_json() {
        let json = r#"{
            "unique_identifier": "abc",
            "reply_size": 1,
            "sign_type": "table_flag",
            "sign": "pumps",
            "cmd": {
                "cmd_type": "set",
                "function_code": 6,
                "value": { "start_address": "0x0001", "value": "3" }
            }
        }"#;
        let carrier: ControlCarrier = serde_json::from_str(json).unwrap();
        let cmd = carrier.check(0).unwrap();
        assert_eq!(cmd.single_value().unwrap(), 3);
        assert_eq!(carrier.sign_type, Some(SignType::TableFlag));
    }
}
