//! Modbus framing.
//!
//! A codec turns a PDU (function code + data) into a transport frame and
//! back. [`rtu`] frames with slave id and CRC, [`tcp`] with an MBAP header.
//! Request building, response echo checks and coil expansion are shared.

pub mod crc;
pub mod rtu;
pub mod tcp;

use bytes::BytesMut;
use std::fmt;

use crate::command::{CmdType, OperateCmd};
use crate::error::{CodecError, CommandError, ConnectorError};
use crate::snapshot::PointGroup;

pub use rtu::ModbusRtuCodec;
pub use tcp::{ModbusTcpCodec, TransactionSequence};

/// Most coils or registers one read request may ask for.
pub const MAX_READ_QUANTITY: u16 = 125;

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const EXCEPTION_FLAG: u8 = 0x80;

/// One inbound frame, split from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Correlation key (TCP: transaction id as hex).
    pub key: String,
    /// Function code with the exception flag cleared.
    pub function_code: u8,
    /// Hex of the whole frame, for logs.
    pub trace: String,
    /// Read data (coils exploded to one byte per bit), or the echoed
    /// address/value of a write.
    pub payload: Vec<u8>,
    /// Bytes per protocol item in `payload`.
    pub item_width: usize,
    /// Exception code when the device rejected the request.
    pub exception: Option<u8>,
}

impl DecodedFrame {
    /// Turn an exception response into an error.
    pub fn into_result(self) -> Result<Self, ConnectorError> {
        match self.exception {
            Some(code) => Err(ConnectorError::Exception {
                function: self.function_code,
                code,
            }),
            None => Ok(self),
        }
    }
}

/// Encoder/decoder for one wire protocol.
///
/// Instances are cheap to [`copy`](ProtocolCodec::copy); each concurrent user
/// (poll loop, decode loop, one control command) works on its own copy.
pub trait ProtocolCodec: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Frame a PDU, returning the correlation key and the bytes to send.
    fn encode(&mut self, pdu: &[u8]) -> (String, Vec<u8>);

    /// Split one frame off the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed. On error the buffer has been
    /// advanced past the bad data and the caller may try again.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedFrame>, CodecError>;

    /// The PDU inside a frame this codec produced.
    fn request_pdu<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]>;

    /// Key of the last frame encoded by this instance.
    fn key(&self) -> Option<&str>;

    fn copy(&self) -> Box<dyn ProtocolCodec>;

    /// Build the frame for an operator command.
    fn opt(&mut self, cmd: &OperateCmd) -> Result<(String, Vec<u8>), CodecError> {
        let pdu = command_pdu(cmd)?;
        Ok(self.encode(&pdu))
    }

    /// Build the read request covering a point group.
    fn build_by_snap(&mut self, group: &PointGroup) -> Result<(String, Vec<u8>), CodecError> {
        let pdu = group_pdu(group)?;
        Ok(self.encode(&pdu))
    }

    /// Check a write response echoes what `frame` asked for.
    fn check_resp(&self, frame: &[u8], resp: &[u8]) -> Result<(), CodecError> {
        let pdu = self
            .request_pdu(frame)
            .ok_or_else(|| CodecError::EchoMismatch("request frame too short".to_string()))?;
        check_echo(pdu, resp)
    }
}

pub fn is_read(function_code: u8) -> bool {
    matches!(function_code, READ_COILS..=READ_INPUT_REGISTERS)
}

pub fn is_bit_read(function_code: u8) -> bool {
    matches!(function_code, READ_COILS | READ_DISCRETE_INPUTS)
}

pub fn is_write(function_code: u8) -> bool {
    matches!(
        function_code,
        WRITE_SINGLE_COIL | WRITE_SINGLE_REGISTER | WRITE_MULTIPLE_COILS | WRITE_MULTIPLE_REGISTERS
    )
}

/// Bytes per item in a decoded read payload: coils and discrete inputs are
/// exploded to one byte each, registers are two bytes.
pub fn item_width(function_code: u8) -> usize {
    if is_bit_read(function_code) { 1 } else { 2 }
}

/// Split a function code into its base code and the exception flag.
pub(crate) fn split_exception(function_code: u8) -> (u8, bool) {
    (
        function_code & !EXCEPTION_FLAG,
        function_code & EXCEPTION_FLAG != 0,
    )
}

pub(crate) fn is_supported(function_code: u8) -> bool {
    let (base, _) = split_exception(function_code);
    is_read(base) || is_write(base)
}

/// Expand packed coil bytes to one 0/1 byte per coil. Bit 0 of the first byte
/// is the coil at the start address.
pub fn explode_bits(data: &[u8]) -> Vec<u8> {
    data.iter()
        .flat_map(|byte| (0..8).map(move |bit| (byte >> bit) & 1))
        .collect()
}

/// Turn a response PDU into a [`DecodedFrame`] payload.
pub(crate) fn response_payload(
    function_code: u8,
    body: &[u8],
) -> Result<(Vec<u8>, usize, Option<u8>), CodecError> {
    let (base, exception) = split_exception(function_code);
    if exception {
        let code = body.first().copied().unwrap_or_default();
        return Ok((body.to_vec(), 1, Some(code)));
    }

    if is_read(base) {
        let declared = body.first().copied().unwrap_or_default() as usize;
        let data = body.get(1..).unwrap_or_default();
        if data.len() != declared {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }
        if is_bit_read(base) {
            return Ok((explode_bits(data), 1, None));
        }
        return Ok((data.to_vec(), 2, None));
    }

    if is_write(base) {
        if body.len() != 4 {
            return Err(CodecError::LengthMismatch {
                declared: 4,
                actual: body.len(),
            });
        }
        return Ok((body.to_vec(), 1, None));
    }

    Err(CodecError::FunctionCode(function_code))
}

/// Read request for a point group.
pub fn group_pdu(group: &PointGroup) -> Result<Vec<u8>, CodecError> {
    let function_code = group.function_code();
    if !is_read(function_code) {
        return Err(CodecError::FunctionCode(function_code));
    }
    if group.is_empty() {
        return Err(CodecError::EmptyGroup);
    }
    let quantity = group.quantity();
    if quantity > u32::from(MAX_READ_QUANTITY) {
        return Err(CodecError::GroupTooLarge(quantity as usize));
    }
    Ok(read_pdu(function_code, group.start(), quantity as u16))
}

fn read_pdu(function_code: u8, start: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function_code);
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// PDU for an operator command. Validation faults surface before any I/O.
pub fn command_pdu(cmd: &OperateCmd) -> Result<Vec<u8>, CodecError> {
    let function_code = cmd.function_code;
    match cmd.cmd_type {
        CmdType::Passthrough => Ok(cmd.passthrough_pdu()?),
        CmdType::CopyRead => {
            if !is_read(function_code) {
                return Err(CommandError::FunctionCode(function_code).into());
            }
            Ok(read_pdu(function_code, cmd.start_address()?, cmd.length()?))
        }
        CmdType::Set => {
            let address = cmd.start_address()?;
            let mut pdu = vec![function_code];
            pdu.extend_from_slice(&address.to_be_bytes());
            match function_code {
                WRITE_SINGLE_COIL | WRITE_SINGLE_REGISTER => {
                    pdu.extend_from_slice(&cmd.single_value()?.to_be_bytes());
                }
                WRITE_MULTIPLE_COILS => {
                    let (count, packed) = cmd.coil_bits()?;
                    pdu.extend_from_slice(&count.to_be_bytes());
                    pdu.push(packed.len() as u8);
                    pdu.extend_from_slice(&packed);
                }
                WRITE_MULTIPLE_REGISTERS => {
                    let (count, data) = cmd.register_values()?;
                    pdu.extend_from_slice(&count.to_be_bytes());
                    pdu.push(data.len() as u8);
                    pdu.extend_from_slice(&data);
                }
                other => return Err(CommandError::FunctionCode(other).into()),
            }
            Ok(pdu)
        }
    }
}

/// Compare a write response payload with the request PDU.
///
/// Single writes must echo address and value; multiple writes must echo the
/// start address and the count. Everything else has nothing to compare.
pub fn check_echo(request: &[u8], resp: &[u8]) -> Result<(), CodecError> {
    let Some(&function_code) = request.first() else {
        return Err(CodecError::EchoMismatch("empty request".to_string()));
    };
    let sent = request.get(1..5);

    match function_code {
        WRITE_SINGLE_COIL | WRITE_SINGLE_REGISTER => {
            if sent.is_some_and(|sent| resp.ends_with(sent)) {
                Ok(())
            } else {
                Err(CodecError::EchoMismatch(format!(
                    "wrote {}, device answered {}",
                    hex::encode(sent.unwrap_or_default()),
                    hex::encode(resp)
                )))
            }
        }
        WRITE_MULTIPLE_COILS | WRITE_MULTIPLE_REGISTERS => {
            if resp.len() != 4 {
                return Err(CodecError::EchoMismatch(format!(
                    "expected 4 echo bytes, got {}",
                    resp.len()
                )));
            }
            let sent = sent.unwrap_or_default();
            if sent.get(0..2) != resp.get(0..2) {
                return Err(CodecError::EchoMismatch("start address differs".to_string()));
            }
            if sent.get(2..4) != resp.get(2..4) {
                return Err(CodecError::EchoMismatch("quantity differs".to_string()));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explode_bits_lsb_first() {
        assert_eq!(explode_bits(&[0b0000_0101]), vec![1, 0, 1, 0, 0, 0, 0, 0]);
        assert_eq!(explode_bits(&[0x00, 0x80]).len(), 16);
        assert_eq!(explode_bits(&[0x00, 0x80])[15], 1);
    }

    #[test]
    fn test_item_width() {
        assert_eq!(item_width(READ_COILS), 1);
        assert_eq!(item_width(READ_DISCRETE_INPUTS), 1);
        assert_eq!(item_width(READ_HOLDING_REGISTERS), 2);
        assert_eq!(item_width(READ_INPUT_REGISTERS), 2);
    }

    #[test]
    fn test_command_pdus() {
        let pdu = command_pdu(&OperateCmd::copy_read(0x04, 0x0010, 2)).unwrap();
        assert_eq!(pdu, vec![0x04, 0x00, 0x10, 0x00, 0x02]);

        let pdu = command_pdu(&OperateCmd::set_single(0x05, 0x00AC, 0xFF00)).unwrap();
        assert_eq!(pdu, vec![0x05, 0x00, 0xAC, 0xFF, 0x00]);

        let pdu = command_pdu(&OperateCmd::set_coils(0x0013, &[true, false, true])).unwrap();
        assert_eq!(pdu, vec![0x0F, 0x00, 0x13, 0x00, 0x03, 0x01, 0x05]);

        let pdu = command_pdu(&OperateCmd::set_registers(0x0001, &[0x000A, 0x0102])).unwrap();
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );

        let pdu = command_pdu(&OperateCmd::passthrough(&[0x11])).unwrap();
        assert_eq!(pdu, vec![0x11]);
    }

    #[test]
    fn test_command_pdu_rejects_before_io() {
        let mut cmd = OperateCmd::copy_read(0x03, 0, 1);
        cmd.function_code = 0x05;
        assert!(matches!(
            command_pdu(&cmd),
            Err(CodecError::Command(CommandError::FunctionCode(0x05)))
        ));

        cmd.function_code = 0x03;
        cmd.value.clear();
        assert!(matches!(
            command_pdu(&cmd),
            Err(CodecError::Command(CommandError::MissingValue(_)))
        ));
    }

    #[test]
    fn test_oversized_writes_rejected_before_io() {
        let coils = OperateCmd::set_coils(0, &[false; 2000]);
        assert!(matches!(
            command_pdu(&coils),
            Err(CodecError::Command(CommandError::WriteQuantity { count: 2000, .. }))
        ));

        let registers = OperateCmd::set_registers(0, &[0; 200]);
        assert!(matches!(
            command_pdu(&registers),
            Err(CodecError::Command(CommandError::WriteQuantity { count: 200, .. }))
        ));
    }

    #[test]
    fn test_group_over_whole_address_space_too_large() {
        use crate::model::Point;
        use std::sync::Arc;

        let point = |address: u16| -> Arc<Point> {
            Arc::new(
                serde_json::from_value(serde_json::json!({
                    "id": format!("p{address}"), "device_id": "d", "tag": format!("t{address}"),
                    "function_code": 3, "address": address, "data_type": "uint16"
                }))
                .unwrap(),
            )
        };
        let mut group = PointGroup::new(READ_HOLDING_REGISTERS);
        group.insert(0, vec![point(0)]);
        group.insert(65535, vec![point(65535)]);

        assert!(matches!(
            group_pdu(&group),
            Err(CodecError::GroupTooLarge(65536))
        ));
    }

    #[test]
    fn test_single_write_echo() {
        let request = [0x06, 0x00, 0x01, 0x00, 0x03];
        assert!(check_echo(&request, &[0x00, 0x01, 0x00, 0x03]).is_ok());
        assert!(check_echo(&request, &[0x00, 0x01, 0x00, 0x04]).is_err());
    }

    #[test]
    fn test_multiple_write_echo() {
        let request = [0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0, 10, 1, 2];
        assert!(check_echo(&request, &[0x00, 0x01, 0x00, 0x02]).is_ok());
        assert!(check_echo(&request, &[0x00, 0x02, 0x00, 0x02]).is_err());
        assert!(check_echo(&request, &[0x00, 0x01, 0x00, 0x03]).is_err());
        assert!(check_echo(&request, &[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_reads_have_no_echo_check() {
        assert!(check_echo(&[0x03, 0, 0, 0, 1], &[0xDE, 0xAD]).is_ok());
    }

    #[test]
    fn test_response_payload_length_mismatch() {
        let result = response_payload(0x03, &[0x04, 0x00, 0x2A]);
        assert!(matches!(
            result,
            Err(CodecError::LengthMismatch {
                declared: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_exception_payload() {
        let (payload, _, exception) = response_payload(0x83, &[0x02]).unwrap();
        assert_eq!(payload, vec![0x02]);
        assert_eq!(exception, Some(0x02));
    }
}
