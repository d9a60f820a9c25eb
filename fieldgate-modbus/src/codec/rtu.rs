//! Modbus RTU: `[slave][function][data...][crc lo][crc hi]`.
//!
//! The line is half-duplex, so responses are matched by position rather than
//! by key. The key of a decoded frame is the hex of its slave id and function
//! code.

use bytes::{Buf, BytesMut};

use super::crc::{append_crc, crc16, split_crc};
use super::{
    DecodedFrame, ProtocolCodec, is_read, is_supported, is_write, response_payload,
    split_exception,
};
use crate::error::CodecError;

/// Highest unicast slave address.
pub const MAX_SLAVE_ID: u8 = 247;

#[derive(Debug, Clone)]
pub struct ModbusRtuCodec {
    slave_id: u8,
    last_key: Option<String>,
}

impl ModbusRtuCodec {
    pub fn new(slave_id: u8) -> Result<Self, CodecError> {
        if !(1..=MAX_SLAVE_ID).contains(&slave_id) {
            return Err(CodecError::SlaveId(slave_id));
        }
        Ok(Self {
            slave_id,
            last_key: None,
        })
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    /// Full frame length implied by the bytes seen so far, if known yet.
    fn expected_len(buf: &[u8]) -> Option<Result<usize, CodecError>> {
        let function_code = *buf.get(1)?;
        let (base, exception) = split_exception(function_code);
        if !is_supported(function_code) {
            return Some(Err(CodecError::FunctionCode(function_code)));
        }
        if exception {
            return Some(Ok(5));
        }
        if is_read(base) {
            let count = *buf.get(2)? as usize;
            return Some(Ok(3 + count + 2));
        }
        debug_assert!(is_write(base));
        Some(Ok(8))
    }
}

impl ProtocolCodec for ModbusRtuCodec {
    fn name(&self) -> &'static str {
        "modbus_rtu"
    }

    fn encode(&mut self, pdu: &[u8]) -> (String, Vec<u8>) {
        let mut frame = Vec::with_capacity(pdu.len() + 3);
        frame.push(self.slave_id);
        frame.extend_from_slice(pdu);
        append_crc(&mut frame);

        let key = hex::encode(&pdu[..pdu.len().min(5)]);
        self.last_key = Some(key.clone());
        (key, frame)
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedFrame>, CodecError> {
        let Some(&slave_id) = buf.first() else {
            return Ok(None);
        };
        if slave_id != self.slave_id {
            buf.advance(1);
            return Err(CodecError::UnitId {
                expected: self.slave_id,
                actual: slave_id,
            });
        }

        let frame_len = match Self::expected_len(buf) {
            None => return Ok(None),
            Some(Err(e)) => {
                buf.advance(1);
                return Err(e);
            }
            Some(Ok(len)) => len,
        };
        if buf.len() < frame_len {
            return Ok(None);
        }

        let (computed, received) = match split_crc(&buf[..frame_len]) {
            Some((body, received)) => (crc16(body), received),
            None => return Ok(None),
        };
        if computed != received {
            buf.advance(1);
            return Err(CodecError::Crc { received, computed });
        }

        let frame = buf.split_to(frame_len);
        let function_code = frame[1];
        let (payload, item_width, exception) =
            response_payload(function_code, &frame[2..frame_len - 2])?;

        Ok(Some(DecodedFrame {
            key: hex::encode(&frame[..2]),
            function_code: function_code & 0x7F,
            trace: hex::encode(&frame),
            payload,
            item_width,
            exception,
        }))
    }

    fn request_pdu<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        if frame.len() < 4 {
            return None;
        }
        frame.get(1..frame.len() - 2)
    }

    fn key(&self) -> Option<&str> {
        self.last_key.as_deref()
    }

    fn copy(&self) -> Box<dyn ProtocolCodec> {
        Box::new(Self {
            slave_id: self.slave_id,
            last_key: None,
        })
    }
}
