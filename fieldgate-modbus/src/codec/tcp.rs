//! Modbus TCP: MBAP header + PDU.
//!
//! ```text
//! [transaction id:2][protocol id:2 = 0][length:2][unit id:1][function:1][data...]
//! ```
//!
//! `length` counts the unit id and everything after it.

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use super::{DecodedFrame, ProtocolCodec, is_supported, response_payload};
use crate::error::CodecError;

const HEADER_LEN: usize = 6;
/// Header plus unit id and function code.
const PEEK_LEN: usize = 8;

/// Default wrap bound: the whole 16-bit field.
pub const DEFAULT_TRANSACTION_WRAP: u16 = 0xFFFF;

/// Transaction id source shared by every copy of one device's codec, so poll
/// requests and control commands never reuse each other's ids.
///
/// Ids run `1..=wrap` and then start over at 1.
#[derive(Debug, Clone)]
pub struct TransactionSequence {
    current: Arc<AtomicU16>,
    wrap: u16,
}

impl TransactionSequence {
    pub fn new(wrap: u16) -> Self {
        Self {
            current: Arc::new(AtomicU16::new(0)),
            wrap: wrap.max(1),
        }
    }

    pub fn wrap(&self) -> u16 {
        self.wrap
    }

    pub fn next_id(&self) -> u16 {
        let wrap = self.wrap;
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(advance(current, wrap))
            })
            .unwrap_or_else(|current| current);
        advance(previous, wrap)
    }
}

fn advance(current: u16, wrap: u16) -> u16 {
    if current >= wrap { 1 } else { current + 1 }
}

impl Default for TransactionSequence {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSACTION_WRAP)
    }
}

#[derive(Debug, Clone)]
pub struct ModbusTcpCodec {
    unit_id: u8,
    sequence: TransactionSequence,
    last_key: Option<String>,
}

impl ModbusTcpCodec {
    pub fn new(unit_id: u8, sequence: TransactionSequence) -> Self {
        Self {
            unit_id,
            sequence,
            last_key: None,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }
}

/// Correlation key of a transaction id.
pub fn transaction_key(id: u16) -> String {
    hex::encode(id.to_be_bytes())
}

impl ProtocolCodec for ModbusTcpCodec {
    fn name(&self) -> &'static str {
        "modbus_tcp"
    }

    fn encode(&mut self, pdu: &[u8]) -> (String, Vec<u8>) {
        let id = self.sequence.next_id();
        let length = (pdu.len() + 1) as u16;

        let mut frame = Vec::with_capacity(HEADER_LEN + 1 + pdu.len());
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(self.unit_id);
        frame.extend_from_slice(pdu);

        let key = transaction_key(id);
        self.last_key = Some(key.clone());
        (key, frame)
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedFrame>, CodecError> {
        if buf.len() < PEEK_LEN {
            return Ok(None);
        }

        let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
        if protocol_id != 0 {
            buf.advance(1);
            return Err(CodecError::ProtocolId(protocol_id));
        }
        let unit_id = buf[6];
        if unit_id != self.unit_id {
            buf.advance(1);
            return Err(CodecError::UnitId {
                expected: self.unit_id,
                actual: unit_id,
            });
        }
        let function_code = buf[7];
        if !is_supported(function_code) {
            buf.advance(1);
            return Err(CodecError::FunctionCode(function_code));
        }
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if length < 2 {
            buf.advance(1);
            return Err(CodecError::LengthMismatch {
                declared: length,
                actual: 2,
            });
        }

        let frame_len = HEADER_LEN + length;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let frame = buf.split_to(frame_len);
        let key = transaction_key(u16::from_be_bytes([frame[0], frame[1]]));
        let (payload, item_width, exception) = response_payload(function_code, &frame[PEEK_LEN..])?;

        Ok(Some(DecodedFrame {
            key,
            function_code: function_code & 0x7F,
            trace: hex::encode(&frame),
            payload,
            item_width,
            exception,
        }))
    }

    fn request_pdu<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        frame.get(HEADER_LEN + 1..).filter(|pdu| !pdu.is_empty())
    }

    fn key(&self) -> Option<&str> {
        self.last_key.as_deref()
    }

    fn copy(&self) -> Box<dyn ProtocolCodec> {
        Box::new(Self::new(self.unit_id, self.sequence.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::OperateCmd;

    fn codec() -> ModbusTcpCodec {
        ModbusTcpCodec::new(1, TransactionSequence::default())
    }

    #[test]
    fn test_decode_read_holding_registers() {
        let mut buf = BytesMut::from(
            &[0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A][..],
        );
        let frame = codec().decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.payload, vec![0x00, 0x2A]);
        assert_eq!(frame.key, "0007");
        assert_eq!(frame.key, transaction_key(7));
        assert_eq!(frame.item_width, 2);
        assert_eq!(frame.trace, "000700000005010302002a");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let full = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A];
        let mut codec = codec();
        let mut buf = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[5..9]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[9..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_decode_resyncs_one_byte_at_a_time() {
        let mut codec = codec();
        let mut buf = BytesMut::from(
            &[0xAA, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A][..],
        );

        let mut errors = 0;
        let frame = loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => panic!("frame should be complete"),
                Err(_) => errors += 1,
            }
        };
        assert_eq!(errors, 1);
        assert_eq!(frame.key, "0001");
    }

    #[test]
    fn test_decode_rejects_foreign_unit() {
        let mut buf = BytesMut::from(
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x09, 0x03, 0x02, 0x00, 0x2A][..],
        );
        let err = codec().decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnitId {
                expected: 1,
                actual: 9
            }
        ));
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_decode_coils_exploded() {
        let mut buf = BytesMut::from(
            &[0x00, 0x02, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x05][..],
        );
        let frame = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, vec![1, 0, 1, 0, 0, 0, 0, 0]);
        assert_eq!(frame.item_width, 1);
    }

    #[test]
    fn test_decode_exception() {
        let mut buf = BytesMut::from(&[0x00, 0x03, 0x00, 0x00, 0x00, 0x03, 0x01, 0x86, 0x02][..]);
        let frame = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.function_code, 0x06);
        assert_eq!(frame.exception, Some(0x02));
        assert!(frame.into_result().is_err());
    }

    #[test]
    fn test_encode_and_check_resp() {
        let mut codec = codec();
        let (key, frame) = codec.opt(&OperateCmd::set_single(0x06, 0x0001, 0x0003)).unwrap();
        assert_eq!(key, "0001");
        assert_eq!(codec.key(), Some("0001"));
        assert_eq!(
            frame,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x03]
        );
        assert!(codec.check_resp(&frame, &[0x00, 0x01, 0x00, 0x03]).is_ok());
        assert!(codec.check_resp(&frame, &[0x00, 0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_sequence_wraps_at_configured_bound() {
        let sequence = TransactionSequence::new(3);
        let ids: Vec<u16> = (0..7).map(|_| sequence.next_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2, 3, 1]);

        let full = TransactionSequence::default();
        full.current.store(0xFFFE, Ordering::SeqCst);
        assert_eq!(full.next_id(), 0xFFFF);
        assert_eq!(full.next_id(), 1);
    }

    #[test]
    fn test_copies_share_sequence() {
        let mut original = codec();
        let mut copy = original.copy();
        let (first, _) = original.encode(&[0x03, 0, 0, 0, 1]);
        let (second, _) = copy.encode(&[0x03, 0, 0, 0, 1]);
        assert_ne!(first, second);
        assert_eq!(copy.key(), Some(second.as_str()));
    }
}
