//! CRC-16/MODBUS.

/// CRC over `data`: reflected polynomial 0xA001, initial register 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Split a frame into body and the CRC it carries, or `None` if too short.
pub fn split_crc(frame: &[u8]) -> Option<(&[u8], u16)> {
    if frame.len() < 2 {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    Some((body, u16::from_le_bytes([tail[0], tail[1]])))
}

/// True when the trailing two bytes match the CRC of everything before them.
pub fn verify(frame: &[u8]) -> bool {
    split_crc(frame).is_some_and(|(body, crc)| crc16(body) == crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // Read holding registers, slave 1, address 0, count 10.
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&frame), 0xCDC5);

        let mut framed = frame.to_vec();
        append_crc(&mut framed);
        assert_eq!(&framed[6..], &[0xC5, 0xCD]);
    }

    #[test]
    fn test_verify_detects_any_single_bit_flip() {
        let mut frame = vec![0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40];
        append_crc(&mut frame);
        assert!(verify(&frame));

        for index in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                assert!(!verify(&corrupted), "flip at byte {index} bit {bit}");
            }
        }
    }

    #[test]
    fn test_short_frames() {
        assert!(!verify(&[]));
        assert!(!verify(&[0x01]));
        assert_eq!(crc16(&[]), 0xFFFF);
    }
}
