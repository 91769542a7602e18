//! Byte-stuffed, CRC-8 protected framing.
//!
//! Wire layout:
//!
//! ```text
//! ESC STX | type | length | payload... | crc8 | ESC ETX
//! ```
//!
//! `length` is the unescaped payload length and the CRC covers
//! `type, length, payload` before escaping. Any `ESC` inside the escaped
//! section is sent twice. The start/end pairs let the decoder resynchronise
//! after dropped or corrupted bytes.

use crc::{CRC_8_MAXIM_DOW, Crc};
use thiserror::Error;

use super::constants::{FRAME_END, FRAME_ESCAPE, FRAME_START, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
use super::packet::PacketType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: {len} bytes, maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Frame exceeds {max} bytes")]
    Overflow { max: usize },
    #[error("Frame truncated: only {len} bytes between sentinels")]
    Truncated { len: usize },
    #[error("Checksum mismatch: computed 0x{expected:02X}, received 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("Length mismatch: header says {declared}, frame carries {actual}")]
    LengthMismatch { declared: u8, actual: usize },
}

// Dallas/Maxim: reflected poly 0x8C, seed 0.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

/// Dallas/Maxim CRC-8 over `data`.
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw type byte. See [`Frame::kind`].
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(packet_type: PacketType, payload: &[u8]) -> Self {
        Self {
            packet_type: packet_type.code(),
            payload: payload.to_vec(),
        }
    }

    /// Known packet type, if any.
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_code(self.packet_type)
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(2 * MAX_FRAME_SIZE + 4);
        encode_frame(self.packet_type, &self.payload, &mut out)?;
        Ok(out)
    }
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if byte == FRAME_ESCAPE {
        out.push(FRAME_ESCAPE);
    }
    out.push(byte);
}

/// Encode a frame into `out`. `out` is cleared first.
pub fn encode_frame(packet_type: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let length = payload.len() as u8;

    out.clear();
    out.push(FRAME_ESCAPE);
    out.push(FRAME_START);
    push_escaped(out, packet_type);
    push_escaped(out, length);

    let mut digest = CRC8.digest();
    digest.update(&[packet_type, length]);
    digest.update(payload);
    for &b in payload {
        push_escaped(out, b);
    }
    push_escaped(out, digest.finalize());

    out.push(FRAME_ESCAPE);
    out.push(FRAME_END);
    Ok(())
}

/// Incremental frame decoder.
///
/// Feed wire bytes one at a time with [`FrameDecoder::push`]. Bytes seen
/// outside a frame are discarded.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    escape_pending: bool,
    in_frame: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_FRAME_SIZE),
            escape_pending: false,
            in_frame: false,
        }
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.escape_pending = false;
        self.in_frame = false;
    }

    /// Bytes buffered for the frame in progress.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed one byte. Returns a frame when `ESC ETX` closes a valid one.
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>, FrameError> {
        if self.escape_pending {
            self.escape_pending = false;
            match byte {
                FRAME_START => {
                    self.buf.clear();
                    self.in_frame = true;
                    return Ok(None);
                }
                FRAME_END => {
                    if !self.in_frame {
                        return Ok(None);
                    }
                    return self.finish().map(Some);
                }
                // Stuffed escape; it must not start a new escape sequence.
                FRAME_ESCAPE => return self.append(FRAME_ESCAPE),
                _ => {}
            }
        } else if byte == FRAME_ESCAPE {
            self.escape_pending = true;
            return Ok(None);
        }

        self.append(byte)
    }

    fn append(&mut self, byte: u8) -> Result<Option<Frame>, FrameError> {
        if !self.in_frame {
            return Ok(None);
        }
        if self.buf.len() == MAX_FRAME_SIZE {
            self.reset();
            return Err(FrameError::Overflow {
                max: MAX_FRAME_SIZE,
            });
        }
        self.buf.push(byte);
        Ok(None)
    }

    fn finish(&mut self) -> Result<Frame, FrameError> {
        let result = validate(&self.buf);
        self.reset();
        result
    }
}

fn validate(buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.len() < 3 {
        return Err(FrameError::Truncated { len: buf.len() });
    }
    let (body, received) = buf.split_at(buf.len() - 1);
    let computed = crc8(body);
    if computed != received[0] {
        return Err(FrameError::ChecksumMismatch {
            expected: computed,
            actual: received[0],
        });
    }

    let declared = body[1];
    let payload = &body[2..];
    if declared as usize != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    Ok(Frame {
        packet_type: body[0],
        payload: payload.to_vec(),
    })
}

/// Decode every complete frame in `bytes`, stopping at the first error.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for &b in bytes {
        if let Some(frame) = decoder.push(b)? {
            frames.push(frame);
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crc8_check_value() {
        // Standard check value for CRC-8/MAXIM.
        assert_eq!(crc8(b"123456789"), 0xA1);
        assert_eq!(crc8(&[]), 0x00);
    }

    #[test]
    fn test_encode_ping() {
        let bytes = Frame::new(PacketType::Ping, &[]).encode().unwrap();
        // CRC of [06, 00] happens to equal STX; only ESC is stuffed.
        assert_eq!(bytes, vec![0x8F, 0xAA, 0x06, 0x00, 0xAA, 0x8F, 0x55]);
        let frames = decode_all(&bytes).unwrap();
        assert_eq!(frames, vec![Frame::new(PacketType::Ping, &[])]);
    }

    #[test]
    fn test_escape_in_payload_and_checksum() {
        // Payload 0xB3 makes the checksum 0x8F, so it must be stuffed too.
        let frame = Frame::new(PacketType::SetFan, &[0xB3]);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, vec![0x8F, 0xAA, 0x16, 0x01, 0xB3, 0x8F, 0x8F, 0x8F, 0x55]);
        assert_eq!(decode_all(&bytes).unwrap(), vec![frame]);

        let frame = Frame::new(PacketType::SetFan, &[0x8F, 0xAA, 0x8F, 0x55]);
        let bytes = frame.encode().unwrap();
        assert_eq!(decode_all(&bytes).unwrap(), vec![frame]);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = Frame::new(PacketType::Message, &payload).encode().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(Frame::new(PacketType::Message, &payload[1..]).encode().is_ok());
    }

    #[test]
    fn test_resync_after_noise() {
        let good = Frame::new(PacketType::Pong, &[]).encode().unwrap();
        let mut wire = vec![0x12, 0x55, 0x8F, 0x33, 0xAA];
        // A truncated frame, then a fresh start.
        wire.extend_from_slice(&[0x8F, 0xAA, 0x05, 0x0B, 0x01]);
        wire.extend_from_slice(&good);
        assert_eq!(decode_all(&wire).unwrap(), vec![Frame::new(PacketType::Pong, &[])]);
    }

    #[test]
    fn test_overflow() {
        let mut decoder = FrameDecoder::new();
        decoder.push(0x8F).unwrap();
        decoder.push(0xAA).unwrap();
        for _ in 0..MAX_FRAME_SIZE {
            assert_eq!(decoder.push(0x01).unwrap(), None);
        }
        assert_eq!(
            decoder.push(0x01),
            Err(FrameError::Overflow {
                max: MAX_FRAME_SIZE
            })
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_truncated_frame() {
        let err = decode_all(&[0x8F, 0xAA, 0x06, 0x8F, 0x55]).unwrap_err();
        assert_eq!(err, FrameError::Truncated { len: 1 });
    }

    #[test]
    fn test_length_mismatch() {
        // Valid CRC, but the header claims two payload bytes.
        let body = [0x05, 0x02, 0x01];
        let mut wire = vec![0x8F, 0xAA];
        wire.extend_from_slice(&body);
        wire.push(crc8(&body));
        wire.extend_from_slice(&[0x8F, 0x55]);
        let err = decode_all(&wire).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                declared: 2,
                actual: 1
            }
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            packet_type in prop_oneof![Just(0x8Fu8), any::<u8>()],
            payload in prop::collection::vec(
                prop_oneof![Just(0x8Fu8), Just(0xAA), Just(0x55), any::<u8>()],
                0..=MAX_PAYLOAD_SIZE,
            ),
        ) {
            let frame = Frame { packet_type, payload };
            let bytes = frame.encode().unwrap();
            prop_assert_eq!(decode_all(&bytes).unwrap(), vec![frame]);
        }

        #[test]
        fn prop_single_bit_flip_is_checksum_error(
            payload in prop::collection::vec(any::<u8>(), 1..=MAX_PAYLOAD_SIZE),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut frame = Frame::new(PacketType::Heartbeat, &payload);
            let mut bytes = frame.encode().unwrap();
            // Corrupt the logical payload and re-stuff, keeping the old CRC.
            let crc = crc8(&[&[frame.packet_type, payload.len() as u8][..], &payload[..]].concat());
            let i = index.index(payload.len());
            frame.payload[i] ^= 1 << bit;
            bytes.clear();
            bytes.extend_from_slice(&[FRAME_ESCAPE, FRAME_START]);
            push_escaped(&mut bytes, frame.packet_type);
            push_escaped(&mut bytes, payload.len() as u8);
            for &b in &frame.payload {
                push_escaped(&mut bytes, b);
            }
            push_escaped(&mut bytes, crc);
            bytes.extend_from_slice(&[FRAME_ESCAPE, FRAME_END]);

            let err = decode_all(&bytes).unwrap_err();
            prop_assert!(
                matches!(err, FrameError::ChecksumMismatch { .. }),
                "unexpected outcome: {:?}",
                err
            );
        }
    }
}
