//! Fan profile: 65 duty cycles, moved in small segments.
//!
//! A whole profile doesn't fit in one frame, so it is transferred as
//! segments of up to [`FAN_PROFILE_SEGMENT`] values:
//!
//! - set: `SET_FAN_PROFILE [offset, value_hi, value_lo, ...]`, answered by ACK
//! - get: `GET_FAN_PROFILE [offset, count]`, answered by
//!   `GET_FAN_PROFILE [offset, value_hi, value_lo, ...]`
//!
//! Values travel in PWM timer units.

use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::{FAN_PROFILE_LEN, FAN_PROFILE_SEGMENT};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FanProfileError {
    #[error("Fan profile needs {expected} values, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("Segment reply for offset {expected} carried offset {actual}")]
    OffsetMismatch { expected: u8, actual: u8 },
    #[error("Segment reply has {actual} bytes, expected {expected}")]
    SegmentLength { expected: usize, actual: usize },
}

/// Normalized fan duty cycles, one per profile step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanProfile {
    values: Vec<f32>,
}

impl Default for FanProfile {
    fn default() -> Self {
        Self {
            values: vec![0.0; FAN_PROFILE_LEN],
        }
    }
}

impl FanProfile {
    /// Build a profile from exactly [`FAN_PROFILE_LEN`] values.
    pub fn new(values: Vec<f32>) -> Result<Self, FanProfileError> {
        if values.len() != FAN_PROFILE_LEN {
            return Err(FanProfileError::WrongLength {
                expected: FAN_PROFILE_LEN,
                actual: values.len(),
            });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Index ranges of the transfer segments, in order.
    pub fn segments() -> impl Iterator<Item = Range<usize>> {
        (0..FAN_PROFILE_LEN)
            .step_by(FAN_PROFILE_SEGMENT)
            .map(|start| start..(start + FAN_PROFILE_SEGMENT).min(FAN_PROFILE_LEN))
    }

    /// Payload of a SET_FAN_PROFILE request for `range`.
    pub fn encode_segment(&self, range: Range<usize>, pwm_top: u16) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + 2 * range.len());
        payload.push(range.start as u8);
        for &value in &self.values[range] {
            payload.extend_from_slice(&to_pwm(value, pwm_top).to_be_bytes());
        }
        payload
    }

    /// Store the values of a GET_FAN_PROFILE reply for `range`.
    pub fn decode_segment(
        &mut self,
        range: Range<usize>,
        payload: &[u8],
        pwm_top: u16,
    ) -> Result<(), FanProfileError> {
        let expected_len = 1 + 2 * range.len();
        if payload.len() != expected_len {
            return Err(FanProfileError::SegmentLength {
                expected: expected_len,
                actual: payload.len(),
            });
        }
        if payload[0] as usize != range.start {
            return Err(FanProfileError::OffsetMismatch {
                expected: range.start as u8,
                actual: payload[0],
            });
        }
        for (slot, word) in self.values[range].iter_mut().zip(payload[1..].chunks_exact(2)) {
            *slot = f32::from(BigEndian::read_u16(word)) / f32::from(pwm_top);
        }
        Ok(())
    }
}

/// Scale a duty cycle to PWM timer units, clamped to 0.0 - 1.0.
pub fn to_pwm(duty_cycle: f32, pwm_top: u16) -> u16 {
    let duty = if duty_cycle.is_nan() {
        0.0
    } else {
        duty_cycle.clamp(0.0, 1.0)
    };
    (duty * f32::from(pwm_top)).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_cover_profile() {
        let segments: Vec<_> = FanProfile::segments().collect();
        assert_eq!(segments.len(), 13);
        assert_eq!(segments[0], 0..5);
        assert_eq!(segments[12], 60..65);
        assert_eq!(segments.iter().map(|r| r.len()).sum::<usize>(), FAN_PROFILE_LEN);
    }

    #[test]
    fn test_wrong_length() {
        assert_eq!(
            FanProfile::new(vec![0.5; 64]),
            Err(FanProfileError::WrongLength {
                expected: 65,
                actual: 64
            })
        );
    }

    #[test]
    fn test_encode_segment() {
        let mut values = vec![0.0; FAN_PROFILE_LEN];
        values[5] = 1.0;
        values[6] = 0.5;
        values[7] = 2.0;
        values[8] = -1.0;
        let profile = FanProfile::new(values).unwrap();
        let payload = profile.encode_segment(5..10, 288);
        assert_eq!(
            payload,
            vec![5, 0x01, 0x20, 0x00, 0x90, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_decode_segment_checks_offset() {
        let mut profile = FanProfile::default();
        let err = profile
            .decode_segment(5..10, &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 288)
            .unwrap_err();
        assert_eq!(
            err,
            FanProfileError::OffsetMismatch {
                expected: 5,
                actual: 0
            }
        );
        let err = profile.decode_segment(5..10, &[5, 0, 0], 288).unwrap_err();
        assert!(matches!(err, FanProfileError::SegmentLength { .. }));
    }

    #[test]
    fn test_quantization_within_one_step() {
        let top = 288u16;
        let step = 1.0 / f32::from(top);
        for i in 0..=1000 {
            let duty = i as f32 / 1000.0;
            let back = f32::from(to_pwm(duty, top)) / f32::from(top);
            assert!((back - duty).abs() <= step, "{} -> {}", duty, back);
        }
    }
}
