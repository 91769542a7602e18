//! Telemetry decoded from heartbeat packets.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::protocol::constants::RPM_SCALE;

/// Minimum heartbeat payload: two duty words, two RPM bytes, two ADC words.
pub const HEARTBEAT_MIN_LEN: usize = 10;

const THERMISTOR_REF_OHMS: i32 = 10_000;
const ADC_FULL_SCALE: i32 = 1024;
// Steinhart-Hart coefficients for the stock 10k NTC.
const SH_A: f64 = 0.001129148;
const SH_B: f64 = 0.000234125;
const SH_C: f64 = 0.0000000876741;
const KELVIN_OFFSET: f64 = 273.15;

/// One status reading from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Fan duty cycle, normally 0.0 - 1.0.
    pub fan_duty_cycle: f32,
    /// Pump duty cycle, normally 0.0 - 1.0.
    pub pump_duty_cycle: f32,
    pub fan_rpm: u32,
    pub pump_rpm: u32,
    /// Degrees Celsius.
    pub ambient_temp: f32,
    /// Degrees Celsius.
    pub coolant_temp: f32,
    /// Reserved; the firmware doesn't report flow yet.
    pub flow_rate: Option<f32>,
}

impl TelemetrySnapshot {
    /// Decode a heartbeat payload. `pwm_top` must be non-zero.
    ///
    /// Returns `None` if the payload is too short.
    pub fn from_heartbeat(payload: &[u8], pwm_top: u16) -> Option<Self> {
        if payload.len() < HEARTBEAT_MIN_LEN {
            return None;
        }
        let top = f32::from(pwm_top);
        Some(Self {
            fan_duty_cycle: f32::from(BigEndian::read_u16(&payload[0..2])) / top,
            pump_duty_cycle: f32::from(BigEndian::read_u16(&payload[2..4])) / top,
            fan_rpm: u32::from(payload[4]) * RPM_SCALE,
            pump_rpm: u32::from(payload[5]) * RPM_SCALE,
            ambient_temp: adc_to_celsius(BigEndian::read_u16(&payload[6..8])),
            coolant_temp: adc_to_celsius(BigEndian::read_u16(&payload[8..10])),
            flow_rate: None,
        })
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fan duty cycle:  {:.2}%", self.fan_duty_cycle * 100.0)?;
        writeln!(f, "Pump duty cycle: {:.2}%", self.pump_duty_cycle * 100.0)?;
        writeln!(f, "Coolant Temp:    {:.2}C", self.coolant_temp)?;
        writeln!(f, "Ambient Temp:    {:.2}C", self.ambient_temp)?;
        writeln!(f, "Fan Speed:       {} RPM", self.fan_rpm)?;
        writeln!(f, "Pump Speed:      {} RPM", self.pump_rpm)?;
        match self.flow_rate {
            Some(flow) => write!(f, "Flow Rate:       {:.1} LPH", flow),
            None => write!(f, "Flow Rate:       n/a"),
        }
    }
}

/// Convert a 10-bit thermistor divider reading to degrees Celsius.
///
/// A reading of 0 is treated as 1. Readings at or above full scale have no
/// physical resistance and give NaN.
pub fn adc_to_celsius(adc: u16) -> f32 {
    let adc = i32::from(adc.max(1));
    let resistance = ADC_FULL_SCALE * THERMISTOR_REF_OHMS / adc - THERMISTOR_REF_OHMS;
    if resistance <= 0 {
        return f32::NAN;
    }
    let ln_r = f64::from(resistance).ln();
    let kelvin = 1.0 / (SH_A + SH_B * ln_r + SH_C * ln_r * ln_r * ln_r);
    (kelvin - KELVIN_OFFSET) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_duty_is_exact_quotient() {
        let payload = [0x01, 0x20, 0x00, 0x90, 0, 0, 0x02, 0x00, 0x02, 0x00, 0x00];
        let snapshot = TelemetrySnapshot::from_heartbeat(&payload, 288).unwrap();
        assert_eq!(snapshot.fan_duty_cycle, 288.0 / 288.0);
        assert_eq!(snapshot.pump_duty_cycle, 144.0 / 288.0);
    }

    #[test]
    fn test_no_clamping_above_top() {
        let payload = [0x02, 0x40, 0, 0, 0, 0, 0x02, 0x00, 0x02, 0x00];
        let snapshot = TelemetrySnapshot::from_heartbeat(&payload, 288).unwrap();
        assert_eq!(snapshot.fan_duty_cycle, 576.0 / 288.0);
    }

    #[test]
    fn test_rpm_and_flow() {
        let payload = [0, 0, 0, 0, 40, 100, 0x02, 0x00, 0x02, 0x00, 0x7F];
        let snapshot = TelemetrySnapshot::from_heartbeat(&payload, 288).unwrap();
        assert_eq!(snapshot.fan_rpm, 1200);
        assert_eq!(snapshot.pump_rpm, 3000);
        assert_eq!(snapshot.flow_rate, None);
    }

    #[test]
    fn test_short_heartbeat() {
        assert!(TelemetrySnapshot::from_heartbeat(&[0; 9], 288).is_none());
    }

    #[test]
    fn test_thermistor_midpoint_is_room_temperature() {
        // Equal divider: R = 10k, which is 25 C for this thermistor.
        let t = adc_to_celsius(512);
        assert!((t - 25.0).abs() < 0.1, "got {}", t);
    }

    #[test]
    fn test_thermistor_edges() {
        assert!(adc_to_celsius(0).is_finite());
        assert_eq!(adc_to_celsius(0), adc_to_celsius(1));
        assert!(adc_to_celsius(1024).is_nan());
        // Hotter water pulls the divider up.
        assert!(adc_to_celsius(700) > adc_to_celsius(400));
    }
}
