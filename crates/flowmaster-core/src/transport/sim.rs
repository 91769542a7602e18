//! In-process stand-in for the controller firmware.
//!
//! `SimulatedController` answers framed requests in application mode and the
//! single-byte bootloader protocol after an enter-bootloader request, the
//! same way the pump controller does. Plugged into a
//! [`MockTransport`](super::MockTransport) it drives tests and the CLI's
//! `--simulate` mode.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use super::mock::{MockResponder, MockTransport};
use crate::protocol::constants::*;
use crate::protocol::{Frame, FrameDecoder, FrameError, PacketType};

/// Everything the simulated controller remembers.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub pwm_top: u16,
    pub fan_duty: u16,
    pub pump_duty: u16,
    pub fan_rpm_raw: u8,
    pub pump_rpm_raw: u8,
    pub ambient_adc: u16,
    pub coolant_adc: u16,
    pub automatic: bool,
    pub heartbeat: bool,
    pub rotate: bool,
    /// Linear cursor, `row * 20 + column`.
    pub cursor: u8,
    /// LCD contents, row after row.
    pub display: Vec<u8>,
    pub fan_profile: [u16; FAN_PROFILE_LEN],
    pub in_bootloader: bool,
    /// Programmed flash, by byte address.
    pub flash: BTreeMap<u16, u8>,
    pub chip_erases: usize,
    pub eeprom_erases: usize,
    pub resets: usize,
    pub display_messages: usize,
    pub percent_markers: usize,
    /// Frames refused for carrying more than [`MAX_PAYLOAD_SIZE`] bytes.
    pub overflows: usize,
    /// Bootloader pings to ignore before answering.
    pub ignore_pings: usize,
    /// Answer erase requests at all.
    pub ack_erase: bool,
    /// NAK the n-th program-word command (0-based).
    pub nak_program_word: Option<usize>,
    /// Whether the firmware knows GET_TOP.
    pub supports_get_top: bool,
    pub(crate) words_programmed: usize,
    pub(crate) bl_address: u16,
    pub(crate) bl_pending: Vec<u8>,
}

const DISPLAY_CELLS: usize = DISPLAY_ROWS as usize * DISPLAY_COLUMNS as usize;

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            pwm_top: DEFAULT_PWM_TOP,
            fan_duty: DEFAULT_PWM_TOP / 2,
            pump_duty: DEFAULT_PWM_TOP,
            fan_rpm_raw: 40,
            pump_rpm_raw: 100,
            // ~25 C on a 10k NTC with a 10k divider.
            ambient_adc: 512,
            coolant_adc: 480,
            automatic: true,
            heartbeat: false,
            rotate: true,
            cursor: 0,
            display: vec![b' '; DISPLAY_CELLS],
            fan_profile: [0; FAN_PROFILE_LEN],
            in_bootloader: false,
            flash: BTreeMap::new(),
            chip_erases: 0,
            eeprom_erases: 0,
            resets: 0,
            display_messages: 0,
            percent_markers: 0,
            overflows: 0,
            ignore_pings: 0,
            ack_erase: true,
            nak_program_word: None,
            supports_get_top: true,
            words_programmed: 0,
            bl_address: 0,
            bl_pending: Vec::new(),
        }
    }
}

impl ControllerState {
    /// One LCD row as text.
    pub fn display_row(&self, row: u8) -> String {
        let start = row as usize * DISPLAY_COLUMNS as usize;
        String::from_utf8_lossy(&self.display[start..start + DISPLAY_COLUMNS as usize]).into_owned()
    }
}

/// Simulated pump controller. Clones share state.
#[derive(Clone, Default)]
pub struct SimulatedController {
    state: Arc<Mutex<ControllerState>>,
    decoder: Arc<Mutex<FrameDecoder>>,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ControllerState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            decoder: Arc::new(Mutex::new(FrameDecoder::new())),
        }
    }

    /// A mock transport wired to this controller.
    pub fn transport(&self) -> MockTransport {
        MockTransport::with_responder(self.clone())
    }

    /// Inspect or tweak the controller state.
    pub fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_frame(state: &mut ControllerState, frame: &Frame) -> Option<Frame> {
        let payload = frame.payload.as_slice();
        let kind = match frame.kind() {
            Some(kind) => kind,
            None => return Some(Frame::new(PacketType::Nak, &[])),
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            state.overflows += 1;
            return Some(Frame::new(PacketType::Overflow, &[]));
        }
        let ack = Some(Frame::new(PacketType::Ack, &[]));
        let bad_length = Some(Frame::new(PacketType::BadLength, &[]));

        match kind {
            PacketType::Ping => Some(Frame::new(PacketType::Pong, &[])),
            PacketType::RequestStatus => {
                let mut hb = [0u8; 11];
                BigEndian::write_u16(&mut hb[0..2], state.fan_duty);
                BigEndian::write_u16(&mut hb[2..4], state.pump_duty);
                hb[4] = state.fan_rpm_raw;
                hb[5] = state.pump_rpm_raw;
                BigEndian::write_u16(&mut hb[6..8], state.ambient_adc);
                BigEndian::write_u16(&mut hb[8..10], state.coolant_adc);
                Some(Frame::new(PacketType::Heartbeat, &hb))
            }
            PacketType::GetTop if state.supports_get_top => {
                let mut top = [0u8; 2];
                BigEndian::write_u16(&mut top, state.pwm_top);
                Some(Frame::new(PacketType::GetTop, &top))
            }
            PacketType::SetFan | PacketType::SetPump => {
                if payload.len() != 2 {
                    return bad_length;
                }
                let duty = BigEndian::read_u16(payload);
                if kind == PacketType::SetFan {
                    state.fan_duty = duty;
                } else {
                    state.pump_duty = duty;
                }
                ack
            }
            PacketType::Manual | PacketType::Automatic => {
                state.automatic = kind == PacketType::Automatic;
                ack
            }
            PacketType::StartHeartbeat | PacketType::StopHeartbeat => {
                state.heartbeat = kind == PacketType::StartHeartbeat;
                ack
            }
            PacketType::Rotate | PacketType::NoRotate => {
                state.rotate = kind == PacketType::Rotate;
                ack
            }
            PacketType::Cursor => {
                if payload.len() != 1 || payload[0] as usize >= DISPLAY_CELLS {
                    return bad_length;
                }
                state.cursor = payload[0];
                ack
            }
            PacketType::Message => {
                for &ch in payload {
                    let cell = state.cursor as usize % DISPLAY_CELLS;
                    state.display[cell] = ch;
                    state.cursor = ((cell + 1) % DISPLAY_CELLS) as u8;
                }
                ack
            }
            PacketType::SetFanProfile => {
                if payload.is_empty() || payload.len() % 2 == 0 {
                    return bad_length;
                }
                let offset = payload[0] as usize;
                let values = &payload[1..];
                if offset + values.len() / 2 > FAN_PROFILE_LEN {
                    return bad_length;
                }
                for (i, word) in values.chunks_exact(2).enumerate() {
                    state.fan_profile[offset + i] = BigEndian::read_u16(word);
                }
                ack
            }
            PacketType::GetFanProfile => {
                if payload.len() != 2 {
                    return bad_length;
                }
                let (offset, count) = (payload[0] as usize, payload[1] as usize);
                if count > FAN_PROFILE_SEGMENT || offset + count > FAN_PROFILE_LEN {
                    return bad_length;
                }
                let mut reply = vec![payload[0]];
                for &value in &state.fan_profile[offset..offset + count] {
                    reply.extend_from_slice(&value.to_be_bytes());
                }
                Some(Frame::new(PacketType::GetFanProfile, &reply))
            }
            PacketType::Bootloader => {
                debug!("Simulated controller entering bootloader");
                state.in_bootloader = true;
                state.bl_pending.clear();
                None
            }
            _ => Some(Frame::new(PacketType::Nak, &[])),
        }
    }

    fn handle_bootloader_byte(state: &mut ControllerState, byte: u8, out: &mut Vec<u8>) {
        state.bl_pending.push(byte);
        let command = state.bl_pending[0];
        let needed = match command {
            BL_SET_ADDR | BL_PROGRAM => 3,
            _ => 1,
        };
        if state.bl_pending.len() < needed {
            return;
        }
        let args: Vec<u8> = state.bl_pending.drain(..).skip(1).collect();

        match command {
            BL_PING => {
                if state.ignore_pings > 0 {
                    state.ignore_pings -= 1;
                } else {
                    out.push(BL_ACK);
                }
            }
            BL_ERASE => {
                if state.ack_erase {
                    state.flash.clear();
                    state.chip_erases += 1;
                    out.push(BL_ACK);
                }
            }
            BL_ERASE_EEPROM => {
                state.eeprom_erases += 1;
                out.push(BL_ACK);
            }
            BL_SET_ADDR => {
                state.bl_address = u16::from_be_bytes([args[0], args[1]]);
                out.push(BL_ACK);
            }
            BL_PROGRAM => {
                let index = state.words_programmed;
                state.words_programmed += 1;
                if state.nak_program_word == Some(index) {
                    out.push(BL_NAK);
                    return;
                }
                // Word arrives low byte first; image order is restored in flash.
                let address = state.bl_address;
                state.flash.insert(address, args[1]);
                state.flash.insert(address.wrapping_add(1), args[0]);
                state.bl_address = address.wrapping_add(2);
                out.push(BL_ACK);
            }
            BL_PROGRAM_MESSAGE => state.display_messages += 1,
            BL_PERCENT => state.percent_markers += 1,
            BL_RESET => {
                state.in_bootloader = false;
                state.resets += 1;
            }
            _ => out.push(BL_NAK),
        }
    }
}

impl MockResponder for SimulatedController {
    fn respond(&mut self, written: &[u8], baud: u32) -> Vec<u8> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut decoder = self.decoder.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();

        for &byte in written {
            if state.in_bootloader {
                // Wrong line speed reads as garbage.
                if baud == BL_BAUD_RATE {
                    Self::handle_bootloader_byte(&mut state, byte, &mut out);
                }
                continue;
            }

            let reply = match decoder.push(byte) {
                Ok(Some(frame)) => Self::handle_frame(&mut state, &frame),
                Ok(None) => None,
                Err(FrameError::Overflow { .. }) => Some(Frame::new(PacketType::Overflow, &[])),
                Err(FrameError::ChecksumMismatch { .. }) => {
                    Some(Frame::new(PacketType::BadChecksum, &[]))
                }
                Err(_) => Some(Frame::new(PacketType::BadLength, &[])),
            };
            if let Some(frame) = reply
                && let Ok(bytes) = frame.encode()
            {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{crc8, decode_all};
    use crate::transport::SerialTransport;

    fn drain(mock: &mut MockTransport) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(b) = mock.read_byte().unwrap() {
            bytes.push(b);
        }
        bytes
    }

    #[test]
    fn test_sim_answers_ping() {
        let sim = SimulatedController::new();
        let mut mock = sim.transport();
        mock.write(&Frame::new(PacketType::Ping, &[]).encode().unwrap())
            .unwrap();
        let frames = decode_all(&drain(&mut mock)).unwrap();
        assert_eq!(frames, vec![Frame::new(PacketType::Pong, &[])]);
    }

    #[test]
    fn test_sim_reports_bad_checksum() {
        let sim = SimulatedController::new();
        let mut mock = sim.transport();
        mock.write(&[0x8F, 0xAA, 0x06, 0x00, 0x00, 0x8F, 0x55])
            .unwrap();
        let frames = decode_all(&drain(&mut mock)).unwrap();
        assert_eq!(frames, vec![Frame::new(PacketType::BadChecksum, &[])]);
    }

    #[test]
    fn test_sim_overflows_on_oversized_payload() {
        let sim = SimulatedController::new();
        let mut mock = sim.transport();
        let body = [&[PacketType::Message.code(), 12][..], &[b'A'; 12][..]].concat();
        let mut wire = vec![FRAME_ESCAPE, FRAME_START];
        wire.extend_from_slice(&body);
        wire.push(crc8(&body));
        wire.extend_from_slice(&[FRAME_ESCAPE, FRAME_END]);

        mock.write(&wire).unwrap();
        let frames = decode_all(&drain(&mut mock)).unwrap();
        assert_eq!(frames, vec![Frame::new(PacketType::Overflow, &[])]);
        assert_eq!(sim.state().overflows, 1);
        assert_eq!(sim.state().display_row(0).trim(), "");
    }

    #[test]
    fn test_sim_bootloader_needs_bootloader_baud() {
        let sim = SimulatedController::new();
        let mut mock = sim.transport().with_baud(57600);
        mock.write(&Frame::new(PacketType::Bootloader, &[]).encode().unwrap())
            .unwrap();
        assert!(sim.state().in_bootloader);

        mock.write(&[BL_PING]).unwrap();
        assert!(drain(&mut mock).is_empty());

        mock.set_baud_rate(BL_BAUD_RATE).unwrap();
        mock.write(&[BL_PING]).unwrap();
        assert_eq!(drain(&mut mock), vec![BL_ACK]);

        mock.write(&[BL_SET_ADDR, 0x01, 0x00]).unwrap();
        mock.write(&[BL_PROGRAM, 0x22, 0x11]).unwrap();
        assert_eq!(drain(&mut mock), vec![BL_ACK, BL_ACK]);
        assert_eq!(sim.state().flash.get(&0x0100), Some(&0x11));
        assert_eq!(sim.state().flash.get(&0x0101), Some(&0x22));

        mock.write(&[BL_RESET]).unwrap();
        assert!(!sim.state().in_bootloader);
        assert_eq!(sim.state().resets, 1);
    }
}
