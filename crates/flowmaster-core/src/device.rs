//! Flowmaster connection: framed request/response over a serial transport.
//!
//! Every request is one frame answered by one frame. The connection owns its
//! transport exclusively, so `&mut self` on each call keeps a single request
//! in flight.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::bootloader::Bootloader;
use crate::cancel::{CancelToken, Deadline};
use crate::fan_profile::{FanProfile, FanProfileError};
use crate::protocol::constants::*;
use crate::protocol::{Frame, FrameDecoder, FrameError, PacketType, RawPacketType, encode_frame};
use crate::session::SessionConfig;
use crate::telemetry::TelemetrySnapshot;
use crate::transport::{SerialPortTransport, SerialTransport, TransportError};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("No response after {reads} empty reads")]
    NoResponse { reads: usize },

    #[error("Response not complete within {timeout_ms}ms")]
    ResponseTimeout { timeout_ms: u64 },

    #[error("Expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: PacketType,
        actual: RawPacketType,
    },

    #[error("Device rejected the request with {0}")]
    Rejected(PacketType),

    #[error("Malformed {packet} payload: {message}")]
    BadPayload { packet: PacketType, message: String },

    #[error("Fan profile error: {0}")]
    FanProfile(#[from] FanProfileError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Connection to one controller.
pub struct Flowmaster<T: SerialTransport> {
    transport: T,
    tx_buf: Vec<u8>,
    decoder: FrameDecoder,
    pwm_top: u16,
    status: Option<TelemetrySnapshot>,
    response_timeout: Duration,
}

impl Flowmaster<SerialPortTransport> {
    /// Open the configured serial port and connect.
    pub fn open(config: &SessionConfig) -> Result<Self, DeviceError> {
        let transport =
            SerialPortTransport::open(&config.port, config.baud_rate, config.read_timeout())?;
        Self::connect(transport, config)
    }
}

impl<T: SerialTransport> Flowmaster<T> {
    /// Wrap a transport without talking to the device.
    ///
    /// The PWM top starts at [`DEFAULT_PWM_TOP`].
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            tx_buf: Vec::with_capacity(2 * MAX_FRAME_SIZE + 4),
            decoder: FrameDecoder::new(),
            pwm_top: DEFAULT_PWM_TOP,
            status: None,
            response_timeout: Duration::from_millis(RESPONSE_TIMEOUT_MS),
        }
    }

    /// Wrap a transport and ask the device for its PWM top.
    ///
    /// A device that can't report it is assumed to run the stock timer
    /// setup. Transport faults are still errors.
    #[instrument(skip_all, fields(port = %transport.name()))]
    pub fn connect(transport: T, config: &SessionConfig) -> Result<Self, DeviceError> {
        let mut device = Self::new(transport).with_response_timeout(config.response_timeout());
        match device.fetch_pwm_top() {
            Ok(top) => info!(pwm_top = top, "Connected"),
            Err(DeviceError::Transport(e)) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, fallback = DEFAULT_PWM_TOP, "Could not read PWM top, using default");
                device.pwm_top = DEFAULT_PWM_TOP;
            }
        }
        Ok(device)
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn pwm_top(&self) -> u16 {
        self.pwm_top
    }

    /// Last snapshot read by [`Flowmaster::update_status`].
    pub fn status(&self) -> Option<&TelemetrySnapshot> {
        self.status.as_ref()
    }

    /// Send `request` and wait for a reply of type `expected`.
    pub fn transact(
        &mut self,
        request: PacketType,
        payload: &[u8],
        expected: PacketType,
    ) -> Result<Frame, DeviceError> {
        self.send(request, payload)?;
        let frame = self.read_frame()?;
        match frame.kind() {
            Some(kind) if kind == expected => Ok(frame),
            Some(kind) if kind.is_error_report() => {
                debug!(request = %request, reply = %kind, "Request rejected");
                Err(DeviceError::Rejected(kind))
            }
            _ => Err(DeviceError::UnexpectedResponse {
                expected,
                actual: RawPacketType(frame.packet_type),
            }),
        }
    }

    fn send(&mut self, request: PacketType, payload: &[u8]) -> Result<(), DeviceError> {
        self.transport.clear()?;
        self.decoder.reset();
        encode_frame(request.code(), payload, &mut self.tx_buf)?;
        trace!(request = %request, bytes = self.tx_buf.len(), "Sending frame");
        let written = self.transport.write(&self.tx_buf)?;
        if written != self.tx_buf.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: self.tx_buf.len(),
            }
            .into());
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, DeviceError> {
        let deadline = Deadline::after(self.response_timeout);
        let mut idle_reads = 0;
        loop {
            match self.transport.read_byte()? {
                Some(byte) => {
                    idle_reads = 0;
                    if let Some(frame) = self.decoder.push(byte)? {
                        trace!(reply = %RawPacketType(frame.packet_type), len = frame.payload.len(), "Received frame");
                        return Ok(frame);
                    }
                }
                None => {
                    idle_reads += 1;
                    if idle_reads >= MAX_IDLE_READS {
                        self.decoder.reset();
                        return Err(DeviceError::NoResponse { reads: idle_reads });
                    }
                }
            }
            if deadline.is_expired() {
                self.decoder.reset();
                return Err(DeviceError::ResponseTimeout {
                    timeout_ms: deadline.budget().as_millis() as u64,
                });
            }
        }
    }

    fn expect_ack(&mut self, request: PacketType, payload: &[u8]) -> Result<(), DeviceError> {
        self.transact(request, payload, PacketType::Ack).map(|_| ())
    }

    /// Round-trip a ping.
    #[instrument(skip(self))]
    pub fn ping(&mut self) -> Result<(), DeviceError> {
        self.transact(PacketType::Ping, &[], PacketType::Pong)?;
        Ok(())
    }

    /// Ask the device for the TOP value of its PWM timer and keep it.
    #[instrument(skip(self))]
    pub fn fetch_pwm_top(&mut self) -> Result<u16, DeviceError> {
        let frame = self.transact(PacketType::GetTop, &[], PacketType::GetTop)?;
        if frame.payload.len() != 2 {
            return Err(DeviceError::BadPayload {
                packet: PacketType::GetTop,
                message: format!("expected 2 bytes, got {}", frame.payload.len()),
            });
        }
        let top = BigEndian::read_u16(&frame.payload);
        if top == 0 {
            return Err(DeviceError::BadPayload {
                packet: PacketType::GetTop,
                message: "PWM top is zero".into(),
            });
        }
        self.pwm_top = top;
        Ok(top)
    }

    /// Request one heartbeat and decode it.
    #[instrument(skip(self))]
    pub fn update_status(&mut self) -> Result<TelemetrySnapshot, DeviceError> {
        let frame = self.transact(PacketType::RequestStatus, &[], PacketType::Heartbeat)?;
        let snapshot =
            TelemetrySnapshot::from_heartbeat(&frame.payload, self.pwm_top).ok_or_else(|| {
                DeviceError::BadPayload {
                    packet: PacketType::Heartbeat,
                    message: format!("{} bytes is too short", frame.payload.len()),
                }
            })?;
        self.status = Some(snapshot);
        Ok(snapshot)
    }

    fn duty_to_raw(&self, duty_cycle: f32) -> Result<u16, DeviceError> {
        if !duty_cycle.is_finite() {
            return Err(DeviceError::InvalidArgument(format!(
                "duty cycle {} is not a number",
                duty_cycle
            )));
        }
        let duty = duty_cycle.min(1.0);
        if duty < MIN_DUTY_CYCLE {
            debug!(duty, minimum = MIN_DUTY_CYCLE, "Duty cycle below recommended minimum");
        }
        Ok((f32::from(self.pwm_top) * duty) as u16)
    }

    /// Set the fan duty cycle (0.0 - 1.0).
    #[instrument(skip(self))]
    pub fn set_fan_speed(&mut self, duty_cycle: f32) -> Result<(), DeviceError> {
        let raw = self.duty_to_raw(duty_cycle)?;
        self.expect_ack(PacketType::SetFan, &raw.to_be_bytes())
    }

    /// Set the pump duty cycle (0.0 - 1.0).
    #[instrument(skip(self))]
    pub fn set_pump_speed(&mut self, duty_cycle: f32) -> Result<(), DeviceError> {
        let raw = self.duty_to_raw(duty_cycle)?;
        self.expect_ack(PacketType::SetPump, &raw.to_be_bytes())
    }

    /// Upload a whole fan profile, one segment per request.
    #[instrument(skip_all)]
    pub fn set_fan_profile(&mut self, profile: &FanProfile) -> Result<(), DeviceError> {
        for range in FanProfile::segments() {
            let payload = profile.encode_segment(range, self.pwm_top);
            self.expect_ack(PacketType::SetFanProfile, &payload)?;
        }
        Ok(())
    }

    /// Download the fan profile.
    #[instrument(skip(self))]
    pub fn get_fan_profile(&mut self) -> Result<FanProfile, DeviceError> {
        let mut profile = FanProfile::default();
        for range in FanProfile::segments() {
            let request = [range.start as u8, range.len() as u8];
            let frame = self.transact(
                PacketType::GetFanProfile,
                &request,
                PacketType::GetFanProfile,
            )?;
            profile.decode_segment(range, &frame.payload, self.pwm_top)?;
        }
        Ok(profile)
    }

    /// Switch between closed-loop (`true`) and manual control.
    #[instrument(skip(self))]
    pub fn autoregulate(&mut self, enabled: bool) -> Result<(), DeviceError> {
        let request = if enabled {
            PacketType::Automatic
        } else {
            PacketType::Manual
        };
        self.expect_ack(request, &[])
    }

    /// Move the LCD cursor.
    pub fn set_cursor(&mut self, row: u8, column: u8) -> Result<(), DeviceError> {
        if row >= DISPLAY_ROWS || column >= DISPLAY_COLUMNS {
            return Err(DeviceError::InvalidArgument(format!(
                "cursor ({}, {}) outside the {}x{} display",
                row, column, DISPLAY_COLUMNS, DISPLAY_ROWS
            )));
        }
        self.expect_ack(PacketType::Cursor, &[row * DISPLAY_COLUMNS + column])
    }

    /// Print ASCII text at the cursor.
    ///
    /// Text longer than one frame's payload goes out as consecutive
    /// MESSAGE requests; the display advances its cursor after each.
    pub fn print_message(&mut self, text: &str) -> Result<(), DeviceError> {
        if !text.is_ascii() {
            return Err(DeviceError::InvalidArgument("message must be ASCII".into()));
        }
        if text.len() > MAX_MESSAGE_LEN {
            return Err(DeviceError::InvalidArgument(format!(
                "message is {} characters, maximum {}",
                text.len(),
                MAX_MESSAGE_LEN
            )));
        }
        for piece in text.as_bytes().chunks(MAX_PAYLOAD_SIZE) {
            self.expect_ack(PacketType::Message, piece)?;
        }
        Ok(())
    }

    /// Turn the rotating status pages on or off.
    pub fn set_display_rotation(&mut self, rotate: bool) -> Result<(), DeviceError> {
        let request = if rotate {
            PacketType::Rotate
        } else {
            PacketType::NoRotate
        };
        self.expect_ack(request, &[])
    }

    /// Turn unsolicited heartbeats on or off.
    pub fn set_heartbeat(&mut self, enabled: bool) -> Result<(), DeviceError> {
        let request = if enabled {
            PacketType::StartHeartbeat
        } else {
            PacketType::StopHeartbeat
        };
        self.expect_ack(request, &[])
    }

    /// Tell the application firmware to jump to its bootloader.
    ///
    /// No reply is expected. The link is switched to [`BL_BAUD_RATE`] and
    /// the returned [`Bootloader`] borrows the transport until dropped.
    #[instrument(skip(self, cancel))]
    pub fn enter_bootloader(
        &mut self,
        ack_timeout: Duration,
        cancel: CancelToken,
    ) -> Result<Bootloader<'_, T>, DeviceError> {
        self.send(PacketType::Bootloader, &[])?;
        self.transport.set_baud_rate(BL_BAUD_RATE)?;
        info!(baud = BL_BAUD_RATE, "Bootloader requested");
        Ok(Bootloader::new(&mut self.transport, ack_timeout, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ControllerState, MockResponder, MockTransport, SimulatedController};

    fn connected(sim: &SimulatedController) -> Flowmaster<MockTransport> {
        Flowmaster::connect(sim.transport(), &SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_connect_reads_pwm_top() {
        let sim = SimulatedController::with_state(ControllerState {
            pwm_top: 400,
            ..Default::default()
        });
        let device = connected(&sim);
        assert_eq!(device.pwm_top(), 400);
    }

    #[test]
    fn test_connect_falls_back_without_get_top() {
        let sim = SimulatedController::with_state(ControllerState {
            pwm_top: 400,
            supports_get_top: false,
            ..Default::default()
        });
        let device = connected(&sim);
        assert_eq!(device.pwm_top(), DEFAULT_PWM_TOP);
    }

    #[test]
    fn test_connect_propagates_transport_errors() {
        let mock = MockTransport::new();
        mock.disconnect();
        let result = Flowmaster::connect(mock, &SessionConfig::default());
        assert!(matches!(result, Err(DeviceError::Transport(TransportError::Closed))));
    }

    #[test]
    fn test_ping_wire_bytes() {
        let sim = SimulatedController::new();
        let mut device = connected(&sim);
        let handle = device.transport().clone();
        handle.clear_writes();
        device.ping().unwrap();
        assert_eq!(
            handle.get_writes(),
            vec![vec![0x8F, 0xAA, 0x06, 0x00, 0xAA, 0x8F, 0x55]]
        );
    }

    #[test]
    fn test_update_status() {
        let sim = SimulatedController::new();
        let mut device = connected(&sim);
        assert!(device.status().is_none());

        let snapshot = device.update_status().unwrap();
        assert_eq!(snapshot.fan_duty_cycle, 0.5);
        assert_eq!(snapshot.pump_duty_cycle, 1.0);
        assert_eq!(snapshot.fan_rpm, 1200);
        assert_eq!(snapshot.pump_rpm, 3000);
        assert!((snapshot.ambient_temp - 25.0).abs() < 0.1);
        assert_eq!(device.status(), Some(&snapshot));

        sim.state().fan_duty = 0;
        let snapshot = device.update_status().unwrap();
        assert_eq!(device.status().unwrap().fan_duty_cycle, 0.0);
        assert_eq!(snapshot.fan_duty_cycle, 0.0);
    }

    #[test]
    fn test_set_speeds() {
        let sim = SimulatedController::new();
        let mut device = connected(&sim);

        device.set_fan_speed(0.5).unwrap();
        assert_eq!(sim.state().fan_duty, 144);

        device.set_pump_speed(1.5).unwrap();
        assert_eq!(sim.state().pump_duty, 288);

        // Below the recommended minimum is still sent as asked.
        device.set_fan_speed(0.1).unwrap();
        assert_eq!(sim.state().fan_duty, 28);

        assert!(matches!(
            device.set_fan_speed(f32::NAN),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fan_profile_round_trip() {
        let sim = SimulatedController::new();
        let mut device = connected(&sim);
        let values: Vec<f32> = (0..FAN_PROFILE_LEN).map(|i| i as f32 / 64.0).collect();
        let profile = FanProfile::new(values.clone()).unwrap();

        device.set_fan_profile(&profile).unwrap();
        assert_eq!(sim.state().fan_profile[64], 288);

        let back = device.get_fan_profile().unwrap();
        let step = 1.0 / 288.0;
        for (a, b) in values.iter().zip(back.values()) {
            assert!((a - b).abs() <= step, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_display_and_mode_commands() {
        let sim = SimulatedController::new();
        let mut device = connected(&sim);

        device.autoregulate(false).unwrap();
        assert!(!sim.state().automatic);
        device.autoregulate(true).unwrap();
        assert!(sim.state().automatic);

        device.set_cursor(2, 5).unwrap();
        assert_eq!(sim.state().cursor, 45);

        device.print_message("Hello").unwrap();
        assert_eq!(&sim.state().display_row(2)[5..10], "Hello");

        device.set_display_rotation(false).unwrap();
        assert!(!sim.state().rotate);

        device.set_heartbeat(true).unwrap();
        assert!(sim.state().heartbeat);
    }

    #[test]
    fn test_long_message_is_split_into_payload_sized_frames() {
        let sim = SimulatedController::new();
        let mut device = connected(&sim);
        let handle = device.transport().clone();

        device.set_cursor(1, 0).unwrap();
        handle.clear_writes();
        device.print_message("ABCDEFGHIJKLMNOPQRST").unwrap();

        let lengths: Vec<u8> = handle.get_writes().iter().map(|w| w[3]).collect();
        assert_eq!(lengths, vec![MAX_PAYLOAD_SIZE as u8, 9]);
        assert_eq!(sim.state().display_row(1), "ABCDEFGHIJKLMNOPQRST");
        assert_eq!(sim.state().overflows, 0);
    }

    #[test]
    fn test_invalid_display_arguments_are_not_sent() {
        let sim = SimulatedController::new();
        let mut device = connected(&sim);
        let handle = device.transport().clone();
        handle.clear_writes();

        assert!(matches!(
            device.set_cursor(4, 0),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.print_message("this message is far too long for a row"),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.print_message("caf\u{e9}"),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(handle.get_writes().is_empty());
    }

    #[test]
    fn test_no_response() {
        let mut device = Flowmaster::new(MockTransport::new());
        assert!(matches!(
            device.ping(),
            Err(DeviceError::NoResponse {
                reads: MAX_IDLE_READS
            })
        ));
    }

    #[test]
    fn test_error_report_is_rejected() {
        let mock = MockTransport::new();
        mock.queue_frame(PacketType::BadChecksum, &[]);
        let mut device = Flowmaster::new(mock);
        assert!(matches!(
            device.ping(),
            Err(DeviceError::Rejected(PacketType::BadChecksum))
        ));
    }

    #[test]
    fn test_unexpected_reply_type() {
        let mock = MockTransport::new();
        mock.queue_frame(PacketType::Pong, &[]);
        let mut device = Flowmaster::new(mock);
        let err = device.update_status().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::UnexpectedResponse {
                expected: PacketType::Heartbeat,
                actual: RawPacketType(0x07)
            }
        ));
    }

    #[test]
    fn test_corrupt_reply() {
        let mock = MockTransport::new();
        mock.queue_reply(&[0x8F, 0xAA, 0x07, 0x00, 0x00, 0x8F, 0x55]);
        let mut device = Flowmaster::new(mock);
        assert!(matches!(
            device.ping(),
            Err(DeviceError::Frame(FrameError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_short_heartbeat_is_bad_payload() {
        let mock = MockTransport::new();
        mock.queue_frame(PacketType::Heartbeat, &[0; 4]);
        let mut device = Flowmaster::new(mock);
        assert!(matches!(
            device.update_status(),
            Err(DeviceError::BadPayload {
                packet: PacketType::Heartbeat,
                ..
            })
        ));
        assert!(device.status().is_none());
    }

    #[test]
    fn test_zero_pwm_top_rejected() {
        let mock = MockTransport::new();
        mock.queue_frame(PacketType::GetTop, &[0, 0]);
        let mut device = Flowmaster::new(mock);
        assert!(matches!(
            device.fetch_pwm_top(),
            Err(DeviceError::BadPayload { .. })
        ));
        assert_eq!(device.pwm_top(), DEFAULT_PWM_TOP);
    }

    struct Babbler;

    impl MockResponder for Babbler {
        fn respond(&mut self, _written: &[u8], _baud: u32) -> Vec<u8> {
            vec![0x00; 64]
        }
    }

    #[test]
    fn test_response_deadline() {
        let mut device = Flowmaster::new(MockTransport::with_responder(Babbler))
            .with_response_timeout(Duration::ZERO);
        assert!(matches!(
            device.ping(),
            Err(DeviceError::ResponseTimeout { timeout_ms: 0 })
        ));
    }

    #[test]
    fn test_enter_bootloader_switches_baud() {
        let sim = SimulatedController::new();
        let mock = sim.transport().with_baud(57600);
        let handle = mock.clone();
        let mut device = Flowmaster::new(mock);

        let mut bootloader = device
            .enter_bootloader(Duration::from_millis(50), CancelToken::new())
            .unwrap();
        bootloader.ping_until_ack().unwrap();
        drop(bootloader);

        assert!(sim.state().in_bootloader);
        assert_eq!(handle.baud_changes(), vec![BL_BAUD_RATE]);
    }
}
