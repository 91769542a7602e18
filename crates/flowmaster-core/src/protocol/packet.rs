//! Packet type codes.
//!
//! The controller firmware and this crate share one closed set of packet
//! types. Unknown codes are kept as raw bytes in [`Frame`](super::Frame) and
//! only turned into a [`PacketType`] when a caller needs to match on them.

use std::fmt;

/// Packet type carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Successful - acknowledge.
    Ack = 0x01,
    /// Failure - negative acknowledge.
    Nak = 0x02,
    /// Send regular heartbeats.
    StartHeartbeat = 0x03,
    /// Stop sending heartbeats.
    StopHeartbeat = 0x04,
    /// System status.
    Heartbeat = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    /// Ask for a single heartbeat.
    RequestStatus = 0x08,
    /// Disable closed-loop control.
    Manual = 0x09,
    /// Back to closed-loop control.
    Automatic = 0x0A,
    /// Custom message on the LCD.
    Message = 0x0B,
    /// LCD cursor position.
    Cursor = 0x0C,
    ConfigSet = 0x0D,
    ConfigGet = 0x0E,
    SysVersion = 0x0F,
    /// Device receive buffer overflowed.
    Overflow = 0x10,
    /// Device saw a checksum failure.
    BadChecksum = 0x11,
    /// Stop rotating the display.
    NoRotate = 0x12,
    /// Rotate the display as normal.
    Rotate = 0x13,
    /// Device rejected the length header.
    BadLength = 0x14,
    /// Enter the serial bootloader.
    Bootloader = 0x15,
    SetFan = 0x16,
    SetPump = 0x17,
    GetAdc = 0x18,
    /// TOP value of the PWM timer.
    GetTop = 0x19,
    SetFanProfile = 0x1A,
    GetFanProfile = 0x1B,
}

impl PacketType {
    /// Every packet type, in code order.
    pub const ALL: [PacketType; 27] = [
        PacketType::Ack,
        PacketType::Nak,
        PacketType::StartHeartbeat,
        PacketType::StopHeartbeat,
        PacketType::Heartbeat,
        PacketType::Ping,
        PacketType::Pong,
        PacketType::RequestStatus,
        PacketType::Manual,
        PacketType::Automatic,
        PacketType::Message,
        PacketType::Cursor,
        PacketType::ConfigSet,
        PacketType::ConfigGet,
        PacketType::SysVersion,
        PacketType::Overflow,
        PacketType::BadChecksum,
        PacketType::NoRotate,
        PacketType::Rotate,
        PacketType::BadLength,
        PacketType::Bootloader,
        PacketType::SetFan,
        PacketType::SetPump,
        PacketType::GetAdc,
        PacketType::GetTop,
        PacketType::SetFanProfile,
        PacketType::GetFanProfile,
    ];

    /// Look up a packet type by its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.code() == code)
    }

    /// Wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Check if the device uses this type to report a failed request.
    pub fn is_error_report(self) -> bool {
        matches!(
            self,
            PacketType::Nak | PacketType::Overflow | PacketType::BadChecksum | PacketType::BadLength
        )
    }

    /// Short protocol name.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Ack => "ACK",
            PacketType::Nak => "NAK",
            PacketType::StartHeartbeat => "START_HEARTBEAT",
            PacketType::StopHeartbeat => "STOP_HEARTBEAT",
            PacketType::Heartbeat => "HEARTBEAT",
            PacketType::Ping => "PING",
            PacketType::Pong => "PONG",
            PacketType::RequestStatus => "REQUEST_STATUS",
            PacketType::Manual => "MANUAL",
            PacketType::Automatic => "AUTOMATIC",
            PacketType::Message => "MESSAGE",
            PacketType::Cursor => "CURSOR",
            PacketType::ConfigSet => "CONFIG_SET",
            PacketType::ConfigGet => "CONFIG_GET",
            PacketType::SysVersion => "SYS_VERSION",
            PacketType::Overflow => "OVERFLOW",
            PacketType::BadChecksum => "BAD_CSUM",
            PacketType::NoRotate => "NO_ROTATE",
            PacketType::Rotate => "ROTATE",
            PacketType::BadLength => "BAD_LENGTH",
            PacketType::Bootloader => "BOOTLOADER",
            PacketType::SetFan => "SET_FAN",
            PacketType::SetPump => "SET_PUMP",
            PacketType::GetAdc => "GET_ADC",
            PacketType::GetTop => "GET_TOP",
            PacketType::SetFanProfile => "SET_FAN_PROFILE",
            PacketType::GetFanProfile => "GET_FAN_PROFILE",
        }
    }
}

impl From<PacketType> for u8 {
    fn from(p: PacketType) -> u8 {
        p.code()
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Display helper for a raw type byte that may not be a known packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPacketType(pub u8);

impl fmt::Display for RawPacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match PacketType::from_code(self.0) {
            Some(p) => write!(f, "{}", p),
            None => write!(f, "UNKNOWN (0x{:02X})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_contiguous() {
        for (i, p) in PacketType::ALL.iter().enumerate() {
            assert_eq!(p.code() as usize, i + 1);
            assert_eq!(PacketType::from_code(p.code()), Some(*p));
        }
        assert_eq!(PacketType::from_code(0x00), None);
        assert_eq!(PacketType::from_code(0x1C), None);
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(PacketType::Heartbeat.code(), 0x05);
        assert_eq!(PacketType::Bootloader.code(), 0x15);
        assert_eq!(PacketType::GetTop.code(), 0x19);
        assert_eq!(PacketType::GetFanProfile.code(), 0x1B);
    }

    #[test]
    fn test_error_reports() {
        assert!(PacketType::Nak.is_error_report());
        assert!(PacketType::BadChecksum.is_error_report());
        assert!(!PacketType::Ack.is_error_report());
        assert!(!PacketType::Heartbeat.is_error_report());
    }

    #[test]
    fn test_display() {
        assert_eq!(PacketType::Pong.to_string(), "PONG (0x07)");
        assert_eq!(RawPacketType(0x40).to_string(), "UNKNOWN (0x40)");
    }
}
