//! Wire constants shared by the host and the controller firmware.

// Framing sentinels
pub const FRAME_ESCAPE: u8 = 0x8F; // DLE
pub const FRAME_START: u8 = 0xAA; // STX
pub const FRAME_END: u8 = 0x55; // ETX

/// Receive buffer for one logical frame: type + length + payload + checksum.
pub const MAX_FRAME_SIZE: usize = 32;
/// Largest payload the controller accepts; more overflows its receive buffer.
pub const MAX_PAYLOAD_SIZE: usize = 11;

// Request/response timing
pub const READ_TIMEOUT_MS: u64 = 200;
pub const RESPONSE_TIMEOUT_MS: u64 = 2000;
/// Consecutive empty single-byte reads tolerated while waiting for a frame.
pub const MAX_IDLE_READS: usize = 4;

// Application link
pub const DEFAULT_BAUD_RATE: u32 = 19200;
/// Timer TOP used by shipped firmware, used when the device can't report its own.
pub const DEFAULT_PWM_TOP: u16 = 288;
/// Documented lower bound for actuator duty cycles. Not enforced on the wire.
pub const MIN_DUTY_CYCLE: f32 = 0.3;
/// Raw RPM counts are sampled over a two second window.
pub const RPM_SCALE: u32 = 30;

// Fan profile transfer
pub const FAN_PROFILE_LEN: usize = 65;
pub const FAN_PROFILE_SEGMENT: usize = 5;

// Display
pub const DISPLAY_COLUMNS: u8 = 20;
pub const DISPLAY_ROWS: u8 = 4;
/// Longest text for one `print_message` call; sent in payload-sized pieces.
pub const MAX_MESSAGE_LEN: usize = DISPLAY_COLUMNS as usize;

// Bootloader byte protocol
pub const BL_BAUD_RATE: u32 = 19200;
pub const BL_ACK: u8 = 0x06;
pub const BL_NAK: u8 = 0x15;
pub const BL_PING: u8 = b'p';
pub const BL_SET_ADDR: u8 = b'A';
pub const BL_ERASE: u8 = b'e';
pub const BL_ERASE_EEPROM: u8 = b'E';
pub const BL_PROGRAM: u8 = b'C';
pub const BL_RESET: u8 = b'R';
pub const BL_PROGRAM_MESSAGE: u8 = b'm';
pub const BL_PERCENT: u8 = b'%';
pub const BL_ACK_TIMEOUT_SECS: u64 = 30;

// Intel HEX
pub const HEX_RECORD_START: u8 = b':';
pub const HEX_RECORD_DATA: u8 = 0x00;
pub const HEX_RECORD_EOF: u8 = 0x01;
/// Largest data field accepted in a single record.
pub const MAX_RECORD_DATA: usize = 32;
/// Value of erased flash, used to pad odd-length records to a whole word.
pub const ERASED_BYTE: u8 = 0xFF;
