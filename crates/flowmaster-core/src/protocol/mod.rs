//! Protocol module - wire constants, packet types and framing.

pub mod constants;
pub mod frame;
pub mod packet;

pub use constants::*;
pub use frame::{Frame, FrameDecoder, FrameError, crc8, encode_frame};
pub use packet::{PacketType, RawPacketType};
