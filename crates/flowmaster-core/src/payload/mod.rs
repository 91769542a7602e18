//! Firmware image handling.
//!
//! Images arrive as Intel-HEX text and are streamed record by record.

pub mod ihex;

pub use ihex::{HexError, HexReader, HexRecord, validate_image};
