//! Serial transport abstraction.
//!
//! Defines the `SerialTransport` trait the protocol layers talk to,
//! allowing different implementations (serialport, mock, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Port {0} is locked by another process")]
    Locked(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Failed to set baud rate {baud}: {message}")]
    BaudRate { baud: u32, message: String },

    #[error("Port closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-level serial link.
///
/// This trait enables:
/// - Production implementation using the `serialport` crate
/// - Mock implementation for unit testing
///
/// A transport is owned by exactly one connection; every method takes
/// `&mut self` so only one request can be in flight.
pub trait SerialTransport: Send {
    /// Write all of `data` and drain the output queue.
    ///
    /// Returns the number of bytes written; anything short of `data.len()`
    /// is reported as [`TransportError::ShortWrite`].
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Write a single byte.
    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        self.write(&[byte]).map(|_| ())
    }

    /// Read one byte, waiting at most the transport's read timeout.
    ///
    /// `Ok(None)` means nothing arrived in time.
    fn read_byte(&mut self) -> Result<Option<u8>, TransportError>;

    /// Discard anything pending in the input and output queues.
    fn clear(&mut self) -> Result<(), TransportError>;

    /// Current line speed.
    fn baud_rate(&self) -> Result<u32, TransportError>;

    /// Change the line speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;

    /// Human readable port name, for logging.
    fn name(&self) -> String;
}

impl<T: SerialTransport + ?Sized> SerialTransport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        (**self).write_byte(byte)
    }

    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        (**self).read_byte()
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        (**self).clear()
    }

    fn baud_rate(&self) -> Result<u32, TransportError> {
        (**self).baud_rate()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        (**self).set_baud_rate(baud)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}
