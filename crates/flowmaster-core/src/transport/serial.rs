//! serialport-based transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, instrument, trace};

use super::traits::{SerialTransport, TransportError};

/// Serial port opened 8N1, no flow control, exclusive access.
pub struct SerialPortTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialPortTransport {
    /// Open `path` at `baud`, with `read_timeout` bounding every single-byte read.
    #[instrument(level = "info", fields(read_timeout_ms = read_timeout.as_millis() as u64))]
    pub fn open(path: &str, baud: u32, read_timeout: Duration) -> Result<Self, TransportError> {
        let builder = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout);

        #[cfg(unix)]
        let port: Box<dyn SerialPort> = {
            let mut tty = builder.open_native().map_err(|e| open_error(path, e))?;
            // TIOCEXCL: a second open of the same tty fails while we hold it.
            tty.set_exclusive(true)
                .map_err(|_| TransportError::Locked(path.to_string()))?;
            Box::new(tty)
        };

        #[cfg(not(unix))]
        let port: Box<dyn SerialPort> = builder.open().map_err(|e| open_error(path, e))?;

        port.clear(ClearBuffer::All)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        info!(port = %path, baud, "Serial port opened");

        Ok(Self {
            port,
            name: path.to_string(),
        })
    }

    /// List serial ports present on the system.
    pub fn available_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|v| v.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }
}

fn open_error(path: &str, e: serialport::Error) -> TransportError {
    TransportError::OpenFailed {
        port: path.to_string(),
        message: e.to_string(),
    }
}

impl SerialTransport for SerialPortTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let written = self
            .port
            .write(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        if written != data.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        self.port
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = written, "Write complete");
        Ok(written)
    }

    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => {
                trace!(byte = %format!("0x{:02X}", buf[0]), "Read byte");
                Ok(Some(buf[0]))
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    fn baud_rate(&self) -> Result<u32, TransportError> {
        self.port.baud_rate().map_err(|e| TransportError::BaudRate {
            baud: 0,
            message: e.to_string(),
        })
    }

    #[instrument(skip(self))]
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| TransportError::BaudRate {
                baud,
                message: e.to_string(),
            })?;
        debug!(baud, "Baud rate changed");
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
