//! Secondary bootloader protocol.
//!
//! Once the application firmware has been told to jump to its bootloader,
//! the link runs at a fixed [`BL_BAUD_RATE`] and speaks single-byte
//! commands, each answered with [`BL_ACK`] or [`BL_NAK`]:
//!
//! | byte | command        | arguments              |
//! |------|----------------|------------------------|
//! | `p`  | ping           |                        |
//! | `e`  | erase chip     |                        |
//! | `E`  | erase EEPROM   |                        |
//! | `A`  | set address    | high, low              |
//! | `C`  | program word   | low, high              |
//! | `m`  | show message   | (no reply)             |
//! | `%`  | show percent   | (no reply)             |
//! | `R`  | reset          | (no reply)             |
//!
//! Every wait for a reply is bounded by a deadline and can be cancelled.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::cancel::{CancelToken, Deadline};
use crate::protocol::constants::*;
use crate::transport::{SerialTransport, TransportError};

#[derive(Error, Debug)]
pub enum BootloaderError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No reply to '{}' within {timeout_ms}ms", *command as char)]
    Timeout { command: u8, timeout_ms: u64 },

    #[error("'{}' answered with 0x{byte:02X} instead of ACK", *command as char)]
    Nak { command: u8, byte: u8 },

    #[error("Cancelled")]
    Cancelled,
}

/// Bootloader session on a borrowed transport.
pub struct Bootloader<'a, T: SerialTransport> {
    transport: &'a mut T,
    ack_timeout: Duration,
    cancel: CancelToken,
}

impl<'a, T: SerialTransport> Bootloader<'a, T> {
    /// Wrap a transport that is already at the bootloader baud rate.
    pub fn new(transport: &'a mut T, ack_timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            transport,
            ack_timeout,
            cancel,
        }
    }

    fn checkpoint(&self, command: u8, deadline: &Deadline) -> Result<(), BootloaderError> {
        if self.cancel.is_cancelled() {
            return Err(BootloaderError::Cancelled);
        }
        if deadline.is_expired() {
            return Err(BootloaderError::Timeout {
                command,
                timeout_ms: deadline.budget().as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Wait for any reply byte.
    fn wait_for_reply(&mut self, command: u8) -> Result<u8, BootloaderError> {
        let deadline = Deadline::after(self.ack_timeout);
        loop {
            if let Some(byte) = self.transport.read_byte()? {
                trace!(command = %(command as char), reply = %format!("0x{:02X}", byte), "Bootloader reply");
                return Ok(byte);
            }
            self.checkpoint(command, &deadline)?;
        }
    }

    fn expect_ack(&mut self, command: u8) -> Result<(), BootloaderError> {
        match self.wait_for_reply(command)? {
            BL_ACK => Ok(()),
            byte => Err(BootloaderError::Nak { command, byte }),
        }
    }

    /// Ping until the bootloader acknowledges.
    #[instrument(skip(self))]
    pub fn ping_until_ack(&mut self) -> Result<(), BootloaderError> {
        let deadline = Deadline::after(self.ack_timeout);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.transport.write_byte(BL_PING)?;
            if self.transport.read_byte()? == Some(BL_ACK) {
                debug!(attempts, "Bootloader responding");
                return Ok(());
            }
            self.checkpoint(BL_PING, &deadline)?;
        }
    }

    /// Erase the whole flash.
    #[instrument(skip(self))]
    pub fn erase_chip(&mut self) -> Result<(), BootloaderError> {
        self.transport.clear()?;
        self.transport.write_byte(BL_ERASE)?;
        self.expect_ack(BL_ERASE)
    }

    /// Erase the EEPROM.
    #[instrument(skip(self))]
    pub fn erase_eeprom(&mut self) -> Result<(), BootloaderError> {
        self.transport.clear()?;
        self.transport.write_byte(BL_ERASE_EEPROM)?;
        self.expect_ack(BL_ERASE_EEPROM)
    }

    pub fn set_address(&mut self, address: u16) -> Result<(), BootloaderError> {
        let [high, low] = address.to_be_bytes();
        self.transport.write(&[BL_SET_ADDR, high, low])?;
        self.expect_ack(BL_SET_ADDR)
    }

    /// Program one word at the current address.
    ///
    /// The bootloader takes the low byte first.
    pub fn program_word(&mut self, high: u8, low: u8) -> Result<(), BootloaderError> {
        self.transport.write(&[BL_PROGRAM, low, high])?;
        self.expect_ack(BL_PROGRAM)
    }

    /// Program `data` starting at `address`, one word per byte pair.
    ///
    /// An odd trailing byte is paired with the erased value.
    pub fn program_block(&mut self, address: u16, data: &[u8]) -> Result<(), BootloaderError> {
        self.transport.clear()?;
        self.set_address(address)?;
        for pair in data.chunks(2) {
            let high = pair[0];
            let low = pair.get(1).copied().unwrap_or(ERASED_BYTE);
            self.program_word(high, low)?;
        }
        Ok(())
    }

    /// Show the "programming" message on the controller display.
    pub fn show_message(&mut self) -> Result<(), BootloaderError> {
        self.transport.write_byte(BL_PROGRAM_MESSAGE)?;
        Ok(())
    }

    /// Add a progress marker on the controller display.
    pub fn show_percent(&mut self) -> Result<(), BootloaderError> {
        self.transport.write_byte(BL_PERCENT)?;
        Ok(())
    }

    /// Leave the bootloader and start the application firmware.
    #[instrument(skip(self))]
    pub fn reset(&mut self) -> Result<(), BootloaderError> {
        self.transport.write_byte(BL_RESET)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_ping_retries_until_ack() {
        let mut mock = MockTransport::new();
        mock.queue_reply(&[]);
        mock.queue_reply(&[0x00]);
        mock.queue_reply(&[BL_ACK]);
        let handle = mock.clone();

        let mut bl = Bootloader::new(&mut mock, SHORT, CancelToken::new());
        bl.ping_until_ack().unwrap();
        assert_eq!(handle.written_bytes(), b"ppp");
    }

    #[test]
    fn test_ping_gives_up_at_deadline() {
        let mut mock = MockTransport::new();
        let mut bl = Bootloader::new(&mut mock, SHORT, CancelToken::new());
        let err = bl.ping_until_ack().unwrap_err();
        assert!(matches!(err, BootloaderError::Timeout { command: BL_PING, .. }));
    }

    #[test]
    fn test_erase_requires_ack() {
        let mut mock = MockTransport::new();
        mock.queue_reply(&[BL_NAK]);
        let mut bl = Bootloader::new(&mut mock, SHORT, CancelToken::new());
        let err = bl.erase_chip().unwrap_err();
        assert!(matches!(
            err,
            BootloaderError::Nak {
                command: BL_ERASE,
                byte: BL_NAK
            }
        ));
    }

    #[test]
    fn test_erase_waits_for_any_byte() {
        let mut mock = MockTransport::new();
        let mut bl = Bootloader::new(&mut mock, SHORT, CancelToken::new());
        let err = bl.erase_chip().unwrap_err();
        assert!(matches!(err, BootloaderError::Timeout { command: BL_ERASE, .. }));
    }

    #[test]
    fn test_program_word_swaps_bytes() {
        let mut mock = MockTransport::new();
        mock.queue_reply(&[BL_ACK]);
        let handle = mock.clone();
        let mut bl = Bootloader::new(&mut mock, SHORT, CancelToken::new());
        bl.program_word(0x12, 0x34).unwrap();
        assert_eq!(handle.get_writes(), vec![vec![BL_PROGRAM, 0x34, 0x12]]);
    }

    #[test]
    fn test_program_block_odd_length() {
        let mut mock = MockTransport::new();
        for _ in 0..3 {
            mock.queue_reply(&[BL_ACK]);
        }
        let handle = mock.clone();
        let mut bl = Bootloader::new(&mut mock, SHORT, CancelToken::new());
        bl.program_block(0x0030, &[0x02, 0x33, 0x7A]).unwrap();
        assert_eq!(
            handle.get_writes(),
            vec![
                vec![BL_SET_ADDR, 0x00, 0x30],
                vec![BL_PROGRAM, 0x33, 0x02],
                vec![BL_PROGRAM, 0xFF, 0x7A],
            ]
        );
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let mut mock = MockTransport::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut bl = Bootloader::new(&mut mock, Duration::from_secs(3600), cancel);
        assert!(matches!(bl.erase_chip(), Err(BootloaderError::Cancelled)));
    }
}
