//! Mock serial transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{SerialTransport, TransportError};
use crate::protocol::constants::DEFAULT_BAUD_RATE;
use crate::protocol::{Frame, PacketType};

/// Something on the far end of a [`MockTransport`] that reacts to writes.
pub trait MockResponder: Send {
    /// Called for every write; returned bytes become readable.
    fn respond(&mut self, written: &[u8], baud: u32) -> Vec<u8>;
}

/// Mock transport for unit testing protocol logic.
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a connection.
#[derive(Clone)]
pub struct MockTransport {
    /// Bytes waiting to be read.
    rx: Arc<Mutex<VecDeque<u8>>>,
    /// Scripted replies, one released per write.
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Every baud rate passed to `set_baud_rate`.
    baud_log: Arc<Mutex<Vec<u32>>>,
    baud: Arc<Mutex<u32>>,
    responder: Arc<Mutex<Option<Box<dyn MockResponder>>>>,
    /// Whether the port is "open".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            rx: Arc::new(Mutex::new(VecDeque::new())),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            baud_log: Arc::new(Mutex::new(Vec::new())),
            baud: Arc::new(Mutex::new(DEFAULT_BAUD_RATE)),
            responder: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Mock whose writes are answered by `responder`.
    pub fn with_responder(responder: impl MockResponder + 'static) -> Self {
        let mock = Self::new();
        *mock.responder.lock().unwrap() = Some(Box::new(responder));
        mock
    }

    /// Line speed the port starts at. Not recorded as a baud change.
    pub fn with_baud(self, baud: u32) -> Self {
        *self.baud.lock().unwrap() = baud;
        self
    }

    /// Queue raw bytes to be released by the next write.
    pub fn queue_reply(&self, bytes: &[u8]) {
        self.replies.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue an encoded frame to be released by the next write.
    pub fn queue_frame(&self, packet_type: PacketType, payload: &[u8]) {
        let bytes = Frame::new(packet_type, payload)
            .encode()
            .expect("test frame fits");
        self.queue_reply(&bytes);
    }

    /// Make bytes readable right away.
    pub fn inject(&self, bytes: &[u8]) {
        self.rx.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// All written bytes, concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.write_log.lock().unwrap().concat()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Every baud rate set since creation, in order.
    pub fn baud_changes(&self) -> Vec<u32> {
        self.baud_log.lock().unwrap().clone()
    }

    /// Simulate the port going away.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate the port coming back.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if *self.connected.lock().unwrap() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.write_log.lock().unwrap().push(data.to_vec());

        let scripted = self.replies.lock().unwrap().pop_front();
        let reply = match scripted {
            Some(bytes) => bytes,
            None => {
                let baud = *self.baud.lock().unwrap();
                match self.responder.lock().unwrap().as_mut() {
                    Some(responder) => responder.respond(data, baud),
                    None => Vec::new(),
                }
            }
        };
        self.rx.lock().unwrap().extend(reply);
        Ok(data.len())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        self.check_connected()?;
        Ok(self.rx.lock().unwrap().pop_front())
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        self.check_connected()?;
        self.rx.lock().unwrap().clear();
        Ok(())
    }

    fn baud_rate(&self) -> Result<u32, TransportError> {
        self.check_connected()?;
        Ok(*self.baud.lock().unwrap())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.check_connected()?;
        self.baud_log.lock().unwrap().push(baud);
        *self.baud.lock().unwrap() = baud;
        Ok(())
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl MockResponder for Echo {
        fn respond(&mut self, written: &[u8], _baud: u32) -> Vec<u8> {
            written.to_vec()
        }
    }

    #[test]
    fn test_mock_reply_queue() {
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0x06]);
        mock.queue_reply(&[0x15, 0x16]);

        // Nothing is readable until something is written.
        assert_eq!(mock.read_byte().unwrap(), None);

        mock.write(b"p").unwrap();
        assert_eq!(mock.read_byte().unwrap(), Some(0x06));
        assert_eq!(mock.read_byte().unwrap(), None);

        mock.write(b"e").unwrap();
        assert_eq!(mock.read_byte().unwrap(), Some(0x15));
        assert_eq!(mock.read_byte().unwrap(), Some(0x16));
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        mock.write(b"Hello").unwrap();
        mock.write_byte(b'!').unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(mock.written_bytes(), b"Hello!");
    }

    #[test]
    fn test_mock_clear_discards_input() {
        let mut mock = MockTransport::new();
        mock.inject(&[1, 2, 3]);
        mock.clear().unwrap();
        assert_eq!(mock.read_byte().unwrap(), None);
    }

    #[test]
    fn test_mock_responder_and_baud() {
        let mut mock = MockTransport::with_responder(Echo).with_baud(57600);
        let handle = mock.clone();
        assert_eq!(mock.baud_rate().unwrap(), 57600);

        mock.set_baud_rate(19200).unwrap();
        mock.write(&[7]).unwrap();
        assert_eq!(mock.read_byte().unwrap(), Some(7));
        assert_eq!(handle.baud_changes(), vec![19200]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(mock.write(b"test"), Err(TransportError::Closed)));
        mock.reconnect();
        assert!(mock.write(b"test").is_ok());
    }
}
