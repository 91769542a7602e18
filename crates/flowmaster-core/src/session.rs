//! Firmware update session - high-level orchestrator for reflashing.
//!
//! The image is validated in full before the device is touched. Once the
//! enter-bootloader request has gone out, the bootloader is always told to
//! reset and the original line speed is always restored, whatever happened
//! in between.

use std::fs::File;
use std::io::{BufReader, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::bootloader::{Bootloader, BootloaderError};
use crate::cancel::CancelToken;
use crate::device::{DeviceError, Flowmaster};
use crate::events::{TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
use crate::payload::{HexError, HexReader, validate_image};
use crate::protocol::constants::*;
use crate::state::UpdateSession;
use crate::transport::{SerialTransport, TransportError};

/// Percent markers drawn across one display row during programming.
const PROGRESS_MARKERS: usize = DISPLAY_COLUMNS as usize;

/// Configuration for a connection and its firmware updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial device path.
    pub port: String,
    /// Application line speed.
    pub baud_rate: u32,
    /// Bound on each single-byte read.
    pub read_timeout_ms: u64,
    /// Bound on a whole request/response exchange.
    pub response_timeout_ms: u64,
    /// Bound on each bootloader acknowledgement.
    pub bootloader_timeout_secs: u64,
    /// Also erase the EEPROM when flashing.
    pub erase_eeprom: bool,
    /// Draw progress markers on the controller display while flashing.
    pub display_progress: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: READ_TIMEOUT_MS,
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            bootloader_timeout_secs: BL_ACK_TIMEOUT_SECS,
            erase_eeprom: false,
            display_progress: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply command-line overrides on top of file values.
    pub fn merge(mut self, port: Option<String>, baud_rate: Option<u32>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(baud) = baud_rate {
            self.baud_rate = baud;
        }
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn bootloader_timeout(&self) -> Duration {
        Duration::from_secs(self.bootloader_timeout_secs)
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Cannot open {path}: {source}")]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid image: {0}")]
    Validation(#[from] HexError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Bootloader error: {0}")]
    Bootloader(BootloaderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Block {block} failed: {source}")]
    Block {
        block: usize,
        source: BootloaderError,
    },

    #[error("Update cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BootloaderError> for UpdateError {
    fn from(e: BootloaderError) -> Self {
        match e {
            BootloaderError::Cancelled => UpdateError::Cancelled,
            e => UpdateError::Bootloader(e),
        }
    }
}

/// Firmware update - validates an image and drives the bootloader.
pub struct FirmwareUpdate<O: UpdateObserver> {
    observer: Arc<O>,
    ack_timeout: Duration,
    erase_eeprom: bool,
    display_progress: bool,
    cancel: CancelToken,
    session: UpdateSession,
}

impl FirmwareUpdate<TracingObserver> {
    /// Create an update with the default tracing observer.
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: UpdateObserver> FirmwareUpdate<O> {
    /// Create an update with a custom observer.
    pub fn with_observer(config: &SessionConfig, observer: Arc<O>) -> Self {
        Self {
            observer,
            ack_timeout: config.bootloader_timeout(),
            erase_eeprom: config.erase_eeprom,
            display_progress: config.display_progress,
            cancel: CancelToken::new(),
            session: UpdateSession::new(),
        }
    }

    /// Share an existing cancellation token, e.g. one wired to Ctrl-C.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn phase(&self) -> UpdatePhase {
        self.session.phase
    }

    fn emit(&self, event: UpdateEvent) {
        self.observer.on_event(&event);
    }

    fn goto(&mut self, to: UpdatePhase) {
        let from = self.session.goto_phase(to);
        if from != to {
            self.emit(UpdateEvent::PhaseChanged { from, to });
        }
    }

    fn checkpoint(&self) -> Result<(), UpdateError> {
        if self.cancel.is_cancelled() {
            warn!("Update cancelled");
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    fn open(&self, path: &Path) -> Result<File, UpdateError> {
        match File::open(path) {
            Ok(file) => {
                self.emit(UpdateEvent::FileOpened {
                    ok: true,
                    message: None,
                });
                Ok(file)
            }
            Err(source) => {
                self.emit(UpdateEvent::FileOpened {
                    ok: false,
                    message: Some(source.to_string()),
                });
                Err(UpdateError::FileOpen {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    fn validate(&mut self, reader: &mut BufReader<File>) -> Result<usize, UpdateError> {
        match validate_image(&mut *reader) {
            Ok(total) => {
                self.emit(UpdateEvent::Validated {
                    ok: true,
                    message: None,
                });
                self.emit(UpdateEvent::BlockCount { total });
                self.session.total_blocks = total;
                Ok(total)
            }
            Err(e) => {
                self.emit(UpdateEvent::Validated {
                    ok: false,
                    message: Some(e.to_string()),
                });
                Err(e.into())
            }
        }
    }

    /// Check an image without contacting any device.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn validate_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, UpdateError> {
        self.session.reset();
        let result = self.open(path.as_ref()).and_then(|file| {
            self.goto(UpdatePhase::Validating);
            self.validate(&mut BufReader::new(file))
        });
        if result.is_err() {
            self.goto(UpdatePhase::Error);
        }
        self.goto(UpdatePhase::Idle);
        if let Err(e) = &result {
            self.emit(UpdateEvent::UpdateError {
                message: e.to_string(),
            });
        }
        result
    }

    /// Validate `path` and write it to the device behind `device`.
    #[instrument(skip(self, device, path), fields(path = %path.as_ref().display()))]
    pub fn run<T: SerialTransport, P: AsRef<Path>>(
        &mut self,
        device: &mut Flowmaster<T>,
        path: P,
    ) -> Result<(), UpdateError> {
        self.session.reset();
        let result = self.run_inner(device, path.as_ref());
        match &result {
            Ok(()) => {
                self.goto(UpdatePhase::Idle);
                self.emit(UpdateEvent::UpdateOk);
            }
            Err(e) => {
                self.goto(UpdatePhase::Error);
                self.goto(UpdatePhase::Idle);
                self.emit(UpdateEvent::UpdateError {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn run_inner<T: SerialTransport>(
        &mut self,
        device: &mut Flowmaster<T>,
        path: &Path,
    ) -> Result<(), UpdateError> {
        let file = self.open(path)?;
        self.goto(UpdatePhase::Validating);
        let mut reader = BufReader::new(file);
        let total = self.validate(&mut reader)?;
        info!(blocks = total, "Image validated");

        self.checkpoint()?;
        self.goto(UpdatePhase::EnterBootloader);
        self.emit(UpdateEvent::UpdateBegin);
        let saved_baud = device.transport().baud_rate()?;
        self.session.saved_baud = Some(saved_baud);

        let flashed = self.flash(device, &mut reader);

        let reset = if self.session.bootloader_entered {
            self.goto(UpdatePhase::Resetting);
            Bootloader::new(device.transport_mut(), self.ack_timeout, self.cancel.clone()).reset()
        } else {
            Ok(())
        };
        let restored = device.transport_mut().set_baud_rate(saved_baud);
        if restored.is_ok() {
            info!(baud = saved_baud, "Line speed restored");
        }

        flashed?;
        reset?;
        restored?;
        Ok(())
    }

    fn flash<T: SerialTransport>(
        &mut self,
        device: &mut Flowmaster<T>,
        reader: &mut BufReader<File>,
    ) -> Result<(), UpdateError> {
        self.session.bootloader_entered = true;
        let mut bootloader = device.enter_bootloader(self.ack_timeout, self.cancel.clone())?;
        bootloader.ping_until_ack()?;

        self.goto(UpdatePhase::Erasing);
        self.emit(UpdateEvent::EraseBegin);
        bootloader.erase_chip()?;
        if self.erase_eeprom {
            bootloader.erase_eeprom()?;
        }
        self.emit(UpdateEvent::EraseOk);

        self.goto(UpdatePhase::Programming);
        reader.rewind()?;
        bootloader.show_message()?;

        let total = self.session.total_blocks;
        let mut markers = 0;
        for record in HexReader::new(&mut *reader) {
            self.checkpoint()?;
            let block = self.session.block;
            let record = record.inspect_err(|e| {
                self.emit(UpdateEvent::WriteError {
                    block,
                    message: e.to_string(),
                })
            })?;
            if let Err(source) = bootloader.program_block(record.address, &record.data) {
                self.emit(UpdateEvent::WriteError {
                    block,
                    message: source.to_string(),
                });
                return Err(match source {
                    BootloaderError::Cancelled => UpdateError::Cancelled,
                    source => UpdateError::Block { block, source },
                });
            }
            self.session.advance_block();
            self.emit(UpdateEvent::WriteOk { block, total });

            if self.display_progress && total > 0 {
                let due = self.session.block * PROGRESS_MARKERS / total;
                while markers < due {
                    bootloader.show_percent()?;
                    markers += 1;
                }
            }
        }
        Ok(())
    }
}
