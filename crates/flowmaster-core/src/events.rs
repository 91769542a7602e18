//! Event system for UI decoupling.
//!
//! Allows CLI/TUI front ends to follow a firmware update without tight
//! coupling to the core logic.

use std::fmt;

/// Firmware update phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// Nothing in progress.
    Idle,
    /// Checking the image without touching the device.
    Validating,
    /// Switching the controller into its bootloader.
    EnterBootloader,
    /// Chip erase in progress.
    Erasing,
    /// Writing records.
    Programming,
    /// Leaving the bootloader.
    Resetting,
    /// Error state.
    Error,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Idle => write!(f, "Idle"),
            UpdatePhase::Validating => write!(f, "Validating"),
            UpdatePhase::EnterBootloader => write!(f, "Enter Bootloader"),
            UpdatePhase::Erasing => write!(f, "Erasing"),
            UpdatePhase::Programming => write!(f, "Programming"),
            UpdatePhase::Resetting => write!(f, "Resetting"),
            UpdatePhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted during a firmware update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// Image file opened (or not).
    FileOpened { ok: bool, message: Option<String> },
    /// Validation pass finished.
    Validated { ok: bool, message: Option<String> },
    /// Number of data records that will be written.
    BlockCount { total: usize },
    /// Device contact starts.
    UpdateBegin,
    EraseBegin,
    EraseOk,
    /// Block `block` (0-based) written and acknowledged.
    WriteOk { block: usize, total: usize },
    /// Block `block` failed; programming stops.
    WriteError { block: usize, message: String },
    /// Phase changed.
    PhaseChanged { from: UpdatePhase, to: UpdatePhase },
    /// Update finished successfully.
    UpdateOk,
    /// Update failed.
    UpdateError { message: String },
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates. Events are
/// delivered synchronously on the updating thread.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::FileOpened { ok: true, .. } => tracing::info!("Firmware file opened"),
            UpdateEvent::FileOpened { ok: false, message } => {
                tracing::error!(error = ?message, "Failed to open firmware file")
            }
            UpdateEvent::Validated { ok: true, .. } => tracing::info!("Firmware image valid"),
            UpdateEvent::Validated { ok: false, message } => {
                tracing::error!(error = ?message, "Firmware image rejected")
            }
            UpdateEvent::BlockCount { total } => tracing::info!(blocks = total, "Block count"),
            UpdateEvent::UpdateBegin => tracing::info!("Update started"),
            UpdateEvent::EraseBegin => tracing::info!("Erasing chip"),
            UpdateEvent::EraseOk => tracing::info!("Chip erased"),
            UpdateEvent::WriteOk { block, total } => {
                let pct = if *total > 0 {
                    ((*block + 1) * 100) / *total
                } else {
                    0
                };
                tracing::debug!(block, progress = %format!("{}%", pct), "Block written");
            }
            UpdateEvent::WriteError { block, message } => {
                tracing::error!(block, "Block write failed: {}", message)
            }
            UpdateEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed")
            }
            UpdateEvent::UpdateOk => tracing::info!("Update complete"),
            UpdateEvent::UpdateError { message } => tracing::error!("Update failed: {}", message),
        }
    }
}

/// Observer that keeps every event, for tests and post-mortems.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<UpdateEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UpdateEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl UpdateObserver for RecordingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
