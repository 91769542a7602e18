//! Application state and logic.
//!
//! Contains the app state (Model), input handling (Controller).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use flowmaster_core::{SessionConfig, TelemetrySnapshot, UpdateEvent, UpdateObserver, UpdatePhase};

use crate::worker::{Reply, Request, Worker};

/// Maximum log entries to keep.
const MAX_LOG_ENTRIES: usize = 1000;
/// Coolant temperature samples kept for the sparkline.
const HISTORY_LEN: usize = 120;
/// Duty cycle change per key press.
const DUTY_STEP: f32 = 0.05;

/// Application state.
pub struct App {
    /// Current focus (which pane is active).
    pub focus: Focus,
    /// Current view/tab.
    pub current_tab: Tab,
    /// Controller connection.
    pub connection: ConnectionStatus,
    /// Latest telemetry.
    pub status: Option<TelemetrySnapshot>,
    /// Recent coolant temperatures, tenths of a degree.
    pub coolant_history: VecDeque<u64>,
    /// Requested fan duty cycle.
    pub fan_target: f32,
    /// Requested pump duty cycle.
    pub pump_target: f32,
    /// Closed-loop control on the controller.
    pub automatic: bool,
    /// Firmware image path input.
    pub flash_path: String,
    /// Current update phase.
    pub phase: UpdatePhase,
    /// Progress (0-100).
    pub progress: u8,
    /// Is an update running?
    pub is_flashing: bool,
    /// Log entries.
    pub logs: VecDeque<LogEntry>,
    /// Log scroll position.
    pub log_scroll: usize,
    /// Shared observer for receiving update events.
    pub observer: Arc<TuiObserver>,
    worker: Worker,
}

/// Which pane is focused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Controls,
    Flash,
}

/// Tab/view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Main,
    Logs,
    Help,
}

/// Controller connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected { port: String, pwm_top: u16 },
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
}

/// TUI observer that collects events for display.
pub struct TuiObserver {
    events: Mutex<VecDeque<UpdateEvent>>,
}

impl TuiObserver {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(100)),
        }
    }

    pub fn drain_events(&self) -> Vec<UpdateEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.drain(..).collect()
    }
}

impl Default for TuiObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateObserver for TuiObserver {
    fn on_event(&self, event: &UpdateEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        // Bounded; the oldest events go first.
        if events.len() >= 1000 {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

impl App {
    pub fn new(config: SessionConfig, simulate: bool, poll_interval: Duration) -> Self {
        let observer = Arc::new(TuiObserver::new());
        let worker = Worker::spawn(config, simulate, observer.clone(), poll_interval);
        Self {
            focus: Focus::Controls,
            current_tab: Tab::Main,
            connection: ConnectionStatus::Connecting,
            status: None,
            coolant_history: VecDeque::with_capacity(HISTORY_LEN),
            fan_target: 0.5,
            pump_target: 1.0,
            automatic: true,
            flash_path: String::new(),
            phase: UpdatePhase::Idle,
            progress: 0,
            is_flashing: false,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            log_scroll: 0,
            observer,
            worker,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection, ConnectionStatus::Connected { .. })
    }

    /// Handle keyboard input. Returns true if app should quit.
    pub fn on_key(&mut self, key: KeyEvent) -> bool {
        // Global shortcuts
        match key.code {
            KeyCode::Char('q') | KeyCode::Char('c')
                if key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                return true;
            }
            KeyCode::Esc => {
                if self.current_tab != Tab::Main {
                    self.current_tab = Tab::Main;
                    return false;
                }
                if self.is_flashing {
                    self.worker.cancel_flash();
                    self.add_log(LogLevel::Warn, "Cancelling update...");
                    return false;
                }
                return true;
            }
            KeyCode::F(1) => {
                self.current_tab = Tab::Help;
                return false;
            }
            KeyCode::F(2) => {
                self.current_tab = Tab::Logs;
                return false;
            }
            _ => {}
        }

        // Tab-specific handling
        match self.current_tab {
            Tab::Main => self.handle_main_key(key),
            Tab::Logs => self.handle_logs_key(key),
            Tab::Help => {
                // Any key returns to main
                self.current_tab = Tab::Main;
            }
        }

        false
    }

    fn handle_main_key(&mut self, key: KeyEvent) {
        if key.code == KeyCode::Tab {
            self.focus = match self.focus {
                Focus::Controls => Focus::Flash,
                Focus::Flash => Focus::Controls,
            };
            return;
        }
        match self.focus {
            Focus::Controls => self.handle_controls_key(key),
            Focus::Flash => self.handle_flash_key(key),
        }
    }

    fn handle_controls_key(&mut self, key: KeyEvent) {
        if !self.is_connected() || self.is_flashing {
            return;
        }
        match key.code {
            KeyCode::Char('f') => self.adjust_fan(-DUTY_STEP),
            KeyCode::Char('F') => self.adjust_fan(DUTY_STEP),
            KeyCode::Char('p') => self.adjust_pump(-DUTY_STEP),
            KeyCode::Char('P') => self.adjust_pump(DUTY_STEP),
            KeyCode::Char('a') => {
                self.automatic = !self.automatic;
                self.worker.send(Request::Autoregulate(self.automatic));
            }
            KeyCode::Char('r') => self.worker.send(Request::Refresh),
            _ => {}
        }
    }

    fn adjust_fan(&mut self, delta: f32) {
        self.fan_target = (self.fan_target + delta).clamp(0.0, 1.0);
        self.worker.send(Request::SetFan(self.fan_target));
    }

    fn adjust_pump(&mut self, delta: f32) {
        self.pump_target = (self.pump_target + delta).clamp(0.0, 1.0);
        self.worker.send(Request::SetPump(self.pump_target));
    }

    fn handle_flash_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => self.start_flash(),
            KeyCode::Char(c) if !self.is_flashing => self.flash_path.push(c),
            KeyCode::Backspace if !self.is_flashing => {
                self.flash_path.pop();
            }
            _ => {}
        }
    }

    fn handle_logs_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => {
                self.log_scroll = self.log_scroll.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.log_scroll < self.logs.len().saturating_sub(1) {
                    self.log_scroll += 1;
                }
            }
            KeyCode::PageUp => {
                self.log_scroll = self.log_scroll.saturating_sub(10);
            }
            KeyCode::PageDown => {
                self.log_scroll = (self.log_scroll + 10).min(self.logs.len().saturating_sub(1));
            }
            KeyCode::Home => {
                self.log_scroll = 0;
            }
            KeyCode::End => {
                self.log_scroll = self.logs.len().saturating_sub(1);
            }
            _ => {}
        }
    }

    fn start_flash(&mut self) {
        if self.is_flashing {
            return;
        }
        if !self.is_connected() {
            self.add_log(LogLevel::Error, "Not connected");
            return;
        }
        let path = self.flash_path.trim().to_string();
        if path.is_empty() {
            self.add_log(LogLevel::Error, "No firmware image! Please enter a .hex path.");
            return;
        }

        self.is_flashing = true;
        self.progress = 0;
        self.add_log(LogLevel::Info, format!("Flashing {}", path));
        self.worker.send(Request::Flash(PathBuf::from(path)));
    }

    /// Called on each tick - process worker replies and update events.
    pub fn on_tick(&mut self) {
        for reply in self.worker.drain() {
            self.process_reply(reply);
        }
        for event in self.observer.drain_events() {
            self.process_update_event(event);
        }
    }

    fn process_reply(&mut self, reply: Reply) {
        match reply {
            Reply::Connected { port, pwm_top } => {
                self.add_log(
                    LogLevel::Info,
                    format!("Connected on {} (PWM top {})", port, pwm_top),
                );
                self.connection = ConnectionStatus::Connected { port, pwm_top };
            }
            Reply::ConnectFailed(message) => {
                self.add_log(LogLevel::Error, format!("Connection failed: {}", message));
                self.connection = ConnectionStatus::Failed(message);
            }
            Reply::Status(status) => {
                if status.coolant_temp.is_finite() {
                    if self.coolant_history.len() >= HISTORY_LEN {
                        self.coolant_history.pop_front();
                    }
                    let tenths = (status.coolant_temp.max(0.0) * 10.0) as u64;
                    self.coolant_history.push_back(tenths);
                }
                self.status = Some(status);
            }
            Reply::Log { level, message } => self.add_log(level, message),
            Reply::FlashFinished { ok } => {
                self.is_flashing = false;
                if ok {
                    self.progress = 100;
                }
            }
        }
    }

    fn process_update_event(&mut self, event: UpdateEvent) {
        match event {
            UpdateEvent::FileOpened { ok: false, message }
            | UpdateEvent::Validated { ok: false, message } => {
                self.add_log(LogLevel::Error, message.unwrap_or_default());
            }
            UpdateEvent::FileOpened { ok: true, .. } => {}
            UpdateEvent::Validated { ok: true, .. } => {
                self.add_log(LogLevel::Info, "Image valid");
            }
            UpdateEvent::BlockCount { total } => {
                self.add_log(LogLevel::Info, format!("{} blocks to write", total));
            }
            UpdateEvent::UpdateBegin => self.add_log(LogLevel::Info, "Entering bootloader"),
            UpdateEvent::EraseBegin => self.add_log(LogLevel::Info, "Erasing chip"),
            UpdateEvent::EraseOk => self.add_log(LogLevel::Info, "Chip erased"),
            UpdateEvent::WriteOk { block, total } => {
                self.progress = if total > 0 {
                    (((block + 1) * 100) / total) as u8
                } else {
                    0
                };
            }
            UpdateEvent::WriteError { block, message } => {
                self.add_log(LogLevel::Error, format!("Block {}: {}", block, message));
            }
            UpdateEvent::PhaseChanged { to, .. } => {
                self.phase = to;
                self.add_log(LogLevel::Debug, format!("Phase: {}", to));
            }
            UpdateEvent::UpdateOk => {
                self.progress = 100;
                self.add_log(LogLevel::Info, "Update complete!");
            }
            UpdateEvent::UpdateError { message } => {
                self.add_log(LogLevel::Error, format!("Update failed: {}", message));
            }
        }
    }

    fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let now = chrono::Local::now();
        let entry = LogEntry {
            level,
            message: message.into(),
            timestamp: now.format("%H:%M:%S").to_string(),
        };

        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);

        // Auto-scroll to bottom
        self.log_scroll = self.logs.len().saturating_sub(1);
    }
}
