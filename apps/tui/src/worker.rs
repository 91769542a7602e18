//! Connection worker.
//!
//! The serial link is owned by one background thread. The UI sends it
//! requests over a channel and polls for replies on every tick; firmware
//! update events arrive separately through the shared [`TuiObserver`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flowmaster_core::{
    CancelToken, DeviceError, FirmwareUpdate, Flowmaster, SerialPortTransport, SerialTransport,
    SessionConfig, SimulatedController, TelemetrySnapshot,
};
use tracing::{info, warn};

use crate::app::{LogLevel, TuiObserver};

/// Work for the connection thread.
#[derive(Debug)]
pub enum Request {
    Refresh,
    SetFan(f32),
    SetPump(f32),
    Autoregulate(bool),
    Flash(PathBuf),
    Shutdown,
}

/// Results coming back from the connection thread.
#[derive(Debug)]
pub enum Reply {
    Connected { port: String, pwm_top: u16 },
    ConnectFailed(String),
    Status(TelemetrySnapshot),
    Log { level: LogLevel, message: String },
    FlashFinished { ok: bool },
}

pub struct Worker {
    requests: Sender<Request>,
    replies: Receiver<Reply>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the connection thread. Status is polled every `poll_interval`
    /// while idle.
    pub fn spawn(
        config: SessionConfig,
        simulate: bool,
        observer: Arc<TuiObserver>,
        poll_interval: Duration,
    ) -> Self {
        let (requests, request_rx) = mpsc::channel();
        let (reply_tx, replies) = mpsc::channel();
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();

        let handle = thread::spawn(move || {
            let mut device = match connect(&config, simulate) {
                Ok(device) => {
                    let _ = reply_tx.send(Reply::Connected {
                        port: device.transport().name(),
                        pwm_top: device.pwm_top(),
                    });
                    device
                }
                Err(e) => {
                    warn!(error = %e, "Connection failed");
                    let _ = reply_tx.send(Reply::ConnectFailed(e.to_string()));
                    return;
                }
            };

            loop {
                let request = match request_rx.recv_timeout(poll_interval) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => Request::Refresh,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let reply = match request {
                    Request::Shutdown => break,
                    Request::Refresh => match device.update_status() {
                        Ok(status) => Reply::Status(status),
                        Err(e) => log(LogLevel::Warn, format!("Status failed: {}", e)),
                    },
                    Request::SetFan(duty) => outcome(
                        device.set_fan_speed(duty),
                        format!("Fan set to {:.0}%", duty * 100.0),
                    ),
                    Request::SetPump(duty) => outcome(
                        device.set_pump_speed(duty),
                        format!("Pump set to {:.0}%", duty * 100.0),
                    ),
                    Request::Autoregulate(enabled) => outcome(
                        device.autoregulate(enabled),
                        format!(
                            "Automatic control {}",
                            if enabled { "on" } else { "off" }
                        ),
                    ),
                    Request::Flash(path) => {
                        thread_cancel.reset();
                        info!(path = %path.display(), "Flash requested");
                        let result = FirmwareUpdate::with_observer(&config, observer.clone())
                            .with_cancel_token(thread_cancel.clone())
                            .run(&mut device, &path);
                        Reply::FlashFinished { ok: result.is_ok() }
                    }
                };
                if reply_tx.send(reply).is_err() {
                    break;
                }
            }
            info!("Connection worker stopped");
        });

        Self {
            requests,
            replies,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn send(&self, request: Request) {
        // A dead worker already reported why.
        let _ = self.requests.send(request);
    }

    /// Replies received since the last call.
    pub fn drain(&self) -> Vec<Reply> {
        self.replies.try_iter().collect()
    }

    /// Abort a running firmware update at its next checkpoint.
    pub fn cancel_flash(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.requests.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn connect(
    config: &SessionConfig,
    simulate: bool,
) -> Result<Flowmaster<Box<dyn SerialTransport>>, DeviceError> {
    let transport: Box<dyn SerialTransport> = if simulate {
        Box::new(SimulatedController::new().transport())
    } else {
        Box::new(SerialPortTransport::open(
            &config.port,
            config.baud_rate,
            config.read_timeout(),
        )?)
    };
    Flowmaster::connect(transport, config)
}

fn log(level: LogLevel, message: String) -> Reply {
    Reply::Log { level, message }
}

fn outcome(result: Result<(), DeviceError>, success: String) -> Reply {
    match result {
        Ok(()) => log(LogLevel::Info, success),
        Err(e) => log(LogLevel::Error, e.to_string()),
    }
}
