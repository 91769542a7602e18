//! Flowmaster-Core: host driver for the Flowmaster liquid-cooling controller.
//!
//! This crate talks to the controller over a serial link: framed,
//! checksummed request/response packets for telemetry and actuator control,
//! and the single-byte bootloader protocol for reflashing from Intel-HEX.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: serial port abstraction (serialport, mock, simulator)
//! - **Protocol**: wire constants, packet types, byte-stuffed CRC-8 framing
//! - **Device**: the [`Flowmaster`] connection, telemetry and fan profiles
//! - **Bootloader**: erase/program/reset commands
//! - **Payload**: streaming Intel-HEX reader and validator
//! - **State / Events / Session**: the firmware update orchestrator
//!
//! # Example
//!
//! ```no_run
//! use flowmaster_core::{Flowmaster, FirmwareUpdate, SessionConfig};
//!
//! let config = SessionConfig {
//!     port: "/dev/ttyUSB0".to_string(),
//!     ..Default::default()
//! };
//!
//! let mut device = Flowmaster::open(&config).expect("open failed");
//! println!("{}", device.update_status().expect("no status"));
//!
//! let mut update = FirmwareUpdate::new(&config);
//! update.run(&mut device, "firmware.hex").expect("update failed");
//! ```

pub mod bootloader;
pub mod cancel;
pub mod device;
pub mod events;
pub mod fan_profile;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod transport;

// Re-exports for convenience
pub use bootloader::{Bootloader, BootloaderError};
pub use cancel::{CancelToken, Deadline};
pub use device::{DeviceError, Flowmaster};
pub use events::{NullObserver, TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
pub use fan_profile::{FanProfile, FanProfileError};
pub use payload::{HexError, HexReader, HexRecord, validate_image};
pub use protocol::{Frame, FrameDecoder, FrameError, PacketType};
pub use session::{FirmwareUpdate, SessionConfig, UpdateError};
pub use telemetry::TelemetrySnapshot;
pub use transport::{
    MockTransport, SerialPortTransport, SerialTransport, SimulatedController, TransportError,
};
