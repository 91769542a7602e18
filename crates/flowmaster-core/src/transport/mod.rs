//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod sim;
pub mod traits;

pub use mock::{MockResponder, MockTransport};
pub use serial::SerialPortTransport;
pub use sim::{ControllerState, SimulatedController};
pub use traits::{SerialTransport, TransportError};
