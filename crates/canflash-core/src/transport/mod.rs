//! Transport layer module.

pub mod hub;
pub mod mock;
pub mod serial;
pub mod simulator;
pub mod traits;

pub use hub::{CancelToken, MessageHub, ResponseWaiter, SessionLease, Subscription, WaitError};
pub use mock::MockTransport;
pub use serial::{SerialTransport, list_ports};
pub use simulator::SimulatedDevice;
pub use traits::{CanTransport, TransportError};
