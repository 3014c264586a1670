//! Hardware Abstraction Layer
//!
//! Capability traits for discrete I/O, the remote telemetry transport, and their real
//! (sysfs GPIO, tokio-serial) and simulated implementations.

pub mod capabilities;
pub mod gpio;
pub mod indicator;
pub mod mock;
pub mod serial;

pub use capabilities::{DigitalInput, DigitalOutput};
pub use serial::{split_transport, DynTransport, RemoteLink, Transport, TransportReader};
