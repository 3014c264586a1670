//! # OshiWasp DAQ Core Library
//!
//! Headless acquisition engine for a field rig made of a Bluetooth-attached IMU/distance
//! sensor and a handful of GPIO gate sensors. Telemetry frames and discrete edges are
//! merged into a single, line-oriented log stamped against one session clock.
//!
//! ## Crate Structure
//!
//! - **`frame`**: wire format of the remote device and the resynchronising `FrameDecoder`.
//! - **`monitor`**: edge detection and the per-channel polling loop.
//! - **`data`**: log records, the serialized `LogWriter` and on-disk log management.
//! - **`session`**: the `AcquisitionSession` state machine and its producer orchestration.
//! - **`hardware`**: capability traits, sysfs GPIO, serial transport, indicator LEDs and mocks.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`error`**: the crate-wide `DaqError`.
//! - **`tracing_setup`**: subscriber initialisation.

pub mod config;
pub mod data;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod monitor;
pub mod session;
pub mod tracing_setup;

pub use error::{AppResult, DaqError};
