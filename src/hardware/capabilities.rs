//! Atomic Hardware Capabilities
//!
//! The acquisition engine never talks to a concrete GPIO backend. Instead it depends on
//! two small capability traits:
//!
//! - [`DigitalInput`]: a line that can be sampled (sensor gates, push buttons)
//! - [`DigitalOutput`]: a line that can be driven (status and action LEDs)
//!
//! Real deployments use [`crate::hardware::gpio::SysfsPin`], which implements both.
//! Tests and `--mock` runs use the mocks in [`crate::hardware::mock`].
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Errors are opaque here. The monitor wraps them into
//! [`DaqError::Capability`](crate::error::DaqError::Capability) together with the channel id.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn mirror(input: &dyn DigitalInput, led: &dyn DigitalOutput) -> Result<()> {
//!     let level = input.sample().await?;
//!     led.set(level).await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Discrete Input
///
/// A single logic-level line.
///
/// # Contract
/// - `sample` returns the instantaneous level, `true` meaning high
/// - Sampling has no side effects and may be called at any rate
/// - An `Err` means the line is unusable; callers treat it as fatal
#[async_trait]
pub trait DigitalInput: Send + Sync {
    /// Read the current level of the line.
    async fn sample(&self) -> Result<bool>;
}

/// Capability: Discrete Output
///
/// A single logic-level line driven by the host.
#[async_trait]
pub trait DigitalOutput: Send + Sync {
    /// Drive the line high (`true`) or low (`false`).
    async fn set(&self, level: bool) -> Result<()>;
}
