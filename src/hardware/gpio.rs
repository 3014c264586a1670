//! Linux sysfs GPIO lines.
//!
//! Pins are addressed by their sysfs name (`gpio22`). On open the pin is exported if needed
//! and its direction is written; afterwards only the `value` file is touched.

use crate::hardware::capabilities::{DigitalInput, DigitalOutput};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default sysfs root on Linux.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Direction written to the pin's `direction` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    /// Sampled by the host.
    In,
    /// Driven by the host.
    Out,
}

impl PinDirection {
    fn as_sysfs(&self) -> &'static str {
        match self {
            PinDirection::In => "in",
            PinDirection::Out => "out",
        }
    }
}

/// One exported GPIO line.
#[derive(Debug, Clone)]
pub struct SysfsPin {
    name: String,
    value_path: PathBuf,
}

impl SysfsPin {
    /// Export (if necessary) and configure `name` under the default sysfs root.
    pub async fn open(name: &str, direction: PinDirection) -> Result<Self> {
        Self::open_at(Path::new(SYSFS_GPIO_ROOT), name, direction).await
    }

    /// Same as [`SysfsPin::open`] with an explicit root directory.
    pub async fn open_at(root: &Path, name: &str, direction: PinDirection) -> Result<Self> {
        let number = pin_number(name)?;
        let pin_dir = root.join(name);

        if !tokio::fs::try_exists(&pin_dir).await.unwrap_or(false) {
            debug!(pin = %name, "Exporting GPIO pin");
            tokio::fs::write(root.join("export"), number.to_string())
                .await
                .with_context(|| format!("Failed to export {}", name))?;
        }

        tokio::fs::write(pin_dir.join("direction"), direction.as_sysfs())
            .await
            .with_context(|| format!("Failed to set direction of {}", name))?;

        Ok(Self {
            name: name.to_string(),
            value_path: pin_dir.join("value"),
        })
    }

    /// Sysfs name of the pin.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn pin_number(name: &str) -> Result<u32> {
    name.strip_prefix("gpio")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow!("Invalid GPIO pin name '{}', expected gpioN", name))
}

#[async_trait]
impl DigitalInput for SysfsPin {
    async fn sample(&self) -> Result<bool> {
        let raw = tokio::fs::read_to_string(&self.value_path)
            .await
            .with_context(|| format!("Failed to read {}", self.name))?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => bail!("Unexpected value '{}' on {}", other, self.name),
        }
    }
}

#[async_trait]
impl DigitalOutput for SysfsPin {
    async fn set(&self, level: bool) -> Result<()> {
        tokio::fs::write(&self.value_path, if level { "1" } else { "0" })
            .await
            .with_context(|| format!("Failed to write {}", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn fake_pin(root: &Path, name: &str, value: &str) {
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("value"), value).await.unwrap();
    }

    #[tokio::test]
    async fn test_sample_and_set() {
        let root = tempdir().unwrap();
        fake_pin(root.path(), "gpio22", "0\n").await;

        let pin = SysfsPin::open_at(root.path(), "gpio22", PinDirection::Out)
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read_to_string(root.path().join("gpio22/direction"))
                .await
                .unwrap(),
            "out"
        );
        assert!(!pin.sample().await.unwrap());

        pin.set(true).await.unwrap();
        assert!(pin.sample().await.unwrap());
    }

    #[tokio::test]
    async fn test_garbage_value_is_error() {
        let root = tempdir().unwrap();
        fake_pin(root.path(), "gpio4", "x\n").await;

        let pin = SysfsPin::open_at(root.path(), "gpio4", PinDirection::In)
            .await
            .unwrap();
        assert!(pin.sample().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_pin_fails_to_open() {
        let root = tempdir().unwrap();
        // No export file and no pin directory: exporting fails.
        let absent = root.path().join("absent");
        let result = SysfsPin::open_at(&absent, "gpio17", PinDirection::In).await;
        assert!(result.is_err());
        assert!(pin_number("led").is_err());
        assert_eq!(pin_number("gpio18").unwrap(), 18);
    }
}
