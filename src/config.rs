//! Configuration System using Figment
//!
//! Strongly-typed configuration for the acquisition engine. Values are layered:
//! 1. Built-in defaults matching the reference deployment (see [`DaqConfig::default`])
//! 2. A TOML file (`config/oshiwasp.toml` unless `--config` says otherwise)
//! 3. Environment variables prefixed with `OSHIWASP_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use oshiwasp_daq::config::DaqConfig;
//!
//! // OSHIWASP_TRANSPORT__PORT=/dev/ttyUSB0 overrides transport.port
//! let config = DaqConfig::load_from("config/oshiwasp.toml")?;
//! println!("Reading telemetry from {}", config.transport.port);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::frame::ResyncPolicy;
use crate::session::orchestrator::ProducerSettings;
use crate::session::ChannelFlags;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/oshiwasp.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "OSHIWASP_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Remote telemetry link
    pub transport: TransportConfig,
    /// Frame decoding
    #[serde(default)]
    pub frame: FrameConfig,
    /// Discrete channel polling
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Log files
    pub storage: StorageConfig,
    /// Indicator LEDs; omitted means no LEDs
    #[serde(default)]
    pub indicator: Option<IndicatorConfig>,
    /// Physical start/stop buttons; omitted means none
    #[serde(default)]
    pub controls: Option<ControlsConfig>,
    /// Discrete channels, in log order
    #[serde(default)]
    pub channels: Vec<ChannelDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Serial link to the remote device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Device path, e.g. `/dev/rfcomm1`
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Frame decoder settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FrameConfig {
    /// Resynchronisation policy (`lenient` or `sliding`)
    #[serde(default)]
    pub resync: ResyncPolicy,
}

/// Discrete channel polling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Delay between samples (`1ms`, `500us`, `0s` to busy-poll)
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Also log falling edges
    #[serde(default)]
    pub log_falling_edges: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            log_falling_edges: false,
        }
    }
}

/// Log file settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding the log files
    pub data_dir: PathBuf,
    /// File extension including the dot
    #[serde(default = "default_extension")]
    pub extension: String,
}

/// Indicator LED pins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorConfig {
    /// Lit while acquiring
    pub status_pin: String,
    /// Follows edges, blinks on frames
    pub action_pin: String,
}

/// Push button pins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlsConfig {
    /// Starts the acquisition
    pub start_pin: String,
    /// Stops the acquisition
    pub stop_pin: String,
}

/// Discrete channel definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelDefinition {
    /// Id written in the log (`A`, `B`, ...)
    pub id: String,
    /// Sysfs GPIO name (`gpio22`)
    pub pin: String,
    /// Whether the channel is enabled by default
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_extension() -> String {
    ".csv".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for DaqConfig {
    fn default() -> Self {
        let channel = |id: &str, pin: &str| ChannelDefinition {
            id: id.to_string(),
            pin: pin.to_string(),
            enabled: true,
        };
        Self {
            application: ApplicationConfig {
                name: "OshiWasp".to_string(),
                log_level: "info".to_string(),
                log_format: default_log_format(),
            },
            transport: TransportConfig {
                port: "/dev/rfcomm1".to_string(),
                baud_rate: default_baud_rate(),
            },
            frame: FrameConfig::default(),
            monitor: MonitorConfig::default(),
            storage: StorageConfig {
                data_dir: PathBuf::from("data"),
                extension: default_extension(),
            },
            indicator: Some(IndicatorConfig {
                status_pin: "gpio7".to_string(),
                action_pin: "gpio8".to_string(),
            }),
            controls: Some(ControlsConfig {
                start_pin: "gpio24".to_string(),
                stop_pin: "gpio23".to_string(),
            }),
            channels: vec![
                channel("A", "gpio22"),
                channel("B", "gpio18"),
                channel("C", "gpio17"),
                channel("D", "gpio4"),
            ],
        }
    }
}

impl DaqConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path. A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider, exposed for inspection in tests and tooling.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.transport.baud_rate == 0 {
            return Err(DaqError::Configuration("baud_rate must be positive".into()));
        }

        if self.storage.extension.is_empty() {
            return Err(DaqError::Configuration(
                "storage extension cannot be empty".into(),
            ));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if channel.id.is_empty() {
                return Err(DaqError::Configuration("channel id cannot be empty".into()));
            }
            if channel.id == crate::data::record::TELEMETRY_SOURCE {
                return Err(DaqError::Configuration(format!(
                    "channel id '{}' is reserved for telemetry",
                    channel.id
                )));
            }
            if !ids.insert(&channel.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel ID: {}",
                    channel.id
                )));
            }
        }

        Ok(())
    }

    /// Flags with telemetry on and the channels marked `enabled`.
    pub fn default_flags(&self) -> ChannelFlags {
        ChannelFlags {
            telemetry: true,
            discrete: self
                .channels
                .iter()
                .map(|ch| (ch.id.clone(), ch.enabled))
                .collect(),
        }
    }

    /// Producer tuning derived from the `frame` and `monitor` sections.
    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            resync: self.frame.resync,
            poll_interval: self.monitor.poll_interval,
            log_falling_edges: self.monitor.log_falling_edges,
        }
    }
}
