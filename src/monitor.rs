//! Discrete edge monitoring.
//!
//! A [`DiscreteEdgeMonitor`] polls one [`DigitalInput`] and turns level changes into
//! [`EdgeRecord`]s. Detection itself lives in [`EdgeDetector`], which is pure and knows
//! nothing about time or sessions.
//!
//! The monitor consults its [`ProducerGate`] before every sample. It exits as soon as the
//! session leaves Running/Paused or a sibling producer fails, and it only submits records
//! while Running. Edges seen while Paused still update the detector (and the indicator),
//! so resuming never yields a phantom edge for a level change that happened during the
//! pause.

use crate::data::log_writer::LogWriter;
use crate::data::record::{ActivityEvent, EdgeRecord, LogRecord, Transition};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::DigitalInput;
use crate::session::state::ProducerGate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

/// Tracks the last observed level of one line.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeDetector {
    last_level: bool,
}

impl EdgeDetector {
    /// Detector that assumes the line starts low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample. Returns the transition if the level changed.
    pub fn observe(&mut self, level: bool) -> Option<Transition> {
        let transition = match (self.last_level, level) {
            (false, true) => Some(Transition::Rising),
            (true, false) => Some(Transition::Falling),
            _ => None,
        };
        self.last_level = level;
        transition
    }

    /// Level seen by the most recent sample.
    pub fn last_level(&self) -> bool {
        self.last_level
    }
}

/// Counters reported when a monitor exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Samples taken.
    pub samples: u64,
    /// Edge records submitted to the log.
    pub logged: u64,
    /// Loggable edges observed while not Running.
    pub suppressed: u64,
}

/// Polls a single discrete channel for the lifetime of a Running/Paused session.
pub struct DiscreteEdgeMonitor {
    channel_id: String,
    input: Arc<dyn DigitalInput>,
    poll_interval: Duration,
    log_falling_edges: bool,
}

impl DiscreteEdgeMonitor {
    /// Create a monitor that logs rising edges only.
    pub fn new(channel_id: impl Into<String>, input: Arc<dyn DigitalInput>) -> Self {
        Self {
            channel_id: channel_id.into(),
            input,
            poll_interval: Duration::from_millis(1),
            log_falling_edges: false,
        }
    }

    /// Delay between samples. Zero yields to the scheduler instead of sleeping.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Also log falling edges.
    pub fn with_falling_edges(mut self, enabled: bool) -> Self {
        self.log_falling_edges = enabled;
        self
    }

    /// Channel this monitor samples.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Poll until the gate closes. Sampling failures are fatal.
    #[instrument(skip_all, fields(channel = %self.channel_id))]
    pub async fn run(
        self,
        gate: ProducerGate,
        writer: LogWriter,
        activity: broadcast::Sender<ActivityEvent>,
    ) -> AppResult<MonitorStats> {
        let mut detector = EdgeDetector::new();
        let mut stats = MonitorStats::default();

        loop {
            if !gate.is_open() {
                break;
            }

            let level = self
                .input
                .sample()
                .await
                .map_err(|source| DaqError::Capability {
                    channel: self.channel_id.clone(),
                    source,
                })?;
            let observed_at = Instant::now();
            stats.samples += 1;

            if let Some(transition) = detector.observe(level) {
                // No subscribers is fine.
                let _ = activity.send(ActivityEvent::Edge {
                    channel_id: self.channel_id.clone(),
                    transition,
                });

                if transition == Transition::Rising || self.log_falling_edges {
                    if let Some(snapshot) = gate.recording() {
                        let record = LogRecord::from(EdgeRecord {
                            channel_id: self.channel_id.clone(),
                            transition,
                            host_time_us: snapshot.host_time_us(observed_at),
                        });
                        writer.submit(&record).await?;
                        stats.logged += 1;
                    } else {
                        stats.suppressed += 1;
                    }
                }
            }

            if self.poll_interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        debug!(?stats, "Edge monitor exiting");
        Ok(stats)
    }
}

/// Block until `input` reads high, polling every `poll_interval`.
///
/// Used for the physical start/stop buttons.
pub async fn wait_for_press(input: &dyn DigitalInput, poll_interval: Duration) -> anyhow::Result<()> {
    while !input.sample().await? {
        tokio::time::sleep(poll_interval).await;
    }
    Ok(())
}
