//! Producer task orchestration.
//!
//! The orchestrator owns everything the producers need across runs: the frame decoder
//! (kept alive between start/stop so partial input is not lost), the discrete channels,
//! and the activity broadcast. Each `launch` spawns one telemetry task plus one monitor
//! per enabled channel into a `JoinSet`; `join` waits for all of them.
//!
//! Producers never change session state. The first producer to fail raises the halt flag,
//! which stops its siblings before their next sample or submission, closes the log and
//! reports the error on the fault channel. The session performs the transition when it
//! applies the fault.

use super::ChannelFlags;
use crate::data::log_writer::LogWriter;
use crate::data::record::{ActivityEvent, LogRecord};
use crate::error::{AppResult, DaqError};
use crate::frame::{DecoderStats, FrameDecoder, ResyncPolicy};
use crate::hardware::capabilities::DigitalInput;
use crate::hardware::serial::TransportReader;
use crate::monitor::DiscreteEdgeMonitor;
use crate::session::state::{HaltReason, ProducerGate, SessionSnapshot};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the activity broadcast. Slow indicator consumers just lag.
const ACTIVITY_CAPACITY: usize = 256;

/// A named discrete input.
#[derive(Clone)]
pub struct DiscreteChannel {
    /// Channel id as it appears in the log (`A`, `B`, ...).
    pub id: String,
    /// Line sampled by the monitor.
    pub input: Arc<dyn DigitalInput>,
}

impl DiscreteChannel {
    /// Pair an id with its input.
    pub fn new(id: impl Into<String>, input: Arc<dyn DigitalInput>) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }
}

impl std::fmt::Debug for DiscreteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscreteChannel")
            .field("id", &self.id)
            .field("input", &"<DigitalInput>")
            .finish()
    }
}

/// Tuning shared by every producer.
#[derive(Debug, Clone, Copy)]
pub struct ProducerSettings {
    /// Frame resynchronisation strategy.
    pub resync: ResyncPolicy,
    /// Delay between discrete samples.
    pub poll_interval: Duration,
    /// Log falling edges as well as rising ones.
    pub log_falling_edges: bool,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            resync: ResyncPolicy::Lenient,
            poll_interval: Duration::from_millis(1),
            log_falling_edges: false,
        }
    }
}

/// Spawns and joins producer tasks.
pub struct Orchestrator {
    decoder: Arc<Mutex<FrameDecoder<TransportReader>>>,
    channels: Vec<DiscreteChannel>,
    settings: ProducerSettings,
    tasks: JoinSet<()>,
    activity: broadcast::Sender<ActivityEvent>,
    decoder_stats: Arc<watch::Sender<DecoderStats>>,
    halt: Arc<watch::Sender<HaltReason>>,
    faults: mpsc::UnboundedSender<DaqError>,
}

impl Orchestrator {
    /// Build an orchestrator reading telemetry from `reader`.
    pub fn new(
        reader: TransportReader,
        channels: Vec<DiscreteChannel>,
        settings: ProducerSettings,
        faults: mpsc::UnboundedSender<DaqError>,
    ) -> Self {
        let (activity, _) = broadcast::channel(ACTIVITY_CAPACITY);
        let (decoder_stats, _) = watch::channel(DecoderStats::default());
        let decoder_stats = Arc::new(decoder_stats);
        let (halt, _) = watch::channel(None);
        Self {
            decoder: Arc::new(Mutex::new(FrameDecoder::new(reader, settings.resync))),
            channels,
            settings,
            tasks: JoinSet::new(),
            activity,
            decoder_stats,
            halt: Arc::new(halt),
            faults,
        }
    }

    /// Configured discrete channels.
    pub fn channels(&self) -> &[DiscreteChannel] {
        &self.channels
    }

    /// Subscribe to producer activity.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity.subscribe()
    }

    /// Decoder counters as of the last decoded frame.
    pub fn decoder_stats(&self) -> DecoderStats {
        *self.decoder_stats.borrow()
    }

    /// Whether a producer failed since the last launch and the fault is not yet joined.
    pub fn is_halted(&self) -> bool {
        self.halt.borrow().is_some()
    }

    /// Message of the fault that halted the producers.
    pub fn halt_reason(&self) -> HaltReason {
        self.halt.borrow().clone()
    }

    /// Whether any producer task is still alive or unjoined.
    pub fn is_active(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn the producers enabled in `flags`. The session must already be Running.
    pub fn launch(
        &mut self,
        session: &watch::Sender<SessionSnapshot>,
        writer: &LogWriter,
        flags: &ChannelFlags,
    ) {
        self.halt.send_replace(None);

        if flags.telemetry {
            let task = pump_telemetry(
                self.decoder.clone(),
                self.gate(session),
                writer.clone(),
                self.activity.clone(),
                self.decoder_stats.clone(),
            );
            self.spawn_producer("telemetry".to_string(), writer.clone(), task);
        }

        let enabled: Vec<DiscreteChannel> = self
            .channels
            .iter()
            .filter(|ch| flags.is_enabled(&ch.id))
            .cloned()
            .collect();
        for channel in enabled {
            let monitor = DiscreteEdgeMonitor::new(channel.id.clone(), channel.input)
                .with_poll_interval(self.settings.poll_interval)
                .with_falling_edges(self.settings.log_falling_edges);
            let gate = self.gate(session);
            let activity = self.activity.clone();
            let task_writer = writer.clone();
            self.spawn_producer(channel.id, writer.clone(), async move {
                monitor.run(gate, task_writer, activity).await.map(|_| ())
            });
        }

        info!(producers = self.tasks.len(), "Producers launched");
    }

    /// Wait for every producer to exit and lower the halt flag.
    ///
    /// Callers publish a non-producing state first unless the producers are halted.
    /// Faults stay queued on the fault channel.
    pub async fn join(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Producer task aborted");
            }
        }
        self.halt.send_replace(None);
    }

    fn gate(&self, session: &watch::Sender<SessionSnapshot>) -> ProducerGate {
        ProducerGate::new(session.subscribe(), self.halt.subscribe())
    }

    fn spawn_producer<F>(&mut self, name: String, writer: LogWriter, task: F)
    where
        F: Future<Output = AppResult<()>> + Send + 'static,
    {
        let faults = self.faults.clone();
        let halt = self.halt.clone();
        self.tasks.spawn(async move {
            match task.await {
                Ok(()) => debug!(producer = %name, "Producer finished"),
                Err(e) => {
                    error!(producer = %name, kind = e.kind(), error = %e, "Producer failed");
                    let first = halt.send_if_modified(|reason| {
                        if reason.is_some() {
                            return false;
                        }
                        *reason = Some(e.to_string());
                        true
                    });
                    if first {
                        if let Err(close) = writer.close().await {
                            warn!(error = %close, "Closing log after producer fault failed");
                        }
                    }
                    let _ = faults.send(e);
                }
            }
        });
    }
}

/// Drive the frame decoder until the gate closes.
#[instrument(skip_all)]
async fn pump_telemetry(
    decoder: Arc<Mutex<FrameDecoder<TransportReader>>>,
    mut gate: ProducerGate,
    writer: LogWriter,
    activity: broadcast::Sender<ActivityEvent>,
    stats: Arc<watch::Sender<DecoderStats>>,
) -> AppResult<()> {
    let mut decoder = decoder.lock().await;

    loop {
        if !gate.is_open() {
            break;
        }

        let frame = tokio::select! {
            decoded = decoder.decode_next() => decoded?,
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let received_at = Instant::now();
        stats.send_replace(decoder.stats());
        let _ = activity.send(ActivityEvent::Frame);

        if let Some(snapshot) = gate.recording() {
            let record = LogRecord::Telemetry {
                frame,
                host_time_us: snapshot.host_time_us(received_at),
            };
            writer.submit(&record).await?;
        }
    }

    let totals = decoder.stats();
    stats.send_replace(totals);
    debug!(?totals, "Telemetry pump exiting");
    Ok(())
}
