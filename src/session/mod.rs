//! Acquisition session: the single owner of session state.
//!
//! `AcquisitionSession` is the only component that changes [`SessionState`]. It publishes
//! every change as a [`SessionSnapshot`] on a `watch` channel, which is how producers learn
//! when to stop submitting records and when to exit. It also owns the write half of the
//! transport (the [`RemoteLink`]) and the log writer.
//!
//! # Control operations
//!
//! Each operation maps to one row of the transition table in [`state`]:
//!
//! | Operation | From | To |
//! |---|---|---|
//! | [`start`](AcquisitionSession::start) | New, Stopped | Running |
//! | [`pause`](AcquisitionSession::pause) | Running | Paused |
//! | [`resume`](AcquisitionSession::resume) | Paused | Running |
//! | [`stop`](AcquisitionSession::stop) | Running, Paused | Stopped |
//! | [`reconfigure`](AcquisitionSession::reconfigure) | any | New |
//!
//! Anything else returns [`DaqError::InvalidTransition`] and leaves the session untouched.
//!
//! # Faults
//!
//! Fatal errors (transport, capability, log I/O) move the session to Error: telemetry is
//! disabled best-effort, producers are joined and the log is closed. Faults raised by a
//! control operation are returned from that call.
//!
//! A failing producer halts its siblings and closes the log on its own, and from that
//! moment [`current_state`](AcquisitionSession::current_state) reports Error. The fault
//! itself waits on an internal channel until it is applied, either at the start of the
//! next control operation or by a caller watching
//! [`next_fault`](AcquisitionSession::next_fault).

pub mod orchestrator;
pub mod state;

use crate::data::log_writer::LogWriter;
use crate::data::record::ActivityEvent;
use crate::data::store::LogStore;
use crate::error::{AppResult, DaqError};
use crate::hardware::serial::{split_transport, DynTransport, RemoteLink};
use orchestrator::{DiscreteChannel, Orchestrator, ProducerSettings};
use serde::Serialize;
use state::{SessionEvent, SessionSnapshot, SessionState};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Which producers run for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelFlags {
    /// Stream telemetry frames from the remote device.
    pub telemetry: bool,
    /// Discrete channel id to enabled flag.
    pub discrete: BTreeMap<String, bool>,
}

impl ChannelFlags {
    /// Telemetry plus every listed discrete channel.
    pub fn all<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            telemetry: true,
            discrete: ids.into_iter().map(|id| (id.into(), true)).collect(),
        }
    }

    /// Enable or disable one discrete channel.
    pub fn set(&mut self, id: impl Into<String>, enabled: bool) {
        self.discrete.insert(id.into(), enabled);
    }

    /// Whether discrete channel `id` is enabled. Unknown ids are disabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.discrete.get(id).copied().unwrap_or(false)
    }
}

/// What the user chose before entering New.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    /// Session name, also the log file stem.
    pub name: String,
    /// Enabled producers.
    pub channels: ChannelFlags,
}

impl SessionConfig {
    /// Create a configuration.
    pub fn new(name: impl Into<String>, channels: ChannelFlags) -> Self {
        Self {
            name: name.into(),
            channels,
        }
    }

    /// Check the name is usable as a file stem and every flag names a known channel.
    pub fn validate(&self, known: &[DiscreteChannel]) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(DaqError::Configuration("session name cannot be empty".into()));
        }
        if let Some(bad) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(DaqError::Configuration(format!(
                "session name '{}' contains invalid character '{}'",
                self.name, bad
            )));
        }
        if let Some(unknown) = self
            .channels
            .discrete
            .keys()
            .find(|id| !known.iter().any(|ch| &ch.id == *id))
        {
            return Err(DaqError::Configuration(format!(
                "unknown discrete channel '{}'",
                unknown
            )));
        }
        Ok(())
    }
}

/// Hardware handed to a session.
pub struct SessionHardware {
    /// Duplex link to the remote telemetry device.
    pub transport: DynTransport,
    /// Discrete inputs, in log order.
    pub channels: Vec<DiscreteChannel>,
}

/// Result of sampling one channel outside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum ChannelStatus {
    /// Not enabled in the current configuration.
    Disabled,
    /// Sampled successfully.
    Ready {
        /// Level read during the check.
        level: bool,
    },
    /// Sampling failed.
    Broken(String),
}

/// One line of [`AcquisitionSession::channel_report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    /// Channel id.
    pub channel_id: String,
    /// Outcome of the check.
    pub status: ChannelStatus,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// Session name.
    pub name: String,
    /// Identifier of the current configuration.
    pub run_id: Uuid,
    /// Active log file.
    pub log_path: PathBuf,
    /// Records written since the log destination was last opened.
    pub records_written: u64,
    /// Frames decoded since the session was created.
    pub frames_decoded: u64,
    /// Malformed frames dropped by the decoder.
    pub frames_dropped: u64,
    /// Message of the fault that put the session in Error.
    pub last_fault: Option<String>,
}

/// The acquisition state machine and everything it owns.
pub struct AcquisitionSession {
    config: SessionConfig,
    run_id: Uuid,
    snapshot: watch::Sender<SessionSnapshot>,
    link: RemoteLink,
    writer: LogWriter,
    store: LogStore,
    log_path: PathBuf,
    producers: Orchestrator,
    faults: mpsc::UnboundedReceiver<DaqError>,
    last_fault: Option<String>,
}

impl AcquisitionSession {
    /// Create a session in New with a fresh log destination.
    #[instrument(skip_all, fields(name = %config.name))]
    pub async fn configure(
        config: SessionConfig,
        hardware: SessionHardware,
        settings: ProducerSettings,
        store: LogStore,
    ) -> AppResult<Self> {
        config.validate(&hardware.channels)?;

        let run_id = Uuid::new_v4();
        let (log_path, destination) = store.create(&config.name, run_id).await?;
        let (reader, link) = split_transport(hardware.transport);
        let (fault_tx, faults) = mpsc::unbounded_channel();
        let producers = Orchestrator::new(reader, hardware.channels, settings, fault_tx);
        let (snapshot, _) = watch::channel(SessionSnapshot::default());

        info!(%run_id, log = %log_path.display(), "Session configured");
        Ok(Self {
            config,
            run_id,
            snapshot,
            link,
            writer: LogWriter::with_destination(Box::new(destination)),
            store,
            log_path,
            producers,
            faults,
            last_fault: None,
        })
    }

    /// Current state. Error as soon as a producer has failed, even before the fault is
    /// applied.
    pub fn current_state(&self) -> SessionState {
        if self.producers.is_halted() {
            SessionState::Error
        } else {
            self.published_state()
        }
    }

    /// Instant captured on the first start of the current configuration.
    pub fn time_zero(&self) -> Option<Instant> {
        self.snapshot.borrow().time_zero
    }

    /// Active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Path of the current log destination.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Watch session snapshots (state and `time_zero`).
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Watch producer activity (frames and edges), e.g. for indicator LEDs.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.producers.subscribe_activity()
    }

    /// Snapshot for display.
    pub fn status(&self) -> SessionStatus {
        let stats = self.producers.decoder_stats();
        SessionStatus {
            state: self.current_state(),
            name: self.config.name.clone(),
            run_id: self.run_id,
            log_path: self.log_path.clone(),
            records_written: self.writer.records_written(),
            frames_decoded: stats.frames,
            frames_dropped: stats.dropped,
            last_fault: self
                .last_fault
                .clone()
                .or_else(|| self.producers.halt_reason()),
        }
    }

    /// New|Stopped -> Running.
    #[instrument(skip(self), fields(name = %self.config.name))]
    pub async fn start(&mut self) -> AppResult<()> {
        let from = self.begin(SessionEvent::Start).await?;

        if !self.writer.is_open().await {
            let destination = match self.store.reopen(&self.log_path).await {
                Ok(destination) => destination,
                Err(e) => return Err(self.fail(e).await),
            };
            if let Err(e) = self.writer.rotate(Box::new(destination)).await {
                return Err(self.fail(e).await);
            }
        }

        if let Err(e) = self.link.enable_telemetry().await {
            return Err(self.fail(e).await);
        }

        let time_zero = self.time_zero().unwrap_or_else(Instant::now);
        self.publish(SessionState::Running, Some(time_zero));
        self.producers
            .launch(&self.snapshot, &self.writer, &self.config.channels);
        info!(?from, "Acquisition running");
        Ok(())
    }

    /// Running -> Paused. Producers keep running but nothing is logged.
    #[instrument(skip(self), fields(name = %self.config.name))]
    pub async fn pause(&mut self) -> AppResult<()> {
        self.begin(SessionEvent::Pause).await?;

        if let Err(e) = self.link.disable_telemetry().await {
            return Err(self.fail(e).await);
        }
        self.publish(SessionState::Paused, self.time_zero());
        if let Err(e) = self.writer.flush().await {
            return Err(self.fail(e).await);
        }
        info!("Acquisition paused");
        Ok(())
    }

    /// Paused -> Running. `time_zero` is kept.
    #[instrument(skip(self), fields(name = %self.config.name))]
    pub async fn resume(&mut self) -> AppResult<()> {
        self.begin(SessionEvent::Resume).await?;

        if let Err(e) = self.link.enable_telemetry().await {
            return Err(self.fail(e).await);
        }
        self.publish(SessionState::Running, self.time_zero());
        info!("Acquisition resumed");
        Ok(())
    }

    /// Running|Paused -> Stopped. Producers are joined and the log is closed.
    #[instrument(skip(self), fields(name = %self.config.name))]
    pub async fn stop(&mut self) -> AppResult<()> {
        self.begin(SessionEvent::Stop).await?;

        if let Err(e) = self.link.disable_telemetry().await {
            return Err(self.fail(e).await);
        }
        self.publish(SessionState::Stopped, self.time_zero());
        self.producers.join().await;
        if let Some(fault) = self.drain_faults() {
            return Err(self.fail(fault).await);
        }
        if let Err(e) = self.writer.close().await {
            return Err(self.fail(e).await);
        }
        info!(records = self.writer.records_written(), "Acquisition stopped");
        Ok(())
    }

    /// Any state -> New with a new configuration, a fresh log and `time_zero` unset.
    #[instrument(skip_all, fields(name = %config.name))]
    pub async fn reconfigure(&mut self, config: SessionConfig) -> AppResult<()> {
        if let Some(fault) = self.take_pending_fault().await {
            let fault = self.fail(fault).await;
            warn!(error = %fault, "Applied pending fault before reconfigure");
        }
        let from = self.current_state();
        if from.next(SessionEvent::Reconfigure).is_none() {
            return Err(DaqError::InvalidTransition {
                state: from,
                event: SessionEvent::Reconfigure,
            });
        }
        config.validate(self.producers.channels())?;

        if self.published_state().has_producers() {
            if let Err(e) = self.link.disable_telemetry().await {
                return Err(self.fail(e).await);
            }
            self.publish(SessionState::New, None);
            self.producers.join().await;
        }
        // Stale faults belong to the configuration being discarded.
        while let Some(stale) = self.drain_faults() {
            warn!(error = %stale, "Discarding fault from previous configuration");
        }

        let run_id = Uuid::new_v4();
        let (log_path, destination) = match self.store.create(&config.name, run_id).await {
            Ok(created) => created,
            Err(e) => return Err(self.fail(e).await),
        };
        if let Err(e) = self.writer.rotate(Box::new(destination)).await {
            return Err(self.fail(e).await);
        }

        self.config = config;
        self.run_id = run_id;
        self.log_path = log_path;
        self.last_fault = None;
        self.publish(SessionState::New, None);
        info!(?from, %run_id, log = %self.log_path.display(), "Session reconfigured");
        Ok(())
    }

    /// Wait for a fault reported by a producer.
    ///
    /// Cancel safe and never resolves while producers are healthy, so it fits in a
    /// `tokio::select!`. The returned fault must be passed to
    /// [`apply_fault`](Self::apply_fault).
    pub async fn next_fault(&mut self) -> Option<DaqError> {
        self.faults.recv().await
    }

    /// Perform the fault transition for an asynchronously reported fault.
    pub async fn apply_fault(&mut self, fault: DaqError) -> DaqError {
        self.fail(fault).await
    }

    /// Sample every configured channel once. Only valid while no producers run.
    pub async fn channel_report(&self) -> AppResult<Vec<ChannelReport>> {
        let state = self.published_state();
        if state.has_producers() {
            return Err(DaqError::SessionBusy(state));
        }

        let mut report = Vec::with_capacity(self.producers.channels().len() + 1);
        report.push(ChannelReport {
            channel_id: crate::data::record::TELEMETRY_SOURCE.to_string(),
            status: if self.config.channels.telemetry {
                ChannelStatus::Ready { level: true }
            } else {
                ChannelStatus::Disabled
            },
        });
        for channel in self.producers.channels() {
            let status = if !self.config.channels.is_enabled(&channel.id) {
                ChannelStatus::Disabled
            } else {
                match channel.input.sample().await {
                    Ok(level) => ChannelStatus::Ready { level },
                    Err(e) => ChannelStatus::Broken(e.to_string()),
                }
            };
            report.push(ChannelReport {
                channel_id: channel.id.clone(),
                status,
            });
        }
        Ok(report)
    }

    /// File names in the data directory.
    pub async fn list_logs(&self) -> AppResult<Vec<String>> {
        self.store.list().await
    }

    /// Delete every file in the data directory, including the current log.
    pub async fn purge_logs(&mut self) -> AppResult<usize> {
        let state = self.published_state();
        if state.has_producers() {
            return Err(DaqError::SessionBusy(state));
        }
        self.writer.close().await?;
        self.store.purge().await
    }

    /// Validate `event` against the current state, applying pending faults first.
    async fn begin(&mut self, event: SessionEvent) -> AppResult<SessionState> {
        if let Some(fault) = self.take_pending_fault().await {
            return Err(self.fail(fault).await);
        }
        let state = self.current_state();
        match state.next(event) {
            Some(_) => Ok(state),
            None => Err(DaqError::InvalidTransition { state, event }),
        }
    }

    /// State as last published to producers.
    fn published_state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// First queued fault. Waits for it when the producers are halted but the failing
    /// task has not queued its fault yet.
    async fn take_pending_fault(&mut self) -> Option<DaqError> {
        match self.drain_faults() {
            Some(fault) => Some(fault),
            None if self.producers.is_halted() => self.faults.recv().await,
            None => None,
        }
    }

    fn drain_faults(&mut self) -> Option<DaqError> {
        let mut first = None;
        while let Ok(fault) = self.faults.try_recv() {
            if first.is_none() {
                first = Some(fault);
            } else {
                warn!(error = %fault, "Additional producer fault");
            }
        }
        first
    }

    fn publish(&self, state: SessionState, time_zero: Option<Instant>) {
        self.snapshot.send_replace(SessionSnapshot { state, time_zero });
    }

    /// Fault transition. Returns the fault for the caller to surface.
    async fn fail(&mut self, fault: DaqError) -> DaqError {
        error!(kind = fault.kind(), error = %fault, "Session fault");
        let was_producing = self.published_state().has_producers();
        self.publish(SessionState::Error, self.time_zero());

        if was_producing {
            if let Err(e) = self.link.disable_telemetry().await {
                warn!(error = %e, "Best-effort telemetry disable failed");
            }
        }
        self.producers.join().await;
        while let Some(extra) = self.drain_faults() {
            warn!(error = %extra, "Additional producer fault");
        }
        if let Err(e) = self.writer.close().await {
            warn!(error = %e, "Closing log after fault failed");
        }

        self.last_fault = Some(fault.to_string());
        fault
    }
}
