//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockDigitalInput` - Scripted or manually driven logic line
//! - `MockDigitalOutput` - Records every level it is driven to
//! - `MockTelemetryDevice` - Remote sensor on the far end of an in-memory transport
//!
//! # Performance Characteristics
//!
//! - MockTelemetryDevice: one frame per configured period while streaming (default 10ms)

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::debug;

use crate::frame::TelemetryFrame;
use crate::hardware::capabilities::{DigitalInput, DigitalOutput};
use crate::hardware::serial::{DynTransport, DISABLE_TELEMETRY, ENABLE_TELEMETRY};

// =============================================================================
// MockDigitalInput - Simulated Logic Line
// =============================================================================

struct InputState {
    queued: VecDeque<bool>,
    level: bool,
    failing: bool,
}

/// Mock discrete input
///
/// Each `sample` consumes the next scripted level; once the script is exhausted the last
/// level is held. `set_level` changes the held level directly, which is what tests use
/// when a monitor is polling in the background.
///
/// # Example
///
/// ```rust,ignore
/// let gate = MockDigitalInput::with_sequence([false, true, true, false]);
/// assert!(!gate.sample().await?);
/// assert!(gate.sample().await?);
/// ```
pub struct MockDigitalInput {
    state: Mutex<InputState>,
    samples: AtomicU64,
}

impl MockDigitalInput {
    /// Create a line held at `level`.
    pub fn new(level: bool) -> Self {
        Self {
            state: Mutex::new(InputState {
                queued: VecDeque::new(),
                level,
                failing: false,
            }),
            samples: AtomicU64::new(0),
        }
    }

    /// Create a line that replays `levels`, then holds the last one.
    pub fn with_sequence(levels: impl IntoIterator<Item = bool>) -> Self {
        Self {
            state: Mutex::new(InputState {
                queued: levels.into_iter().collect(),
                level: false,
                failing: false,
            }),
            samples: AtomicU64::new(0),
        }
    }

    /// Drive the held level.
    pub async fn set_level(&self, level: bool) {
        let mut state = self.state.lock().await;
        state.queued.clear();
        state.level = level;
    }

    /// Make every following sample fail (or recover).
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Number of successful samples taken so far.
    pub fn samples_taken(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl Default for MockDigitalInput {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl DigitalInput for MockDigitalInput {
    async fn sample(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.failing {
            bail!("MockDigitalInput: simulated line failure");
        }
        if let Some(next) = state.queued.pop_front() {
            state.level = next;
        }
        self.samples.fetch_add(1, Ordering::Relaxed);
        Ok(state.level)
    }
}

// =============================================================================
// MockDigitalOutput - Simulated LED
// =============================================================================

/// Mock discrete output recording its level history.
#[derive(Default)]
pub struct MockDigitalOutput {
    history: Mutex<Vec<bool>>,
}

impl MockDigitalOutput {
    /// Create an output that has never been driven.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every level written, oldest first.
    pub async fn history(&self) -> Vec<bool> {
        self.history.lock().await.clone()
    }

    /// Most recent level, if any.
    pub async fn level(&self) -> Option<bool> {
        self.history.lock().await.last().copied()
    }
}

#[async_trait]
impl DigitalOutput for MockDigitalOutput {
    async fn set(&self, level: bool) -> Result<()> {
        self.history.lock().await.push(level);
        Ok(())
    }
}

// =============================================================================
// MockTelemetryDevice - Simulated Remote Sensor
// =============================================================================

/// Simulated remote telemetry device
///
/// Lives on the far side of a `tokio::io::duplex` pipe. It reacts to the `n`/`f` command
/// bytes like the real firmware: frames are emitted once per period while streaming is
/// enabled. Readings are a slow ramp on the distance sensor plus noise on the IMU axes.
///
/// The device runs until [`MockDeviceHandle::disconnect`] is called or the handle is
/// dropped, after which the host side reads EOF.
///
/// # Example
///
/// ```rust,ignore
/// let (transport, device) = MockTelemetryDevice::new(Duration::from_millis(5)).spawn();
/// let (reader, mut link) = split_transport(transport);
/// link.enable_telemetry().await?;
/// ```
pub struct MockTelemetryDevice {
    period: Duration,
    buffer: usize,
}

impl MockTelemetryDevice {
    /// Device emitting one frame per `period` while streaming.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            buffer: 64 * 1024,
        }
    }

    /// Start the device task and return the host end of the link.
    pub fn spawn(self) -> (DynTransport, MockDeviceHandle) {
        let (host, device) = tokio::io::duplex(self.buffer);
        let shared = Arc::new(DeviceShared::default());
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run_device(
            device,
            self.period,
            shared.clone(),
            inject_rx,
            shutdown_rx,
        ));

        let handle = MockDeviceHandle {
            shared,
            inject_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        };
        (Box::new(host), handle)
    }
}

impl Default for MockTelemetryDevice {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

#[derive(Default)]
struct DeviceShared {
    commands: std::sync::Mutex<Vec<u8>>,
    streaming: AtomicBool,
    frames_sent: AtomicU64,
}

/// Test-side view of a running [`MockTelemetryDevice`].
pub struct MockDeviceHandle {
    shared: Arc<DeviceShared>,
    inject_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MockDeviceHandle {
    /// Command bytes received from the host, in arrival order.
    pub fn commands(&self) -> Vec<u8> {
        self.shared
            .commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Whether the device currently streams frames.
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    /// Frames written to the host so far.
    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Acquire)
    }

    /// Write raw bytes to the host, interleaved with the frame stream.
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.inject_tx.send(bytes.into());
    }

    /// Hang up the link. The host side observes end of stream.
    pub async fn disconnect(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_device(
    device: DuplexStream,
    period: Duration,
    shared: Arc<DeviceShared>,
    mut inject_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (mut rx, mut tx) = tokio::io::split(device);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rng = StdRng::from_entropy();
    let boot = Instant::now();
    let mut command = [0u8; 1];

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            read = rx.read(&mut command) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if let Ok(mut log) = shared.commands.lock() {
                        log.push(command[0]);
                    }
                    match command[0] {
                        ENABLE_TELEMETRY => shared.streaming.store(true, Ordering::Release),
                        DISABLE_TELEMETRY => shared.streaming.store(false, Ordering::Release),
                        other => debug!(command = other, "MockTelemetryDevice: unknown command"),
                    }
                }
            },
            Some(bytes) = inject_rx.recv() => {
                if tx.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !shared.streaming.load(Ordering::Acquire) {
                    continue;
                }
                let frame = synth_frame(&mut rng, boot.elapsed());
                if tx.write_all(&frame.to_wire()).await.is_err() {
                    break;
                }
                shared.frames_sent.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    debug!("MockTelemetryDevice: link closed");
}

fn synth_frame(rng: &mut StdRng, uptime: Duration) -> TelemetryFrame {
    let micros = uptime.as_micros() as u32;
    let mut noise = |scale: f32| rng.gen_range(-scale..scale);
    TelemetryFrame {
        sync_time_us: micros,
        device_time_us: micros.wrapping_add(250),
        distance_mm: 1000 + (uptime.as_millis() % 500) as u32,
        accel: (noise(0.05), noise(0.05), 1.0 + noise(0.05)),
        gyro: (noise(0.5), noise(0.5), noise(0.5)),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, ResyncPolicy};
    use crate::hardware::serial::split_transport;

    #[tokio::test]
    async fn test_mock_input_replays_then_holds() {
        let input = MockDigitalInput::with_sequence([true, false, true]);

        assert!(input.sample().await.unwrap());
        assert!(!input.sample().await.unwrap());
        assert!(input.sample().await.unwrap());
        // Script exhausted, last level held
        assert!(input.sample().await.unwrap());
        assert_eq!(input.samples_taken(), 4);

        input.set_level(false).await;
        assert!(!input.sample().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_input_failure() {
        let input = MockDigitalInput::new(true);
        input.set_failing(true).await;
        assert!(input.sample().await.is_err());

        input.set_failing(false).await;
        assert!(input.sample().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_output_history() {
        let led = MockDigitalOutput::new();
        assert_eq!(led.level().await, None);

        led.set(true).await.unwrap();
        led.set(false).await.unwrap();
        assert_eq!(led.history().await, vec![true, false]);
        assert_eq!(led.level().await, Some(false));
    }

    #[tokio::test]
    async fn test_device_streams_only_when_enabled() {
        let (transport, device) = MockTelemetryDevice::new(Duration::from_millis(1)).spawn();
        let (reader, mut link) = split_transport(transport);
        let mut decoder = FrameDecoder::new(reader, ResyncPolicy::Lenient);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(device.frames_sent(), 0);

        link.enable_telemetry().await.unwrap();
        let frame = decoder.decode_next().await.unwrap();
        assert!((frame.accel.2 - 1.0).abs() < 0.1);
        assert!(device.is_streaming());

        link.disable_telemetry().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!device.is_streaming());
        assert_eq!(device.commands(), b"nf".to_vec());
    }

    #[tokio::test]
    async fn test_disconnect_closes_transport() {
        let (transport, device) = MockTelemetryDevice::default().spawn();
        let (reader, _link) = split_transport(transport);
        let mut decoder = FrameDecoder::new(reader, ResyncPolicy::Lenient);

        device.disconnect().await;
        assert!(matches!(
            decoder.decode_next().await,
            Err(crate::frame::FrameError::TransportClosed)
        ));
    }
}
