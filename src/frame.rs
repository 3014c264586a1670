//! Sentinel-delimited telemetry frames from the remote microcontroller.
//!
//! # Wire Format
//!
//! ```text
//! +--------+---------+-----------+----------+------+------+------+------+------+------+----------+
//! | marker | sync us | device us | dist mm  | ax   | ay   | az   | gx   | gy   | gz   | sentinel |
//! |  '#'   | u32 LE  |  u32 LE   |  u32 LE  | f32  | f32  | f32  | f32  | f32  | f32  |   '$'    |
//! +--------+---------+-----------+----------+------+------+------+------+------+------+----------+
//!     1         4          4          4         4      4      4      4      4      4        1      = 38
//! ```
//!
//! The sentinel byte is not escaped by the device, so it may legally appear inside the
//! payload. The decoder never treats a short candidate as a frame boundary: it keeps
//! appending sentinel-terminated chunks until the fixed frame length is reached and
//! only then looks at the marker.
//!
//! Frames whose marker does not match are dropped silently (debug log only) and the
//! decoder resumes scanning. Only the end of the stream is reported, as
//! [`FrameError::TransportClosed`].

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, trace};

/// Byte that terminates every frame.
pub const SENTINEL: u8 = b'$';

/// First byte of a well-aligned frame.
pub const MARKER: u8 = b'#';

/// Nine little-endian 4-byte fields.
pub const PAYLOAD_LEN: usize = 36;

/// Marker + payload + sentinel.
pub const FRAME_LEN: usize = 1 + PAYLOAD_LEN + 1;

/// One decoded telemetry reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryFrame {
    /// Synchronisation clock of the device, microseconds
    pub sync_time_us: u32,
    /// Sensor clock of the device, microseconds
    pub device_time_us: u32,
    /// Range finder distance, millimetres
    pub distance_mm: u32,
    /// Acceleration (x, y, z) in g
    pub accel: (f32, f32, f32),
    /// Angular rate (x, y, z) in degrees per second
    pub gyro: (f32, f32, f32),
}

impl TelemetryFrame {
    /// Decode a candidate buffer.
    ///
    /// Returns `None` when the buffer is shorter than [`FRAME_LEN`] or does not start
    /// with [`MARKER`]. Bytes past the fixed payload are ignored.
    pub fn from_wire(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_LEN || buf[0] != MARKER {
            return None;
        }

        let mut payload = &buf[1..1 + PAYLOAD_LEN];
        Some(Self {
            sync_time_us: payload.get_u32_le(),
            device_time_us: payload.get_u32_le(),
            distance_mm: payload.get_u32_le(),
            accel: (
                payload.get_f32_le(),
                payload.get_f32_le(),
                payload.get_f32_le(),
            ),
            gyro: (
                payload.get_f32_le(),
                payload.get_f32_le(),
                payload.get_f32_le(),
            ),
        })
    }

    /// Encode into the 38-byte wire representation.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAME_LEN);
        buf.put_u8(MARKER);
        buf.put_u32_le(self.sync_time_us);
        buf.put_u32_le(self.device_time_us);
        buf.put_u32_le(self.distance_mm);
        buf.put_f32_le(self.accel.0);
        buf.put_f32_le(self.accel.1);
        buf.put_f32_le(self.accel.2);
        buf.put_f32_le(self.gyro.0);
        buf.put_f32_le(self.gyro.1);
        buf.put_f32_le(self.gyro.2);
        buf.put_u8(SENTINEL);
        buf.to_vec()
    }
}

/// Errors surfaced by [`FrameDecoder::decode_next`].
#[derive(Error, Debug)]
pub enum FrameError {
    /// The stream ended before a frame boundary was found.
    #[error("Transport closed before a frame boundary was found")]
    TransportClosed,

    /// The underlying read failed.
    #[error("Transport read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How the decoder realigns after noise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncPolicy {
    /// Accumulate sentinel-terminated chunks until the fixed length is reached, then
    /// check the marker and drop the whole buffer on mismatch. Junk glued to the front
    /// of a frame costs that frame; the next one decodes.
    #[default]
    Lenient,
    /// Require the marker at offset 0 and the sentinel at offset 37 of a fixed window;
    /// otherwise slide the window by one byte.
    Sliding,
}

/// Counters kept by a decoder across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    /// Frames successfully decoded
    pub frames: u64,
    /// Candidate buffers rejected for a bad marker (lenient) or alignment runs
    /// recovered from (sliding)
    pub dropped: u64,
    /// Total bytes thrown away while resynchronising
    pub skipped_bytes: u64,
}

/// Incremental decoder over any async byte stream.
///
/// `decode_next` is cancel-safe: partial input is kept in the decoder between calls,
/// so it can sit inside a `tokio::select!` next to a shutdown signal.
pub struct FrameDecoder<R> {
    reader: BufReader<R>,
    policy: ResyncPolicy,
    pending: Vec<u8>,
    skipping: u64,
    stats: DecoderStats,
}

impl<R: AsyncRead + Unpin> FrameDecoder<R> {
    /// Create a decoder using the given resync policy.
    pub fn new(reader: R, policy: ResyncPolicy) -> Self {
        Self {
            reader: BufReader::new(reader),
            policy,
            pending: Vec::with_capacity(FRAME_LEN * 2),
            skipping: 0,
            stats: DecoderStats::default(),
        }
    }

    /// Counters since construction.
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Active resync policy.
    pub fn policy(&self) -> ResyncPolicy {
        self.policy
    }

    /// Block until the next valid frame is available or the stream ends.
    pub async fn decode_next(&mut self) -> Result<TelemetryFrame, FrameError> {
        match self.policy {
            ResyncPolicy::Lenient => self.next_lenient().await,
            ResyncPolicy::Sliding => self.next_sliding().await,
        }
    }

    async fn next_lenient(&mut self) -> Result<TelemetryFrame, FrameError> {
        loop {
            // A sentinel inside the payload yields a short chunk; keep appending.
            while self.pending.len() < FRAME_LEN {
                self.read_through_sentinel().await?;
            }

            if let Some(frame) = TelemetryFrame::from_wire(&self.pending) {
                self.stats.frames += 1;
                self.pending.clear();
                return Ok(frame);
            }

            self.stats.dropped += 1;
            self.stats.skipped_bytes += self.pending.len() as u64;
            debug!(
                len = self.pending.len(),
                first_byte = self.pending[0],
                "Dropping frame with unexpected marker"
            );
            self.pending.clear();
        }
    }

    async fn next_sliding(&mut self) -> Result<TelemetryFrame, FrameError> {
        loop {
            while self.pending.len() < FRAME_LEN {
                self.fill_window().await?;
            }

            if self.pending[0] == MARKER && self.pending[FRAME_LEN - 1] == SENTINEL {
                if let Some(frame) = TelemetryFrame::from_wire(&self.pending) {
                    if self.skipping > 0 {
                        debug!(skipped = self.skipping, "Resynchronised on frame boundary");
                        self.stats.dropped += 1;
                        self.skipping = 0;
                    }
                    self.pending.clear();
                    self.stats.frames += 1;
                    return Ok(frame);
                }
            }

            trace!(byte = self.pending[0], "Sliding window past misaligned byte");
            self.pending.remove(0);
            self.skipping += 1;
            self.stats.skipped_bytes += 1;
        }
    }

    /// Append bytes up to and including the next sentinel to `pending`.
    async fn read_through_sentinel(&mut self) -> Result<(), FrameError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Err(FrameError::TransportClosed);
            }

            match available.iter().position(|&b| b == SENTINEL) {
                Some(pos) => {
                    self.pending.extend_from_slice(&available[..=pos]);
                    self.reader.consume(pos + 1);
                    return Ok(());
                }
                None => {
                    let len = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(len);
                }
            }
        }
    }

    /// Top `pending` up towards one full window.
    async fn fill_window(&mut self) -> Result<(), FrameError> {
        let available = self.reader.fill_buf().await?;
        if available.is_empty() {
            return Err(FrameError::TransportClosed);
        }

        let take = available.len().min(FRAME_LEN - self.pending.len());
        self.pending.extend_from_slice(&available[..take]);
        self.reader.consume(take);
        Ok(())
    }
}
