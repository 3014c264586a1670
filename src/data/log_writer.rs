//! Single-writer funnel for the acquisition log.
//!
//! The telemetry task and every edge monitor call [`LogWriter::submit`] concurrently.
//! Each record is rendered outside the lock and written as one `write` call while the
//! destination mutex is held, so lines never interleave and none is lost or duplicated.
//!
//! # Architecture
//!
//! ```text
//! Telemetry task ──┐
//! Edge monitor A ──┤
//! Edge monitor B ──┼──> LogWriter (Mutex<Option<Box<dyn LogDestination>>>) ──> data/<name>.csv
//! Edge monitor … ──┘
//! ```

use crate::data::record::LogRecord;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Append-only byte sink behind the log writer.
#[async_trait]
pub trait LogDestination: Send {
    /// Append `buf` in full.
    async fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Push buffered bytes to the backing store.
    async fn flush(&mut self) -> io::Result<()>;

    /// Flush, sync and release the destination. No writes follow.
    async fn close(&mut self) -> io::Result<()>;

    /// Human readable location, for logs.
    fn describe(&self) -> String;
}

/// Log destination backed by a file on disk.
pub struct FileDestination {
    path: PathBuf,
    file: BufWriter<File>,
}

impl FileDestination {
    /// Create (or truncate) `path`.
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
        })
    }

    /// Open `path` for appending, creating it if it was removed.
    pub async fn append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogDestination for FileDestination {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.file.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory destination, shareable so the contents can be inspected while writing.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    buf: Arc<std::sync::Mutex<Vec<u8>>>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemoryDestination {
    /// Create an empty destination.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Make every following write fail with `BrokenPipe`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogDestination for MemoryDestination {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.buf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Serialising writer shared by all producers.
///
/// Cloning is cheap; all clones write to the same destination.
#[derive(Clone, Default)]
pub struct LogWriter {
    inner: Arc<WriterInner>,
}

#[derive(Default)]
struct WriterInner {
    dest: Mutex<Option<Box<dyn LogDestination>>>,
    records: AtomicU64,
}

impl LogWriter {
    /// Writer with no destination; every submit fails until `rotate` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer already pointing at `dest`.
    pub fn with_destination(dest: Box<dyn LogDestination>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                dest: Mutex::new(Some(dest)),
                records: AtomicU64::new(0),
            }),
        }
    }

    /// Append one record as a single line.
    pub async fn submit(&self, record: &LogRecord) -> AppResult<()> {
        let line = record.render();
        self.write_raw(line.as_bytes()).await?;
        self.inner.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append pre-rendered bytes (header lines) without counting them as records.
    pub async fn write_raw(&self, bytes: &[u8]) -> AppResult<()> {
        let mut guard = self.inner.dest.lock().await;
        let dest = guard.as_mut().ok_or_else(closed_error)?;
        dest.write(bytes).await.map_err(DaqError::LogIo)
    }

    /// Flush the current destination, if any.
    pub async fn flush(&self) -> AppResult<()> {
        let mut guard = self.inner.dest.lock().await;
        match guard.as_mut() {
            Some(dest) => dest.flush().await.map_err(DaqError::LogIo),
            None => Ok(()),
        }
    }

    /// Close the current destination and switch to `next`.
    ///
    /// Callers must make sure no producer is submitting. The new destination is
    /// installed even if closing the old one fails; that failure is still returned.
    pub async fn rotate(&self, next: Box<dyn LogDestination>) -> AppResult<()> {
        let mut guard = self.inner.dest.lock().await;
        info!(destination = %next.describe(), "Rotating log destination");
        let previous = guard.replace(next);
        drop(guard);

        self.inner.records.store(0, Ordering::Relaxed);
        match previous {
            Some(mut old) => old.close().await.map_err(DaqError::LogIo),
            None => Ok(()),
        }
    }

    /// Flush, sync and drop the current destination. Idempotent.
    pub async fn close(&self) -> AppResult<()> {
        let previous = self.inner.dest.lock().await.take();
        match previous {
            Some(mut dest) => {
                debug!(destination = %dest.describe(), "Closing log destination");
                dest.close().await.map_err(DaqError::LogIo)
            }
            None => Ok(()),
        }
    }

    /// Whether a destination is installed.
    pub async fn is_open(&self) -> bool {
        self.inner.dest.lock().await.is_some()
    }

    /// Records submitted since the last rotation.
    pub fn records_written(&self) -> u64 {
        self.inner.records.load(Ordering::Relaxed)
    }
}

fn closed_error() -> DaqError {
    DaqError::LogIo(io::Error::new(
        io::ErrorKind::NotConnected,
        "log destination is closed",
    ))
}
