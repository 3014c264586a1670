//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the faults that can occur while an acquisition session is active, from the serial
//! transport going away to a GPIO line that can no longer be sampled.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`** / **`TransportClosed`**: read or write failures on the remote byte
//!   stream. Always fatal for the session.
//! - **`Capability`**: a discrete input channel failed to sample. Fatal.
//! - **`LogIo`**: write, flush or close failure on the log destination. Fatal.
//! - **`InvalidTransition`**: a control operation was issued in a state where it is not
//!   defined. The session is left untouched.
//! - **`SessionBusy`**: a maintenance operation (self-test, purge) was requested while
//!   producers are running.
//! - **`FeatureNotEnabled`**: the binary was built without the requested backend.
//! - **`Configuration`** / **`Config`**: semantic or parse errors in the configuration.
//! - **`Io`**: plain filesystem errors outside the hot path (listing or purging logs).
//!
//! Malformed telemetry frames never show up here: the decoder drops them and resyncs.

use crate::frame::FrameError;
use crate::session::state::{SessionEvent, SessionState};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// The primary error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Reading from or writing to the remote byte stream failed.
    #[error("Transport fault: {0}")]
    Transport(std::io::Error),

    /// The remote end hung up (end of stream).
    #[error("Transport closed by remote end")]
    TransportClosed,

    /// A discrete input could not be sampled.
    #[error("Channel '{channel}' sampling failed: {source}")]
    Capability {
        /// Id of the failing channel.
        channel: String,
        /// Error reported by the input driver.
        #[source]
        source: anyhow::Error,
    },

    /// Writing, flushing or closing the log destination failed.
    #[error("Log destination error: {0}")]
    LogIo(std::io::Error),

    /// The control operation is not defined for the current state.
    #[error("Cannot {event} while session is {state}")]
    InvalidTransition {
        /// State the session was in.
        state: SessionState,
        /// Rejected event.
        event: SessionEvent,
    },

    /// A maintenance operation was requested while producers run.
    #[error("Operation not allowed while session is {0}")]
    SessionBusy(SessionState),

    /// The binary was built without the named cargo feature.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Filesystem error outside the log writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Whether this error forces the session into `SessionState::Error`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Transport(_)
                | DaqError::TransportClosed
                | DaqError::Capability { .. }
                | DaqError::LogIo(_)
        )
    }

    /// Short machine-friendly label, used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DaqError::Transport(_) | DaqError::TransportClosed => "transport",
            DaqError::Capability { .. } => "capability",
            DaqError::LogIo(_) => "log_io",
            DaqError::InvalidTransition { .. } => "invalid_transition",
            DaqError::SessionBusy(_) => "busy",
            DaqError::FeatureNotEnabled(_) => "feature",
            DaqError::Configuration(_) | DaqError::Config(_) => "configuration",
            DaqError::Io(_) => "io",
        }
    }
}

impl From<FrameError> for DaqError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::TransportClosed => DaqError::TransportClosed,
            FrameError::Io(err) => DaqError::Transport(err),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(DaqError::TransportClosed.is_fatal());
        assert!(DaqError::LogIo(std::io::Error::other("disk full")).is_fatal());
        assert!(DaqError::Capability {
            channel: "A".into(),
            source: anyhow::anyhow!("gpio gone"),
        }
        .is_fatal());

        let rejected = DaqError::InvalidTransition {
            state: SessionState::New,
            event: SessionEvent::Pause,
        };
        assert!(!rejected.is_fatal());
        assert_eq!(rejected.kind(), "invalid_transition");
        assert_eq!(rejected.to_string(), "Cannot pause while session is New");
    }

    #[test]
    fn converts_frame_errors() {
        let closed: DaqError = FrameError::TransportClosed.into();
        assert!(matches!(closed, DaqError::TransportClosed));

        let io: DaqError =
            FrameError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).into();
        match io {
            DaqError::Transport(err) => assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
