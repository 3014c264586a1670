//! Records merged into the acquisition log.
//!
//! Every record renders to one self-contained text line:
//!
//! ```text
//! [Ard], <host us>, <sync us>, <device us>, <distance mm>, <ax>, <ay>, <az>, <gx>, <gy>, <gz>
//! [<channel>], <host us>, <level>
//! ```
//!
//! The bracketed tag identifies the source; `host us` is relative to the session's
//! `time_zero`. Floats are rendered with six decimals.

use crate::frame::TelemetryFrame;
use serde::Serialize;
use std::fmt::Write as _;

/// Source tag used for telemetry lines.
pub const TELEMETRY_SOURCE: &str = "Ard";

/// Direction of a discrete level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    /// false -> true
    Rising,
    /// true -> false
    Falling,
}

impl Transition {
    /// Level after the transition.
    pub fn level(&self) -> bool {
        matches!(self, Transition::Rising)
    }
}

/// One observed transition on a discrete channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeRecord {
    /// Channel that changed level
    pub channel_id: String,
    /// Direction of the change
    pub transition: Transition,
    /// Microseconds since `time_zero` when the new level was sampled
    pub host_time_us: u64,
}

/// Anything the log writer accepts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LogRecord {
    /// A decoded frame stamped on arrival
    Telemetry {
        /// Decoded payload
        frame: TelemetryFrame,
        /// Microseconds since `time_zero` when the frame was decoded
        host_time_us: u64,
    },
    /// A discrete level change
    Edge(EdgeRecord),
}

impl LogRecord {
    /// Host-relative timestamp carried by the record.
    pub fn host_time_us(&self) -> u64 {
        match self {
            LogRecord::Telemetry { host_time_us, .. } => *host_time_us,
            LogRecord::Edge(edge) => edge.host_time_us,
        }
    }

    /// Source identifier printed in the tag column.
    pub fn source(&self) -> &str {
        match self {
            LogRecord::Telemetry { .. } => TELEMETRY_SOURCE,
            LogRecord::Edge(edge) => &edge.channel_id,
        }
    }

    /// Render as a single newline-terminated line.
    pub fn render(&self) -> String {
        let mut line = String::with_capacity(128);
        // Writing into a String cannot fail.
        let _ = match self {
            LogRecord::Telemetry {
                frame,
                host_time_us,
            } => writeln!(
                line,
                "[{}], {}, {}, {}, {}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}",
                TELEMETRY_SOURCE,
                host_time_us,
                frame.sync_time_us,
                frame.device_time_us,
                frame.distance_mm,
                frame.accel.0,
                frame.accel.1,
                frame.accel.2,
                frame.gyro.0,
                frame.gyro.1,
                frame.gyro.2,
            ),
            LogRecord::Edge(edge) => writeln!(
                line,
                "[{}], {}, {}",
                edge.channel_id,
                edge.host_time_us,
                u8::from(edge.transition.level())
            ),
        };
        line
    }
}

impl From<EdgeRecord> for LogRecord {
    fn from(value: EdgeRecord) -> Self {
        LogRecord::Edge(value)
    }
}

/// Out-of-band notification of producer activity, consumed by the indicator LEDs.
///
/// Emitted whether or not the record was logged, so indicators keep blinking while paused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    /// A well-formed telemetry frame was decoded.
    Frame,
    /// A discrete channel changed level.
    Edge {
        /// Channel that changed level
        channel_id: String,
        /// Direction of the change
        transition: Transition,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_telemetry_line() {
        let record = LogRecord::Telemetry {
            frame: TelemetryFrame {
                sync_time_us: 10,
                device_time_us: 20,
                distance_mm: 1500,
                accel: (1.0, -1.0, 0.0),
                gyro: (0.5, 0.25, -2.0),
            },
            host_time_us: 123_456,
        };
        assert_eq!(
            record.render(),
            "[Ard], 123456, 10, 20, 1500, 1.000000, -1.000000, 0.000000, 0.500000, 0.250000, -2.000000\n"
        );
        assert_eq!(record.source(), "Ard");
    }

    #[test]
    fn test_render_edge_lines() {
        let rising = LogRecord::from(EdgeRecord {
            channel_id: "B".into(),
            transition: Transition::Rising,
            host_time_us: 42,
        });
        assert_eq!(rising.render(), "[B], 42, 1\n");
        assert_eq!(rising.host_time_us(), 42);

        let falling = LogRecord::from(EdgeRecord {
            channel_id: "B".into(),
            transition: Transition::Falling,
            host_time_us: 43,
        });
        assert_eq!(falling.render(), "[B], 43, 0\n");
    }
}
