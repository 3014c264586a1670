//! Log records, the serialized writer and on-disk log management.
pub mod log_writer;
pub mod record;
pub mod store;

pub use log_writer::{FileDestination, LogDestination, LogWriter, MemoryDestination};
pub use record::{ActivityEvent, EdgeRecord, LogRecord, Transition};
pub use store::LogStore;
