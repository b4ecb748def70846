//! Single-segment append-only log storage.
//!
//! A segment owns one data + index file pair covering a contiguous range
//! of log indices starting at a fixed base. Truncation tombstones records
//! in place; compaction rewrites the prefix with a crash-safe swap.

use std::path::PathBuf;

use thiserror::Error;

mod index;
pub mod record;
pub mod segment;

pub use record::{EntryStatus, RecordHeader, RECORD_HEADER_LEN};
pub use segment::{LogSegment, SegmentConfig};

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("log segment is not open")]
    NotOpen,
    #[error("log segment is already open")]
    AlreadyOpen,
    #[error("index {index} outside segment range [{first:?}, {last:?}]")]
    IndexOutOfRange {
        index: u64,
        first: Option<u64>,
        last: Option<u64>,
    },
    #[error("entry exceeds max bytes {max_bytes} (got {got_bytes})")]
    EntryTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("log missing entries: sought index {sought}, found {found}")]
    MissingEntries { sought: u64, found: u64 },
    #[error("record invalid: {reason}")]
    RecordInvalid { reason: String },
}
