//! JournalStore - append-only JSONL journal keyed by stream id
//!
//! Every stream is a single JSONL file. Records are never rewritten in place;
//! a stream that is finished gets moved into the archive directory as a whole.
//!
//! # Architecture
//!
//! ```text
//! journal/
//! ├── .lock               # held by the writing process
//! ├── {stream}.jsonl       # live streams, one Entry per line
//! └── archive/
//!     └── {stream}.jsonl   # streams whose owner reached a terminal state
//! ```
//!
//! # Example
//!
//! ```ignore
//! use journalstore::Journal;
//!
//! let journal = Journal::open(".journal")?;
//! journal.append("instance-42", &snapshot)?;
//! let entries = journal.read::<Snapshot>("instance-42")?;
//! journal.archive("instance-42")?;
//! ```

pub mod cli;
pub mod config;
mod journal;

pub use journal::{Entry, Journal, JournalLock, StreamStats, validate_stream_name};

/// Name of the directory holding archived streams
pub const ARCHIVE_DIR: &str = "archive";

/// Lock file claimed by the process writing to a journal
pub const LOCK_FILE: &str = ".lock";

/// File extension used for stream files
pub const STREAM_EXTENSION: &str = "jsonl";

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
