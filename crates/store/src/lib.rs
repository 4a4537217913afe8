//! File-backed storage for the capture daemon.
//!
//! Everything lives under one data directory:
//!
//! ```text
//! <data_dir>/
//!   raw/events.jsonl   append-only raw log (backup of record)
//!   events.jsonl       structured events, one line per unique id
//!   sessions.jsonl     finished session records
//!   dimensions.json    channels + identities (flushed when dirty)
//!   watermark.json     ingestion high-water mark
//! ```

pub mod file_store;
pub mod raw_log;

mod fsutil;

pub use file_store::FileStore;
pub use raw_log::RawLog;
