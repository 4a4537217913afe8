//! Shared vocabulary for the continuum capture daemon: configuration, the
//! error taxonomy, structured trace events, and the source/storage
//! collaborator interfaces.

pub mod config;
pub mod error;
pub mod source;
pub mod storage;
pub mod trace;
