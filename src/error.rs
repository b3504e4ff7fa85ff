//! Error taxonomy for the trace recording engine
//!
//! Fatal errors stop tracing for the affected process. Recoverable conditions
//! (a full buffer, a trace-root name collision) never surface as errors; they
//! are handled inside the component that observes them.

use std::path::PathBuf;
use thiserror::Error;

use crate::record::StreamKind;

/// Errors that can occur while recording or reading a trace
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Unable to create trace root {path}: {source}")]
    TraceRootCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to create session directory {path}: {source}")]
    SessionCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Flush of {stream} stream failed after {records} records: {source}")]
    FlushFailed {
        stream: StreamKind,
        records: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {stream} record: expected {expected} bytes, got {actual}")]
    MalformedRecord {
        stream: StreamKind,
        expected: usize,
        actual: usize,
    },

    #[error("Cannot append to process tree at {path}: {source}")]
    ProcessTree {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Corrupt trace file {path}: {reason}")]
    CorruptTrace { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    /// Whether this error ends tracing for the process that observed it
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::CorruptTrace { .. })
    }
}

/// Result type for trace operations
pub type Result<T> = std::result::Result<T, TraceError>;
