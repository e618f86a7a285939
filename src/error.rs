//! Error types for srsforge.

use std::time::Duration;

use thiserror::Error;

use crate::source::SourceFormat;

/// Error type for srsforge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration document version is not one we know how to read
    #[error("unsupported configuration version: {0}")]
    UnsupportedConfigVersion(u32),

    /// Invalid artifact magic bytes
    #[error("invalid magic bytes: expected SRSFORGE header")]
    InvalidMagic,

    /// Unsupported artifact layout version
    #[error("unsupported artifact layout: {0}")]
    UnsupportedLayout(u32),

    /// Artifact checksum mismatch
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Invalid header size
    #[error("invalid header size: expected {expected}, got {actual}")]
    InvalidHeaderSize { expected: usize, actual: usize },

    /// Artifact body is shorter than its index claims
    #[error("truncated artifact: {0}")]
    Truncated(String),

    /// Invalid pipeline state transition
    #[error("invalid state transition from {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Result type alias for srsforge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for fetching one rule source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Every attempt timed out
    #[error("timed out fetching {url} after {attempts} attempt(s)")]
    Timeout { url: String, attempts: u32 },

    /// Permanent client error, never retried
    #[error("source not found: {url} (HTTP {status})")]
    NotFound { url: String, status: u16 },

    /// Connection, TLS or HTTP failure
    #[error("transport failure fetching {url}: {detail}")]
    TransportFailure { url: String, detail: String },

    /// The run was cancelled before the fetch completed
    #[error("fetch cancelled: {url}")]
    Cancelled { url: String },
}

/// Error type for parsing one rule source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A single line (or array element) could not be parsed
    #[error("malformed line {line_no}: {content}")]
    MalformedLine { line_no: usize, content: String },

    /// The whole document could not be decoded as the declared format
    #[error("unsupported {format} content: {detail}")]
    UnsupportedFormat { format: SourceFormat, detail: String },
}

/// Error type for structurally invalid records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid record `{record}`: {reason}")]
    InvalidRecord { record: String, reason: String },
}

/// Error type for compiling a rule set.
#[derive(Error, Debug)]
pub enum CompileError {
    /// Target engine version has no known artifact layout
    #[error("unsupported target version: {version}")]
    UnsupportedVersion { version: String },

    /// External compiler could not be launched or exited non-zero
    #[error("external compiler failed: {detail}")]
    ExternalCompilerFailed {
        detail: String,
        exit_code: Option<i32>,
    },

    /// External compiler exceeded the compile timeout
    #[error("external compiler timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// The run was cancelled while compiling
    #[error("compile cancelled")]
    Cancelled,

    /// Encoding the payload failed
    #[error("encoding failed: {0}")]
    Encode(String),

    /// IO error while preparing or collecting compiler files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
