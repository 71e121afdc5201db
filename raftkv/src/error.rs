//! Error types exposed by this crate.

use thiserror::Error;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internal Raft task.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The Raft node is shutting down.
    #[error("raft stopped")]
    ShuttingDown,
    /// An error coming from the persistent store.
    #[error("{0}")]
    Storage(#[source] anyhow::Error),
    /// An error coming from the log directory.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// The error surface of the transaction API.
///
/// `Conflict` is the retry-indicating class: the transaction itself was
/// well-formed, but the cluster state moved underneath it; the caller is
/// expected to retry from scratch. `Fatal` indicates the transaction can not
/// succeed without changing its inputs.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The transaction lost an MVCC or leadership race and should be retried.
    #[error("transaction must be retried: {0}")]
    Conflict(String),
    /// The transaction is no longer known to the node.
    #[error("transaction is no longer open")]
    Stale,
    /// The transaction can never succeed as submitted.
    #[error("transaction failed: {0}")]
    Fatal(String),
    /// The node is shutting down; the transaction outcome is unknown.
    #[error("raft node is shutting down")]
    ShuttingDown,
}

impl CommitError {
    /// True if the error indicates the transaction may simply be retried.
    pub fn is_retry(&self) -> bool {
        matches!(self, CommitError::Conflict(_) | CommitError::ShuttingDown)
    }
}

/// Error variants related to configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The node identity must be a non-empty string.
    #[error("node identity must not be empty")]
    MissingIdentity,
    /// A log directory is required.
    #[error("a log directory must be configured")]
    MissingLogDir,
    /// The min & max election timeout values are invalid.
    #[error("given values for election timeout min & max are invalid")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat timeout must be strictly less than the minimum election
    /// timeout.
    #[error("heartbeat timeout must be strictly less than the minimum election timeout")]
    InvalidHeartbeatTimeout,
}

/// Error variants produced while decoding wire messages.
///
/// Protocol errors never change node state: the offending frame is logged
/// and dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame ended before the advertised field boundaries.
    #[error("truncated frame")]
    Truncated,
    /// The frame exceeds the maximum admitted size.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },
    /// The leading type byte does not name a known message.
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    /// A node identity field was not valid UTF-8.
    #[error("identity is not valid utf-8")]
    BadIdentity(#[from] std::string::FromUtf8Error),
    /// A structurally invalid field combination.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl From<ProtocolError> for std::io::Error {
    fn from(err: ProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
    }
}
