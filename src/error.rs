//! Error types, one enum per concern.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the radix index itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The caller passed something the index cannot store (e.g. an empty word).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A structural rule of the tree was broken. Unreachable in a healthy tree.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Errors from exporting or importing a shard's persisted state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// I/O error (file operations, disk I/O)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A node header carried a type tag outside 0..=3.
    #[error("unknown node type {node_type} at offset {offset}")]
    UnknownNodeType {
        /// Tag read from the stream.
        node_type: u32,
        /// Byte offset of the header.
        offset: usize,
    },

    /// The stream ended in the middle of a node.
    #[error("truncated input: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// Byte offset of the short read.
        offset: usize,
        /// Bytes the decoder asked for.
        needed: usize,
    },

    /// The stream decoded but describes an impossible tree.
    #[error("corrupt index at offset {offset}: {reason}")]
    Corrupt {
        /// Byte offset where the problem was detected.
        offset: usize,
        /// Human readable description.
        reason: String,
    },

    /// A catalog blob failed to (de)serialize or the three blobs disagree.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Replaying a decoded child into its parent failed.
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl From<bincode::Error> for PersistenceError {
    fn from(e: bincode::Error) -> Self {
        Self::Catalog(format!("bincode error: {}", e))
    }
}

/// Result alias for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors talking to the coordinator or a peer shard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The remote end could not be reached. Worth retrying.
    #[error("transient link failure: {0}")]
    Transient(String),

    /// Every attempt of a retried call failed.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Message of the final failure.
        last: String,
    },

    /// The overall deadline of a call elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The link is in the failed state and reconnecting did not help.
    #[error("link unavailable")]
    Unavailable,

    /// The remote end answered with something unusable. Not retried.
    #[error("remote error: {0}")]
    Remote(String),
}

impl LinkError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::Transient(_))
    }
}

/// Errors while turning crawl output into index updates.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A raw crawl message did not have the expected fields.
    #[error("malformed crawl message: {0}")]
    Malformed(String),

    /// The catalog refused the update.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Allocating a document id failed after retries.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The index refused a word.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// The pipeline has been shut down.
    #[error("ingestion pipeline is closed")]
    Closed,

    /// A worker thread could not be spawned.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors pulling a peer's state.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The coordinator or the peer could not be reached.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The peer's bytes did not decode.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors rejected synchronously by the query engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Zero page size, empty word set and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for [`crate::BarrelConfig`].
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from the shard facade.
#[derive(Debug, Error)]
pub enum BarrelError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Starting the ingestion workers failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// Writing or reading a snapshot failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Pulling from a peer failed.
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// A background thread could not be spawned.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shard is already running.
    #[error("shard {0} is already started")]
    AlreadyStarted(String),
}
