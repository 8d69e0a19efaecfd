//! Typed errors for the RAID-PIR client and mirror.
//!
//! Ad-hoc failures (a malformed CLI argument, a one-off I/O error while
//! loading a block store) go through `anyhow::Error`. Anything the caller
//! needs to match on - a dropped mirror, a corrupted manifest, a failed
//! integrity check - gets its own variant here.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum RaidPirError {
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("file not in manifest: {0}")]
    FileNotInManifest(String),

    #[error("parameter error: {0}")]
    ParameterError(String),

    #[error("mirror unavailable: {0}")]
    MirrorUnavailable(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("block hash mismatch at index {index}")]
    BlockHashMismatch { index: u32 },

    #[error("file hash mismatch for {filename}")]
    FileHashMismatch { filename: String },

    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

/// Wraps a single mirror connection's I/O failure.
///
/// The original client distinguished recoverable socket errors from
/// everything else by substring-matching the exception message (a typo
/// for "socket" that happened to still match). Here the distinction is
/// structural: any [`NetworkError`] reaching the scheduler is recoverable
/// by failover; errors that are not network errors (protocol violations,
/// integrity failures) are not.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct NetworkError(#[from] pub io::Error);

impl RaidPirError {
    /// True if the scheduler may attempt to route around this failure by
    /// reassigning work to a different mirror.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RaidPirError::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, RaidPirError>;
