//! Errors surfaced by this crate.
//!
//! Every anomaly inside the trace/metric/profiler core is absorbed into a
//! no-op or a degraded-but-valid output: a plugin's missed `popSpan` gets
//! unwound defensively, a dead weak thread reference just skips sampling.
//! The one place a caller can observe failure is writing a snapshot out,
//! so that's the only variant here.

use thiserror::Error;

/// A specialized `Result` type for this crate's fallible operations.
pub type Result<T> = std::result::Result<T, TraceCoreError>;

/// Errors this crate can return.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceCoreError {
    /// Writing a snapshot's encoded bytes to its destination failed.
    #[error("failed to write trace snapshot: {0}")]
    Io(#[from] std::io::Error),
}
