#![forbid(unsafe_code)]
//! Error types for the HPB engine.
//!
//! # Error Taxonomy
//!
//! HPB is a read-path accelerator: no error in this crate is ever surfaced
//! to the block-I/O caller. Every variant maps to exactly one internal
//! handling policy:
//!
//! | Variant | Policy | Effect |
//! |---------|--------|--------|
//! | `Descriptor` / `Parse` during attach | feature never activates | LU marked `NotSupported` |
//! | `OutOfBounds` | fatal to the feature | LU torn down, marked `Failed`, all I/O falls through |
//! | `NotCached` | benign race with eviction | caller discards the stale download result |
//! | `PoolExhausted` | degraded | event dropped, cache state goes stale-but-safe |
//!
//! Crate-internal error types (`ParseError` in `hpb-types`) convert into
//! `HpbError` at the `hpb-core` boundary; the parsing layer never needs to
//! know about lifecycle policy.

use thiserror::Error;

/// Unified error type for HPB engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HpbError {
    /// A descriptor read failed or returned bytes the parser rejected.
    ///
    /// Only reachable during attach; the feature ends up `NotSupported`
    /// rather than activating with bad constants.
    #[error("descriptor error: {0}")]
    Descriptor(String),

    /// Wire-format parse failure surfaced from `hpb-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// The device named a region or subregion index outside the table.
    ///
    /// Host and device have diverged about region geometry; proceeding
    /// would index unrelated memory. The feature is torn down for the
    /// remainder of the attachment.
    #[error("{what} index {index} out of bounds (limit {limit})")]
    OutOfBounds {
        what: &'static str,
        index: u32,
        limit: u32,
    },

    /// The target subregion lost its map buffer to a concurrent eviction.
    ///
    /// The operation's result is moot; the caller discards it.
    #[error("subregion is no longer cached")]
    NotCached,

    /// A fixed pool (notification queue, in-flight map reads) is full.
    #[error("{0} pool exhausted")]
    PoolExhausted(&'static str),

    /// A scheduler or retry worker thread could not be spawned at attach.
    ///
    /// Treated like any other attach-time failure: the LU ends up
    /// `NotSupported`.
    #[error("worker thread error: {0}")]
    Worker(String),

    /// An internal invariant broke during attach (e.g. the sized map-buffer
    /// pool ran dry while binding pinned regions).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias using `HpbError`.
pub type Result<T> = std::result::Result<T, HpbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let oob = HpbError::OutOfBounds {
            what: "region",
            index: 99,
            limit: 4,
        };
        assert_eq!(oob.to_string(), "region index 99 out of bounds (limit 4)");

        let pool = HpbError::PoolExhausted("notification");
        assert_eq!(pool.to_string(), "notification pool exhausted");

        let desc = HpbError::Descriptor("geometry descriptor truncated".into());
        assert!(desc.to_string().contains("geometry descriptor"));
    }
}
