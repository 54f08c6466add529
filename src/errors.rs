//! Error types for configuration, wire decoding, and simulation setup.
//!
//! Protocol races (a stale reply, a revoked OK, an unexpected tag in a given
//! mode) are not errors — see the manager and requester modules, which log
//! and continue. `GmeError` exists only for conditions that should stop the
//! binary before or around the simulation.

use thiserror::Error;

/// Errors raised while configuring or bootstrapping a simulation run.
#[derive(Debug, Error)]
pub enum GmeError {
    /// Fewer total ranks than managers; there is nothing left for requesters.
    #[error("world size {total_ranks} must exceed manager count {managers}")]
    InvalidTopology { total_ranks: u32, managers: u32 },

    /// `M` must be odd and at least 3 for every coterie quorum to have majority.
    #[error("manager count {0} must be odd and >= 3")]
    InvalidManagerCount(u32),

    /// The group count must be positive; rank policies index into `[0, G)`.
    #[error("group count must be at least 1")]
    InvalidGroupCount,

    /// Queue capacity smaller than the number of requesters risks silently
    /// dropping requests that will never be granted.
    #[error("queue capacity {capacity} is smaller than requester count {requesters}")]
    QueueTooSmall { capacity: usize, requesters: u32 },

    /// A manager's request queue is at capacity; the triggering request is dropped.
    #[error("manager {manager} queue at capacity ({capacity}), dropping request from rank {rank}")]
    QueueOverflow {
        manager: u32,
        capacity: usize,
        rank: u32,
    },

    /// The fixed-layout wire payload did not decode into a known message.
    #[error("failed to decode wire message: {0}")]
    Decode(String),
}

/// Result type for fallible setup and wire operations.
pub type Result<T> = std::result::Result<T, GmeError>;
