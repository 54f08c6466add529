//! Quorum-based group mutual exclusion
//!
//! A set of manager ranks arbitrate entry to a shared resource on behalf of
//! a set of requester ranks. Requesters declare, per cycle, which of `G`
//! groups they want to enter; two requesters may share the resource only if
//! their group sets overlap. Mutual exclusion across incompatible groups is
//! enforced without any rank seeing the full set of outstanding requests, by
//! having each requester gather grants from one quorum of a coterie of
//! pairwise-intersecting manager subsets.
//!
//! # Architecture
//!
//! - **Manager** ([`manager`]): per-manager-rank arbitration — a priority
//!   queue of outstanding requests, a single pending grant at a time, and
//!   opportunistic admission of compatible followers once a pivot locks in.
//! - **Requester** ([`requester`]): per-requester-rank cycle — gather a
//!   quorum's grants, become pivot or follower, run the critical section,
//!   and (as pivot) drive the two-phase release.
//! - **Coterie** ([`coterie`]): the quorum family and deterministic
//!   per-requester quorum selection.
//! - **Clock** ([`clock`]): the Lamport clock and `(timestamp, rank)`
//!   priority order used to break ties between concurrent requests.
//! - **Message / transport** ([`message`], [`transport`]): the wire schema
//!   and the in-process mailbox substrate the two state machines run over.
//! - **Config / errors** ([`config`], [`errors`]): simulation topology and
//!   the setup-time failures that can stop a run before it starts.

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod coterie;
pub mod errors;
pub mod manager;
pub mod message;
pub mod requester;
pub mod transport;

/// A process identity. Manager ranks occupy `0..managers`; requester ranks
/// occupy `managers..total_ranks`.
pub type Rank = u32;

/// A group identity, `0..groups`.
pub type GroupId = u32;

pub use config::Config;
pub use coterie::Coterie;
pub use errors::{GmeError, Result};
pub use manager::{ManagerCore, ManagerMode};
pub use message::{GroupSet, Message};
pub use requester::{Effect, Outbound, RequesterCore, RequesterMode};
pub use transport::{Envelope, Transport};

/// Crate version, surfaced in startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
