//! Simulation configuration.
//!
//! `M`, `G`, queue capacity, and simulation duration are compile-time
//! constants in the reference implementation (§6); `Config` keeps that as
//! its default but is itself a plain struct so tests can instantiate
//! alternate topologies, and the binary's `clap` CLI can override the
//! ambient knobs (duration, log level) without touching the protocol
//! constants.

use std::time::Duration;

use clap::Parser;

use crate::message::GroupSet;
use crate::Rank;

/// Number of managers in the reference configuration.
pub const DEFAULT_MANAGERS: u32 = 3;
/// Number of groups in the reference configuration.
pub const DEFAULT_GROUPS: u32 = 2;
/// Reference simulation duration.
pub const DEFAULT_SIM_SECS: u64 = 15;
/// Reference per-requester critical-section duration.
pub const DEFAULT_CS_SECS: u64 = 2;
/// Reference inter-cycle back-off.
pub const DEFAULT_BACKOFF_SECS: u64 = 1;
/// Reference total world size (3 managers + 2 requesters).
pub const DEFAULT_TOTAL_RANKS: u32 = 5;

/// Full simulation configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of manager ranks, `0..managers`. Must be odd and `>= 3`.
    pub managers: u32,
    /// Number of groups, `0..groups`.
    pub groups: u32,
    /// Total process count; ranks `managers..total_ranks` are requesters.
    pub total_ranks: u32,
    /// Per-manager bound on outstanding (ungranted, unadmitted) requests.
    pub queue_capacity: usize,
    /// How long a requester holds the critical section.
    pub cs_duration: Duration,
    /// Pause between a requester's `IDLE` entry and its next `WAIT` cycle.
    pub backoff_duration: Duration,
    /// Wall-clock bound on the whole simulation.
    pub sim_duration: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            managers: DEFAULT_MANAGERS,
            groups: DEFAULT_GROUPS,
            total_ranks: DEFAULT_TOTAL_RANKS,
            queue_capacity: 128,
            cs_duration: Duration::from_secs(DEFAULT_CS_SECS),
            backoff_duration: Duration::from_secs(DEFAULT_BACKOFF_SECS),
            sim_duration: Duration::from_secs(DEFAULT_SIM_SECS),
        }
    }
}

impl Config {
    /// Number of requester ranks implied by `total_ranks - managers`.
    pub fn requester_count(&self) -> u32 {
        self.total_ranks.saturating_sub(self.managers)
    }

    /// Whether `rank` names a manager.
    pub fn is_manager(&self, rank: Rank) -> bool {
        rank < self.managers
    }

    /// The fixed per-rank group-set policy (§6): the first requester rank
    /// wants group 0 only, the second wants both groups, every other
    /// requester wants group 1 only. Ranks beyond the first two requesters
    /// cycle through the same three policies so larger topologies still
    /// exercise both the single-group and multi-group paths.
    pub fn group_set_for(&self, rank: Rank) -> GroupSet {
        debug_assert!(!self.is_manager(rank));
        let offset = (rank - self.managers) % 3;
        let last_group = self.groups.saturating_sub(1);
        match offset {
            0 => GroupSet::singleton(0),
            1 => GroupSet::from_groups(&[0, last_group]),
            _ => GroupSet::singleton(last_group),
        }
    }

    /// Validate the invariants required by §3 and §7.
    pub fn validate(&self) -> crate::errors::Result<()> {
        use crate::errors::GmeError;

        if self.managers < 3 || self.managers % 2 == 0 {
            return Err(GmeError::InvalidManagerCount(self.managers));
        }
        if self.groups == 0 {
            return Err(GmeError::InvalidGroupCount);
        }
        if self.total_ranks <= self.managers {
            return Err(GmeError::InvalidTopology {
                total_ranks: self.total_ranks,
                managers: self.managers,
            });
        }
        if (self.queue_capacity as u32) < self.requester_count() {
            return Err(GmeError::QueueTooSmall {
                capacity: self.queue_capacity,
                requesters: self.requester_count(),
            });
        }
        Ok(())
    }
}

/// Command-line surface for the simulation binary. Only ambient knobs are
/// exposed here — `managers`/`groups` stay at their compiled-in defaults
/// unless a caller builds a `Config` directly (e.g. in tests), matching the
/// "compile-time" configuration model of §6.
#[derive(Debug, Parser)]
#[command(name = "quorum-gme", about = "Quorum-based group mutual exclusion simulation")]
pub struct Cli {
    /// Override the simulation's wall-clock duration, in seconds.
    #[arg(long, default_value_t = DEFAULT_SIM_SECS)]
    pub sim_secs: u64,

    /// Tracing log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Build a `Config` from the reference defaults with this CLI's
    /// overrides applied.
    pub fn to_config(&self) -> Config {
        Config {
            sim_duration: Duration::from_secs(self.sim_secs),
            ..Config::default()
        }
    }
}
