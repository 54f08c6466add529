//! The manager state machine (§4.2): arbitrates access for one manager
//! rank. `ManagerCore` is the pure, synchronously-testable transition
//! table; `run` drives it over a real `Transport`.

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::clock::{LamportClock, Priority};
use crate::config::Config;
use crate::message::{GroupId, GroupSet, Message};
use crate::transport::{Envelope, Transport};
use crate::Rank;

/// `mode` of the manager state machine (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerMode {
    /// No pending grant, no pivot, empty of in-flight state.
    Vacant,
    /// An `OK` was sent; waiting for the winner's `LOCK` (or a preempting
    /// higher-priority `REQUEST` to trigger a `CANCEL`).
    WaitLock,
    /// A pivot is locked in; followers may be admitted opportunistically.
    Locked,
    /// The pivot sent `RELEASE`; waiting for outstanding followers to send
    /// `NONEED` before reporting `FINISHED`.
    Releasing,
    /// A `CANCEL` was sent to the previous pending winner; waiting for its
    /// `CANCELLED` (or a late `LOCK` that wins the race instead).
    WaitCancel,
}

/// A queued, not-yet-granted-or-admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    rank: Rank,
    ts: i64,
    gset: GroupSet,
}

impl QueueEntry {
    fn priority(&self) -> Priority {
        Priority::new(self.ts, self.rank)
    }
}

/// The pivot captured on `LOCK` acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PivotInfo {
    rank: Rank,
    ts: i64,
    group: GroupId,
    gset: GroupSet,
}

/// A message this manager owes to some other rank.
pub type Outgoing = (Rank, Message);

/// The manager's synchronous transition table. No I/O, no async — every
/// public method takes the inputs a transition needs and returns the
/// messages that transition emits, so it can be driven directly in tests
/// without a transport or a runtime.
#[derive(Debug, Clone)]
pub struct ManagerCore {
    rank: Rank,
    queue_capacity: usize,
    clock: LamportClock,
    mode: ManagerMode,
    pivot: Option<PivotInfo>,
    /// Invariant 1 (§3): `Some` iff `mode` is `WaitLock` or `WaitCancel`.
    pending_ok: Option<QueueEntry>,
    /// Kept in ascending priority order; index 0 is the highest-priority entry.
    queue: Vec<QueueEntry>,
    followers: HashSet<Rank>,
}

impl ManagerCore {
    pub fn new(rank: Rank, cfg: &Config) -> Self {
        ManagerCore {
            rank,
            queue_capacity: cfg.queue_capacity,
            clock: LamportClock::new(),
            mode: ManagerMode::Vacant,
            pivot: None,
            pending_ok: None,
            queue: Vec::new(),
            followers: HashSet::new(),
        }
    }

    pub fn mode(&self) -> ManagerMode {
        self.mode
    }

    /// Dispatch a received message, after applying the Lamport receive rule.
    pub fn handle(&mut self, from: Rank, msg: Message) -> Vec<Outgoing> {
        self.clock.observe(msg.ts());
        match msg {
            Message::Request { ts, gset, .. } => self.on_request(from, ts, gset),
            Message::Lock { ts, group, gset, .. } => self.on_lock(from, ts, group, gset),
            Message::Release { ts } => self.on_release(from, ts),
            Message::Over { ts } => self.on_over(from, ts),
            Message::NoNeed { ts, group, gset, .. } => self.on_noneed(from, ts, group, gset),
            Message::Cancelled { ts } => self.on_cancelled(from, ts),
            other => {
                warn!(
                    manager = self.rank,
                    tag = other.tag(),
                    mode = ?self.mode,
                    "unexpected message at manager, ignoring"
                );
                Vec::new()
            }
        }
    }

    fn enqueue(&mut self, entry: QueueEntry) -> bool {
        if self.queue.len() >= self.queue_capacity {
            let err = crate::errors::GmeError::QueueOverflow {
                manager: self.rank,
                capacity: self.queue_capacity,
                rank: entry.rank,
            };
            warn!(manager = self.rank, rank = entry.rank, "{err}");
            return false;
        }
        let pos = self
            .queue
            .iter()
            .position(|q| entry.priority().outranks(&q.priority()))
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
        true
    }

    fn pop_best(&mut self) -> Option<QueueEntry> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    /// Pop the highest-priority queued request (if any) and grant it an OK,
    /// entering `WaitLock`. Used on the `Vacant` entry path and whenever a
    /// cycle closes (`OVER`, a cleared `WaitCancel`).
    fn grant_next(&mut self) -> Vec<Outgoing> {
        match self.pop_best() {
            Some(entry) => {
                debug!(manager = self.rank, rank = entry.rank, ts = entry.ts, "granting OK");
                self.pending_ok = Some(entry);
                self.mode = ManagerMode::WaitLock;
                vec![(entry.rank, Message::Ok { ts: entry.ts, gset: entry.gset })]
            }
            None => {
                self.mode = ManagerMode::Vacant;
                Vec::new()
            }
        }
    }

    /// Scan the queue for entries compatible with the current pivot and
    /// with lower priority than it, admitting each as a follower. Shared
    /// between `LOCK` acceptance (bulk admission) and opportunistic
    /// admission of a newly arrived `REQUEST` while `Locked` (§4.2 Open
    /// Question 2).
    fn admit_compatible(&mut self, pivot: PivotInfo) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let mut remaining = Vec::new();
        for entry in self.queue.drain(..) {
            let compatible = entry.gset.contains(pivot.group)
                && pivot.priority_of().outranks(&entry.priority());
            if compatible {
                self.followers.insert(entry.rank);
                out.push((
                    entry.rank,
                    Message::Enter {
                        ts: entry.ts,
                        group: pivot.group,
                        gset: pivot.gset,
                    },
                ));
            } else {
                remaining.push(entry);
            }
        }
        self.queue = remaining;
        out
    }

    fn on_request(&mut self, from: Rank, ts: i64, gset: GroupSet) -> Vec<Outgoing> {
        let entry = QueueEntry { rank: from, ts, gset };
        if !self.enqueue(entry) {
            return Vec::new();
        }

        match self.mode {
            ManagerMode::Vacant => self.grant_next(),
            ManagerMode::WaitLock => {
                let Some(pending) = self.pending_ok else {
                    warn!(manager = self.rank, "WaitLock with no pending OK, ignoring");
                    return Vec::new();
                };
                if entry.priority().outranks(&pending.priority()) {
                    debug!(
                        manager = self.rank,
                        cancelling = pending.rank,
                        winner = from,
                        "higher-priority request preempts pending OK"
                    );
                    self.mode = ManagerMode::WaitCancel;
                    vec![(pending.rank, Message::Cancel { ts: pending.ts })]
                } else {
                    Vec::new()
                }
            }
            ManagerMode::Locked => {
                let Some(pivot) = self.pivot else {
                    warn!(manager = self.rank, "Locked with no pivot, ignoring");
                    return Vec::new();
                };
                if entry.gset.contains(pivot.group) && pivot.priority_of().outranks(&entry.priority()) {
                    // Admit this single newcomer immediately; remove it from
                    // the queue we just inserted it into.
                    self.queue.retain(|q| *q != entry);
                    self.followers.insert(entry.rank);
                    vec![(
                        entry.rank,
                        Message::Enter { ts: entry.ts, group: pivot.group, gset: pivot.gset },
                    )]
                } else {
                    Vec::new()
                }
            }
            ManagerMode::Releasing | ManagerMode::WaitCancel => Vec::new(),
        }
    }

    fn on_lock(&mut self, from: Rank, ts: i64, group: GroupId, gset: GroupSet) -> Vec<Outgoing> {
        let matches_pending = matches!(self.mode, ManagerMode::WaitLock | ManagerMode::WaitCancel)
            && self.pending_ok.map(|p| p.rank == from && p.ts == ts).unwrap_or(false);
        if !matches_pending {
            trace!(manager = self.rank, rank = from, ts, "LOCK without a matching pending OK, ignoring");
            return Vec::new();
        }

        let pivot = PivotInfo { rank: from, ts, group, gset };
        self.pending_ok = None;
        self.followers.clear();
        self.mode = ManagerMode::Locked;
        self.pivot = Some(pivot);
        debug!(manager = self.rank, pivot = from, group, "pivot locked");

        self.admit_compatible(pivot)
    }

    fn on_release(&mut self, from: Rank, ts: i64) -> Vec<Outgoing> {
        let Some(pivot) = self.pivot else { return Vec::new() };
        if self.mode != ManagerMode::Locked || pivot.rank != from {
            return Vec::new();
        }
        self.mode = ManagerMode::Releasing;
        self.pivot = Some(PivotInfo { ts, ..pivot });
        debug!(manager = self.rank, pivot = from, followers = self.followers.len(), "releasing");

        if self.followers.is_empty() {
            vec![(from, Message::Finished { ts })]
        } else {
            Vec::new()
        }
    }

    fn on_noneed(&mut self, from: Rank, ts: i64, _group: GroupId, _gset: GroupSet) -> Vec<Outgoing> {
        match self.mode {
            ManagerMode::Locked => {
                self.followers.remove(&from);
                Vec::new()
            }
            ManagerMode::Releasing => {
                self.followers.remove(&from);
                if self.followers.is_empty() {
                    if let Some(pivot) = self.pivot {
                        return vec![(pivot.rank, Message::Finished { ts: pivot.ts })];
                    }
                }
                Vec::new()
            }
            ManagerMode::WaitCancel => {
                let matches = self.pending_ok.map(|p| p.rank == from && p.ts == ts).unwrap_or(false);
                if matches {
                    self.pending_ok = None;
                    self.mode = ManagerMode::Vacant;
                    self.grant_next()
                } else {
                    Vec::new()
                }
            }
            ManagerMode::Vacant | ManagerMode::WaitLock => Vec::new(),
        }
    }

    fn on_cancelled(&mut self, from: Rank, _ts: i64) -> Vec<Outgoing> {
        if self.mode != ManagerMode::WaitCancel {
            return Vec::new();
        }
        let matches = self.pending_ok.map(|p| p.rank == from).unwrap_or(false);
        if !matches {
            return Vec::new();
        }
        self.pending_ok = None;
        self.mode = ManagerMode::Vacant;
        self.grant_next()
    }

    fn on_over(&mut self, from: Rank, _ts: i64) -> Vec<Outgoing> {
        match self.pivot {
            Some(pivot) if self.mode == ManagerMode::Releasing && pivot.rank == from => {
                self.pivot = None;
                self.followers.clear();
                self.mode = ManagerMode::Vacant;
                self.grant_next()
            }
            _ => {
                trace!(manager = self.rank, "OVER outside an active release, ignoring");
                Vec::new()
            }
        }
    }
}

impl PivotInfo {
    fn priority_of(&self) -> Priority {
        Priority::new(self.ts, self.rank)
    }
}

/// Drive a `ManagerCore` for `rank` over the real transport until its
/// mailbox is closed (simulation end).
pub async fn run(rank: Rank, cfg: Config, mut rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>, transport: Transport) {
    let mut core = ManagerCore::new(rank, &cfg);
    while let Some(Envelope { from, message }) = rx.recv().await {
        let tag = message.tag();
        let out = core.handle(from, message);
        trace!(manager = rank, from, tag, emitted = out.len(), "processed message");
        for (to, msg) in out {
            transport.send(rank, to, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    fn req(rank: Rank, ts: i64, groups: &[GroupId]) -> Message {
        Message::Request { ts, rank, gset: GroupSet::from_groups(groups) }
    }

    #[test]
    fn vacant_on_request_grants_immediately() {
        let mut m = ManagerCore::new(0, &cfg());
        let out = m.handle(3, req(3, 1, &[0]));
        assert_eq!(out, vec![(3, Message::Ok { ts: 1, gset: GroupSet::singleton(0) })]);
        assert_eq!(m.mode(), ManagerMode::WaitLock);
    }

    #[test]
    fn priority_preservation_on_vacant_to_waitlock() {
        // Two requests race into an empty manager; whichever message the
        // manager processes first becomes pending_ok via grant_next, but
        // a REQUEST arriving while WaitLock must yield to higher priority.
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(4, req(4, 5, &[0])); // lower priority (larger ts) granted first
        assert_eq!(m.pending_ok.unwrap().rank, 4);

        let out = m.handle(3, req(3, 3, &[0])); // higher priority (smaller ts)
        assert_eq!(out, vec![(4, Message::Cancel { ts: 5 })]);
        assert_eq!(m.mode(), ManagerMode::WaitCancel);
    }

    #[test]
    fn cancellation_then_grant_to_winner() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(4, req(4, 5, &[0]));
        m.handle(3, req(3, 3, &[0]));
        assert_eq!(m.mode(), ManagerMode::WaitCancel);

        let out = m.handle(4, Message::Cancelled { ts: 5 });
        assert_eq!(out, vec![(3, Message::Ok { ts: 3, gset: GroupSet::singleton(0) })]);
        assert_eq!(m.mode(), ManagerMode::WaitLock);
    }

    #[test]
    fn lock_wins_race_against_cancel() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(4, req(4, 5, &[0]));
        m.handle(3, req(3, 3, &[0]));
        assert_eq!(m.mode(), ManagerMode::WaitCancel);

        // r=4's LOCK arrives despite the outstanding CANCEL.
        let out = m.handle(4, Message::Lock { ts: 5, rank: 4, group: 0, gset: GroupSet::singleton(0) });
        assert_eq!(m.mode(), ManagerMode::Locked);
        // r=3 stays queued, no ENTER: it outranks the pivot.
        assert!(out.is_empty());
        assert_eq!(m.queue.len(), 1);
        assert_eq!(m.queue[0].rank, 3);
    }

    #[test]
    fn locked_admits_lower_priority_follower_on_lock() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(3, req(3, 1, &[0]));
        m.handle(4, req(4, 2, &[0])); // queued while WaitLock

        let out = m.handle(3, Message::Lock { ts: 1, rank: 3, group: 0, gset: GroupSet::singleton(0) });
        assert_eq!(
            out,
            vec![(4, Message::Enter { ts: 2, group: 0, gset: GroupSet::singleton(0) })]
        );
        assert!(m.followers.contains(&4));
    }

    #[test]
    fn locked_admits_opportunistically_on_incoming_request() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(3, req(3, 1, &[0]));
        m.handle(3, Message::Lock { ts: 1, rank: 3, group: 0, gset: GroupSet::singleton(0) });
        assert_eq!(m.mode(), ManagerMode::Locked);

        let out = m.handle(4, req(4, 2, &[0]));
        assert_eq!(
            out,
            vec![(4, Message::Enter { ts: 2, group: 0, gset: GroupSet::singleton(0) })]
        );
        assert!(m.queue.is_empty());
    }

    #[test]
    fn locked_does_not_admit_incompatible_group() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(3, req(3, 1, &[0]));
        m.handle(3, Message::Lock { ts: 1, rank: 3, group: 0, gset: GroupSet::singleton(0) });

        let out = m.handle(4, req(4, 2, &[1]));
        assert!(out.is_empty());
        assert_eq!(m.queue.len(), 1);
    }

    #[test]
    fn two_phase_release_waits_for_empty_followers() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(3, req(3, 1, &[0]));
        m.handle(3, Message::Lock { ts: 1, rank: 3, group: 0, gset: GroupSet::singleton(0) });
        m.handle(4, req(4, 2, &[0])); // admitted as follower

        let out = m.handle(3, Message::Release { ts: 1 });
        assert!(out.is_empty(), "FINISHED withheld while a follower is outstanding");
        assert_eq!(m.mode(), ManagerMode::Releasing);

        let out = m.handle(4, Message::NoNeed { ts: 2, rank: 4, group: 0, gset: GroupSet::singleton(0) });
        assert_eq!(out, vec![(3, Message::Finished { ts: 1 })]);
    }

    #[test]
    fn follower_early_exit_lets_release_finish_immediately() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(3, req(3, 1, &[0]));
        m.handle(3, Message::Lock { ts: 1, rank: 3, group: 0, gset: GroupSet::singleton(0) });
        m.handle(4, req(4, 2, &[0]));
        m.handle(4, Message::NoNeed { ts: 2, rank: 4, group: 0, gset: GroupSet::singleton(0) });
        assert!(m.followers.is_empty());

        let out = m.handle(3, Message::Release { ts: 1 });
        assert_eq!(out, vec![(3, Message::Finished { ts: 1 })]);
    }

    #[test]
    fn over_closes_cycle_and_grants_next_head() {
        let mut m = ManagerCore::new(0, &cfg());
        m.handle(3, req(3, 1, &[0]));
        m.handle(3, Message::Lock { ts: 1, rank: 3, group: 0, gset: GroupSet::singleton(0) });
        m.handle(5, req(5, 9, &[0])); // different group-incompatible-free request waits
        m.handle(3, Message::Release { ts: 1 });

        let out = m.handle(3, Message::Over { ts: 1 });
        assert_eq!(out, vec![(5, Message::Ok { ts: 9, gset: GroupSet::singleton(0) })]);
        assert_eq!(m.mode(), ManagerMode::WaitLock);
    }

    #[test]
    fn over_in_vacant_is_ignored() {
        let mut m = ManagerCore::new(0, &cfg());
        let out = m.handle(3, Message::Over { ts: 1 });
        assert!(out.is_empty());
        assert_eq!(m.mode(), ManagerMode::Vacant);
    }

    #[test]
    fn queue_overflow_drops_request_and_emits_no_grant() {
        let mut cfg = cfg();
        cfg.queue_capacity = 1;
        let mut m = ManagerCore::new(0, &cfg);
        m.handle(3, req(3, 1, &[0])); // granted immediately, queue empties back out
        m.handle(4, req(4, 2, &[0])); // queued (capacity 1)
        let out = m.handle(5, req(5, 3, &[0])); // dropped: queue already at capacity
        assert!(out.is_empty());
        assert_eq!(m.queue.len(), 1);
    }
}
