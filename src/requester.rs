//! The requester state machine (§4.3): gathers a quorum's grants, becomes
//! pivot or follower, and runs the two-phase release when pivot.
//! `RequesterCore` is the pure transition table; `run` drives it over a
//! real `Transport`, pausing for back-off and the simulated CS body.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::clock::LamportClock;
use crate::config::Config;
use crate::coterie::Coterie;
use crate::message::{GroupId, GroupSet, Message};
use crate::transport::{Envelope, Transport};
use crate::Rank;

/// `mode` of the requester state machine (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterMode {
    /// Between cycles; no outstanding request.
    Idle,
    /// A `REQUEST` was broadcast to this cycle's quorum; gathering `OK`s
    /// (or waiting on a single `ENTER` as an opportunistically admitted
    /// follower).
    Wait,
    /// Holding the critical section, either as pivot or as follower.
    In,
    /// Pivot only: `RELEASE` sent, gathering `FINISHED` acks before `OVER`.
    Out,
}

/// What a requester transition owes the transport: every requester message
/// either goes to the whole quorum at once (`REQUEST`, `LOCK`, `NONEED`,
/// `RELEASE`, `OVER`) or to a single manager (the `CANCELLED` ack) — so,
/// unlike the manager's per-destination `Enter` fan-out, this can ride
/// `Transport::broadcast` directly instead of one `send` per recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// The same message, addressed to every member of the quorum.
    Broadcast(Vec<Rank>, Message),
    /// A single reply to one specific rank.
    Unicast(Rank, Message),
}

impl Outbound {
    fn send_via(self, from: Rank, transport: &Transport) {
        match self {
            Outbound::Broadcast(to, message) => transport.broadcast(from, &to, message),
            Outbound::Unicast(to, message) => transport.send(from, to, message),
        }
    }
}

/// What the async driver must do in response to a transition, beyond
/// sending the returned messages: enter the critical section as pivot or
/// as follower. Everything else is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// No critical-section transition this call.
    None,
    /// Commit to `group` as pivot and run the critical section.
    EnterCsAsPivot {
        /// The group the pivot committed to.
        group: GroupId,
    },
    /// Enter the critical section as a follower admitted into `group`.
    EnterCsAsFollower {
        /// The pivot's group, which this follower was admitted under.
        group: GroupId,
    },
}

/// The requester's synchronous transition table.
#[derive(Debug, Clone)]
pub struct RequesterCore {
    rank: Rank,
    gset: GroupSet,
    coterie: Coterie,
    clock: LamportClock,
    mode: RequesterMode,
    my_ts: i64,
    chosen_group: Option<GroupId>,
    quorum: Vec<Rank>,
    ok_count: usize,
    finished_count: usize,
}

impl RequesterCore {
    pub fn new(rank: Rank, cfg: &Config) -> Self {
        RequesterCore {
            rank,
            gset: cfg.group_set_for(rank),
            coterie: Coterie::new(cfg.managers),
            clock: LamportClock::new(),
            mode: RequesterMode::Idle,
            my_ts: 0,
            chosen_group: None,
            quorum: Vec::new(),
            ok_count: 0,
            finished_count: 0,
        }
    }

    pub fn mode(&self) -> RequesterMode {
        self.mode
    }

    pub fn quorum(&self) -> &[Rank] {
        &self.quorum
    }

    /// `IDLE -> WAIT`: stamp a fresh cycle timestamp, pick a quorum (§4.1),
    /// and broadcast `REQUEST` to it. Per-cycle state is reinitialized here
    /// (§3, Lifetimes).
    pub fn start_cycle(&mut self) -> Outbound {
        self.my_ts = self.clock.tick();
        self.ok_count = 0;
        self.finished_count = 0;
        self.chosen_group = None;
        self.quorum = self.coterie.select_for(self.rank, self.gset.bitmask()).to_vec();
        self.mode = RequesterMode::Wait;

        debug!(requester = self.rank, ts = self.my_ts, quorum = ?self.quorum, "starting cycle");
        Outbound::Broadcast(
            self.quorum.clone(),
            Message::Request { ts: self.my_ts, rank: self.rank, gset: self.gset },
        )
    }

    /// Dispatch a received message, after applying the Lamport receive
    /// rule and the stale-reply filter (§3, invariant 3).
    pub fn handle(&mut self, from: Rank, msg: Message) -> (Option<Outbound>, Effect) {
        self.clock.observe(msg.ts());
        match msg {
            Message::Ok { ts, gset } => self.on_ok(ts, gset),
            Message::Enter { ts, group, gset } => self.on_enter(ts, group, gset),
            Message::Cancel { ts } => self.on_cancel(from, ts),
            Message::Finished { ts } => self.on_finished(ts),
            other => {
                warn!(
                    requester = self.rank,
                    tag = other.tag(),
                    mode = ?self.mode,
                    "unexpected message at requester, ignoring"
                );
                (None, Effect::None)
            }
        }
    }

    fn is_stale(&self, ts: i64) -> bool {
        ts != self.my_ts
    }

    fn on_ok(&mut self, ts: i64, gset: GroupSet) -> (Option<Outbound>, Effect) {
        if self.mode != RequesterMode::Wait || self.is_stale(ts) {
            trace!(requester = self.rank, ts, "stale or unexpected OK, discarding");
            return (None, Effect::None);
        }
        self.ok_count += 1;
        if self.ok_count < self.quorum.len() {
            return (None, Effect::None);
        }

        let group = gset.smallest().unwrap_or_else(|| self.gset.smallest().unwrap_or(0));
        self.chosen_group = Some(group);
        self.mode = RequesterMode::In;
        debug!(requester = self.rank, ts = self.my_ts, group, "quorum reached, committing as pivot");

        let out = Outbound::Broadcast(
            self.quorum.clone(),
            Message::Lock { ts: self.my_ts, rank: self.rank, group, gset: self.gset },
        );
        (Some(out), Effect::EnterCsAsPivot { group })
    }

    fn on_enter(&mut self, ts: i64, group: GroupId, gset: GroupSet) -> (Option<Outbound>, Effect) {
        if self.mode != RequesterMode::Wait || self.is_stale(ts) {
            trace!(requester = self.rank, ts, "stale or unexpected ENTER, discarding");
            return (None, Effect::None);
        }
        self.chosen_group = Some(group);
        self.mode = RequesterMode::In;
        debug!(requester = self.rank, ts, group, "admitted as follower");

        let out = Outbound::Broadcast(
            self.quorum.clone(),
            Message::NoNeed { ts, rank: self.rank, group, gset },
        );
        (Some(out), Effect::EnterCsAsFollower { group })
    }

    fn on_cancel(&mut self, from: Rank, ts: i64) -> (Option<Outbound>, Effect) {
        if self.mode != RequesterMode::Wait || self.is_stale(ts) {
            trace!(requester = self.rank, ts, "stale or unexpected CANCEL, discarding");
            return (None, Effect::None);
        }
        self.mode = RequesterMode::Idle;
        debug!(requester = self.rank, manager = from, "acknowledging CANCEL, retrying next cycle");
        (Some(Outbound::Unicast(from, Message::Cancelled { ts: self.my_ts })), Effect::None)
    }

    fn on_finished(&mut self, ts: i64) -> (Option<Outbound>, Effect) {
        if self.mode != RequesterMode::Out || self.is_stale(ts) {
            trace!(requester = self.rank, ts, "stale or unexpected FINISHED, discarding");
            return (None, Effect::None);
        }
        self.finished_count += 1;
        if self.finished_count < self.quorum.len() {
            return (None, Effect::None);
        }
        self.mode = RequesterMode::Idle;
        debug!(requester = self.rank, ts = self.my_ts, "all FINISHED received, closing cycle");
        let out = Outbound::Broadcast(self.quorum.clone(), Message::Over { ts: self.my_ts });
        (Some(out), Effect::None)
    }

    /// `IN -> OUT` for the pivot: begin the two-phase release.
    pub fn after_pivot_cs(&mut self) -> Outbound {
        self.mode = RequesterMode::Out;
        self.finished_count = 0;
        Outbound::Broadcast(self.quorum.clone(), Message::Release { ts: self.my_ts })
    }

    /// `IN -> IDLE` for a follower: the exit `NONEED` burst (§4.3 step 4).
    pub fn after_follower_cs(&mut self) -> Outbound {
        let group = self.chosen_group.unwrap_or(0);
        let ts = self.my_ts;
        self.mode = RequesterMode::Idle;
        Outbound::Broadcast(
            self.quorum.clone(),
            Message::NoNeed { ts, rank: self.rank, group, gset: self.gset },
        )
    }
}

/// Observes critical-section entry/exit, independent of the protocol
/// logic. The default is a no-op; tests supply a recording implementation
/// to assert the mutual-exclusion property of §8.
pub trait CsObserver: Send + Sync {
    /// Called the instant a requester begins holding the critical section.
    fn on_enter(&self, _rank: Rank, _group: GroupId) {}
    /// Called the instant a requester stops holding the critical section.
    fn on_exit(&self, _rank: Rank, _group: GroupId) {}
}

/// The production default: CS entry/exit is only visible via `tracing`.
pub struct TracingObserver;

impl CsObserver for TracingObserver {
    fn on_enter(&self, rank: Rank, group: GroupId) {
        tracing::info!(requester = rank, group, "entered critical section");
    }

    fn on_exit(&self, rank: Rank, group: GroupId) {
        tracing::info!(requester = rank, group, "exited critical section");
    }
}

/// Drive a `RequesterCore` for `rank` over the real transport until its
/// mailbox is closed (simulation end), pacing cycles with `Config`'s
/// back-off and CS durations.
pub async fn run(
    rank: Rank,
    cfg: Config,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
    transport: Transport,
    observer: Arc<dyn CsObserver>,
) {
    let mut core = RequesterCore::new(rank, &cfg);
    loop {
        tokio::time::sleep(cfg.backoff_duration).await;
        core.start_cycle().send_via(rank, &transport);

        loop {
            let Some(Envelope { from, message }) = rx.recv().await else { return };
            let (out, effect) = core.handle(from, message);
            if let Some(out) = out {
                out.send_via(rank, &transport);
            }

            match effect {
                Effect::EnterCsAsPivot { group } => {
                    observer.on_enter(rank, group);
                    tokio::time::sleep(cfg.cs_duration).await;
                    observer.on_exit(rank, group);
                    core.after_pivot_cs().send_via(rank, &transport);
                }
                Effect::EnterCsAsFollower { group } => {
                    observer.on_enter(rank, group);
                    tokio::time::sleep(cfg.cs_duration).await;
                    observer.on_exit(rank, group);
                    core.after_follower_cs().send_via(rank, &transport);
                }
                Effect::None => {}
            }

            if core.mode() == RequesterMode::Idle {
                break;
            }
        }
    }
}
