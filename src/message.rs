//! The protocol message schema: a tagged sum in Rust, flattened to a
//! fixed-layout wire struct for transport.

use serde::{Deserialize, Serialize};

use crate::errors::{GmeError, Result};
use crate::{GroupId, Rank};

/// The set of groups a requester is willing to enter this cycle, or the
/// group set a pivot was admitted under. Backed by a bitmask since `G` is
/// small (single digits in practice); `bitmask()` feeds coterie selection
/// (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupSet(u64);

impl GroupSet {
    /// The empty set.
    pub fn empty() -> Self {
        GroupSet(0)
    }

    /// A set containing exactly one group.
    pub fn singleton(group: GroupId) -> Self {
        let mut s = GroupSet::empty();
        s.insert(group);
        s
    }

    /// Build from an explicit list of member groups.
    pub fn from_groups(groups: &[GroupId]) -> Self {
        let mut s = GroupSet::empty();
        for &g in groups {
            s.insert(g);
        }
        s
    }

    /// Add `group` to the set.
    pub fn insert(&mut self, group: GroupId) {
        self.0 |= 1 << group;
    }

    /// Whether `group` is a member.
    pub fn contains(&self, group: GroupId) -> bool {
        self.0 & (1 << group) != 0
    }

    /// The raw bitmask, used by the coterie's deterministic quorum index.
    pub fn bitmask(&self) -> u64 {
        self.0
    }

    /// The smallest member group, used to deterministically choose the
    /// pivot's `chosen_group` out of its group set.
    pub fn smallest(&self) -> Option<GroupId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    /// Expand into `(0..bound)` bits truncated to `bound` groups.
    pub fn to_bits(&self, bound: u32) -> Vec<bool> {
        (0..bound).map(|g| self.contains(g)).collect()
    }
}

/// The tagged-sum message schema (§9 Design Notes). Each variant carries
/// only the fields meaningful for that tag, per the table in §6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Requester asks a manager for a grant.
    Request {
        ts: i64,
        rank: Rank,
        gset: GroupSet,
    },
    /// Manager grants candidate-pivot status.
    Ok { ts: i64, gset: GroupSet },
    /// Requester commits as pivot.
    Lock {
        ts: i64,
        rank: Rank,
        group: GroupId,
        gset: GroupSet,
    },
    /// Manager admits a requester as a follower.
    Enter {
        ts: i64,
        group: GroupId,
        gset: GroupSet,
    },
    /// Pivot begins the release phase.
    Release { ts: i64 },
    /// Manager reports all followers have signaled completion.
    Finished { ts: i64 },
    /// Pivot closes the cycle.
    Over { ts: i64 },
    /// Requester withdraws (follower exit, or withdrawal of a pending OK).
    NoNeed {
        ts: i64,
        rank: Rank,
        group: GroupId,
        gset: GroupSet,
    },
    /// Manager revokes a pending OK.
    Cancel { ts: i64 },
    /// Requester acknowledges a CANCEL.
    Cancelled { ts: i64 },
}

impl Message {
    /// The timestamp every variant carries, used for Lamport clock updates
    /// and for stale-reply filtering (§3, invariant 3).
    pub fn ts(&self) -> i64 {
        match self {
            Message::Request { ts, .. }
            | Message::Ok { ts, .. }
            | Message::Lock { ts, .. }
            | Message::Enter { ts, .. }
            | Message::Release { ts }
            | Message::Finished { ts }
            | Message::Over { ts }
            | Message::NoNeed { ts, .. }
            | Message::Cancel { ts }
            | Message::Cancelled { ts } => *ts,
        }
    }

    /// Transport-level tag, used only for logging/diagnostics; the payload
    /// itself already disambiguates via the enum variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Request { .. } => "REQUEST",
            Message::Ok { .. } => "OK",
            Message::Lock { .. } => "LOCK",
            Message::Enter { .. } => "ENTER",
            Message::Release { .. } => "RELEASE",
            Message::Finished { .. } => "FINISHED",
            Message::Over { .. } => "OVER",
            Message::NoNeed { .. } => "NONEED",
            Message::Cancel { .. } => "CANCEL",
            Message::Cancelled { .. } => "CANCELLED",
        }
    }

    /// Flatten to the fixed-layout wire struct required by §6.
    pub fn to_wire(&self, sender: Rank, groups: u32) -> WireMessage {
        let (tag, rank, gset, group) = match self {
            Message::Request { rank, gset, .. } => (WireTag::Request, *rank, *gset, -1),
            Message::Ok { gset, .. } => (WireTag::Ok, sender, *gset, -1),
            Message::Lock {
                rank, gset, group, ..
            } => (WireTag::Lock, *rank, *gset, *group as i32),
            Message::Enter { gset, group, .. } => {
                (WireTag::Enter, sender, *gset, *group as i32)
            }
            Message::Release { .. } => (WireTag::Release, sender, GroupSet::empty(), -1),
            Message::Finished { .. } => (WireTag::Finished, sender, GroupSet::empty(), -1),
            Message::Over { .. } => (WireTag::Over, sender, GroupSet::empty(), -1),
            Message::NoNeed {
                rank, gset, group, ..
            } => (WireTag::NoNeed, *rank, *gset, *group as i32),
            Message::Cancel { .. } => (WireTag::Cancel, sender, GroupSet::empty(), -1),
            Message::Cancelled { .. } => (WireTag::Cancelled, sender, GroupSet::empty(), -1),
        };
        WireMessage {
            tag,
            timestamp: self.ts(),
            rank,
            gset: gset.to_bits(groups),
            group,
        }
    }
}

/// Transport-level tag. Not part of the payload proper (§6): it is carried
/// alongside the wire struct the way a real transport would carry it out of
/// band (e.g. an MPI tag or an RPC method name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireTag {
    /// See [`Message::Request`].
    Request,
    /// See [`Message::Ok`].
    Ok,
    /// See [`Message::Lock`].
    Lock,
    /// See [`Message::Enter`].
    Enter,
    /// See [`Message::Release`].
    Release,
    /// See [`Message::Finished`].
    Finished,
    /// See [`Message::Over`].
    Over,
    /// See [`Message::NoNeed`].
    NoNeed,
    /// See [`Message::Cancel`].
    Cancel,
    /// See [`Message::Cancelled`].
    Cancelled,
}

/// The fixed-layout wire payload: `(timestamp, rank, gset, group)`, field
/// order stable across every tag, per §6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Transport-level discriminant.
    pub tag: WireTag,
    /// Lamport timestamp, meaningful for every tag.
    pub timestamp: i64,
    /// The rank the payload is about (not necessarily the sender — see
    /// [`Message::to_wire`]).
    pub rank: Rank,
    /// Group-set bitmask expanded to `groups` booleans.
    pub gset: Vec<bool>,
    /// The chosen group, or `-1` when the tag carries none.
    pub group: i32,
}

impl WireMessage {
    /// Reconstruct the tagged-sum `Message` from its wire layout.
    pub fn decode(self) -> Result<Message> {
        let gset = GroupSet::from_groups(
            &self
                .gset
                .iter()
                .enumerate()
                .filter(|(_, set)| **set)
                .map(|(i, _)| i as GroupId)
                .collect::<Vec<_>>(),
        );
        let group = || -> Result<GroupId> {
            if self.group < 0 {
                Err(GmeError::Decode(format!(
                    "tag {:?} requires a non-negative group, got {}",
                    self.tag, self.group
                )))
            } else {
                Ok(self.group as GroupId)
            }
        };
        let ts = self.timestamp;
        Ok(match self.tag {
            WireTag::Request => Message::Request {
                ts,
                rank: self.rank,
                gset,
            },
            WireTag::Ok => Message::Ok { ts, gset },
            WireTag::Lock => Message::Lock {
                ts,
                rank: self.rank,
                group: group()?,
                gset,
            },
            WireTag::Enter => Message::Enter {
                ts,
                group: group()?,
                gset,
            },
            WireTag::Release => Message::Release { ts },
            WireTag::Finished => Message::Finished { ts },
            WireTag::Over => Message::Over { ts },
            WireTag::NoNeed => Message::NoNeed {
                ts,
                rank: self.rank,
                group: group()?,
                gset,
            },
            WireTag::Cancel => Message::Cancel { ts },
            WireTag::Cancelled => Message::Cancelled { ts },
        })
    }
}
