//! In-process transport: one unbounded mailbox per rank.
//!
//! This stands in for the real point-to-point transport the protocol is
//! specified against (§1, §6): typed messages with sender identity, FIFO
//! per ordered (sender, receiver) pair, no ordering guarantee across
//! senders. A single `mpsc` channel per receiving rank gives exactly that:
//! every send from one task happens in program order, so the queue a given
//! sender appends to preserves its own order, while concurrent senders may
//! interleave arbitrarily — the transport never blocks a process on a slow
//! peer (§5).

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::message::Message;
use crate::Rank;

/// A message in flight, carrying the sender's rank the way a real
/// transport's sender identity would.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Rank,
    pub message: Message,
}

/// Per-rank outbound handles, shared by every task that needs to address a
/// peer by rank.
#[derive(Debug, Clone)]
pub struct Transport {
    senders: HashMap<Rank, mpsc::UnboundedSender<Envelope>>,
}

impl Transport {
    /// Build a transport wired for exactly `ranks`, returning each rank's
    /// receive end alongside the shared `Transport` handle used to send.
    pub fn build(ranks: impl Iterator<Item = Rank>) -> (Transport, HashMap<Rank, mpsc::UnboundedReceiver<Envelope>>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for rank in ranks {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(rank, tx);
            receivers.insert(rank, rx);
        }
        (Transport { senders }, receivers)
    }

    /// Send `message` from `from` to `to`. Silently drops if `to` has no
    /// registered mailbox (it has already shut down) or has dropped its
    /// receiver — a real transport would see a connection reset, which is
    /// equally not a protocol-level error.
    pub fn send(&self, from: Rank, to: Rank, message: Message) {
        if let Some(tx) = self.senders.get(&to) {
            let _ = tx.send(Envelope { from, message });
        }
    }

    /// Send `message` from `from` to every member of `quorum`.
    pub fn broadcast(&self, from: Rank, quorum: &[Rank], message: Message) {
        for &to in quorum {
            self.send(from, to, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::GroupSet;

    #[tokio::test]
    async fn send_preserves_order_for_a_single_sender() {
        let (transport, mut receivers) = Transport::build([0u32, 1].into_iter());
        let mut rx = receivers.remove(&1).unwrap();

        transport.send(0, 1, Message::Request { ts: 1, rank: 0, gset: GroupSet::singleton(0) });
        transport.send(0, 1, Message::Request { ts: 2, rank: 0, gset: GroupSet::singleton(0) });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.message.ts(), 1);
        assert_eq!(second.message.ts(), 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_quorum_member() {
        let (transport, mut receivers) = Transport::build([0u32, 1, 2].into_iter());
        transport.broadcast(0, &[1, 2], Message::Cancel { ts: 1 });

        assert!(receivers.get_mut(&1).unwrap().recv().await.is_some());
        assert!(receivers.get_mut(&2).unwrap().recv().await.is_some());
    }
}
