//! Tit-for-tat choking
//!
//! Every ten seconds the session hands the controller a snapshot of its peers
//! and applies the transitions this module decides on. Download phase policy:
//! the four peers uploading to us fastest earn the regular slots, and one
//! more choked peer gets the optimistic slot, drawn uniformly at random so
//! newcomers can prove themselves.

use std::net::SocketAddr;

use rand::Rng;
use tracing::debug;

/// Number of merit-based unchoke slots
pub const DEFAULT_UNCHOKE_SLOTS: usize = 4;

/// Snapshot of one peer, as the session sees it at rechoke time
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Peer address, used as the identity in decisions
    pub addr: SocketAddr,
    /// Bytes per second this peer is currently uploading to us
    pub upload_to_us: u64,
    /// Whether we are choking the peer right now
    pub am_choking: bool,
}

/// A single transition to apply; peers already in the target state are
/// never re-notified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChokeTransition {
    pub addr: SocketAddr,
    /// `true` to send CHOKE, `false` to send UNCHOKE
    pub choke: bool,
}

/// Recomputes the served-peer set on a fixed cadence
pub struct ChokingController {
    slots: usize,
}

impl ChokingController {
    /// Controller with the standard four regular slots.
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_UNCHOKE_SLOTS)
    }

    /// Controller with a custom regular slot count.
    pub fn with_slots(slots: usize) -> Self {
        Self { slots }
    }

    /// Evaluate all peers and return the transitions to apply.
    pub fn rechoke(&mut self, peers: &[PeerSnapshot]) -> Vec<ChokeTransition> {
        self.rechoke_with(peers, |upper| rand::thread_rng().gen_range(0..upper))
    }

    /// Same as [`rechoke`](Self::rechoke) with the optimistic draw injected,
    /// so tests can pin it.
    fn rechoke_with(
        &mut self,
        peers: &[PeerSnapshot],
        mut draw: impl FnMut(usize) -> usize,
    ) -> Vec<ChokeTransition> {
        if peers.is_empty() {
            return Vec::new();
        }

        // Fastest uploaders first; ties keep snapshot order
        let mut ranked: Vec<&PeerSnapshot> = peers.iter().collect();
        ranked.sort_by(|a, b| b.upload_to_us.cmp(&a.upload_to_us));

        let (served, remainder) = ranked.split_at(self.slots.min(ranked.len()));

        let optimistic = if remainder.is_empty() {
            None
        } else {
            Some(remainder[draw(remainder.len())].addr)
        };

        let mut transitions = Vec::new();
        for peer in served {
            if peer.am_choking {
                transitions.push(ChokeTransition {
                    addr: peer.addr,
                    choke: false,
                });
            }
        }
        for peer in remainder {
            let unchoke = Some(peer.addr) == optimistic;
            if peer.am_choking == unchoke {
                transitions.push(ChokeTransition {
                    addr: peer.addr,
                    choke: !unchoke,
                });
            }
        }

        if let Some(addr) = optimistic {
            debug!(%addr, "optimistic unchoke slot");
        }
        transitions
    }
}

impl Default for ChokingController {
    fn default() -> Self {
        Self::new()
    }
}
