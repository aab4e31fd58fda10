//! Rarest-first piece selection
//!
//! The picker owns two pieces of swarm-wide state: how many connected peers
//! hold each piece (availability) and which pieces are currently assigned to
//! some peer (the in-flight lock set). All operations are short and run under
//! one internal mutex, so peers may call in from any task.

use bitvec::prelude::*;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

/// Rarest-first piece picker with in-flight locking
pub struct PiecePicker {
    inner: Mutex<PickerState>,
}

struct PickerState {
    /// Per-piece count of connected peers holding the piece
    availability: Vec<u32>,
    /// Pieces currently assigned to a peer; at most one holder per index
    in_flight: BitVec<u8, Msb0>,
    /// Tie-break pool size among the rarest candidates; 1 is deterministic
    variance: usize,
}

impl PiecePicker {
    /// Create a picker for a torrent of `num_pieces` pieces with the default
    /// deterministic tie-break.
    pub fn new(num_pieces: usize) -> Self {
        Self::with_variance(num_pieces, 1)
    }

    /// Create a picker that selects uniformly among the `variance` rarest
    /// candidates. A variance of 1 always takes the lowest index.
    pub fn with_variance(num_pieces: usize, variance: usize) -> Self {
        Self {
            inner: Mutex::new(PickerState {
                availability: vec![0; num_pieces],
                in_flight: bitvec![u8, Msb0; 0; num_pieces],
                variance: variance.max(1),
            }),
        }
    }

    /// Select a piece for a peer: one it has, we lack, and nobody is
    /// downloading. The returned index is locked in-flight until
    /// [`piece_passed`](Self::piece_passed) or
    /// [`piece_failed`](Self::piece_failed) releases it.
    pub fn pick_piece(
        &self,
        peer_bits: &BitSlice<u8, Msb0>,
        my_bits: &BitSlice<u8, Msb0>,
    ) -> Option<usize> {
        let mut state = self.inner.lock();
        let num_pieces = state.availability.len();

        let mut candidates: Vec<(u32, usize)> = Vec::new();
        for index in 0..num_pieces {
            if my_bits.get(index).is_some_and(|b| *b) {
                continue;
            }
            if state.in_flight[index] {
                continue;
            }
            if !peer_bits.get(index).is_some_and(|b| *b) {
                continue;
            }
            candidates.push((state.availability[index], index));
        }

        if candidates.is_empty() {
            return None;
        }

        // Rarity ascending, then index ascending
        candidates.sort_unstable();
        let pool = candidates.len().min(state.variance);
        let chosen = if pool == 1 {
            candidates[0].1
        } else {
            candidates[rand::thread_rng().gen_range(0..pool)].1
        };

        state.in_flight.set(chosen, true);
        debug!(piece = chosen, "picker assigned piece");
        Some(chosen)
    }

    /// Release the in-flight lock after a verified piece.
    pub fn piece_passed(&self, index: usize) {
        self.release(index);
    }

    /// Release the in-flight lock after a failed or abandoned piece so
    /// another peer can pick it up.
    pub fn piece_failed(&self, index: usize) {
        self.release(index);
    }

    fn release(&self, index: usize) {
        let mut state = self.inner.lock();
        if index < state.in_flight.len() {
            state.in_flight.set(index, false);
        }
    }

    /// Fold a peer's bitfield into (or out of) the availability counts.
    /// Bits past the torrent's piece count are ignored. Decrements saturate
    /// at zero.
    pub fn update_availability(&self, peer_bits: &BitSlice<u8, Msb0>, add: bool) {
        let mut state = self.inner.lock();
        let limit = state.availability.len().min(peer_bits.len());
        for index in peer_bits[..limit].iter_ones() {
            let slot = &mut state.availability[index];
            *slot = if add {
                slot.saturating_add(1)
            } else {
                slot.saturating_sub(1)
            };
        }
    }

    /// Record a HAVE announcement for one piece.
    pub fn record_have(&self, index: usize) {
        let mut state = self.inner.lock();
        if let Some(slot) = state.availability.get_mut(index) {
            *slot = slot.saturating_add(1);
        }
    }

    /// Availability snapshot, for diagnostics and tests.
    pub fn availability(&self) -> Vec<u32> {
        self.inner.lock().availability.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(set: &[usize], len: usize) -> BitVec<u8, Msb0> {
        let mut bv = bitvec![u8, Msb0; 0; len];
        for &i in set {
            bv.set(i, true);
        }
        bv
    }

    #[test]
    fn test_rarest_first_ordering() {
        // Peer1 has {0,1,2}, Peer2 has {0,1}: piece 2 is rarest.
        let picker = PiecePicker::new(4);
        let peer1 = bits(&[0, 1, 2], 4);
        let peer2 = bits(&[0, 1], 4);
        let mine = bits(&[], 4);

        picker.update_availability(&peer1, true);
        picker.update_availability(&peer2, true);

        assert_eq!(picker.pick_piece(&peer1, &mine), Some(2));
        assert_eq!(picker.pick_piece(&peer2, &mine), Some(0));
        assert_eq!(picker.pick_piece(&peer1, &mine), Some(1));
        // Everything either locked or absent from both peers
        assert_eq!(picker.pick_piece(&peer1, &mine), None);
        assert_eq!(picker.pick_piece(&peer2, &mine), None);
    }

    #[test]
    fn test_never_picks_owned_absent_or_locked() {
        let picker = PiecePicker::new(8);
        let peer = bits(&[1, 3, 5], 8);
        let mine = bits(&[3], 8);

        picker.update_availability(&peer, true);

        let first = picker.pick_piece(&peer, &mine).unwrap();
        assert!(first == 1, "lowest index among equal-rarity candidates");

        let second = picker.pick_piece(&peer, &mine).unwrap();
        assert_eq!(second, 5, "3 is ours, 1 is in flight");
        assert_eq!(picker.pick_piece(&peer, &mine), None);
    }

    #[test]
    fn test_release_makes_piece_pickable_again() {
        let picker = PiecePicker::new(2);
        let peer = bits(&[0, 1], 2);
        let mine = bits(&[], 2);
        picker.update_availability(&peer, true);

        assert_eq!(picker.pick_piece(&peer, &mine), Some(0));
        assert_eq!(picker.pick_piece(&peer, &mine), Some(1));
        assert_eq!(picker.pick_piece(&peer, &mine), None);

        picker.piece_failed(1);
        assert_eq!(picker.pick_piece(&peer, &mine), Some(1));

        picker.piece_passed(0);
        // Passed pieces come back too; the caller's bitfield is what
        // excludes them after a save
        assert_eq!(picker.pick_piece(&peer, &mine), Some(0));
    }

    #[test]
    fn test_disconnect_restores_availability() {
        let picker = PiecePicker::new(5);
        let a = bits(&[0, 2, 4], 5);
        let b = bits(&[0, 1], 5);

        picker.update_availability(&a, true);
        let baseline = picker.availability();

        picker.update_availability(&b, true);
        picker.update_availability(&b, false);
        assert_eq!(picker.availability(), baseline);
    }

    #[test]
    fn test_decrement_saturates_at_zero() {
        let picker = PiecePicker::new(3);
        let peer = bits(&[0, 1, 2], 3);
        picker.update_availability(&peer, false);
        assert_eq!(picker.availability(), vec![0, 0, 0]);
    }

    #[test]
    fn test_have_increments_single_piece() {
        let picker = PiecePicker::new(3);
        picker.record_have(1);
        picker.record_have(1);
        picker.record_have(7); // out of range, ignored
        assert_eq!(picker.availability(), vec![0, 2, 0]);
    }

    #[test]
    fn test_oversized_peer_bitfield_tail_ignored() {
        let picker = PiecePicker::new(3);
        // 8 bits from one byte; bits 3..8 are past the torrent
        let peer = bits(&[0, 1, 2, 3, 4, 5, 6, 7], 8);
        picker.update_availability(&peer, true);
        assert_eq!(picker.availability(), vec![1, 1, 1]);
    }

    #[test]
    fn test_variance_picks_within_rarest_pool() {
        let picker = PiecePicker::with_variance(6, 3);
        let peer = bits(&[0, 1, 2, 3, 4, 5], 6);
        let mine = bits(&[], 6);
        picker.update_availability(&peer, true);

        for _ in 0..6 {
            let picked = picker.pick_piece(&peer, &mine).unwrap();
            assert!(picked < 6);
        }
        assert_eq!(picker.pick_piece(&peer, &mine), None);
    }
}
