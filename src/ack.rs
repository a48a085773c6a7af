//! Packet-level acknowledgment: the `AckWindow` bitfield and the per-connection
//! `AckBundle` ring that maps an acked packet back to the reliable ids it carried.

use crate::seq::cyclic_gt;

/// Number of bits carried in the ack bitfield.
pub const ACK_BITS: u32 = 16;

/// Per-connection ring size for [`AckBundleRing`].
pub const MAX_ACK_BUNDLES: usize = 128;

/// `{highest_received, prev_received_bitfield}`, tracking which of the last
/// `ACK_BITS` packets before `highest_received` have been received.
///
/// Bit `i` of `prev_received_bitfield` denotes receipt of
/// `highest_received - (i+1)`. Only updated on a strictly newer ack by
/// left-shifting and setting the bit for the displaced previous highest;
/// an older, straggling ack sets its own bit without shifting.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckWindow {
    highest_received: u16,
    prev_received_bitfield: u16,
    has_received_any: bool,
}

impl AckWindow {
    /// Creates an empty window, having received nothing yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest ack observed so far.
    #[must_use]
    pub fn highest_received(&self) -> u16 {
        self.highest_received
    }

    /// The raw bitfield, ready to be placed on the wire.
    #[must_use]
    pub fn prev_received_bitfield(&self) -> u16 {
        self.prev_received_bitfield
    }

    /// Records receipt of `ack`, applying the asymmetric update rule: the
    /// window only ever advances forward.
    pub fn update(&mut self, ack: u16) {
        if !self.has_received_any {
            self.highest_received = ack;
            self.has_received_any = true;
            return;
        }
        if ack == self.highest_received {
            return;
        }
        if cyclic_gt(ack, self.highest_received) {
            let delta = ack.wrapping_sub(self.highest_received);
            if u32::from(delta) <= ACK_BITS {
                self.prev_received_bitfield <<= delta;
                self.prev_received_bitfield |= 1u16 << (delta - 1);
            } else {
                self.prev_received_bitfield = 0;
            }
            self.highest_received = ack;
        } else {
            let delta = self.highest_received.wrapping_sub(ack);
            if delta >= 1 && u32::from(delta) <= ACK_BITS {
                self.prev_received_bitfield |= 1u16 << (delta - 1);
            }
        }
    }

    /// Whether `ack` is recorded as received: either it is the current
    /// highest, or a set bit in the bitfield.
    #[must_use]
    pub fn was_received(&self, ack: u16) -> bool {
        if !self.has_received_any {
            return false;
        }
        if ack == self.highest_received {
            return true;
        }
        if cyclic_gt(ack, self.highest_received) {
            return false;
        }
        let delta = self.highest_received.wrapping_sub(ack);
        delta >= 1 && u32::from(delta) <= ACK_BITS && (self.prev_received_bitfield & (1u16 << (delta - 1))) != 0
    }

    /// Iterates every ack this window currently attests as received:
    /// `highest_received` plus every set bit of the bitfield.
    pub fn acked_seqs(&self) -> impl Iterator<Item = u16> + '_ {
        let highest = self.highest_received;
        let has_any = self.has_received_any;
        let bitfield = self.prev_received_bitfield;
        (0..ACK_BITS)
            .filter(move |i| (bitfield & (1u16 << i)) != 0)
            .map(move |i| highest.wrapping_sub(i as u16 + 1))
            .chain(has_any.then_some(highest))
    }
}

/// Per-connection record of which reliable ids a sent packet's ack carried,
/// so confirming that ack confirms those reliables. Indexed by
/// `ack_id % MAX_ACK_BUNDLES`; a new bundle silently overwrites whatever
/// previously occupied that slot, implicitly treating it as lost.
#[derive(Debug, Clone)]
pub struct AckBundleRing {
    slots: Vec<Option<AckBundle>>,
}

/// A single bundle: the ack id it was sent under, and the reliable ids it carried.
#[derive(Debug, Clone)]
pub struct AckBundle {
    /// The packet ack this bundle was recorded under.
    pub ack_id: u16,
    /// Reliable ids carried by that packet.
    pub reliable_ids: Vec<u16>,
}

impl AckBundleRing {
    /// Creates an empty ring of [`MAX_ACK_BUNDLES`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_ACK_BUNDLES],
        }
    }

    /// Records a bundle for `ack_id`, overwriting any prior occupant of that slot.
    pub fn insert(&mut self, ack_id: u16, reliable_ids: Vec<u16>) {
        let idx = ack_id as usize % MAX_ACK_BUNDLES;
        self.slots[idx] = Some(AckBundle {
            ack_id,
            reliable_ids,
        });
    }

    /// Takes the bundle for `ack_id` if it is still present in its slot
    /// (i.e. has not been overwritten by a later ack landing on the same
    /// slot), removing it.
    pub fn take(&mut self, ack_id: u16) -> Option<AckBundle> {
        let idx = ack_id as usize % MAX_ACK_BUNDLES;
        match &self.slots[idx] {
            Some(b) if b.ack_id == ack_id => self.slots[idx].take(),
            _ => None,
        }
    }
}

impl Default for AckBundleRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_updates_track_highest() {
        let mut w = AckWindow::new();
        for ack in 0..24u16 {
            w.update(ack);
        }
        assert_eq!(w.highest_received(), 23);
        for ack in 8..=23u16 {
            assert!(w.was_received(ack), "ack {ack} should be received");
        }
    }

    #[test]
    fn out_of_order_updates_are_recorded_without_shifting() {
        // property 4: arbitrary order within a 16-ack span of the max
        let mut w = AckWindow::new();
        let order = [23u16, 10, 22, 8, 9, 21, 20, 19, 18, 17, 16, 15, 14, 13, 12, 11];
        for &a in &order {
            w.update(a);
        }
        for &a in &order {
            assert!(w.was_received(a), "ack {a} should be received");
        }
    }

    #[test]
    fn straggler_sets_bit_without_moving_highest() {
        let mut w = AckWindow::new();
        w.update(10);
        w.update(5);
        assert_eq!(w.highest_received(), 10);
        assert!(w.was_received(5));
        assert!(w.was_received(10));
    }

    #[test]
    fn ring_overwrite_drops_old_bundle() {
        let mut ring = AckBundleRing::new();
        ring.insert(0, vec![1, 2, 3]);
        ring.insert(0 + MAX_ACK_BUNDLES as u16, vec![9]);
        let b = ring.take(0);
        assert!(b.is_none(), "slot 0 was overwritten by wraparound ack");
        let b = ring.take(MAX_ACK_BUNDLES as u16);
        assert_eq!(b.unwrap().reliable_ids, vec![9]);
    }

    #[test]
    fn take_is_idempotent_removal() {
        let mut ring = AckBundleRing::new();
        ring.insert(5, vec![42]);
        assert!(ring.take(5).is_some());
        assert!(ring.take(5).is_none());
    }
}
