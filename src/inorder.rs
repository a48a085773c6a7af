//! The in-order channel: sequence-id assignment on the send side, hold-back
//! reorder buffering on the receive side.

use std::collections::BTreeMap;

use crate::reliable::RELIABLE_RANGE_RADIUS;
use crate::seq::Seq;

/// A reliable, in-order message buffered in the `InOrderChannel`'s hold-back
/// set while waiting for its predecessors to arrive.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// The framed payload, as received.
    pub payload: Vec<u8>,
}

/// Assigns outbound sequence ids and reorders inbound ones back into order.
///
/// Invariant: a message is dispatched immediately iff its `sequence_id`
/// equals `next_expected_sequence_id`; otherwise it is buffered in
/// `hold_back`, a set ordered by the cyclic comparator on [`Seq`]. After
/// every advance, `hold_back` is drained while its minimum matches the new
/// expectation.
#[derive(Debug, Default)]
pub struct InOrderChannel {
    next_sent_sequence_id: u16,
    next_expected_sequence_id: u16,
    hold_back: BTreeMap<Seq, StoredMessage>,
}

impl InOrderChannel {
    /// Creates a channel starting both counters at 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns and returns the next outbound sequence id.
    pub fn next_sent(&mut self) -> u16 {
        let id = self.next_sent_sequence_id;
        self.next_sent_sequence_id = self.next_sent_sequence_id.wrapping_add(1);
        id
    }

    /// The next sequence id this channel expects to dispatch.
    #[must_use]
    pub fn next_expected(&self) -> u16 {
        self.next_expected_sequence_id
    }

    /// Number of messages currently sitting in the hold-back buffer.
    #[must_use]
    pub fn hold_back_len(&self) -> usize {
        self.hold_back.len()
    }

    /// Presents a received message with the given `sequence_id`. Returns the
    /// messages now ready for dispatch, in order: the message itself (if it
    /// matched immediately) followed by anything drained from hold-back.
    ///
    /// If `sequence_id` doesn't match, the message is cloned into hold-back
    /// and an empty vec is returned.
    pub fn receive(&mut self, sequence_id: u16, payload: Vec<u8>) -> Vec<StoredMessage> {
        if sequence_id != self.next_expected_sequence_id {
            self.hold_back
                .insert(Seq(sequence_id), StoredMessage { payload });
            return Vec::new();
        }

        let mut ready = vec![StoredMessage { payload }];
        self.next_expected_sequence_id = self.next_expected_sequence_id.wrapping_add(1);

        while let Some((&front, _)) = self.hold_back.iter().next() {
            if front == Seq(self.next_expected_sequence_id) {
                let msg = self.hold_back.remove(&front).expect("just peeked");
                ready.push(msg);
                self.next_expected_sequence_id = self.next_expected_sequence_id.wrapping_add(1);
            } else {
                break;
            }
        }

        ready
    }

    /// Whether the hold-back buffer has exceeded its allowed bound (`R - 1`
    /// entries): exceeding this indicates a peer-protocol violation upstream
    /// (the reliable window should have rejected the id before it reached
    /// here).
    #[must_use]
    pub fn hold_back_exceeds_bound(&self) -> bool {
        self.hold_back.len() >= usize::from(RELIABLE_RANGE_RADIUS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_arrival_dispatches_immediately() {
        let mut ch = InOrderChannel::new();
        for i in 0..5u16 {
            let ready = ch.receive(i, vec![i as u8]);
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].payload, vec![i as u8]);
        }
        assert_eq!(ch.hold_back_len(), 0);
    }

    #[test]
    fn out_of_order_arrival_drains_on_catch_up() {
        // ids 0,1,2,3,4 arrive with id 2 delayed behind 3 and 4
        let mut ch = InOrderChannel::new();
        let mut dispatched = Vec::new();

        for i in [0u16, 1, 3, 4] {
            let ready = ch.receive(i, vec![i as u8]);
            dispatched.extend(ready.into_iter().map(|m| m.payload[0]));
        }
        assert_eq!(dispatched, vec![0, 1]);
        assert_eq!(ch.hold_back_len(), 2);

        let ready = ch.receive(2, vec![2]);
        dispatched.extend(ready.into_iter().map(|m| m.payload[0]));
        assert_eq!(dispatched, vec![0, 1, 2, 3, 4]);
        assert_eq!(ch.hold_back_len(), 0);
    }

    #[test]
    fn next_sent_increments_independently_of_receive_side() {
        let mut ch = InOrderChannel::new();
        assert_eq!(ch.next_sent(), 0);
        assert_eq!(ch.next_sent(), 1);
    }
}
