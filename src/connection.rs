//! Per-peer connection state machine: send/receive queues, ack bookkeeping,
//! reliable retry, heartbeat and liveness.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use web_time::Instant;

use crate::ack::{AckBundleRing, AckWindow};
use crate::buffer::{ByteBuffer, Endian};
use crate::config::SessionConfig;
use crate::error::ProtocolViolation;
use crate::inorder::InOrderChannel;
use crate::packet::{
    core_messages, decode_packet_body, encode_message, DefinitionTable, FramedMessage, PacketHeader,
    MAX_PACKET_SIZE,
};
use crate::reliable::{ReliableRecvWindow, ReliableSendWindow};
use crate::seq::Seq;

/// A peer's connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// This connection represents ourselves.
    Local,
    /// Just created; no data observed yet.
    Unconfirmed,
    /// At least one packet has been received.
    Confirmed,
}

struct QueuedReliable {
    type_id: u8,
    payload: Vec<u8>,
}

struct QueuedUnreliable {
    type_id: u8,
    payload: Vec<u8>,
}

struct SentReliable {
    reliable_id: u16,
    sequence_id: Option<u16>,
    type_id: u8,
    payload: Vec<u8>,
    last_send_at: Instant,
}

/// A message ready for the gameplay layer to handle, borrowed only for the
/// duration of dispatch.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// The message's type id.
    pub type_id: u8,
    /// The message payload.
    pub payload: Vec<u8>,
}

/// Per-peer state: address, identity, lifecycle, and every send/receive
/// primitive layered on top of the packet framing layer.
pub struct Connection {
    /// The peer's socket address.
    pub address: SocketAddr,
    /// Host-assigned small integer identifying this connection on the wire.
    pub peer_index: u8,
    /// Client-chosen string identifier.
    pub guid: String,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Whether this connection has exceeded the liveness soft threshold.
    pub is_bad: bool,

    last_recv_at: Instant,
    last_send_at: Instant,

    ack_window: AckWindow,
    ack_bundles: AckBundleRing,
    next_sent_ack: u16,

    reliable_recv: ReliableRecvWindow,
    reliable_send: ReliableSendWindow,
    inorder: InOrderChannel,

    unsent_reliables: VecDeque<QueuedReliable>,
    unsent_unreliables: VecDeque<QueuedUnreliable>,
    sent_reliables: VecDeque<SentReliable>,
}

impl Connection {
    /// Creates a new, `Unconfirmed` connection for a freshly accepted or
    /// joined peer.
    #[must_use]
    pub fn new(address: SocketAddr, peer_index: u8, guid: String, reliable_range_radius: u16, now: Instant) -> Self {
        Self {
            address,
            peer_index,
            guid,
            state: ConnectionState::Unconfirmed,
            is_bad: false,
            last_recv_at: now,
            last_send_at: now,
            ack_window: AckWindow::new(),
            ack_bundles: AckBundleRing::new(),
            next_sent_ack: 0,
            reliable_recv: ReliableRecvWindow::new(reliable_range_radius),
            reliable_send: ReliableSendWindow::new(),
            inorder: InOrderChannel::new(),
            unsent_reliables: VecDeque::new(),
            unsent_unreliables: VecDeque::new(),
            sent_reliables: VecDeque::new(),
        }
    }

    /// `oldest_unconfirmed_reliable_id` as tracked by the send-side window.
    #[must_use]
    pub fn oldest_unconfirmed_reliable_id(&self) -> u16 {
        self.reliable_send.oldest_unconfirmed()
    }

    /// Enqueues a message for sending.
    ///
    /// `is_reliable`/`is_in_order` mirror the looked-up [`Definition`]'s
    /// flags; the caller (the session) is expected to have already looked
    /// up and validated the definition.
    ///
    /// [`Definition`]: crate::packet::Definition
    pub fn send_message(&mut self, type_id: u8, is_reliable: bool, payload: Vec<u8>) {
        if is_reliable {
            self.unsent_reliables.push_back(QueuedReliable { type_id, payload });
        } else {
            self.unsent_unreliables.push_back(QueuedUnreliable { type_id, payload });
        }
    }

    /// Builds and returns one outbound packet, or `None` if there is
    /// nothing to send and the heartbeat interval hasn't elapsed.
    pub fn build_packet(&mut self, defs: &DefinitionTable, config: &SessionConfig, now: Instant) -> Option<Vec<u8>> {
        let ack = self.next_sent_ack;
        self.next_sent_ack = if ack == 0xFFFE { 0 } else { ack.wrapping_add(1) };

        let mut mem = vec![0u8; MAX_PACKET_SIZE];
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);

        let header = PacketHeader {
            peer_index: self.peer_index,
            ack,
            highest_received_ack: self.ack_window.highest_received(),
            prev_received_bitfield: self.ack_window.prev_received_bitfield(),
        };
        if !header.encode(&mut buf) {
            return None;
        }
        let Some(count_bookmark) = buf.reserve::<u8>() else {
            return None;
        };

        let mut num_messages: u8 = 0;
        let mut carried_reliables = Vec::new();

        // A bad connection sends heartbeats only; no new or resent traffic
        // goes out until it recovers.
        if !self.is_bad {
            // (a) resend due reliables
            while let Some(front) = self.sent_reliables.front() {
                if Seq(front.reliable_id) < Seq(self.reliable_send.oldest_unconfirmed()) {
                    self.sent_reliables.pop_front();
                    continue;
                }
                if now.duration_since(front.last_send_at) < config.reliable_retry_after {
                    break;
                }
                if num_messages as usize >= config.max_reliables_per_packet {
                    break;
                }
                let def_type_id = front.type_id;
                let Some(def) = defs.get(def_type_id) else {
                    self.sent_reliables.pop_front();
                    continue;
                };
                if encode_message(&mut buf, def, Some(front.reliable_id), front.sequence_id, &front.payload) {
                    carried_reliables.push(front.reliable_id);
                    num_messages += 1;
                    let mut entry = self.sent_reliables.pop_front().expect("front just peeked");
                    entry.last_send_at = now;
                    self.sent_reliables.push_back(entry);
                } else {
                    break;
                }
            }

            // (b) newly assigned reliables
            while self.reliable_send.outstanding() < config.reliable_range_radius
                && (num_messages as usize) < config.max_reliables_per_packet
            {
                let Some(queued) = self.unsent_reliables.pop_front() else {
                    break;
                };
                let Some(def) = defs.get(queued.type_id) else {
                    continue;
                };
                let reliable_id = self.reliable_send.assign();
                let sequence_id = def.is_in_order().then(|| self.inorder.next_sent());
                if encode_message(&mut buf, def, Some(reliable_id), sequence_id, &queued.payload) {
                    carried_reliables.push(reliable_id);
                    num_messages += 1;
                    self.sent_reliables.push_back(SentReliable {
                        reliable_id,
                        sequence_id,
                        type_id: queued.type_id,
                        payload: queued.payload,
                        last_send_at: now,
                    });
                } else {
                    self.unsent_reliables.push_front(queued);
                    break;
                }
            }

            // (c) unreliables; ones that don't fit are dropped, not requeued
            while let Some(queued) = self.unsent_unreliables.pop_front() {
                let Some(def) = defs.get(queued.type_id) else {
                    continue;
                };
                if encode_message(&mut buf, def, None, None, &queued.payload) {
                    num_messages += 1;
                }
                // if it didn't fit, it's simply dropped
            }
        } else {
            self.unsent_unreliables.clear();
        }

        if num_messages == 0 && now.duration_since(self.last_send_at) < config.heartbeat_interval {
            return None;
        }

        buf.write_at(count_bookmark, num_messages);
        self.ack_bundles.insert(ack, carried_reliables);
        self.last_send_at = now;

        let len = buf.len_written();
        mem.truncate(len);
        Some(mem)
    }

    /// Processes a fully decoded, length-validated packet's header: updates
    /// the ack window and confirms reliables via the ack-bundle ring.
    pub fn receive_header(&mut self, header: &PacketHeader) {
        self.ack_window.update(header.ack);

        self.confirm_ack(header.highest_received_ack);
        for i in 0..crate::ack::ACK_BITS {
            if header.prev_received_bitfield & (1u16 << i) != 0 {
                let acked = header.highest_received_ack.wrapping_sub(i as u16 + 1);
                self.confirm_ack(acked);
            }
        }
    }

    fn confirm_ack(&mut self, ack_id: u16) {
        if let Some(bundle) = self.ack_bundles.take(ack_id) {
            for reliable_id in bundle.reliable_ids {
                self.reliable_send.confirm(reliable_id);
            }
        }
    }

    /// Processes one decoded message, taking the in-order hold-back path if
    /// applicable. Returns the messages now ready to dispatch to the
    /// gameplay layer, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolViolation::ReliableIdOutOfWindow`] if a reliable
    /// message arrives further than the window radius ahead of expected.
    pub fn receive_message(&mut self, msg: FramedMessage, is_in_order: bool) -> Result<Vec<Dispatch>, ProtocolViolation> {
        if let Some(reliable_id) = msg.reliable_id {
            let is_new = self.reliable_recv.accept(reliable_id)?;
            if !is_new {
                return Ok(Vec::new());
            }
        }

        if is_in_order {
            let sequence_id = msg.sequence_id.unwrap_or(0);
            let ready = self.inorder.receive(sequence_id, msg.payload);
            return Ok(ready
                .into_iter()
                .map(|m| Dispatch {
                    type_id: msg.type_id,
                    payload: m.payload,
                })
                .collect());
        }

        Ok(vec![Dispatch {
            type_id: msg.type_id,
            payload: msg.payload,
        }])
    }

    /// Marks this connection as having just received a packet: clears
    /// `is_bad` and resets the liveness timer.
    pub fn note_receipt(&mut self, now: Instant) {
        self.last_recv_at = now;
        if self.is_bad {
            tracing::info!(peer_index = self.peer_index, "connection no longer bad");
        }
        self.is_bad = false;
        if self.state == ConnectionState::Unconfirmed {
            tracing::info!(peer_index = self.peer_index, "connection confirmed");
            self.state = ConnectionState::Confirmed;
        }
    }

    /// Advances liveness bookkeeping against `now`. Returns `true` if this
    /// connection should be disconnected.
    #[must_use]
    pub fn tick_liveness(&mut self, now: Instant, config: &SessionConfig) -> bool {
        if self.state == ConnectionState::Local {
            return false;
        }
        let since_recv = now.duration_since(self.last_recv_at);
        if since_recv > config.disconnect_after {
            tracing::info!(peer_index = self.peer_index, "connection timed out, disconnecting");
            return true;
        }
        if since_recv > config.bad_after && !self.is_bad {
            tracing::warn!(peer_index = self.peer_index, "connection marked bad");
            self.is_bad = true;
        }
        false
    }
}

/// Decodes a packet's header, body, and runs the length-validation pass,
/// without mutating any connection state. Used by the session's receive
/// loop before it has resolved which `Connection` this is for.
///
/// # Errors
///
/// See [`decode_packet_body`].
pub fn decode_incoming<'a>(
    raw: &'a mut [u8],
    received_len: usize,
    defs: &DefinitionTable,
) -> Result<(PacketHeader, Vec<FramedMessage>), ProtocolViolation> {
    let mut buf = ByteBuffer::for_reading(raw, received_len, Endian::Big);
    let header = PacketHeader::decode(&mut buf).ok_or(ProtocolViolation::LengthMismatch {
        summed: 0,
        received: received_len,
    })?;
    let num_messages: u8 = buf.read().ok_or(ProtocolViolation::LengthMismatch {
        summed: PacketHeader::ENCODED_LEN,
        received: received_len,
    })?;
    let messages = decode_packet_body(&mut buf, defs, num_messages, received_len)?;
    Ok((header, messages))
}

/// Builds a one-off connectionless datagram (PING/PONG/JOIN_DENY path),
/// bypassing per-connection send queues.
///
/// # Errors
///
/// Returns [`SendDirectError::UnknownTypeId`] if `type_id` isn't registered,
/// [`SendDirectError::RequiresConnection`] if it's reliable or in-order, or
/// a [`SendDirectError::Capacity`] if the message doesn't fit in one packet.
pub fn build_connectionless_packet(
    defs: &DefinitionTable,
    peer_index: u8,
    type_id: u8,
    payload: &[u8],
) -> Result<Vec<u8>, crate::error::SendDirectError> {
    use crate::error::SendDirectError;

    let def = defs.get(type_id).ok_or(SendDirectError::UnknownTypeId { type_id })?;
    if def.is_reliable() || def.is_in_order() {
        return Err(SendDirectError::RequiresConnection);
    }

    let mut mem = vec![0u8; MAX_PACKET_SIZE];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        let header = PacketHeader {
            peer_index,
            ack: 0xFFFF,
            highest_received_ack: 0,
            prev_received_bitfield: 0,
        };
        if !header.encode(&mut buf) {
            return Err(crate::error::CapacityError::PacketFull.into());
        }
        let Some(count_bookmark) = buf.reserve::<u8>() else {
            return Err(crate::error::CapacityError::PacketFull.into());
        };
        if !encode_message(&mut buf, def, None, None, payload) {
            return Err(crate::error::CapacityError::MessageTooLarge {
                len: payload.len(),
                max: MAX_PACKET_SIZE,
            }
            .into());
        }
        buf.write_at(count_bookmark, 1u8);
        buf.len_written()
    };
    mem.truncate(len);
    Ok(mem)
}

/// Core message type ids re-exported for convenience.
pub use core_messages as core;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{control_flags, option_flags, Definition};

    fn reliable_unordered_defs() -> DefinitionTable {
        let mut defs = DefinitionTable::new();
        defs.register(Definition {
            type_id: 10,
            name: "test_reliable",
            control_flags: 0,
            option_flags: option_flags::RELIABLE,
        });
        defs.register(Definition {
            type_id: 11,
            name: "test_unreliable",
            control_flags: 0,
            option_flags: 0,
        });
        defs
    }

    fn reliable_in_order_defs() -> DefinitionTable {
        let mut defs = DefinitionTable::new();
        defs.register(Definition {
            type_id: 20,
            name: "test_in_order",
            control_flags: control_flags::IN_ORDER,
            option_flags: option_flags::RELIABLE,
        });
        defs
    }

    #[test]
    fn enqueue_and_flush_reliable_message() {
        let defs = reliable_unordered_defs();
        let config = SessionConfig::default();
        let now = Instant::now();
        let mut conn = Connection::new("127.0.0.1:0".parse().unwrap(), 1, "peer".into(), 1000, now);

        conn.send_message(10, true, b"X".to_vec());
        let packet = conn.build_packet(&defs, &config, now).expect("has content to send");
        assert!(!packet.is_empty());
    }

    #[test]
    fn unreliable_message_flushed_once() {
        let defs = reliable_unordered_defs();
        let config = SessionConfig::default();
        let now = Instant::now();
        let mut conn = Connection::new("127.0.0.1:0".parse().unwrap(), 1, "peer".into(), 1000, now);

        conn.send_message(11, false, b"Y".to_vec());
        let packet = conn.build_packet(&defs, &config, now).unwrap();
        let (_, messages) = decode_incoming(&mut packet.clone(), packet.len(), &defs).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"Y");
    }

    #[test]
    fn heartbeat_suppressed_until_interval_elapses() {
        let defs = reliable_unordered_defs();
        let config = SessionConfig::default();
        let now = Instant::now();
        let mut conn = Connection::new("127.0.0.1:0".parse().unwrap(), 1, "peer".into(), 1000, now);

        assert!(conn.build_packet(&defs, &config, now).is_none());
        let later = now + config.heartbeat_interval + Duration::from_millis(1);
        assert!(conn.build_packet(&defs, &config, later).is_some());
    }

    #[test]
    fn reliable_redelivery_after_retry_window() {
        let defs = reliable_unordered_defs();
        let config = SessionConfig::default();
        let now = Instant::now();
        let mut conn = Connection::new("127.0.0.1:0".parse().unwrap(), 1, "peer".into(), 1000, now);

        conn.send_message(10, true, b"X".to_vec());
        let first = conn.build_packet(&defs, &config, now).unwrap();
        let (_, first_msgs) = decode_incoming(&mut first.clone(), first.len(), &defs).unwrap();
        assert_eq!(first_msgs[0].reliable_id, Some(0));

        // first packet "lost": no further action. after 200ms+ the resend appears.
        let retry_time = now + config.reliable_retry_after + Duration::from_millis(1);
        let second = conn
            .build_packet(&defs, &config, retry_time)
            .expect("heartbeat/resend should fire");
        let (_, second_msgs) = decode_incoming(&mut second.clone(), second.len(), &defs).unwrap();
        assert_eq!(second_msgs[0].reliable_id, Some(0));

        conn.confirm_ack_for_test(0, &[0]);
        assert_eq!(conn.oldest_unconfirmed_reliable_id(), 1);
    }

    #[test]
    fn in_order_messages_hold_back_until_contiguous() {
        let defs = reliable_in_order_defs();
        let now = Instant::now();
        let mut conn = Connection::new("127.0.0.1:0".parse().unwrap(), 1, "peer".into(), 1000, now);

        let msg = |seq: u16, rid: u16| FramedMessage {
            type_id: 20,
            reliable_id: Some(rid),
            sequence_id: Some(seq),
            payload: vec![seq as u8],
        };

        let mut dispatched = Vec::new();
        for (seq, rid) in [(0u16, 0u16), (1, 1), (3, 3), (4, 4)] {
            let ready = conn.receive_message(msg(seq, rid), true).unwrap();
            dispatched.extend(ready.into_iter().map(|d| d.payload[0]));
        }
        assert_eq!(dispatched, vec![0, 1]);

        let ready = conn.receive_message(msg(2, 2), true).unwrap();
        dispatched.extend(ready.into_iter().map(|d| d.payload[0]));
        assert_eq!(dispatched, vec![0, 1, 2, 3, 4]);
    }

    impl Connection {
        fn confirm_ack_for_test(&mut self, ack_id: u16, _reliable_ids: &[u16]) {
            self.confirm_ack(ack_id);
        }
    }
}
