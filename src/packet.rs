//! Packet and message wire framing: the packet header, the
//! variable-width per-message header, and the message-definition dispatch
//! table that tells framing which optional fields a given `type_id` carries.

use crate::buffer::{ByteBuffer, Endian};
use crate::error::ProtocolViolation;

/// Maximum packet size: MTU 1280 minus a 48-byte IPv6+UDP reserve.
pub const MAX_PACKET_SIZE: usize = 1232;

/// `peer_index | ack | highest_received_ack | prev_received_bitfield`, the
/// fixed 7-byte prefix of every packet, followed by a `num_messages` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Host-assigned small integer identifying the sender's connection.
    pub peer_index: u8,
    /// This packet's own ack id, or [`crate::seq::Seq::INVALID`]'s raw value.
    pub ack: u16,
    /// Highest ack the sender has received from us.
    pub highest_received_ack: u16,
    /// Bitfield of the 16 acks before `highest_received_ack`.
    pub prev_received_bitfield: u16,
}

impl PacketHeader {
    /// Encoded length of the header fields, excluding `num_messages`.
    pub const ENCODED_LEN: usize = 1 + 2 + 2 + 2;

    /// Encodes the header, returning `false` if the buffer lacks room.
    pub fn encode(&self, buf: &mut ByteBuffer) -> bool {
        buf.write(self.peer_index)
            && buf.write(self.ack)
            && buf.write(self.highest_received_ack)
            && buf.write(self.prev_received_bitfield)
    }

    /// Decodes a header, returning `None` if the buffer has too few bytes.
    pub fn decode(buf: &mut ByteBuffer) -> Option<Self> {
        Some(Self {
            peer_index: buf.read()?,
            ack: buf.read()?,
            highest_received_ack: buf.read()?,
            prev_received_bitfield: buf.read()?,
        })
    }
}

/// Control-flag bits on a [`Definition`].
pub mod control_flags {
    /// This message type may be dispatched without a registered connection.
    pub const CONNECTIONLESS: u8 = 1 << 0;
    /// This message type, if also reliable, carries a `sequence_id` and
    /// takes the in-order dispatch path.
    pub const IN_ORDER: u8 = 1 << 1;
}

/// Option-flag bits on a [`Definition`].
pub mod option_flags {
    /// This message type carries a `reliable_id` and goes through the
    /// reliable send/recv windows.
    pub const RELIABLE: u8 = 1 << 0;
}

/// One entry of the session's message-definition dispatch table: everything
/// framing needs to know about a `type_id` to read/write its variable
/// header, plus a debug name for logging.
#[derive(Debug, Clone)]
pub struct Definition {
    /// The type id this definition is registered under.
    pub type_id: u8,
    /// Debug name, used only in logs.
    pub name: &'static str,
    /// See [`control_flags`].
    pub control_flags: u8,
    /// See [`option_flags`].
    pub option_flags: u8,
}

impl Definition {
    /// Whether this message type may be dispatched without a connection.
    #[must_use]
    pub fn is_connectionless(&self) -> bool {
        self.control_flags & control_flags::CONNECTIONLESS != 0
    }

    /// Whether this message type carries a `sequence_id` and is in-order.
    #[must_use]
    pub fn is_in_order(&self) -> bool {
        self.control_flags & control_flags::IN_ORDER != 0
    }

    /// Whether this message type carries a `reliable_id`.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.option_flags & option_flags::RELIABLE != 0
    }
}

/// The fixed 256-entry dispatch table, indexed by `type_id`.
#[derive(Debug, Clone)]
pub struct DefinitionTable {
    entries: Box<[Option<Definition>; 256]>,
}

impl DefinitionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Box::new(std::array::from_fn(|_| None)),
        }
    }

    /// Registers `def` at its own `type_id`, overwriting any prior entry.
    pub fn register(&mut self, def: Definition) {
        let idx = usize::from(def.type_id);
        self.entries[idx] = Some(def);
    }

    /// Looks up a definition by `type_id`.
    #[must_use]
    pub fn get(&self, type_id: u8) -> Option<&Definition> {
        self.entries[usize::from(type_id)].as_ref()
    }
}

impl Default for DefinitionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully decoded message, payload copied out of the packet buffer it came from.
#[derive(Debug, Clone)]
pub struct FramedMessage {
    /// The message's type id.
    pub type_id: u8,
    /// Present iff the definition is reliable.
    pub reliable_id: Option<u16>,
    /// Present iff the definition is reliable and in-order.
    pub sequence_id: Option<u16>,
    /// Raw application payload.
    pub payload: Vec<u8>,
}

/// Encodes one message's framing plus payload into `buf`, given its
/// definition and (if applicable) the ids already assigned to it.
///
/// This is all-or-nothing: the full encoded length is computed and checked
/// against `buf`'s remaining write capacity *before* any byte is written, so
/// a `false` return leaves `buf` byte-for-byte as it was before the call.
/// Without this, a write failing partway through a message would leave
/// uncounted trailing bytes behind `num_messages`, and the receiver's
/// length-validation pass would reject the whole packet instead of just the
/// message that didn't fit. Callers must treat `false` as "this message
/// doesn't fit in the current packet" and leave it queued.
pub fn encode_message(
    buf: &mut ByteBuffer,
    def: &Definition,
    reliable_id: Option<u16>,
    sequence_id: Option<u16>,
    payload: &[u8],
) -> bool {
    if def.is_reliable() && reliable_id.is_none() {
        return false;
    }
    if def.is_reliable() && def.is_in_order() && sequence_id.is_none() {
        return false;
    }

    let mut total_len = 2 + 1; // total_message_size prefix + type_id
    if def.is_reliable() {
        total_len += 2;
        if def.is_in_order() {
            total_len += 2;
        }
    }
    total_len += payload.len();

    if buf.remaining_write() < total_len {
        return false;
    }

    let size_bookmark = buf.reserve::<u16>().expect("room was just checked above");
    let msg_start = buf.position() - 2;

    buf.write(def.type_id);
    if def.is_reliable() {
        buf.write(reliable_id.expect("checked above"));
        if def.is_in_order() {
            buf.write(sequence_id.expect("checked above"));
        }
    }
    buf.write_forward(payload);

    let encoded_len = (buf.position() - msg_start) as u16;
    buf.write_at(size_bookmark, encoded_len);
    true
}

/// Decodes one message's framing plus payload from `buf`, consulting `defs`
/// for the variable-header shape.
///
/// # Errors
///
/// Returns [`ProtocolViolation::UnknownTypeId`] if the type id has no
/// registered definition, or [`ProtocolViolation::CorruptMessage`] if the
/// declared `total_message_size` runs past the populated region.
pub fn decode_message(buf: &mut ByteBuffer, defs: &DefinitionTable) -> Result<FramedMessage, ProtocolViolation> {
    let msg_start = buf.position();
    let total_len = buf
        .read::<u16>()
        .ok_or(ProtocolViolation::CorruptMessage { type_id: 0 })?;
    let msg_end = msg_start + usize::from(total_len);

    let type_id: u8 = buf
        .read()
        .ok_or(ProtocolViolation::CorruptMessage { type_id: 0 })?;
    let def = defs
        .get(type_id)
        .ok_or(ProtocolViolation::UnknownTypeId { type_id })?;

    let reliable_id = if def.is_reliable() {
        Some(
            buf.read::<u16>()
                .ok_or(ProtocolViolation::CorruptMessage { type_id })?,
        )
    } else {
        None
    };
    let sequence_id = if def.is_reliable() && def.is_in_order() {
        Some(
            buf.read::<u16>()
                .ok_or(ProtocolViolation::CorruptMessage { type_id })?,
        )
    } else {
        None
    };

    if msg_end < buf.position() || msg_end > buf.len_written() {
        return Err(ProtocolViolation::CorruptMessage { type_id });
    }
    let payload_len = msg_end - buf.position();
    let payload = buf
        .read_bytes(payload_len)
        .ok_or(ProtocolViolation::CorruptMessage { type_id })?
        .to_vec();

    Ok(FramedMessage {
        type_id,
        reliable_id,
        sequence_id,
        payload,
    })
}

/// Decodes every message in a packet, enforcing the length-validation pass:
/// the running offset after the last message must equal the received byte
/// count, or the whole packet is rejected and nothing is dispatched.
///
/// # Errors
///
/// Returns [`ProtocolViolation::LengthMismatch`] or any per-message error
/// from [`decode_message`]; in every error case, no messages are returned.
pub fn decode_packet_body(
    buf: &mut ByteBuffer,
    defs: &DefinitionTable,
    num_messages: u8,
    received_len: usize,
) -> Result<Vec<FramedMessage>, ProtocolViolation> {
    let mut messages = Vec::with_capacity(usize::from(num_messages));
    for _ in 0..num_messages {
        messages.push(decode_message(buf, defs)?);
    }
    if buf.position() != received_len {
        tracing::warn!(
            summed = buf.position(),
            received_len,
            "packet length validation failed, dropping whole packet"
        );
        return Err(ProtocolViolation::LengthMismatch {
            summed: buf.position(),
            received: received_len,
        });
    }
    Ok(messages)
}

/// Builds the core PING/PONG/JOIN_REQUEST/JOIN_ACCEPT/JOIN_DENY/LEAVE
/// definitions at their reserved low type-ids.
pub mod core_messages {
    use super::{control_flags, option_flags, Definition};

    /// `PING` — connectionless, unreliable; payload: optional string.
    pub const PING: u8 = 0;
    /// `PONG` — connectionless, unreliable; no payload.
    pub const PONG: u8 = 1;
    /// `JOIN_REQUEST` — connectionless, reliable.
    pub const JOIN_REQUEST: u8 = 2;
    /// `JOIN_ACCEPT` — reliable.
    pub const JOIN_ACCEPT: u8 = 3;
    /// `JOIN_DENY` — unreliable.
    pub const JOIN_DENY: u8 = 4;
    /// `LEAVE` — unreliable.
    pub const LEAVE: u8 = 5;

    /// `NETOBJECT_CREATE` — reliable; broadcast by the host when a replicated
    /// object is created.
    pub const NETOBJECT_CREATE: u8 = 6;
    /// `NETOBJECT_DESYNC` — reliable; broadcast by the host when a
    /// replicated object is destroyed.
    pub const NETOBJECT_DESYNC: u8 = 7;
    /// `NETOBJECT_SERVER_UPDATE` — unreliable; the host's per-tick
    /// authoritative update stream.
    pub const NETOBJECT_SERVER_UPDATE: u8 = 8;
    /// `NETOBJECT_CLIENT_UPDATE` — unreliable; an owning client's per-tick
    /// input/state stream sent to the host.
    pub const NETOBJECT_CLIENT_UPDATE: u8 = 9;

    /// The lowest type id a game-specific message may use.
    pub const FIRST_FREE_TYPE_ID: u8 = 10;

    /// Registers the ten core definitions into `table`.
    pub fn register_all(table: &mut super::DefinitionTable) {
        table.register(Definition {
            type_id: PING,
            name: "PING",
            control_flags: control_flags::CONNECTIONLESS,
            option_flags: 0,
        });
        table.register(Definition {
            type_id: PONG,
            name: "PONG",
            control_flags: control_flags::CONNECTIONLESS,
            option_flags: 0,
        });
        table.register(Definition {
            type_id: JOIN_REQUEST,
            name: "JOIN_REQUEST",
            control_flags: control_flags::CONNECTIONLESS,
            option_flags: option_flags::RELIABLE,
        });
        table.register(Definition {
            type_id: JOIN_ACCEPT,
            name: "JOIN_ACCEPT",
            control_flags: 0,
            option_flags: option_flags::RELIABLE,
        });
        table.register(Definition {
            type_id: JOIN_DENY,
            name: "JOIN_DENY",
            control_flags: 0,
            option_flags: 0,
        });
        table.register(Definition {
            type_id: LEAVE,
            name: "LEAVE",
            control_flags: 0,
            option_flags: 0,
        });
        table.register(Definition {
            type_id: NETOBJECT_CREATE,
            name: "NETOBJECT_CREATE",
            control_flags: 0,
            option_flags: option_flags::RELIABLE,
        });
        table.register(Definition {
            type_id: NETOBJECT_DESYNC,
            name: "NETOBJECT_DESYNC",
            control_flags: 0,
            option_flags: option_flags::RELIABLE,
        });
        table.register(Definition {
            type_id: NETOBJECT_SERVER_UPDATE,
            name: "NETOBJECT_SERVER_UPDATE",
            control_flags: 0,
            option_flags: 0,
        });
        table.register(Definition {
            type_id: NETOBJECT_CLIENT_UPDATE,
            name: "NETOBJECT_CLIENT_UPDATE",
            control_flags: 0,
            option_flags: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_one_reliable_in_order(type_id: u8) -> DefinitionTable {
        let mut t = DefinitionTable::new();
        t.register(Definition {
            type_id,
            name: "test",
            control_flags: control_flags::IN_ORDER,
            option_flags: option_flags::RELIABLE,
        });
        t
    }

    #[test]
    fn header_round_trip() {
        let header = PacketHeader {
            peer_index: 3,
            ack: 42,
            highest_received_ack: 41,
            prev_received_bitfield: 0b101,
        };
        let mut mem = [0u8; PacketHeader::ENCODED_LEN];
        {
            let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
            assert!(header.encode(&mut buf));
        }
        let mut buf = ByteBuffer::for_reading(&mut mem, PacketHeader::ENCODED_LEN, Endian::Big);
        assert_eq!(PacketHeader::decode(&mut buf), Some(header));
    }

    #[test]
    fn message_round_trip_reliable_in_order() {
        let defs = table_with_one_reliable_in_order(7);
        let def = defs.get(7).unwrap();
        let mut mem = [0u8; 64];
        let written = {
            let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
            assert!(encode_message(&mut buf, def, Some(100), Some(5), b"hello"));
            buf.len_written()
        };
        let mut buf = ByteBuffer::for_reading(&mut mem, written, Endian::Big);
        let msg = decode_message(&mut buf, &defs).unwrap();
        assert_eq!(msg.type_id, 7);
        assert_eq!(msg.reliable_id, Some(100));
        assert_eq!(msg.sequence_id, Some(5));
        assert_eq!(msg.payload, b"hello");
    }

    #[test]
    fn unknown_type_id_is_rejected() {
        let defs = DefinitionTable::new();
        let mut mem = [0u8; 16];
        let written = {
            let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
            let bm = buf.reserve::<u16>().unwrap();
            buf.write(99u8);
            let len = buf.position();
            buf.write_at(bm, len as u16);
            buf.len_written()
        };
        let mut buf = ByteBuffer::for_reading(&mut mem, written, Endian::Big);
        let err = decode_message(&mut buf, &defs).unwrap_err();
        assert_matches::assert_matches!(err, ProtocolViolation::UnknownTypeId { type_id: 99 });
    }

    #[test]
    fn length_mismatch_rejects_whole_packet() {
        let defs = table_with_one_reliable_in_order(7);
        let def = defs.get(7).unwrap();
        let mut mem = [0u8; 64];
        let written = {
            let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
            assert!(encode_message(&mut buf, def, Some(1), Some(1), b"x"));
            buf.len_written()
        };
        // tamper: claim the packet was one byte longer than it really was
        let result = {
            let mut buf = ByteBuffer::for_reading(&mut mem, written, Endian::Big);
            decode_packet_body(&mut buf, &defs, 1, written + 1)
        };
        assert_matches::assert_matches!(result, Err(ProtocolViolation::LengthMismatch { .. }));
    }
}
