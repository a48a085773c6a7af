//! Crate-wide error taxonomy.
//!
//! The core distinguishes four error families, matching the failure modes a
//! session-layer protocol actually has: the peer misbehaved, the socket
//! misbehaved, a local resource ran out, or the caller misused the API.

use std::io;

/// The peer sent something that violates the wire protocol.
///
/// Policy for all variants: drop the offending packet or message silently,
/// record no receipt, and log at [`tracing::Level::WARN`]. None of these are
/// propagated to the caller as a hard error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    /// The packet's declared message lengths did not sum to the number of
    /// bytes actually received.
    #[error("packet length mismatch: summed {summed} bytes, received {received} bytes")]
    LengthMismatch {
        /// Bytes accounted for by message length prefixes.
        summed: usize,
        /// Bytes actually present in the datagram.
        received: usize,
    },

    /// A message declared a `type_id` with no registered [`Definition`].
    ///
    /// [`Definition`]: crate::packet::Definition
    #[error("unknown message type_id {type_id}")]
    UnknownTypeId {
        /// The offending type id.
        type_id: u8,
    },

    /// A reliable id arrived further than `reliable_range_radius` ahead of
    /// `next_expected`.
    #[error("reliable id {id} is out of window (next_expected {next_expected}, radius {radius})")]
    ReliableIdOutOfWindow {
        /// The id that arrived.
        id: u16,
        /// The receiver's current expected id.
        next_expected: u16,
        /// The configured window radius.
        radius: u16,
    },

    /// A message's declared size put its cursor past the end of the packet.
    #[error("message stream corrupted while reading type_id {type_id}")]
    CorruptMessage {
        /// The type id being read when corruption was detected.
        type_id: u8,
    },
}

/// A transport-level I/O error on the bound socket.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// No port in the configured scan range could be bound.
    #[error("could not bind a UDP socket in the configured port range starting at {preferred_port}")]
    BindFailure {
        /// The first port that was attempted.
        preferred_port: u16,
    },

    /// The underlying socket returned an error other than `WouldBlock`.
    #[error("socket error: {0}")]
    SocketError(#[from] io::Error),
}

/// A local resource limit was hit.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    /// The per-connection reliable-message pool has no free slots.
    #[error("reliable message pool exhausted")]
    ReliablePoolExhausted,

    /// A message's payload does not fit in a single packet, ever.
    #[error("message of {len} bytes exceeds the per-message buffer of {max} bytes")]
    MessageTooLarge {
        /// The payload length that was rejected.
        len: usize,
        /// The maximum a single message's payload may occupy.
        max: usize,
    },

    /// The packet being built has no room for one more message.
    #[error("packet is full")]
    PacketFull,
}

/// The connectionless send-direct path was asked
/// to do something it cannot.
#[derive(Debug, thiserror::Error)]
pub enum SendDirectError {
    /// A reliable or in-order message was passed to the path that bypasses
    /// per-connection queues, which have no way to track or retry it.
    #[error("reliable or in-order messages cannot be sent via the connectionless send-direct path")]
    RequiresConnection,

    /// The session has no bound channel yet ([`crate::session::Session::start`]
    /// hasn't been called).
    #[error("session has not been started")]
    NotStarted,

    /// The message has no registered [`Definition`](crate::packet::Definition).
    #[error("unknown message type_id {type_id}")]
    UnknownTypeId {
        /// The offending type id.
        type_id: u8,
    },

    /// The payload didn't fit in a single packet.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// The underlying socket failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The session API was called while the session was in the wrong sub-state.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// `register_message` or `start` was called outside the `Invalid` state.
    #[error("session is not in the Invalid state")]
    NotInvalid,

    /// `host` was called outside the `Disconnected` state.
    #[error("session is not in the Disconnected state")]
    NotDisconnected,

    /// `start` was called on an already-started session.
    #[error("session has already been started")]
    AlreadyStarted,

    /// A configuration value violated one of its own invariants.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_stable_enough_to_match_on() {
        let e = ProtocolViolation::UnknownTypeId { type_id: 200 };
        assert_eq!(e.to_string(), "unknown message type_id 200");
    }
}
