//! A session-layer networking core for UDP-based client-server multiplayer:
//! packet framing, reliable/unreliable/in-order message delivery, connection
//! lifecycle and handshake, ack windows, simulated lag/loss for test
//! harnesses, and replicated `NetObject`s.
//!
//! [`Session`](session::Session) is the entry point: it owns a
//! [`PacketChannel`](channel::PacketChannel), a table of registered message
//! definitions, the set of live [`Connection`](connection::Connection)s, and
//! a [`NetObjectSystem`](netobject::NetObjectSystem). Everything below it is
//! pure logic with no I/O of its own, so the window, channel, and packet
//! types can be exercised directly in tests without a socket.

pub mod ack;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod inorder;
pub mod netobject;
pub mod packet;
pub mod reliable;
pub mod seq;
pub mod session;

pub use config::SessionConfig;
pub use error::{ChannelError, LifecycleError, ProtocolViolation};
pub use netobject::{NetObjectProtocol, TargetId};
pub use session::{Session, SessionEvent, SessionState};
