//! The session layer: connection table, handshake, message dispatch, and
//! the replication tick. `Session` is the only type an embedding game loop
//! drives directly — it owns the bound channel, the definition table, every
//! `Connection`, and the `NetObjectSystem` by composition, and mediates
//! every inbound and outbound message itself.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ahash::AHashMap;
use web_time::Instant;

use crate::buffer::{ByteBuffer, Endian};
use crate::channel::PacketChannel;
use crate::config::SessionConfig;
use crate::connection::{build_connectionless_packet, decode_incoming, Connection, ConnectionState};
use crate::error::{ChannelError, LifecycleError, SendDirectError};
use crate::netobject::{NetObjectError, NetObjectProtocol, NetObjectSystem, TargetId};
use crate::packet::{core_messages as core, Definition, DefinitionTable, FramedMessage, PacketHeader, MAX_PACKET_SIZE};

/// Placeholder peer index for a connection not yet assigned a real one (the
/// client, before its `JoinAccept` arrives).
pub const UNASSIGNED_PEER_INDEX: u8 = 0xFF;

/// Wire protocol version exchanged during the join handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The session's own sub-state-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Before `start`: only `register_message` and `start` are legal.
    Invalid,
    /// Bound but not a member of any game: `host` or `join` are legal.
    Disconnected,
    /// A `JoinRequest` is outstanding.
    Joining,
    /// At least this session is connected.
    Connected,
}

/// Why a host turned down a join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum JoinDenyReason {
    /// The joinee's protocol version didn't match the host's.
    IncompatibleVersion,
    /// The target isn't hosting.
    NotHost,
    /// The host isn't currently accepting joiners.
    NotJoinable,
    /// The host is at its goal capacity.
    GameFull,
    /// Another connection already holds this guid.
    GuidTaken,
}

impl JoinDenyReason {
    fn to_u8(self) -> u8 {
        match self {
            JoinDenyReason::IncompatibleVersion => 0,
            JoinDenyReason::NotHost => 1,
            JoinDenyReason::NotJoinable => 2,
            JoinDenyReason::GameFull => 3,
            JoinDenyReason::GuidTaken => 4,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => JoinDenyReason::IncompatibleVersion,
            1 => JoinDenyReason::NotHost,
            2 => JoinDenyReason::NotJoinable,
            3 => JoinDenyReason::GameFull,
            4 => JoinDenyReason::GuidTaken,
            _ => return None,
        })
    }
}

/// Something the gameplay layer should react to, produced by [`Session::tick`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection (possibly ourselves) joined.
    ConnectionJoined {
        /// The connection's assigned peer index.
        peer_index: u8,
        /// Its guid.
        guid: String,
    },
    /// A connection left, by leave message or timeout.
    ConnectionLeft {
        /// The departed connection's peer index.
        peer_index: u8,
    },
    /// Our own join attempt was refused.
    JoinDenied {
        /// Why.
        reason: JoinDenyReason,
    },
    /// We left or were disconnected, and are back in `Disconnected`.
    Disconnected,
    /// A connectionless ping arrived.
    Ping {
        /// The sender's address.
        from: SocketAddr,
        /// Its optional payload string.
        payload: Option<String>,
    },
    /// A connectionless pong arrived, in reply to a ping we sent.
    Pong {
        /// The sender's address.
        from: SocketAddr,
    },
    /// A game-registered message arrived from a connection.
    Message {
        /// The sender's peer index.
        peer_index: u8,
        /// The message's type id.
        type_id: u8,
        /// Its raw payload.
        payload: Vec<u8>,
    },
    /// A replicated object was created (either ours or a peer's).
    NetObjectCreated {
        /// Its allocated id.
        per_object_id: u16,
    },
    /// A replicated object was destroyed.
    NetObjectDestroyed {
        /// Its id, now free for reuse.
        per_object_id: u16,
    },
}

/// A deterministic xorshift32 generator, seeded once at session construction
/// and used only to advance the join nuonce. Reproducible across runs given
/// the same seed, unlike OS randomness.
struct Nuoncer {
    state: u32,
}

impl Nuoncer {
    fn new(seed: u64) -> Self {
        let folded = (seed ^ (seed >> 32)) as u32;
        Self {
            state: if folded == 0 { 0x9E37_79B9 } else { folded },
        }
    }

    fn next(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }
}

/// Failure modes for [`Session::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The session wasn't in `Invalid`, or its configuration is invalid.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The channel could not be bound.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Failure modes for [`Session::send_message`].
#[derive(Debug, thiserror::Error)]
pub enum SendMessageError {
    /// `type_id` has no registered definition.
    #[error("unknown message type_id {type_id}")]
    UnknownTypeId {
        /// The offending type id.
        type_id: u8,
    },
    /// No connection is registered under `peer_index`.
    #[error("no connection with peer_index {peer_index}")]
    NoSuchConnection {
        /// The requested peer index.
        peer_index: u8,
    },
}

struct PendingJoin {
    host_addr: SocketAddr,
    nuonce: u32,
    started_at: Instant,
    last_sent_at: Instant,
}

fn local_placeholder_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// The session: connection table, dispatch table, replication system, and
/// the bound channel, all owned by composition rather than as free-floating
/// globals.
pub struct Session {
    config: SessionConfig,
    defs: DefinitionTable,
    channel: Option<PacketChannel>,
    state: SessionState,

    connections: AHashMap<u8, Connection>,
    address_index: AHashMap<SocketAddr, u8>,

    my_peer_index: u8,
    my_guid: String,
    host_guid: String,
    host_peer_index: u8,
    is_host: bool,
    listening: bool,
    goal_capacity: usize,

    pending_join: Option<PendingJoin>,
    nuoncer: Nuoncer,

    netobjects: NetObjectSystem,
    events: VecDeque<SessionEvent>,
}

impl Session {
    /// Creates a session in the `Invalid` state. `rng_seed` seeds the join
    /// nuonce generator; callers that need reproducible join traces across
    /// runs should pass a fixed seed.
    #[must_use]
    pub fn new(config: SessionConfig, rng_seed: u64) -> Self {
        let mut defs = DefinitionTable::new();
        core::register_all(&mut defs);
        Self {
            config,
            defs,
            channel: None,
            state: SessionState::Invalid,
            connections: AHashMap::new(),
            address_index: AHashMap::new(),
            my_peer_index: UNASSIGNED_PEER_INDEX,
            my_guid: String::new(),
            host_guid: String::new(),
            host_peer_index: UNASSIGNED_PEER_INDEX,
            is_host: false,
            listening: false,
            goal_capacity: 0,
            pending_join: None,
            nuoncer: Nuoncer::new(rng_seed),
            netobjects: NetObjectSystem::new(),
            events: VecDeque::new(),
        }
    }

    /// Current sub-state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Our own peer index, or [`UNASSIGNED_PEER_INDEX`] before a join completes.
    #[must_use]
    pub fn my_peer_index(&self) -> u8 {
        self.my_peer_index
    }

    /// Whether this session is hosting.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Number of remote connections, excluding ourselves.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.values().filter(|c| c.state != ConnectionState::Local).count()
    }

    /// Registers a game message definition. Legal only in the `Invalid` state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotInvalid`] outside `Invalid`, or
    /// [`LifecycleError::InvalidConfig`] if `type_id` collides with a
    /// reserved core message id.
    pub fn register_message(&mut self, def: Definition) -> Result<(), LifecycleError> {
        if self.state != SessionState::Invalid {
            return Err(LifecycleError::NotInvalid);
        }
        if def.type_id < core::FIRST_FREE_TYPE_ID {
            return Err(LifecycleError::InvalidConfig(
                "type_id collides with a reserved core message id",
            ));
        }
        self.defs.register(def);
        Ok(())
    }

    /// Registers the replication protocol for a NetObject type. Legal only
    /// in the `Invalid` state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotInvalid`] outside `Invalid`.
    pub fn register_netobject_protocol(
        &mut self,
        type_id: u8,
        protocol: Box<dyn NetObjectProtocol>,
    ) -> Result<(), LifecycleError> {
        if self.state != SessionState::Invalid {
            return Err(LifecycleError::NotInvalid);
        }
        self.netobjects.register_protocol(type_id, protocol);
        Ok(())
    }

    /// Validates the configuration and binds the channel, moving to
    /// `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Lifecycle`] if not `Invalid` or the
    /// configuration is invalid, or [`StartError::Channel`] if no port binds.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != SessionState::Invalid {
            return Err(LifecycleError::AlreadyStarted.into());
        }
        self.config.validate()?;
        let channel = PacketChannel::bind(
            self.config.preferred_port,
            self.config.port_scan_range,
            self.config.simulated_loss_pct,
            self.config.simulated_lag_ms,
        )?;
        self.channel = Some(channel);
        self.state = SessionState::Disconnected;
        Ok(())
    }

    /// This session's bound local address, if started.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SocketError`] if the OS lookup fails.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.channel
            .as_ref()
            .map(PacketChannel::local_addr)
            .unwrap_or_else(|| Ok(local_placeholder_addr()))
    }

    /// Starts hosting under `guid`, capped at `goal_capacity` joiners
    /// (further capped by `max_connections`). Registers ourselves as peer
    /// index 0 and moves straight to `Connected`; call [`Session::start_listening`]
    /// separately to begin accepting joiners.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotDisconnected`] outside `Disconnected`.
    pub fn host(&mut self, guid: String, goal_capacity: usize, now: Instant) -> Result<(), LifecycleError> {
        if self.state != SessionState::Disconnected {
            return Err(LifecycleError::NotDisconnected);
        }
        self.is_host = true;
        self.my_guid = guid.clone();
        self.host_guid = guid.clone();
        self.my_peer_index = 0;
        self.host_peer_index = 0;
        self.goal_capacity = goal_capacity.min(self.config.max_connections);

        let mut me = Connection::new(
            local_placeholder_addr(),
            0,
            guid.clone(),
            self.config.reliable_range_radius,
            now,
        );
        me.state = ConnectionState::Local;
        self.connections.insert(0, me);

        self.state = SessionState::Connected;
        tracing::info!(%guid, "hosting");
        self.events.push_back(SessionEvent::ConnectionJoined { peer_index: 0, guid });
        Ok(())
    }

    /// Toggles whether a hosting session accepts new joiners. A no-op if not hosting.
    pub fn start_listening(&mut self) {
        if self.is_host {
            self.listening = true;
        }
    }

    /// Stops accepting new joiners. A no-op if not hosting.
    pub fn stop_listening(&mut self) {
        self.listening = false;
    }

    /// Sends a `JoinRequest` to `host_addr` and moves to `Joining`. The
    /// request is retried every `reliable_retry_after` until accepted,
    /// denied, or `join_timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotDisconnected`] outside `Disconnected`.
    pub fn join(&mut self, guid: String, host_addr: SocketAddr, now: Instant) -> Result<(), LifecycleError> {
        if self.state != SessionState::Disconnected {
            return Err(LifecycleError::NotDisconnected);
        }
        self.is_host = false;
        self.my_guid = guid;
        self.my_peer_index = UNASSIGNED_PEER_INDEX;
        let nuonce = self.nuoncer.next();
        self.pending_join = Some(PendingJoin {
            host_addr,
            nuonce,
            started_at: now,
            last_sent_at: now,
        });
        self.state = SessionState::Joining;

        let packet = build_join_request_packet(&self.defs, &self.my_guid, nuonce);
        if let Some(channel) = self.channel.as_ref() {
            if let Err(e) = channel.send_to(host_addr, &packet) {
                tracing::warn!(error = %e, "failed to send initial join request");
            }
        }
        tracing::info!(%host_addr, "joining");
        Ok(())
    }

    /// Announces our departure to the host (if we're a joined, non-host
    /// session) and tears down locally, moving to `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SocketError`] if the farewell send fails.
    pub fn leave(&mut self, now: Instant) -> Result<(), ChannelError> {
        if !self.is_host {
            let host_peer_index = self.host_peer_index;
            let my_peer_index = self.my_peer_index;
            let my_guid = self.my_guid.clone();
            if let Some(conn) = self.connections.get_mut(&host_peer_index) {
                conn.send_message(core::LEAVE, false, encode_leave(my_peer_index, &my_guid));
                if let Some(packet) = conn.build_packet(&self.defs, &self.config, now) {
                    if let Some(channel) = self.channel.as_ref() {
                        channel.send_to(conn.address, &packet)?;
                    }
                }
            }
        }
        self.connections.clear();
        self.address_index.clear();
        self.pending_join = None;
        self.state = SessionState::Disconnected;
        self.events.push_back(SessionEvent::Disconnected);
        Ok(())
    }

    /// Enqueues a message to `peer_index`'s send queue.
    ///
    /// # Errors
    ///
    /// Returns [`SendMessageError::UnknownTypeId`] if `type_id` isn't
    /// registered, or [`SendMessageError::NoSuchConnection`] if no
    /// connection has that peer index.
    pub fn send_message(&mut self, peer_index: u8, type_id: u8, payload: Vec<u8>) -> Result<(), SendMessageError> {
        let def = self.defs.get(type_id).ok_or(SendMessageError::UnknownTypeId { type_id })?;
        let is_reliable = def.is_reliable();
        let conn = self
            .connections
            .get_mut(&peer_index)
            .ok_or(SendMessageError::NoSuchConnection { peer_index })?;
        conn.send_message(type_id, is_reliable, payload);
        Ok(())
    }

    /// Sends a one-off connectionless message directly to `addr`, bypassing
    /// per-connection queues.
    ///
    /// # Errors
    ///
    /// See [`build_connectionless_packet`] and [`SendDirectError::NotStarted`].
    pub fn send_direct(&mut self, addr: SocketAddr, type_id: u8, payload: &[u8]) -> Result<(), SendDirectError> {
        let packet = build_connectionless_packet(&self.defs, self.my_peer_index, type_id, payload)?;
        let channel = self.channel.as_ref().ok_or(SendDirectError::NotStarted)?;
        channel.send_to(addr, &packet)?;
        Ok(())
    }

    /// Registers a new replicated object and, if hosting, broadcasts its
    /// creation.
    ///
    /// # Errors
    ///
    /// See [`NetObjectError`].
    pub fn net_sync(
        &mut self,
        target: TargetId,
        type_id: u8,
        owning_player: Option<u32>,
        owning_connection: Option<u8>,
    ) -> Result<u16, NetObjectError> {
        let (per_object_id, create_payload) = self
            .netobjects
            .sync(target, type_id, owning_player, owning_connection, self.is_host)?;
        if let Some(payload) = create_payload {
            let wire = encode_netobject_create(per_object_id, type_id, owning_player, owning_connection, &payload);
            self.broadcast(core::NETOBJECT_CREATE, true, &wire);
        }
        tracing::debug!(per_object_id, type_id, "net object synced");
        Ok(per_object_id)
    }

    /// Stops replicating `target`, broadcasting a desync if hosting.
    pub fn net_stop_sync(&mut self, target: TargetId) {
        if let Some(per_object_id) = self.netobjects.stop_sync(target, self.is_host) {
            self.broadcast(core::NETOBJECT_DESYNC, true, &encode_netobject_desync(per_object_id));
            tracing::debug!(per_object_id, "net object desynced");
        }
    }

    /// Drains the channel, advances handshake/liveness/replication
    /// bookkeeping, and flushes one packet per connection. Returns the
    /// events produced this tick.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the channel itself fails.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<SessionEvent>, ChannelError> {
        let _span = tracing::debug_span!("tick", peer_index = self.my_peer_index).entered();
        self.poll_receive(now)?;
        self.poll_join_retry(now);
        self.poll_liveness(now);
        self.tick_netobject_updates();
        self.poll_send(now);
        Ok(self.events.drain(..).collect())
    }

    fn poll_receive(&mut self, now: Instant) -> Result<(), ChannelError> {
        loop {
            let received = {
                let Some(channel) = self.channel.as_mut() else {
                    return Ok(());
                };
                let mut raw = [0u8; MAX_PACKET_SIZE];
                match channel.recv_from(now, &mut raw)? {
                    Some((from, n)) => Some((from, raw, n)),
                    None => None,
                }
            };
            let Some((from, mut raw, n)) = received else {
                break;
            };
            self.handle_packet(from, &mut raw, n, now);
        }
        Ok(())
    }

    fn handle_packet(&mut self, from: SocketAddr, raw: &mut [u8], n: usize, now: Instant) {
        let (header, messages) = match decode_incoming(raw, n, &self.defs) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%from, error = %e, "dropping malformed packet");
                return;
            }
        };

        let mut resolved = self.resolve_connection(header.peer_index, from);
        if let Some(pi) = resolved {
            self.mark_packet_received(pi, &header, now);
        }

        for msg in messages {
            self.dispatch_message(from, resolved, msg, now);
            if resolved.is_none() {
                // A connectionless JoinRequest may have created a connection
                // as a side effect of the dispatch above; re-resolve so this
                // packet's header bookkeeping still lands on it, without
                // double-processing on a future packet.
                resolved = self.resolve_connection(header.peer_index, from);
                if let Some(pi) = resolved {
                    self.mark_packet_received(pi, &header, now);
                }
            }
        }
    }

    fn mark_packet_received(&mut self, peer_index: u8, header: &PacketHeader, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&peer_index) {
            conn.receive_header(header);
            conn.note_receipt(now);
        }
    }

    fn resolve_connection(&self, peer_index: u8, from: SocketAddr) -> Option<u8> {
        if peer_index != UNASSIGNED_PEER_INDEX {
            if let Some(conn) = self.connections.get(&peer_index) {
                if conn.address == from {
                    return Some(peer_index);
                }
            }
        }
        self.address_index.get(&from).copied()
    }

    fn dispatch_message(&mut self, from: SocketAddr, resolved: Option<u8>, msg: FramedMessage, now: Instant) {
        match msg.type_id {
            core::PING => {
                let text = decode_ping(&msg.payload);
                self.handle_ping(from, text);
            }
            core::PONG => self.handle_pong(from),
            core::JOIN_REQUEST => self.handle_join_request(from, msg.payload, now),
            core::JOIN_ACCEPT => self.handle_join_accept(from, msg.payload, now),
            core::JOIN_DENY => self.handle_join_deny(msg.payload),
            core::LEAVE => self.handle_leave(resolved, msg.payload),
            core::NETOBJECT_CREATE | core::NETOBJECT_DESYNC | core::NETOBJECT_SERVER_UPDATE | core::NETOBJECT_CLIENT_UPDATE => {
                self.dispatch_connection_scoped(resolved, msg, true);
            }
            _ => self.dispatch_connection_scoped(resolved, msg, false),
        }
    }

    fn dispatch_connection_scoped(&mut self, resolved: Option<u8>, msg: FramedMessage, is_netobject: bool) {
        let Some(pi) = resolved else {
            tracing::warn!(type_id = msg.type_id, "dropping message with no resolved connection");
            return;
        };
        let is_in_order = self.defs.get(msg.type_id).map(Definition::is_in_order).unwrap_or(false);
        let type_id = msg.type_id;

        let outcome = match self.connections.get_mut(&pi) {
            Some(conn) => conn.receive_message(msg, is_in_order),
            None => return,
        };

        match outcome {
            Ok(ready) => {
                for d in ready {
                    if is_netobject {
                        self.handle_netobject_message(pi, d.type_id, d.payload);
                    } else {
                        self.events.push_back(SessionEvent::Message {
                            peer_index: pi,
                            type_id,
                            payload: d.payload,
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer_index = pi, error = %e, "protocol violation, dropping connection");
                self.disconnect_connection(pi);
            }
        }
    }

    fn handle_ping(&mut self, from: SocketAddr, payload: Option<String>) {
        self.events.push_back(SessionEvent::Ping {
            from,
            payload: payload.clone(),
        });
        if let Err(e) = self.send_direct(from, core::PONG, &[]) {
            tracing::warn!(%from, error = %e, "failed to send pong");
        }
    }

    fn handle_pong(&mut self, from: SocketAddr) {
        self.events.push_back(SessionEvent::Pong { from });
    }

    fn handle_join_request(&mut self, from: SocketAddr, payload: Vec<u8>, now: Instant) {
        let Some((guid, version, nuonce)) = decode_join_request(&payload) else {
            tracing::warn!(%from, "malformed join request");
            return;
        };
        if !self.is_host {
            self.deny_join(from, nuonce, JoinDenyReason::NotHost);
            return;
        }
        if !self.listening {
            self.deny_join(from, nuonce, JoinDenyReason::NotJoinable);
            return;
        }
        if version != PROTOCOL_VERSION {
            self.deny_join(from, nuonce, JoinDenyReason::IncompatibleVersion);
            return;
        }
        if self.connections.values().any(|c| c.guid == guid) {
            self.deny_join(from, nuonce, JoinDenyReason::GuidTaken);
            return;
        }
        if self.connections.len() >= self.goal_capacity {
            self.deny_join(from, nuonce, JoinDenyReason::GameFull);
            return;
        }
        let Some(peer_index) = self.allocate_peer_index() else {
            self.deny_join(from, nuonce, JoinDenyReason::GameFull);
            return;
        };

        let mut conn = Connection::new(from, peer_index, guid.clone(), self.config.reliable_range_radius, now);
        conn.send_message(
            core::JOIN_ACCEPT,
            true,
            encode_join_accept(&self.host_guid, self.my_peer_index, peer_index),
        );
        self.connections.insert(peer_index, conn);
        self.address_index.insert(from, peer_index);
        tracing::info!(peer_index, %guid, "connection accepted");
        self.events.push_back(SessionEvent::ConnectionJoined { peer_index, guid });
    }

    fn deny_join(&mut self, from: SocketAddr, nuonce: u32, reason: JoinDenyReason) {
        tracing::info!(%from, ?reason, "join denied");
        if let Err(e) = self.send_direct(from, core::JOIN_DENY, &encode_join_deny(nuonce, reason)) {
            tracing::warn!(%from, error = %e, "failed to send join deny");
        }
    }

    fn handle_join_accept(&mut self, from: SocketAddr, payload: Vec<u8>, now: Instant) {
        if self.state != SessionState::Joining {
            return;
        }
        let Some(pending) = self.pending_join.as_ref() else {
            return;
        };
        if from != pending.host_addr {
            return;
        }
        let Some((host_guid, host_peer_index, assigned_peer_index)) = decode_join_accept(&payload) else {
            tracing::warn!(%from, "malformed join accept");
            return;
        };

        self.pending_join = None;
        self.my_peer_index = assigned_peer_index;
        self.host_peer_index = host_peer_index;

        let mut host_conn = Connection::new(from, host_peer_index, host_guid.clone(), self.config.reliable_range_radius, now);
        host_conn.note_receipt(now);
        self.connections.insert(host_peer_index, host_conn);
        self.address_index.insert(from, host_peer_index);

        let mut me = Connection::new(
            local_placeholder_addr(),
            assigned_peer_index,
            self.my_guid.clone(),
            self.config.reliable_range_radius,
            now,
        );
        me.state = ConnectionState::Local;
        self.connections.insert(assigned_peer_index, me);

        self.state = SessionState::Connected;
        tracing::info!(peer_index = assigned_peer_index, "joined host");
        self.events.push_back(SessionEvent::ConnectionJoined {
            peer_index: host_peer_index,
            guid: host_guid,
        });
        self.events.push_back(SessionEvent::ConnectionJoined {
            peer_index: assigned_peer_index,
            guid: self.my_guid.clone(),
        });
    }

    fn handle_join_deny(&mut self, payload: Vec<u8>) {
        let Some((nuonce, reason)) = decode_join_deny(&payload) else {
            return;
        };
        let Some(pending) = self.pending_join.as_ref() else {
            return;
        };
        if pending.nuonce != nuonce {
            tracing::trace!("ignoring join deny for a stale attempt");
            return;
        }
        self.pending_join = None;
        self.state = SessionState::Disconnected;
        tracing::info!(?reason, "join denied");
        self.events.push_back(SessionEvent::JoinDenied { reason });
    }

    fn handle_leave(&mut self, resolved: Option<u8>, payload: Vec<u8>) {
        let Some(pi) = resolved else {
            return;
        };
        let guid = decode_leave(&payload).map(|(_, g)| g);
        if self.connections.remove(&pi).is_some() {
            self.address_index.retain(|_, v| *v != pi);
            tracing::info!(peer_index = pi, ?guid, "peer left");
            self.events.push_back(SessionEvent::ConnectionLeft { peer_index: pi });
        }
    }

    fn handle_netobject_message(&mut self, from_peer: u8, type_id: u8, payload: Vec<u8>) {
        match type_id {
            core::NETOBJECT_CREATE => {
                let Some((per_object_id, obj_type_id, owning_player, owning_connection, create_payload)) =
                    decode_netobject_create(&payload)
                else {
                    tracing::warn!("malformed net object create");
                    return;
                };
                if self
                    .netobjects
                    .on_create(per_object_id, obj_type_id, owning_player, owning_connection, &create_payload)
                {
                    self.events.push_back(SessionEvent::NetObjectCreated { per_object_id });
                }
            }
            core::NETOBJECT_DESYNC => {
                let Some(per_object_id) = decode_netobject_desync(&payload) else {
                    return;
                };
                if self.netobjects.on_destroy_by_id(per_object_id) {
                    self.events.push_back(SessionEvent::NetObjectDestroyed { per_object_id });
                }
            }
            core::NETOBJECT_SERVER_UPDATE => {
                let Some((per_object_id, update_number, update_payload)) = decode_netobject_update(&payload) else {
                    return;
                };
                self.netobjects.apply_server_update(per_object_id, update_number, &update_payload);
            }
            core::NETOBJECT_CLIENT_UPDATE => {
                if from_peer == self.my_peer_index {
                    // A non-dedicated host must never double-apply its own
                    // client update.
                    return;
                }
                let Some((per_object_id, update_number, update_payload)) = decode_netobject_update(&payload) else {
                    return;
                };
                self.netobjects.apply_client_update(per_object_id, update_number, &update_payload);
            }
            _ => unreachable!("dispatch_message only routes net object type ids here"),
        }
    }

    fn disconnect_connection(&mut self, peer_index: u8) {
        if self.connections.remove(&peer_index).is_some() {
            self.address_index.retain(|_, v| *v != peer_index);
            tracing::info!(peer_index, "connection dropped");
            self.events.push_back(SessionEvent::ConnectionLeft { peer_index });
        }
    }

    fn allocate_peer_index(&self) -> Option<u8> {
        (0..self.config.max_connections as u8).find(|c| !self.connections.contains_key(c))
    }

    fn poll_join_retry(&mut self, now: Instant) {
        if self.state != SessionState::Joining {
            return;
        }
        let Some(pending) = self.pending_join.as_ref() else {
            return;
        };
        let host_addr = pending.host_addr;
        let nuonce = pending.nuonce;
        let started_at = pending.started_at;
        let last_sent_at = pending.last_sent_at;

        if now.duration_since(started_at) > self.config.join_timeout {
            tracing::info!("join attempt timed out");
            self.pending_join = None;
            self.state = SessionState::Disconnected;
            self.events.push_back(SessionEvent::Disconnected);
            return;
        }

        if now.duration_since(last_sent_at) >= self.config.reliable_retry_after {
            let packet = build_join_request_packet(&self.defs, &self.my_guid, nuonce);
            if let Some(channel) = self.channel.as_ref() {
                if let Err(e) = channel.send_to(host_addr, &packet) {
                    tracing::warn!(error = %e, "failed to resend join request");
                }
            }
            if let Some(p) = self.pending_join.as_mut() {
                p.last_sent_at = now;
            }
        }
    }

    fn poll_liveness(&mut self, now: Instant) {
        let config = self.config.clone();
        let dead: Vec<u8> = self
            .connections
            .iter_mut()
            .filter_map(|(&pi, conn)| conn.tick_liveness(now, &config).then_some(pi))
            .collect();
        for pi in dead {
            self.disconnect_connection(pi);
        }
    }

    fn tick_netobject_updates(&mut self) {
        let snapshot: Vec<(u16, Option<u8>)> = self
            .netobjects
            .objects()
            .map(|o| (o.per_object_id, o.owning_connection))
            .collect();

        for (per_object_id, owning_connection) in snapshot {
            if self.is_host {
                if let Some((update_number, payload)) = self.netobjects.build_server_update(per_object_id) {
                    let wire = encode_netobject_update(per_object_id, update_number, &payload);
                    self.broadcast(core::NETOBJECT_SERVER_UPDATE, false, &wire);
                }
            }

            if owning_connection == Some(self.my_peer_index) {
                if let Some((update_number, payload)) = self.netobjects.build_client_update(per_object_id) {
                    let wire = encode_netobject_update(per_object_id, update_number, &payload);
                    if self.is_host {
                        self.broadcast(core::NETOBJECT_CLIENT_UPDATE, false, &wire);
                    } else if let Some(conn) = self.connections.get_mut(&self.host_peer_index) {
                        conn.send_message(core::NETOBJECT_CLIENT_UPDATE, false, wire);
                    }
                }
            }
        }
    }

    fn broadcast(&mut self, type_id: u8, is_reliable: bool, payload: &[u8]) {
        for conn in self.connections.values_mut() {
            if conn.state != ConnectionState::Local {
                conn.send_message(type_id, is_reliable, payload.to_vec());
            }
        }
    }

    fn poll_send(&mut self, now: Instant) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        for conn in self.connections.values_mut() {
            if conn.state == ConnectionState::Local {
                continue;
            }
            if let Some(packet) = conn.build_packet(&self.defs, &self.config, now) {
                if let Err(e) = channel.send_to(conn.address, &packet) {
                    tracing::warn!(peer_index = conn.peer_index, error = %e, "send failed");
                }
            }
        }
    }
}

fn build_join_request_packet(defs: &DefinitionTable, guid: &str, nuonce: u32) -> Vec<u8> {
    let payload = encode_join_request(guid, PROTOCOL_VERSION, nuonce);
    let mut mem = vec![0u8; MAX_PACKET_SIZE];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        let header = PacketHeader {
            peer_index: UNASSIGNED_PEER_INDEX,
            ack: 0xFFFF,
            highest_received_ack: 0,
            prev_received_bitfield: 0,
        };
        header.encode(&mut buf);
        let count_bookmark = buf.reserve::<u8>().expect("fresh buffer has room for the count byte");
        let def = defs.get(core::JOIN_REQUEST).expect("core messages are always registered");
        crate::packet::encode_message(&mut buf, def, Some(0), None, &payload);
        buf.write_at(count_bookmark, 1u8);
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn encode_join_request(guid: &str, version: u32, nuonce: u32) -> Vec<u8> {
    let mut mem = vec![0u8; guid.len() + 16];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        buf.write_string(Some(guid));
        buf.write(version);
        buf.write(nuonce);
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn decode_join_request(payload: &[u8]) -> Option<(String, u32, u32)> {
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    let guid = buf.read_string()?.ok()?.to_string();
    let version: u32 = buf.read()?;
    let nuonce: u32 = buf.read()?;
    Some((guid, version, nuonce))
}

fn encode_join_accept(host_guid: &str, host_peer_index: u8, assigned_peer_index: u8) -> Vec<u8> {
    let mut mem = vec![0u8; host_guid.len() + 8];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        buf.write_string(Some(host_guid));
        buf.write(host_peer_index);
        buf.write(assigned_peer_index);
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn decode_join_accept(payload: &[u8]) -> Option<(String, u8, u8)> {
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    let host_guid = buf.read_string()?.ok()?.to_string();
    let host_peer_index: u8 = buf.read()?;
    let assigned_peer_index: u8 = buf.read()?;
    Some((host_guid, host_peer_index, assigned_peer_index))
}

fn encode_join_deny(nuonce: u32, reason: JoinDenyReason) -> Vec<u8> {
    let mut mem = vec![0u8; 8];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        buf.write(nuonce);
        buf.write(reason.to_u8());
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn decode_join_deny(payload: &[u8]) -> Option<(u32, JoinDenyReason)> {
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    let nuonce: u32 = buf.read()?;
    let reason_byte: u8 = buf.read()?;
    Some((nuonce, JoinDenyReason::from_u8(reason_byte)?))
}

fn encode_leave(peer_index: u8, guid: &str) -> Vec<u8> {
    let mut mem = vec![0u8; guid.len() + 8];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        buf.write(peer_index);
        buf.write_string(Some(guid));
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn decode_leave(payload: &[u8]) -> Option<(u8, String)> {
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    let peer_index: u8 = buf.read()?;
    let guid = buf.read_string()?.ok()?.to_string();
    Some((peer_index, guid))
}

fn encode_ping(payload: Option<&str>) -> Vec<u8> {
    let cap = payload.map(str::len).unwrap_or(0) + 2;
    let mut mem = vec![0u8; cap];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        buf.write_string(payload);
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn decode_ping(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    buf.read_string().and_then(Result::ok).map(str::to_string)
}

fn encode_netobject_create(
    per_object_id: u16,
    type_id: u8,
    owning_player: Option<u32>,
    owning_connection: Option<u8>,
    payload: &[u8],
) -> Vec<u8> {
    let mut mem = vec![0u8; payload.len() + 16];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        buf.write(per_object_id);
        buf.write(type_id);
        match owning_player {
            Some(p) => {
                buf.write(1u8);
                buf.write(p);
            }
            None => {
                buf.write(0u8);
            }
        }
        buf.write(owning_connection.unwrap_or(UNASSIGNED_PEER_INDEX));
        buf.write_forward(payload);
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn decode_netobject_create(payload: &[u8]) -> Option<(u16, u8, Option<u32>, Option<u8>, Vec<u8>)> {
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    let per_object_id: u16 = buf.read()?;
    let type_id: u8 = buf.read()?;
    let has_owning_player: u8 = buf.read()?;
    let owning_player = if has_owning_player != 0 { Some(buf.read::<u32>()?) } else { None };
    let owning_connection_raw: u8 = buf.read()?;
    let owning_connection = (owning_connection_raw != UNASSIGNED_PEER_INDEX).then_some(owning_connection_raw);
    let rest_len = buf.remaining_read();
    let create_payload = buf.read_bytes(rest_len)?.to_vec();
    Some((per_object_id, type_id, owning_player, owning_connection, create_payload))
}

fn encode_netobject_desync(per_object_id: u16) -> Vec<u8> {
    let mut mem = vec![0u8; 2];
    let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
    buf.write(per_object_id);
    mem
}

fn decode_netobject_desync(payload: &[u8]) -> Option<u16> {
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    buf.read()
}

fn encode_netobject_update(per_object_id: u16, update_number: u16, payload: &[u8]) -> Vec<u8> {
    let mut mem = vec![0u8; payload.len() + 4];
    let len = {
        let mut buf = ByteBuffer::new(&mut mem, Endian::Big);
        buf.write(per_object_id);
        buf.write(update_number);
        buf.write_forward(payload);
        buf.len_written()
    };
    mem.truncate(len);
    mem
}

fn decode_netobject_update(payload: &[u8]) -> Option<(u16, u16, Vec<u8>)> {
    let mut mem = payload.to_vec();
    let len = mem.len();
    let mut buf = ByteBuffer::for_reading(&mut mem, len, Endian::Big);
    let per_object_id: u16 = buf.read()?;
    let update_number: u16 = buf.read()?;
    let rest_len = buf.remaining_read();
    let rest = buf.read_bytes(rest_len)?.to_vec();
    Some((per_object_id, update_number, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ping_round_trip_produces_no_connections() {
        let mut a = Session::new(SessionConfig::default(), 1);
        let mut b = Session::new(SessionConfig::default(), 2);
        a.start().unwrap();
        b.start().unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_direct(b_addr, core::PING, &encode_ping(Some("hello"))).unwrap();

        let mut b_got_ping = false;
        let mut a_got_pong = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(5));
            let now = Instant::now();
            for ev in b.tick(now).unwrap() {
                if let SessionEvent::Ping { payload, .. } = ev {
                    assert_eq!(payload.as_deref(), Some("hello"));
                    b_got_ping = true;
                }
            }
            for ev in a.tick(now).unwrap() {
                if let SessionEvent::Pong { .. } = ev {
                    a_got_pong = true;
                }
            }
            if b_got_ping && a_got_pong {
                break;
            }
        }
        assert!(b_got_ping, "B should have observed the ping");
        assert!(a_got_pong, "A should have observed the pong");
        assert!(b.connections.is_empty());
        assert!(a.connections.is_empty());
    }

    #[test]
    fn join_accept_then_leave() {
        let mut host = Session::new(SessionConfig::default(), 10);
        let mut client = Session::new(SessionConfig::default(), 20);
        host.start().unwrap();
        client.start().unwrap();

        let now = Instant::now();
        host.host("h".to_string(), 2, now).unwrap();
        host.start_listening();
        let host_addr = host.local_addr().unwrap();
        client.join("b".to_string(), host_addr, now).unwrap();

        let mut client_connected = false;
        for _ in 0..100 {
            std::thread::sleep(Duration::from_millis(5));
            let t = Instant::now();
            host.tick(t).unwrap();
            client.tick(t).unwrap();
            if client.state() == SessionState::Connected {
                client_connected = true;
                break;
            }
        }
        assert!(client_connected, "client should have joined");
        assert_eq!(client.my_peer_index(), 1);
        assert_eq!(host.connections.len(), 2);

        let t = Instant::now();
        client.leave(t).unwrap();
        assert_eq!(client.state(), SessionState::Disconnected);

        let mut host_saw_leave = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(5));
            let t = Instant::now();
            for ev in host.tick(t).unwrap() {
                if matches!(ev, SessionEvent::ConnectionLeft { .. }) {
                    host_saw_leave = true;
                }
            }
            if host_saw_leave {
                break;
            }
        }
        assert!(host_saw_leave, "host should have observed the leave");
        assert_eq!(host.connections.len(), 1);
    }

    #[test]
    fn join_denied_when_guid_already_taken() {
        let mut host = Session::new(SessionConfig::default(), 30);
        let mut first = Session::new(SessionConfig::default(), 31);
        let mut second = Session::new(SessionConfig::default(), 32);
        host.start().unwrap();
        first.start().unwrap();
        second.start().unwrap();

        let now = Instant::now();
        host.host("h".to_string(), 4, now).unwrap();
        host.start_listening();
        let host_addr = host.local_addr().unwrap();
        first.join("dup".to_string(), host_addr, now).unwrap();

        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(5));
            let t = Instant::now();
            host.tick(t).unwrap();
            first.tick(t).unwrap();
            if first.state() == SessionState::Connected {
                break;
            }
        }
        assert_eq!(first.state(), SessionState::Connected);

        second.join("dup".to_string(), host_addr, now).unwrap();
        let mut denied = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(5));
            let t = Instant::now();
            host.tick(t).unwrap();
            for ev in second.tick(t).unwrap() {
                if let SessionEvent::JoinDenied { reason } = ev {
                    assert_eq!(reason, JoinDenyReason::GuidTaken);
                    denied = true;
                }
            }
            if denied {
                break;
            }
        }
        assert!(denied, "second join with a duplicate guid should be denied");
    }

    #[test]
    fn netobject_create_and_update_replicate_to_joined_client() {
        use crate::netobject::NetObjectProtocol;

        struct Echo;
        impl NetObjectProtocol for Echo {
            fn write_create(&mut self, _target: TargetId, buf: &mut ByteBuffer) -> bool {
                buf.write(1u8)
            }
            fn on_create(&mut self, _per_object_id: u16, _buf: &mut ByteBuffer) -> TargetId {
                TargetId(42)
            }
            fn write_destroy(&mut self, _target: TargetId, _buf: &mut ByteBuffer) -> bool {
                true
            }
            fn on_destroy(&mut self, _target: TargetId) {}
            fn server_write_update(&mut self, _target: TargetId, buf: &mut ByteBuffer) -> bool {
                buf.write(7u8)
            }
            fn client_read_update(&mut self, _target: TargetId, _buf: &mut ByteBuffer) -> bool {
                true
            }
            fn client_write_update(&mut self, _target: TargetId, buf: &mut ByteBuffer) -> bool {
                buf.write(9u8)
            }
            fn server_read_update(&mut self, _target: TargetId, _buf: &mut ByteBuffer) -> bool {
                true
            }
        }

        let mut host = Session::new(SessionConfig::default(), 40);
        let mut client = Session::new(SessionConfig::default(), 41);
        host.register_netobject_protocol(10, Box::new(Echo)).unwrap();
        client.register_netobject_protocol(10, Box::new(Echo)).unwrap();
        host.start().unwrap();
        client.start().unwrap();

        let now = Instant::now();
        host.host("h".to_string(), 2, now).unwrap();
        host.start_listening();
        let host_addr = host.local_addr().unwrap();
        client.join("c".to_string(), host_addr, now).unwrap();

        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(5));
            let t = Instant::now();
            host.tick(t).unwrap();
            client.tick(t).unwrap();
            if client.state() == SessionState::Connected {
                break;
            }
        }
        assert_eq!(client.state(), SessionState::Connected);

        host.net_sync(TargetId(1), 10, None, None).unwrap();

        let mut client_created = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(5));
            let t = Instant::now();
            for ev in client.tick(t).unwrap() {
                if matches!(ev, SessionEvent::NetObjectCreated { .. }) {
                    client_created = true;
                }
            }
            host.tick(t).unwrap();
            if client_created {
                break;
            }
        }
        assert!(client_created, "client should have created the replicated object");
    }
}
