//! NetObject replication: a factory-keyed table of replicated
//! objects, create/update/destroy bookkeeping, and the update-number
//! staleness filter that protects server- and client-update streams from
//! out-of-order or duplicate delivery.
//!
//! This generalizes the same "fixed table keyed by an id, consulted on every
//! receive" dispatch-table idiom `Session`'s message-definition table uses —
//! the NetObject protocol table is, in effect, a second dispatch table.
//! Replication never owns the session; `Session` owns this system by
//! composition and mediates every outbound/inbound message itself.

use ahash::AHashMap;

use crate::buffer::ByteBuffer;
use crate::seq::cyclic_ge;

/// Capacity of the per-object-id table.
pub const MAX_NET_OBJECTS: usize = 1000;

/// An opaque handle identifying a replicated object to its owning
/// application. The core never looks inside this value; it exists purely as
/// a key linking a [`NetObject`] back to whatever the gameplay layer's
/// entity representation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(pub u64);

/// Per-replicated-object state.
#[derive(Debug, Clone)]
pub struct NetObject {
    /// Host-allocated id, unique while the object is in use.
    pub per_object_id: u16,
    /// The registered [`NetObjectProtocol`] this object replicates through.
    pub type_id: u8,
    /// Last update number we sent, if we own this object.
    pub last_sent_update_number: u16,
    /// Last update number accepted by the staleness filter.
    pub last_received_update_number: u16,
    /// Game-level player identity owning this object, if any.
    pub owning_player: Option<u32>,
    /// Connection peer-index owning this object, if any.
    pub owning_connection: Option<u8>,
    /// The caller's opaque handle for the underlying game object.
    pub target: TargetId,
}

/// The six operations that replicate one entity type: a small
/// interface rather than an inheritance hierarchy, stored as a trait object
/// keyed by `type_id` the same way [`crate::packet::DefinitionTable`] keys
/// message definitions.
///
/// Every method receives the object's opaque [`TargetId`] so an
/// implementation can look its real game object up in whatever registry the
/// gameplay layer maintains; the core never touches that registry directly.
pub trait NetObjectProtocol {
    /// Serializes the creation payload for `target` into `buf`.
    fn write_create(&mut self, target: TargetId, buf: &mut ByteBuffer) -> bool;
    /// Spawns the local game object for a just-received creation payload and
    /// returns the opaque handle identifying it, so the caller's side of a
    /// Create it did not initiate itself still ends up registered under a
    /// real target.
    fn on_create(&mut self, per_object_id: u16, buf: &mut ByteBuffer) -> TargetId;
    /// Serializes any destroy-time payload for `target` into `buf`.
    fn write_destroy(&mut self, target: TargetId, buf: &mut ByteBuffer) -> bool;
    /// Tears down `target`'s underlying game object.
    fn on_destroy(&mut self, target: TargetId);
    /// Host-authoritative side: serializes the current predicted state.
    fn server_write_update(&mut self, target: TargetId, buf: &mut ByteBuffer) -> bool;
    /// Client side: applies a just-accepted server update.
    fn client_read_update(&mut self, target: TargetId, buf: &mut ByteBuffer) -> bool;
    /// Owning-client side: serializes this tick's input/state.
    fn client_write_update(&mut self, target: TargetId, buf: &mut ByteBuffer) -> bool;
    /// Host side: applies a just-accepted client update.
    fn server_read_update(&mut self, target: TargetId, buf: &mut ByteBuffer) -> bool;
}

/// Errors [`NetObjectSystem`] can report.
#[derive(Debug, thiserror::Error)]
pub enum NetObjectError {
    /// No free `per_object_id` slot remained under [`MAX_NET_OBJECTS`].
    #[error("net object id table is full ({MAX_NET_OBJECTS} in use)")]
    TableFull,
    /// `sync` was called with a `type_id` that has no registered protocol.
    #[error("no protocol registered for net object type_id {type_id}")]
    UnknownProtocol {
        /// The offending type id.
        type_id: u8,
    },
    /// The protocol's `write_create` declined to serialize a payload (ran
    /// out of room in the scratch buffer).
    #[error("protocol for type_id {type_id} failed to write its creation payload")]
    WriteCreateFailed {
        /// The offending type id.
        type_id: u8,
    },
}

/// Scratch buffer size for replication payloads. Generous relative to a
/// typical entity snapshot; a protocol that needs more must fragment itself,
/// which is out of scope.
const SCRATCH_SIZE: usize = 1024;

/// Factory-keyed table of replicated objects.
///
/// `Session` owns one of these and mediates every Create/Desync/Server-Update
/// /Client-Update message itself; this type never touches a socket or a
/// connection table.
#[derive(Default)]
pub struct NetObjectSystem {
    protocols: AHashMap<u8, Box<dyn NetObjectProtocol>>,
    objects: AHashMap<u16, NetObject>,
    by_target: AHashMap<TargetId, u16>,
    next_id_hint: u16,
}

impl NetObjectSystem {
    /// Creates an empty system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the protocol implementing replication for `type_id`.
    pub fn register_protocol(&mut self, type_id: u8, protocol: Box<dyn NetObjectProtocol>) {
        self.protocols.insert(type_id, protocol);
    }

    /// Number of currently registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no objects are currently registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterates every currently registered object.
    pub fn objects(&self) -> impl Iterator<Item = &NetObject> {
        self.objects.values()
    }

    /// Looks up an object by its `per_object_id`.
    #[must_use]
    pub fn get(&self, per_object_id: u16) -> Option<&NetObject> {
        self.objects.get(&per_object_id)
    }

    fn allocate_id(&mut self) -> Option<u16> {
        for _ in 0..MAX_NET_OBJECTS {
            let candidate = self.next_id_hint;
            self.next_id_hint = ((usize::from(candidate) + 1) % MAX_NET_OBJECTS) as u16;
            if !self.objects.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Registers a new replicated object for `target` and, if `is_host`,
    /// returns the creation payload to broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`NetObjectError::TableFull`] if no id is free, or
    /// [`NetObjectError::UnknownProtocol`]/[`NetObjectError::WriteCreateFailed`]
    /// if `type_id` has no usable protocol.
    pub fn sync(
        &mut self,
        target: TargetId,
        type_id: u8,
        owning_player: Option<u32>,
        owning_connection: Option<u8>,
        is_host: bool,
    ) -> Result<(u16, Option<Vec<u8>>), NetObjectError> {
        let per_object_id = self.allocate_id().ok_or(NetObjectError::TableFull)?;

        let create_payload = if is_host {
            let protocol = self
                .protocols
                .get_mut(&type_id)
                .ok_or(NetObjectError::UnknownProtocol { type_id })?;
            let mut mem = vec![0u8; SCRATCH_SIZE];
            let len = {
                let mut buf = ByteBuffer::new(&mut mem, crate::buffer::Endian::Big);
                if !protocol.write_create(target, &mut buf) {
                    return Err(NetObjectError::WriteCreateFailed { type_id });
                }
                buf.len_written()
            };
            mem.truncate(len);
            Some(mem)
        } else {
            None
        };

        self.objects.insert(
            per_object_id,
            NetObject {
                per_object_id,
                type_id,
                last_sent_update_number: 0,
                last_received_update_number: 0,
                owning_player,
                owning_connection,
                target,
            },
        );
        self.by_target.insert(target, per_object_id);

        Ok((per_object_id, create_payload))
    }

    /// Applies an incoming Create message.
    ///
    /// Returns `true` if this was a new registration, `false` if `per_object_id`
    /// was already present (idempotent no-op) or `type_id` has no registered
    /// protocol.
    pub fn on_create(
        &mut self,
        per_object_id: u16,
        type_id: u8,
        owning_player: Option<u32>,
        owning_connection: Option<u8>,
        payload: &[u8],
    ) -> bool {
        if self.objects.contains_key(&per_object_id) {
            return false;
        }
        let Some(protocol) = self.protocols.get_mut(&type_id) else {
            return false;
        };
        let mut mem = payload.to_vec();
        let len = mem.len();
        let target = {
            let mut buf = ByteBuffer::for_reading(&mut mem, len, crate::buffer::Endian::Big);
            protocol.on_create(per_object_id, &mut buf)
        };

        self.objects.insert(
            per_object_id,
            NetObject {
                per_object_id,
                type_id,
                last_sent_update_number: 0,
                last_received_update_number: 0,
                owning_player,
                owning_connection,
                target,
            },
        );
        self.by_target.insert(target, per_object_id);
        true
    }

    /// Stops replicating `target`: invokes
    /// `on_destroy`, removes it from every table, and, if `is_host`, returns
    /// the `per_object_id` to broadcast a Desync for.
    pub fn stop_sync(&mut self, target: TargetId, is_host: bool) -> Option<u16> {
        let per_object_id = self.by_target.remove(&target)?;
        let obj = self.objects.remove(&per_object_id)?;
        if let Some(protocol) = self.protocols.get_mut(&obj.type_id) {
            let mut mem = Vec::new();
            let mut buf = ByteBuffer::new(&mut mem, crate::buffer::Endian::Big);
            let _ = protocol.write_destroy(target, &mut buf);
            protocol.on_destroy(target);
        }
        is_host.then_some(per_object_id)
    }

    /// Applies an incoming Desync message by `per_object_id` (used on a
    /// client, which has no direct `TargetId` lookup path into the message).
    ///
    /// Returns `true` if an object was found and destroyed.
    pub fn on_destroy_by_id(&mut self, per_object_id: u16) -> bool {
        let Some(obj) = self.objects.remove(&per_object_id) else {
            return false;
        };
        self.by_target.remove(&obj.target);
        if let Some(protocol) = self.protocols.get_mut(&obj.type_id) {
            protocol.on_destroy(obj.target);
        }
        true
    }

    /// Builds this tick's Server-Update payload for `per_object_id` (SPEC
    /// §4.6 "Update"): `(update_number, payload)`, where `update_number` is
    /// `last_received_update_number` as-is — the server does not increment
    /// its own counter between authoritative client inputs.
    pub fn build_server_update(&mut self, per_object_id: u16) -> Option<(u16, Vec<u8>)> {
        let obj = self.objects.get(&per_object_id)?;
        let update_number = obj.last_received_update_number;
        let type_id = obj.type_id;
        let target = obj.target;
        let protocol = self.protocols.get_mut(&type_id)?;
        let mut mem = vec![0u8; SCRATCH_SIZE];
        let len = {
            let mut buf = ByteBuffer::new(&mut mem, crate::buffer::Endian::Big);
            if !protocol.server_write_update(target, &mut buf) {
                return None;
            }
            buf.len_written()
        };
        mem.truncate(len);
        Some((update_number, mem))
    }

    /// Builds this tick's Client-Update payload for `per_object_id`,
    /// incrementing `last_sent_update_number`.
    pub fn build_client_update(&mut self, per_object_id: u16) -> Option<(u16, Vec<u8>)> {
        let obj = self.objects.get_mut(&per_object_id)?;
        obj.last_sent_update_number = obj.last_sent_update_number.wrapping_add(1);
        let update_number = obj.last_sent_update_number;
        let type_id = obj.type_id;
        let target = obj.target;
        let protocol = self.protocols.get_mut(&type_id)?;
        let mut mem = vec![0u8; SCRATCH_SIZE];
        let len = {
            let mut buf = ByteBuffer::new(&mut mem, crate::buffer::Endian::Big);
            if !protocol.client_write_update(target, &mut buf) {
                return None;
            }
            buf.len_written()
        };
        mem.truncate(len);
        Some((update_number, mem))
    }

    /// Applies an incoming Server-Update: accepted
    /// iff `update_number >= last_received` (cyclic, non-strict, since
    /// repeated equal-numbered sends are host predictions that must still be
    /// applied).
    ///
    /// Returns `true` if the update was accepted and applied.
    pub fn apply_server_update(&mut self, per_object_id: u16, update_number: u16, payload: &[u8]) -> bool {
        let Some(obj) = self.objects.get_mut(&per_object_id) else {
            return false;
        };
        if !cyclic_ge(update_number, obj.last_received_update_number) {
            return false;
        }
        obj.last_received_update_number = update_number;
        let type_id = obj.type_id;
        let target = obj.target;
        let Some(protocol) = self.protocols.get_mut(&type_id) else {
            return false;
        };
        let mut mem = payload.to_vec();
        let len = mem.len();
        let mut buf = ByteBuffer::for_reading(&mut mem, len, crate::buffer::Endian::Big);
        protocol.client_read_update(target, &mut buf)
    }

    /// Applies an incoming Client-Update: accepted
    /// iff `update_number > last_received` (cyclic, strict).
    ///
    /// Returns `true` if the update was accepted and applied.
    pub fn apply_client_update(&mut self, per_object_id: u16, update_number: u16, payload: &[u8]) -> bool {
        let Some(obj) = self.objects.get_mut(&per_object_id) else {
            return false;
        };
        if !crate::seq::cyclic_gt(update_number, obj.last_received_update_number) {
            return false;
        }
        obj.last_received_update_number = update_number;
        let type_id = obj.type_id;
        let target = obj.target;
        let Some(protocol) = self.protocols.get_mut(&type_id) else {
            return false;
        };
        let mut mem = payload.to_vec();
        let len = mem.len();
        let mut buf = ByteBuffer::for_reading(&mut mem, len, crate::buffer::Endian::Big);
        protocol.server_read_update(target, &mut buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingProtocol {
        created: u32,
        destroyed: u32,
        next_target: u64,
    }

    impl NetObjectProtocol for CountingProtocol {
        fn write_create(&mut self, _target: TargetId, buf: &mut ByteBuffer) -> bool {
            buf.write(7u8)
        }
        fn on_create(&mut self, _per_object_id: u16, _buf: &mut ByteBuffer) -> TargetId {
            self.created += 1;
            self.next_target += 1;
            TargetId(self.next_target)
        }
        fn write_destroy(&mut self, _target: TargetId, _buf: &mut ByteBuffer) -> bool {
            true
        }
        fn on_destroy(&mut self, _target: TargetId) {
            self.destroyed += 1;
        }
        fn server_write_update(&mut self, _target: TargetId, buf: &mut ByteBuffer) -> bool {
            buf.write(1u8)
        }
        fn client_read_update(&mut self, _target: TargetId, _buf: &mut ByteBuffer) -> bool {
            true
        }
        fn client_write_update(&mut self, _target: TargetId, buf: &mut ByteBuffer) -> bool {
            buf.write(2u8)
        }
        fn server_read_update(&mut self, _target: TargetId, _buf: &mut ByteBuffer) -> bool {
            true
        }
    }

    #[test]
    fn create_then_desync_allows_reuse_with_new_object() {
        let mut sys = NetObjectSystem::new();
        sys.register_protocol(1, Box::new(CountingProtocol { created: 0, destroyed: 0, next_target: 0 }));

        let (id, payload) = sys.sync(TargetId(1), 1, None, None, true).unwrap();
        assert!(sys.get(id).is_some());
        assert!(payload.is_some());

        assert!(sys.stop_sync(TargetId(1), true).is_some());
        assert!(sys.get(id).is_none());

        // a duplicate create for the same id after destroy produces a new object
        assert!(sys.on_create(id, 1, None, None, &[7]));
        assert!(sys.get(id).is_some());
    }

    #[test]
    fn duplicate_create_is_idempotent() {
        let mut sys = NetObjectSystem::new();
        sys.register_protocol(1, Box::new(CountingProtocol { created: 0, destroyed: 0, next_target: 0 }));
        assert!(sys.on_create(7, 1, None, None, &[7]));
        assert!(!sys.on_create(7, 1, None, None, &[7]));
        assert_eq!(sys.get(7).unwrap().target, TargetId(1));
    }

    #[test]
    fn server_update_accepts_equal_update_number() {
        // property 8: server stream accepts u_k >= last_received
        let mut sys = NetObjectSystem::new();
        sys.register_protocol(1, Box::new(CountingProtocol { created: 0, destroyed: 0, next_target: 0 }));
        sys.on_create(1, 1, None, None, &[7]);

        assert!(sys.apply_server_update(1, 5, &[1]));
        assert!(sys.apply_server_update(1, 5, &[1]), "equal update number must still apply");
        assert!(!sys.apply_server_update(1, 4, &[1]), "stale update must be rejected");
    }

    #[test]
    fn client_update_requires_strictly_increasing_number() {
        // property 8: client stream accepts only u_k > last_received
        let mut sys = NetObjectSystem::new();
        sys.register_protocol(1, Box::new(CountingProtocol { created: 0, destroyed: 0, next_target: 0 }));
        sys.on_create(1, 1, None, None, &[7]);

        assert!(sys.apply_client_update(1, 1, &[2]));
        assert!(!sys.apply_client_update(1, 1, &[2]), "equal update number must be rejected");
        assert!(sys.apply_client_update(1, 2, &[2]));
    }

    #[test]
    fn table_full_when_every_id_in_use() {
        let mut sys = NetObjectSystem::new();
        sys.register_protocol(1, Box::new(CountingProtocol { created: 0, destroyed: 0, next_target: 0 }));
        for i in 0..MAX_NET_OBJECTS as u16 {
            sys.on_create(i, 1, None, None, &[7]);
        }
        assert_matches::assert_matches!(
            sys.sync(TargetId(9999), 1, None, None, true),
            Err(NetObjectError::TableFull)
        );
    }
}
