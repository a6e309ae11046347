use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use serialization::policy::DataPolicyContainer;
use serialization::stream::Serializer;
use transport::addr::Address;
use transport::config::ProtocolConfig;
use transport::end_point::{Server, ServerEvent as TransportEvent};

use crate::message::MessageType;
use crate::object::{ObjectId, ObjectRef, Outbox, MASTER_OBJECT};
use crate::rmi::InvokeArgs;
use crate::system::{
    encode_create_object, encode_delete_object, encode_invoke_method, process_invoke_method,
    ObjectRegistry,
};

/// What the server side of the object system reports from `tick()`.
pub enum ServerSystemEvent {
    ConnectionCreated(Address),
    /// The connection is gone; its autonomous objects have already been unbound
    ///  (with the DELETE_OBJECT fan-out to everyone else) and are handed back so
    ///  the application can drop them from its own world.
    ConnectionDeleted {
        conn: Address,
        orphans: Vec<ObjectRef>,
    },
}

impl std::fmt::Debug for ServerSystemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerSystemEvent::ConnectionCreated(conn) => {
                f.debug_tuple("ConnectionCreated").field(conn).finish()
            }
            ServerSystemEvent::ConnectionDeleted { conn, orphans } => f
                .debug_struct("ConnectionDeleted")
                .field("conn", conn)
                .field("orphans", &orphans.iter().map(|o| o.borrow().id()).collect::<Vec<_>>())
                .finish(),
        }
    }
}

#[derive(Default)]
struct ConnectionRecord {
    /// Objects this peer has received CREATE_OBJECT for and no DELETE_OBJECT yet.
    spawned: FxHashSet<ObjectId>,
    /// Objects whose authoritative state lives on this peer; they die with it.
    autonomous: FxHashSet<ObjectId>,
}

/// The authoritative endpoint of the object system.
///
/// Owns the transport server, the object registry and the per-connection
///  bookkeeping. All replication and invocation fan-out flows through here, with
///  the shared `connIDs`/`except` semantics: `except == false` targets exactly the
///  named connections, `except == true` targets everyone else (so an empty set
///  broadcasts).
pub struct DistributedObjectServer {
    server: Server,
    container: DataPolicyContainer,
    registry: ObjectRegistry,
    connections: FxHashMap<Address, ConnectionRecord>,
    next_object_id: ObjectId,
    outbox: Outbox,
}

impl DistributedObjectServer {
    /// A server over a fresh UDP endpoint, with the master object bound under
    ///  [`MASTER_OBJECT`].
    pub fn new(master: ObjectRef) -> DistributedObjectServer {
        DistributedObjectServer::with_endpoint(Server::new(ProtocolConfig::default()), master)
    }

    pub fn with_endpoint(server: Server, master: ObjectRef) -> DistributedObjectServer {
        let mut registry = ObjectRegistry::new();
        registry.bind(MASTER_OBJECT, master);
        DistributedObjectServer {
            server,
            container: DataPolicyContainer::standard(),
            registry,
            connections: FxHashMap::default(),
            next_object_id: MASTER_OBJECT,
            outbox: Outbox::new(),
        }
    }

    pub fn host(&mut self, local: Address) -> anyhow::Result<()> {
        self.server.host(local)
    }

    pub fn local_addr(&self) -> Address {
        self.server.local_addr()
    }

    /// Drives the transport and translates its events: new connections get a
    ///  record, data gets dispatched (and any relays a handler queued are flushed),
    ///  lost connections take their autonomous objects with them.
    pub fn tick(&mut self) -> Vec<ServerSystemEvent> {
        let mut out = Vec::new();
        for event in self.server.tick() {
            match event {
                TransportEvent::ConnectionEstablished(conn) => {
                    debug!("connection {} created", conn);
                    self.connections.insert(conn, ConnectionRecord::default());
                    out.push(ServerSystemEvent::ConnectionCreated(conn));
                }
                TransportEvent::ConnectionClosed(conn) => {
                    self.handle_connection_deleted(conn, &mut out);
                }
                TransportEvent::Data { from, payload } => {
                    if let Err(e) = self.dispatch(from, &payload) {
                        warn!("dropping malformed message from {}: {:#}", from, e);
                    }
                    self.flush_outbox();
                }
            }
        }
        out
    }

    /// Binds an application object under a freshly minted id.
    pub fn bind_object(&mut self, object: ObjectRef) -> ObjectId {
        let obj_id = self.generate_object_id();
        self.registry.bind(obj_id, object);
        obj_id
    }

    /// Removes the binding, telling every peer that knew the object to delete its
    ///  mirror first.
    pub fn unbind_object(&mut self, obj_id: ObjectId) {
        self.delete_remote_object(&[], true, obj_id);
        self.registry.unbind(obj_id);
    }

    pub fn object(&self, obj_id: ObjectId) -> Option<ObjectRef> {
        self.registry.translate(obj_id)
    }

    pub fn bound_object_ids(&self) -> Vec<ObjectId> {
        self.registry.ids()
    }

    /// Spawns the object's mirror at the targeted peers. Idempotent per
    ///  connection: a peer that already has the object is skipped.
    pub fn create_remote_object(&mut self, conns: &[Address], except: bool, obj_id: ObjectId) {
        let Some(object) = self.registry.translate(obj_id) else {
            return;
        };
        let payload = match encode_create_object(&mut self.container, obj_id, &object) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode creation of object {}: {:#}", obj_id, e);
                return;
            }
        };

        for target in self.targets(conns, except) {
            let Some(record) = self.connections.get_mut(&target) else {
                continue;
            };
            if !record.spawned.insert(obj_id) {
                continue; // that peer already has it
            }
            self.server.send(&target, &payload, true);
        }
    }

    /// Deletes the object's mirror at the targeted peers; only peers that
    ///  actually have it are told.
    pub fn delete_remote_object(&mut self, conns: &[Address], except: bool, obj_id: ObjectId) {
        if self.registry.translate(obj_id).is_none() {
            return;
        }
        let payload = match encode_delete_object(&mut self.container, obj_id) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode deletion of object {}: {:#}", obj_id, e);
                return;
            }
        };

        for target in self.targets(conns, except) {
            let Some(record) = self.connections.get_mut(&target) else {
                continue;
            };
            if !record.spawned.remove(&obj_id) {
                continue;
            }
            self.server.send(&target, &payload, true);
        }
    }

    pub fn invoke_remote_method<A: InvokeArgs>(
        &mut self,
        conns: &[Address],
        except: bool,
        obj_id: ObjectId,
        signature: &str,
        args: A,
        reliable: bool,
    ) {
        let targets = self.targets(conns, except);
        if targets.is_empty() {
            return;
        }
        let mut args = args;
        let payload = match encode_invoke_method(&mut self.container, obj_id, signature, |s| {
            args.serialize_args(s)
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode invocation of {}: {:#}", signature, e);
                return;
            }
        };
        for target in targets {
            self.server.send(&target, &payload, reliable);
        }
    }

    /// Marks the object as autonomously controlled by that peer, so it is unbound
    ///  and handed back when the connection goes away.
    pub fn mark_autonomous(&mut self, conn: &Address, obj_id: ObjectId) {
        if let Some(record) = self.connections.get_mut(conn) {
            record.autonomous.insert(obj_id);
        }
    }

    /// The object ids this peer currently knows through CREATE_OBJECT.
    pub fn spawned_objects(&self, conn: &Address) -> Vec<ObjectId> {
        self.connections
            .get(conn)
            .map(|record| record.spawned.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connections(&self) -> Vec<Address> {
        self.connections.keys().copied().collect()
    }

    pub fn rtt_millis(&self, conn: &Address) -> Option<f32> {
        self.server.connection(conn).map(|c| c.rtt_millis())
    }

    pub fn bandwidth(&self, conn: &Address) -> Option<f32> {
        self.server.connection(conn).map(|c| c.bandwidth())
    }

    /// Forcibly drops the connection (the peer just gets a bare RST) and unbinds
    ///  its autonomous objects, which are handed back like on a normal loss.
    pub fn kick(&mut self, conn: &Address) -> Vec<ObjectRef> {
        self.server.kick(conn);
        let mut orphans = Vec::new();
        if let Some(record) = self.connections.remove(conn) {
            for obj_id in record.autonomous {
                if let Some(object) = self.registry.translate(obj_id) {
                    orphans.push(object);
                }
                self.unbind_object(obj_id);
            }
        }
        orphans
    }

    pub fn shutdown(&mut self) {
        self.server.shutdown();
        self.connections.clear();
    }

    fn generate_object_id(&mut self) -> ObjectId {
        self.next_object_id = self.next_object_id.wrapping_add(1);
        if self.next_object_id == MASTER_OBJECT {
            self.next_object_id = self.next_object_id.wrapping_add(1);
        }
        self.next_object_id
    }

    fn targets(&self, conns: &[Address], except: bool) -> Vec<Address> {
        if except {
            self.connections
                .keys()
                .filter(|conn| !conns.contains(*conn))
                .copied()
                .collect()
        } else {
            conns
                .iter()
                .filter(|conn| self.connections.contains_key(*conn))
                .copied()
                .collect()
        }
    }

    fn dispatch(&mut self, from: Address, payload: &[u8]) -> anyhow::Result<()> {
        let Self {
            container,
            registry,
            outbox,
            ..
        } = self;
        let mut s = Serializer::reading(container, payload);
        let mut msg_type = 0u8;
        s.value(&mut msg_type)?;
        match MessageType::try_from(msg_type)? {
            MessageType::InvokeMethod => {
                process_invoke_method(registry, &mut s, Some(from), outbox)?;
            }
            // peers do not manage objects on the server; accepted and ignored
            MessageType::CreateObject | MessageType::DeleteObject | MessageType::UpdateObject => {}
        }
        Ok(())
    }

    /// Sends out the remote invocations handlers queued during dispatch.
    fn flush_outbox(&mut self) {
        let pending = std::mem::take(&mut self.outbox);
        for invoke in pending {
            let targets = self.targets(&invoke.conns, invoke.except);
            if targets.is_empty() {
                continue;
            }
            let payload = match encode_invoke_method(
                &mut self.container,
                invoke.obj_id,
                &invoke.signature,
                invoke.write_args,
            ) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to encode relayed invocation of {}: {:#}", invoke.signature, e);
                    continue;
                }
            };
            for target in targets {
                self.server.send(&target, &payload, invoke.reliable);
            }
        }
    }

    fn handle_connection_deleted(&mut self, conn: Address, out: &mut Vec<ServerSystemEvent>) {
        debug!("connection {} deleted", conn);
        let mut orphans = Vec::new();
        if let Some(record) = self.connections.remove(&conn) {
            for obj_id in record.autonomous {
                if let Some(object) = self.registry.translate(obj_id) {
                    orphans.push(object);
                }
                // the record is already gone, so the fan-out only reaches the others
                self.unbind_object(obj_id);
            }
        }
        out.push(ServerSystemEvent::ConnectionDeleted { conn, orphans });
    }
}
