use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use serialization::policy::DataPolicyContainer;
use serialization::stream::Serializer;
use transport::addr::Address;
use transport::config::ProtocolConfig;
use transport::end_point::{Client, ClientEvent as TransportEvent};

use crate::message::MessageType;
use crate::object::{ObjectId, ObjectRef, Outbox, MASTER_OBJECT};
use crate::rmi::InvokeArgs;
use crate::system::{encode_invoke_method, process_invoke_method, ObjectRegistry};

#[derive(Debug)]
pub enum ClientSystemEvent {
    Connected,
    ConnectFailed,
    /// The server connection broke; every object it had spawned here has already
    ///  been destroyed through the factory.
    ConnectionBroken,
}

/// Instantiates and destroys the local mirrors of server-spawned objects. The
///  application's world (whatever owns the real entities) implements this.
pub trait ObjectFactory {
    /// Builds a mirror from the creation parameters of a CREATE_OBJECT message.
    fn create_object(&mut self, s: &mut Serializer) -> anyhow::Result<ObjectRef>;

    fn delete_object(&mut self, object: ObjectRef);
}

/// The mirroring endpoint of the object system: one connection to the server,
///  with the master object bound under [`MASTER_OBJECT`] and everything else
///  spawned and despawned at the server's direction.
pub struct DistributedObjectClient {
    client: Client,
    container: DataPolicyContainer,
    registry: ObjectRegistry,
    factory: Box<dyn ObjectFactory>,
    /// Objects the server has spawned here and not yet deleted.
    spawned: FxHashSet<ObjectId>,
    outbox: Outbox,
}

impl DistributedObjectClient {
    pub fn new(master: ObjectRef, factory: Box<dyn ObjectFactory>) -> DistributedObjectClient {
        DistributedObjectClient::with_endpoint(Client::new(ProtocolConfig::default()), master, factory)
    }

    pub fn with_endpoint(
        client: Client,
        master: ObjectRef,
        factory: Box<dyn ObjectFactory>,
    ) -> DistributedObjectClient {
        let mut registry = ObjectRegistry::new();
        registry.bind(MASTER_OBJECT, master);
        DistributedObjectClient {
            client,
            container: DataPolicyContainer::standard(),
            registry,
            factory,
            spawned: FxHashSet::default(),
            outbox: Outbox::new(),
        }
    }

    pub fn connect(&mut self, server: Address) -> anyhow::Result<()> {
        self.client.connect(server)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn object(&self, obj_id: ObjectId) -> Option<ObjectRef> {
        self.registry.translate(obj_id)
    }

    pub fn rtt_millis(&self) -> f32 {
        self.client.rtt_millis()
    }

    pub fn bandwidth(&self) -> f32 {
        self.client.bandwidth()
    }

    pub fn tick(&mut self) -> Vec<ClientSystemEvent> {
        let mut out = Vec::new();
        for event in self.client.tick() {
            match event {
                TransportEvent::Connected => {
                    debug!("connected to {}", self.client.remote_address());
                    out.push(ClientSystemEvent::Connected);
                }
                TransportEvent::ConnectFailed => {
                    out.push(ClientSystemEvent::ConnectFailed);
                }
                TransportEvent::ConnectionBroken => {
                    self.drop_spawned_objects();
                    out.push(ClientSystemEvent::ConnectionBroken);
                }
                TransportEvent::Data(payload) => {
                    if let Err(e) = self.dispatch(&payload) {
                        warn!("dropping malformed message from the server: {:#}", e);
                    }
                    self.flush_outbox();
                }
            }
        }
        out
    }

    /// Invokes a method on the identified object at the server.
    pub fn invoke_remote_method<A: InvokeArgs>(
        &mut self,
        obj_id: ObjectId,
        signature: &str,
        args: A,
        reliable: bool,
    ) {
        if !self.is_connected() {
            trace!("not connected - dropping invocation of {}", signature);
            return;
        }
        let mut args = args;
        match encode_invoke_method(&mut self.container, obj_id, signature, |s| {
            args.serialize_args(s)
        }) {
            Ok(payload) => self.client.send(&payload, reliable),
            Err(e) => warn!("failed to encode invocation of {}: {:#}", signature, e),
        }
    }

    /// Closes the connection. Spawned objects are dropped like on a broken
    ///  connection, but no event is surfaced - the application asked for this.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
        self.drop_spawned_objects();
    }

    pub fn shutdown(&mut self) {
        self.client.shutdown();
        self.drop_spawned_objects();
    }

    fn dispatch(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let Self {
            client,
            container,
            registry,
            factory,
            spawned,
            outbox,
        } = self;
        let mut s = Serializer::reading(container, payload);
        let mut msg_type = 0u8;
        s.value(&mut msg_type)?;

        match MessageType::try_from(msg_type)? {
            MessageType::CreateObject => {
                let mut obj_id: ObjectId = MASTER_OBJECT;
                s.value(&mut obj_id)?;
                let object = factory.create_object(&mut s)?;
                registry.bind(obj_id, object);
                spawned.insert(obj_id);
            }
            MessageType::DeleteObject => {
                let mut obj_id: ObjectId = MASTER_OBJECT;
                s.value(&mut obj_id)?;
                spawned.remove(&obj_id);
                if let Some(object) = registry.translate(obj_id) {
                    factory.delete_object(object);
                }
                registry.unbind(obj_id);
            }
            MessageType::UpdateObject => {} // reserved
            MessageType::InvokeMethod => {
                process_invoke_method(registry, &mut s, Some(client.remote_address()), outbox)?;
            }
        }
        Ok(())
    }

    /// Everything a client queues goes to its single server connection.
    fn flush_outbox(&mut self) {
        let pending = std::mem::take(&mut self.outbox);
        for invoke in pending {
            match encode_invoke_method(
                &mut self.container,
                invoke.obj_id,
                &invoke.signature,
                invoke.write_args,
            ) {
                Ok(payload) => self.client.send(&payload, invoke.reliable),
                Err(e) => warn!("failed to encode relayed invocation of {}: {:#}", invoke.signature, e),
            }
        }
    }

    /// Server-spawned objects do not outlive the connection that spawned them.
    fn drop_spawned_objects(&mut self) {
        for obj_id in std::mem::take(&mut self.spawned) {
            if let Some(object) = self.registry.translate(obj_id) {
                self.factory.delete_object(object);
            }
            self.registry.unbind(obj_id);
        }
    }
}
