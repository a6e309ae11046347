//! The demo world used by the integration tests and the example: entities with a
//!  position and heading, mirrored from a server to its clients, with one
//!  autonomous entity per connection.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::OnceLock;

use serialization::shared_str::SharedStr;
use serialization::stream::{Serialize, Serializer};
use transport::addr::Address;

use crate::client::ObjectFactory;
use crate::object::{DistributedObject, InvokeContext, ObjectId, ObjectRef, MASTER_OBJECT};
use crate::rmi::{read_args, MethodRegistry};
use crate::server::DistributedObjectServer;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Vec3 {
        Vec3 { x, y, z }
    }
}

impl Serialize for Vec3 {
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
        s.value(&mut self.x)?;
        s.value(&mut self.y)?;
        s.value(&mut self.z)?;
        Ok(())
    }
}

/// A world object with position and heading. Server-side entities relay physics
///  updates onward to every peer except the one that reported them.
pub struct Entity {
    id: ObjectId,
    pos: Vec3,
    yaw: f64,
    autonomous: bool,
    relay: bool,
}

impl Entity {
    pub fn new(relay: bool, pos: Vec3, yaw: f64) -> Entity {
        Entity {
            id: MASTER_OBJECT,
            pos,
            yaw,
            autonomous: false,
            relay,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.pos
    }

    pub fn rotation(&self) -> f64 {
        self.yaw
    }

    pub fn is_autonomous(&self) -> bool {
        self.autonomous
    }

    pub fn set_physics(&mut self, pos: Vec3, yaw: f64) {
        self.pos = pos;
        self.yaw = yaw;
    }

    fn registry() -> &'static MethodRegistry<Entity> {
        static REGISTRY: OnceLock<MethodRegistry<Entity>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let mut registry: MethodRegistry<Entity> = MethodRegistry::new();
            registry.register("Entity::UpdatePhysics", |entity, s, ctx| {
                let (pos, yaw, timestamp) = read_args::<(Vec3, f64, u64)>(s)?;
                entity.update_physics(ctx, pos, yaw, timestamp)
            });
            registry.register("Entity::SetAutonomous", |entity, s, ctx| {
                let (autonomous,) = read_args::<(bool,)>(s)?;
                entity.set_autonomous(ctx, autonomous)
            });
            registry
        })
    }

    pub fn update_physics(
        &mut self,
        ctx: &mut InvokeContext,
        pos: Vec3,
        yaw: f64,
        _timestamp: u64,
    ) -> anyhow::Result<()> {
        self.pos = pos;
        self.yaw = yaw;
        if self.relay {
            ctx.invoke_remote_except_origin(self.id, "Entity::UpdatePhysics", (pos, yaw, 0u64), false);
        }
        Ok(())
    }

    pub fn set_autonomous(
        &mut self,
        _ctx: &mut InvokeContext,
        autonomous: bool,
    ) -> anyhow::Result<()> {
        self.autonomous = autonomous;
        Ok(())
    }
}

impl DistributedObject for Entity {
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()> {
        self.pos.serialize(s)?;
        s.value(&mut self.yaw)?;
        Ok(())
    }

    fn invoke(
        &mut self,
        signature: &str,
        s: &mut Serializer,
        ctx: &mut InvokeContext,
    ) -> anyhow::Result<bool> {
        Entity::registry().dispatch(self, signature, s, ctx)
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn id(&self) -> ObjectId {
        self.id
    }
}

/// The endpoint object bound under id 0 on both sides; its methods are the
///  top-level control channel.
#[derive(Default)]
pub struct MasterObject {
    id: ObjectId,
    pub keep_alives: u32,
    pub logins: Vec<SharedStr>,
}

impl MasterObject {
    fn registry() -> &'static MethodRegistry<MasterObject> {
        static REGISTRY: OnceLock<MethodRegistry<MasterObject>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let mut registry: MethodRegistry<MasterObject> = MethodRegistry::new();
            registry.register("MasterObject::KeepAlive", |master, _s, _ctx| {
                master.keep_alives += 1;
                Ok(())
            });
            registry.register("MasterObject::ClientRequestLogin", |master, s, _ctx| {
                let (credential,) = read_args::<(SharedStr,)>(s)?;
                master.logins.push(credential);
                Ok(())
            });
            registry.register("MasterObject::ServerSetupDone", |_master, _s, _ctx| Ok(()));
            registry
        })
    }
}

impl DistributedObject for MasterObject {
    fn serialize(&mut self, _s: &mut Serializer) -> anyhow::Result<()> {
        Ok(()) // always present on both sides, no creation parameters
    }

    fn invoke(
        &mut self,
        signature: &str,
        s: &mut Serializer,
        ctx: &mut InvokeContext,
    ) -> anyhow::Result<bool> {
        MasterObject::registry().dispatch(self, signature, s, ctx)
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn id(&self) -> ObjectId {
        self.id
    }
}

/// The world: owns the entities on its side of the wire.
pub struct Engine {
    entities: Vec<Rc<RefCell<Entity>>>,
}

impl Engine {
    pub fn new() -> Rc<RefCell<Engine>> {
        Rc::new(RefCell::new(Engine { entities: Vec::new() }))
    }

    pub fn create_entity(&mut self, relay: bool, pos: Vec3, yaw: f64) -> Rc<RefCell<Entity>> {
        let entity = Rc::new(RefCell::new(Entity::new(relay, pos, yaw)));
        self.entities.push(entity.clone());
        entity
    }

    pub fn remove_by_id(&mut self, id: ObjectId) {
        self.entities.retain(|entity| entity.borrow().id() != id);
    }

    pub fn entities(&self) -> &[Rc<RefCell<Entity>>] {
        &self.entities
    }

    pub fn entity_by_id(&self, id: ObjectId) -> Option<Rc<RefCell<Entity>>> {
        self.entities.iter().find(|entity| entity.borrow().id() == id).cloned()
    }

    pub fn autonomous_entity(&self) -> Option<Rc<RefCell<Entity>>> {
        self.entities.iter().find(|entity| entity.borrow().is_autonomous()).cloned()
    }
}

/// Client-side factory wiring server-spawned entities into an [`Engine`].
pub struct EngineFactory {
    pub engine: Rc<RefCell<Engine>>,
}

impl ObjectFactory for EngineFactory {
    fn create_object(&mut self, s: &mut Serializer) -> anyhow::Result<ObjectRef> {
        let entity = Rc::new(RefCell::new(Entity::new(false, Vec3::default(), 0.0)));
        DistributedObject::serialize(&mut *entity.borrow_mut(), s)?;
        self.engine.borrow_mut().entities.push(entity.clone());
        Ok(entity)
    }

    fn delete_object(&mut self, object: ObjectRef) {
        self.engine.borrow_mut().remove_by_id(object.borrow().id());
    }
}

/// The connection policy of the demo server: every new peer gets its own
///  autonomous entity, spawned at everyone; every other bound object is spawned at
///  the new peer; and the peer is told it owns the new entity - reliably, so the
///  message arrives after the entity's CREATE_OBJECT.
pub fn spawn_autonomous_entity(
    server: &mut DistributedObjectServer,
    engine: &Rc<RefCell<Engine>>,
    conn: &Address,
) -> ObjectId {
    let entity = engine.borrow_mut().create_entity(true, Vec3::default(), 0.0);
    let obj_id = server.bind_object(entity);

    server.create_remote_object(&[], true, obj_id);
    for other in server.bound_object_ids() {
        if other != obj_id && other != MASTER_OBJECT {
            server.create_remote_object(std::slice::from_ref(conn), false, other);
        }
    }

    server.mark_autonomous(conn, obj_id);
    server.invoke_remote_method(
        std::slice::from_ref(conn),
        false,
        obj_id,
        "Entity::SetAutonomous",
        (true,),
        true,
    );
    obj_id
}

/// Counterpart of [`spawn_autonomous_entity`] for a lost connection: drops the
///  orphaned entities from the server's world.
pub fn drop_orphaned_entities(engine: &Rc<RefCell<Engine>>, orphans: &[ObjectRef]) {
    for orphan in orphans {
        engine.borrow_mut().remove_by_id(orphan.borrow().id());
    }
}
