use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use serialization::policy::DataPolicyContainer;
use serialization::shared_str::SharedStr;
use serialization::stream::Serializer;
use transport::addr::Address;

use crate::message::MessageType;
use crate::object::{InvokeContext, ObjectId, ObjectRef, Outbox, MASTER_OBJECT};

/// The object-id to object registry of one endpoint.
///
/// The registry owns the binding; the application and the connection records hold
///  clones of the `ObjectRef`. Binding stamps the id onto the object.
pub struct ObjectRegistry {
    bound: FxHashMap<ObjectId, ObjectRef>,
}

impl ObjectRegistry {
    pub fn new() -> ObjectRegistry {
        ObjectRegistry {
            bound: FxHashMap::default(),
        }
    }

    pub fn bind(&mut self, obj_id: ObjectId, object: ObjectRef) {
        debug!("binding object {}", obj_id);
        object.borrow_mut().set_id(obj_id);
        self.bound.insert(obj_id, object);
    }

    pub fn unbind(&mut self, obj_id: ObjectId) -> Option<ObjectRef> {
        debug!("unbinding object {}", obj_id);
        self.bound.remove(&obj_id)
    }

    pub fn translate(&self, obj_id: ObjectId) -> Option<ObjectRef> {
        self.bound.get(&obj_id).cloned()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.bound.keys().copied().collect()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        ObjectRegistry::new()
    }
}

/// The INVOKE_METHOD receive path, shared by server and client: reads the object
///  id and signature, then hands the argument stream to the bound object.
///
/// An unknown object id is not an error towards the peer - the object may simply
///  be gone already. Same for an unknown signature; both report `Ok(false)`.
pub(crate) fn process_invoke_method(
    registry: &ObjectRegistry,
    s: &mut Serializer,
    origin: Option<Address>,
    outbox: &mut Outbox,
) -> anyhow::Result<bool> {
    let mut obj_id: ObjectId = MASTER_OBJECT;
    s.value(&mut obj_id)?;

    let Some(object) = registry.translate(obj_id) else {
        trace!("invocation for unknown object {} - ignoring", obj_id);
        return Ok(false);
    };

    let mut signature = SharedStr::default();
    s.value_with(&mut signature, "unique")?;

    let mut ctx = InvokeContext::new(origin, outbox);
    let handled = object.borrow_mut().invoke(signature.as_str(), s, &mut ctx)?;
    if !handled {
        trace!("object {} does not handle {}", obj_id, signature);
    }
    Ok(handled)
}

pub(crate) fn encode_create_object(
    container: &mut DataPolicyContainer,
    obj_id: ObjectId,
    object: &ObjectRef,
) -> anyhow::Result<Bytes> {
    let mut s = Serializer::writing(container);
    let mut msg_type = MessageType::CreateObject as u8;
    s.value(&mut msg_type)?;
    let mut obj_id = obj_id;
    s.value(&mut obj_id)?;
    object.borrow_mut().serialize(&mut s)?;
    Ok(s.into_bytes())
}

pub(crate) fn encode_delete_object(
    container: &mut DataPolicyContainer,
    obj_id: ObjectId,
) -> anyhow::Result<Bytes> {
    let mut s = Serializer::writing(container);
    let mut msg_type = MessageType::DeleteObject as u8;
    s.value(&mut msg_type)?;
    let mut obj_id = obj_id;
    s.value(&mut obj_id)?;
    Ok(s.into_bytes())
}

pub(crate) fn encode_invoke_method(
    container: &mut DataPolicyContainer,
    obj_id: ObjectId,
    signature: &str,
    write_args: impl FnOnce(&mut Serializer) -> anyhow::Result<()>,
) -> anyhow::Result<Bytes> {
    let mut s = Serializer::writing(container);
    let mut msg_type = MessageType::InvokeMethod as u8;
    s.value(&mut msg_type)?;
    let mut obj_id = obj_id;
    s.value(&mut obj_id)?;
    let mut signature = SharedStr::from(signature);
    s.value_with(&mut signature, "unique")?;
    write_args(&mut s)?;
    Ok(s.into_bytes())
}
