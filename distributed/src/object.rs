use std::cell::RefCell;
use std::rc::Rc;

use serialization::shared_str::SharedStr;
use serialization::stream::Serializer;
use transport::addr::Address;

use crate::rmi::InvokeArgs;

pub type ObjectId = u64;

/// The id of the always-present endpoint object, bound on server and client at
///  startup. The id counter never mints it for anything else.
pub const MASTER_OBJECT: ObjectId = 0;

/// An object participating in replication and remote invocation.
///
/// Objects are owned by their hosting endpoint's registry; everyone else holds a
///  cheap clone of the [`ObjectRef`].
pub trait DistributedObject {
    /// Emits - or, on the receiving side, restores - the creation parameters a
    ///  remote peer needs to instantiate its mirror of this object.
    fn serialize(&mut self, s: &mut Serializer) -> anyhow::Result<()>;

    /// Dispatches an incoming remote invocation. `Ok(false)` means the signature
    ///  is unknown here; a decode failure of the arguments is an error.
    fn invoke(
        &mut self,
        signature: &str,
        s: &mut Serializer,
        ctx: &mut InvokeContext,
    ) -> anyhow::Result<bool> {
        let _ = (signature, s, ctx);
        Ok(false)
    }

    fn set_id(&mut self, id: ObjectId);

    fn id(&self) -> ObjectId;
}

pub type ObjectRef = Rc<RefCell<dyn DistributedObject>>;

pub(crate) struct PendingInvoke {
    pub conns: Vec<Address>,
    pub except: bool,
    pub obj_id: ObjectId,
    pub signature: SharedStr,
    pub reliable: bool,
    pub write_args: Box<dyn FnOnce(&mut Serializer) -> anyhow::Result<()>>,
}

pub(crate) type Outbox = Vec<PendingInvoke>;

/// Call-scoped context of one method dispatch.
///
/// Carries the address the invocation arrived from (`None` for locally driven
///  dispatch) and collects remote invocations the handler wants to emit. Those are
///  deferred: the system flushes them after the handler returns, since the system
///  itself is busy dispatching while the handler runs.
pub struct InvokeContext<'a> {
    origin: Option<Address>,
    outbox: &'a mut Outbox,
}

impl<'a> InvokeContext<'a> {
    pub(crate) fn new(origin: Option<Address>, outbox: &'a mut Outbox) -> InvokeContext<'a> {
        InvokeContext { origin, outbox }
    }

    /// The peer this invocation came from, if it came over the network.
    pub fn origin(&self) -> Option<Address> {
        self.origin
    }

    /// Queues a remote invocation with the usual fan-out semantics: with
    ///  `except == false` the named connections are the targets; with
    ///  `except == true` everyone *not* named is (an empty set then means
    ///  broadcast). On a client endpoint the targeting is moot - everything goes
    ///  to the server.
    pub fn invoke_remote<A: InvokeArgs + 'static>(
        &mut self,
        conns: Vec<Address>,
        except: bool,
        obj_id: ObjectId,
        signature: &str,
        args: A,
        reliable: bool,
    ) {
        self.outbox.push(PendingInvoke {
            conns,
            except,
            obj_id,
            signature: SharedStr::from(signature),
            reliable,
            write_args: Box::new(move |s| {
                let mut args = args;
                args.serialize_args(s)
            }),
        });
    }

    /// The relay pattern: forward to every connection except the one the current
    ///  invocation arrived on. For a local invocation this is a plain broadcast.
    pub fn invoke_remote_except_origin<A: InvokeArgs + 'static>(
        &mut self,
        obj_id: ObjectId,
        signature: &str,
        args: A,
        reliable: bool,
    ) {
        let conns = self.origin.into_iter().collect();
        self.invoke_remote(conns, true, obj_id, signature, args, reliable);
    }
}
