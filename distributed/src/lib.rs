//! The distributed object system: a registry of objects addressable by numeric id,
//!  replicated to peers over the transport layer and driven by remote method
//!  invocations.
//!
//! The server is authoritative: it mints object ids, decides which peer learns
//!  about which object (CREATE_OBJECT / DELETE_OBJECT fan-out with per-connection
//!  bookkeeping), and dispatches incoming invocations to bound objects. Clients
//!  mirror the objects the server spawns at them through an application-provided
//!  factory, and reach back with invocations on the ids the server issued.
//!
//! Every message is one transport payload, encoded with the serialization crate:
//!
//! ```ascii
//! msg type (u8)  object id (u64)  [ signature (string, 'unique' policy)  args... ]
//! ```
//!
//! Method dispatch is table-driven: each invocable class builds a signature ->
//!  thunk registry in a startup function, and the thunks deserialize the
//!  positional argument tuple before calling the method. A handler can relay the
//!  call onward ("everyone except whoever sent this") through its invocation
//!  context; relays are flushed once the handler returns.

pub mod client;
pub mod message;
pub mod object;
pub mod rmi;
pub mod server;
pub mod system;
pub mod test_util;
