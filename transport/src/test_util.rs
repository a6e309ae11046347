//! Deterministic in-memory datagram implementations for tests.
//!
//! Real networks drop and reorder packets at their own pace; the reliability
//!  machinery is exercised against these instead, so loss scenarios are exact and
//!  fast. Production code always talks to [`crate::datagram::UdpDatagram`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::addr::Address;
use crate::datagram::Datagram;

/// Records every send; never receives anything. For unit tests that assert on the
///  exact packets a connection emits.
pub struct RecordingDatagram {
    pub sent: Vec<(Address, Bytes)>,
}

impl RecordingDatagram {
    pub fn new() -> RecordingDatagram {
        RecordingDatagram { sent: Vec::new() }
    }
}

impl Default for RecordingDatagram {
    fn default() -> Self {
        RecordingDatagram::new()
    }
}

impl Datagram for RecordingDatagram {
    fn init(&mut self, _local: Address) -> anyhow::Result<()> {
        Ok(())
    }

    fn term(&mut self) {}

    fn send(&mut self, remote: Address, data: &[u8]) {
        self.sent.push((remote, Bytes::copy_from_slice(data)));
    }

    fn recv(&mut self) -> Option<(Address, Bytes)> {
        None
    }

    fn local_addr(&self) -> Address {
        Address::UNSPECIFIED
    }
}

/// A lossless, instant in-memory "network" connecting any number of
///  [`MemoryDatagram`] endpoints by address.
pub struct MemoryNetwork {
    inboxes: RefCell<FxHashMap<Address, VecDeque<(Address, Bytes)>>>,
}

impl MemoryNetwork {
    pub fn new() -> Rc<MemoryNetwork> {
        Rc::new(MemoryNetwork {
            inboxes: RefCell::new(FxHashMap::default()),
        })
    }

    /// Creates an endpoint reachable under the given address.
    pub fn endpoint(self: &Rc<Self>, addr: &str) -> MemoryDatagram {
        let addr = Address::from(addr);
        self.inboxes.borrow_mut().entry(addr).or_default();
        MemoryDatagram {
            network: self.clone(),
            addr,
            drop_filter: None,
        }
    }
}

/// Every outgoing datagram is first offered to the drop filter; returning `true`
///  makes the network lose it. The filter sees the destination and the raw packet,
///  so tests can target specific packet kinds and keep counters.
pub type DropFilter = Box<dyn FnMut(&Address, &[u8]) -> bool>;

pub struct MemoryDatagram {
    network: Rc<MemoryNetwork>,
    addr: Address,
    drop_filter: Option<DropFilter>,
}

impl MemoryDatagram {
    pub fn set_drop_filter(&mut self, filter: DropFilter) {
        self.drop_filter = Some(filter);
    }
}

impl Datagram for MemoryDatagram {
    fn init(&mut self, local: Address) -> anyhow::Result<()> {
        if !local.is_unspecified() {
            self.addr = local;
        }
        self.network.inboxes.borrow_mut().entry(self.addr).or_default();
        Ok(())
    }

    fn term(&mut self) {
        self.network.inboxes.borrow_mut().remove(&self.addr);
    }

    fn send(&mut self, remote: Address, data: &[u8]) {
        if let Some(filter) = &mut self.drop_filter {
            if filter(&remote, data) {
                return;
            }
        }
        if let Some(inbox) = self.network.inboxes.borrow_mut().get_mut(&remote) {
            inbox.push_back((self.addr, Bytes::copy_from_slice(data)));
        }
    }

    fn recv(&mut self) -> Option<(Address, Bytes)> {
        self.network.inboxes.borrow_mut().get_mut(&self.addr)?.pop_front()
    }

    fn local_addr(&self) -> Address {
        self.addr
    }
}
