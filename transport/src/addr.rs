use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};

/// A peer's textual identity in the form `"<dotted-quad-ipv4>:<decimal-port>"`.
///
/// Connections are keyed by this address, and it is opaque to everything above the
///  transport layer. A string that does not parse as `ip:port` yields the
///  unspecified address `0.0.0.0:0`, which never matches a real peer.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Address(SocketAddrV4);

impl Address {
    pub const UNSPECIFIED: Address = Address(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

    pub fn new(ip: Ipv4Addr, port: u16) -> Address {
        Address(SocketAddrV4::new(ip, port))
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        self.0
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Address(addr)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        s.parse::<SocketAddrV4>()
            .map(Address)
            .unwrap_or(Address::UNSPECIFIED)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0.ip(), self.0.port())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
