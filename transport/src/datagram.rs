use std::io::ErrorKind;
use std::net::UdpSocket;

use bytes::Bytes;
use tracing::{trace, warn};

#[cfg(test)]
use mockall::automock;

use crate::addr::Address;
use crate::config::MAX_PACKET_SIZE;

/// A non-blocking datagram socket.
///
/// `send` is best-effort: no retry, no ordering, errors are swallowed (the
///  reliability layer above compensates). `recv` never blocks; `None` means there
///  is currently nothing to read.
#[cfg_attr(test, automock)]
pub trait Datagram {
    /// Binds the socket. An unspecified address binds to an ephemeral local port.
    fn init(&mut self, local: Address) -> anyhow::Result<()>;

    /// Closes the socket; further sends and receives are no-ops.
    fn term(&mut self);

    fn send(&mut self, remote: Address, data: &[u8]);

    fn recv(&mut self) -> Option<(Address, Bytes)>;

    fn local_addr(&self) -> Address;
}

/// The production UDP implementation. Datagrams larger than [`MAX_PACKET_SIZE`]
///  are truncated on receive.
pub struct UdpDatagram {
    socket: Option<UdpSocket>,
    recv_buf: Vec<u8>,
}

impl UdpDatagram {
    pub fn new() -> UdpDatagram {
        UdpDatagram {
            socket: None,
            recv_buf: vec![0u8; MAX_PACKET_SIZE],
        }
    }
}

impl Default for UdpDatagram {
    fn default() -> Self {
        UdpDatagram::new()
    }
}

impl Datagram for UdpDatagram {
    fn init(&mut self, local: Address) -> anyhow::Result<()> {
        self.term();

        let socket = UdpSocket::bind(local.socket_addr())?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn term(&mut self) {
        self.socket = None;
    }

    fn send(&mut self, remote: Address, data: &[u8]) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.send_to(data, remote.socket_addr()) {
                trace!("send to {} failed: {}", remote, e);
            }
        }
    }

    fn recv(&mut self) -> Option<(Address, Bytes)> {
        let socket = self.socket.as_ref()?;
        match socket.recv_from(&mut self.recv_buf) {
            Ok((len, std::net::SocketAddr::V4(from))) => {
                Some((Address::from(from), Bytes::copy_from_slice(&self.recv_buf[..len])))
            }
            Ok((_, from)) => {
                warn!("dropping datagram from non-IPv4 source {:?}", from);
                None
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                trace!("socket error on recv: {}", e);
                None
            }
        }
    }

    fn local_addr(&self) -> Address {
        match self.socket.as_ref().and_then(|s| s.local_addr().ok()) {
            Some(std::net::SocketAddr::V4(addr)) => Address::from(addr),
            _ => Address::UNSPECIFIED,
        }
    }
}
