use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::addr::Address;
use crate::config::ProtocolConfig;
use crate::connection::{send_reset, ConnEvent, Connection, ConnectionState};
use crate::datagram::{Datagram, UdpDatagram};
use crate::packet_header::{PacketHeader, FLAG_RLB, FLAG_RST, FLAG_SYN};
use crate::timer::Timer;

/// What a server endpoint reports from `tick()`.
///
/// Events queue up in arrival order until the application drains them, so reliable
///  payloads arriving before the application gets around to a connection are never
///  lost - they are simply still in the queue.
#[derive(Debug)]
pub enum ServerEvent {
    ConnectionEstablished(Address),
    ConnectionClosed(Address),
    Data { from: Address, payload: Bytes },
}

#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    ConnectFailed,
    ConnectionBroken,
    Data(Bytes),
}

/// The listening endpoint: owns the socket and one child connection per peer.
///
/// This is the LISTEN role of the protocol - an unknown peer's `RLB|SYN` packet
///  spawns a child in `SynRcvd`, anything else from an unknown peer draws a bare
///  RST. Known peers are dispatched to their child's state machine.
pub struct Server {
    config: ProtocolConfig,
    socket: Box<dyn Datagram>,
    children: FxHashMap<Address, Connection>,
    listening: bool,
    timer: Timer,
}

impl Server {
    pub fn new(config: ProtocolConfig) -> Server {
        Server::with_socket(config, Box::new(UdpDatagram::new()))
    }

    pub fn with_socket(config: ProtocolConfig, socket: Box<dyn Datagram>) -> Server {
        Server {
            config,
            socket,
            children: FxHashMap::default(),
            listening: false,
            timer: Timer::new(),
        }
    }

    /// Binds the socket and starts accepting connections.
    pub fn host(&mut self, local: Address) -> anyhow::Result<()> {
        if self.listening {
            bail!("server is already hosting");
        }
        self.socket.init(local)?;
        self.listening = true;
        self.timer.reset();
        debug!("hosting on {}", self.socket.local_addr());
        Ok(())
    }

    pub fn local_addr(&self) -> Address {
        self.socket.local_addr()
    }

    /// Forcibly closes the named connection. The peer gets a bare RST; no event is
    ///  surfaced locally.
    pub fn kick(&mut self, raddr: &Address) {
        if let Some(mut connection) = self.children.remove(raddr) {
            debug!("kicking {}", raddr);
            connection.close(self.socket.as_mut());
        }
    }

    pub fn connection(&self, raddr: &Address) -> Option<&Connection> {
        self.children.get(raddr)
    }

    pub fn connections(&self) -> impl Iterator<Item = Address> + '_ {
        self.children.keys().copied()
    }

    pub fn send(&mut self, raddr: &Address, data: &[u8], reliable: bool) {
        if let Some(connection) = self.children.get_mut(raddr) {
            connection.send(self.socket.as_mut(), data, reliable);
        } else {
            trace!("dropping send to unknown peer {}", raddr);
        }
    }

    /// Drains up to the per-cycle packet budget, then advances all timers by the
    ///  wall-clock time since the previous tick.
    pub fn tick(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        if !self.listening {
            return out;
        }

        let mut conn_events = Vec::new();
        for _ in 0..self.config.max_packets_per_cycle {
            let Some((raddr, packet)) = self.socket.recv() else {
                break;
            };
            let Ok(header) = PacketHeader::deser(&mut &packet[..]) else {
                continue; // malformed
            };
            if PacketHeader::SERIALIZED_LEN + header.length as usize != packet.len() {
                continue; // malformed
            }

            if let Some(connection) = self.children.get_mut(&raddr) {
                connection.handle_packet(self.socket.as_mut(), raddr, header, packet, &mut conn_events);
                if connection.state() == ConnectionState::Closed {
                    self.children.remove(&raddr);
                }
                translate_server_events(raddr, &mut conn_events, &mut out);
            } else if header.pflags == FLAG_RLB | FLAG_SYN {
                let connection =
                    Connection::accept(self.config.clone(), self.socket.as_mut(), raddr, header.seqnum);
                self.children.insert(raddr, connection);
            } else if header.flags() & FLAG_RST == 0 {
                trace!("unexpected packet from unknown peer {} - sending reset", raddr);
                send_reset(self.socket.as_mut(), raddr);
            }
        }

        let elapsed = self.timer.elapsed(true);
        let mut closed = Vec::new();
        for (raddr, connection) in self.children.iter_mut() {
            connection.check_timeout(self.socket.as_mut(), elapsed, &mut conn_events);
            translate_server_events(*raddr, &mut conn_events, &mut out);
            if connection.state() == ConnectionState::Closed {
                closed.push(*raddr);
            }
        }
        for raddr in closed {
            self.children.remove(&raddr);
        }

        out
    }

    /// Closes every child (each peer gets a bare RST, no events) and the socket.
    pub fn shutdown(&mut self) {
        for (_, mut connection) in self.children.drain() {
            connection.close(self.socket.as_mut());
        }
        self.socket.term();
        self.listening = false;
    }
}

fn translate_server_events(raddr: Address, conn_events: &mut Vec<ConnEvent>, out: &mut Vec<ServerEvent>) {
    for event in conn_events.drain(..) {
        match event {
            ConnEvent::Established => out.push(ServerEvent::ConnectionEstablished(raddr)),
            ConnEvent::Broken => out.push(ServerEvent::ConnectionClosed(raddr)),
            ConnEvent::Data(payload) => out.push(ServerEvent::Data { from: raddr, payload }),
            // a server child that fails its handshake dies silently
            ConnEvent::ConnectFailed => {}
        }
    }
}

/// The connecting endpoint: owns the socket and a single master connection.
pub struct Client {
    config: ProtocolConfig,
    socket: Box<dyn Datagram>,
    master: Connection,
    timer: Timer,
}

impl Client {
    pub fn new(config: ProtocolConfig) -> Client {
        Client::with_socket(config, Box::new(UdpDatagram::new()))
    }

    pub fn with_socket(config: ProtocolConfig, socket: Box<dyn Datagram>) -> Client {
        let master = Connection::master(config.clone());
        Client {
            config,
            socket,
            master,
            timer: Timer::new(),
        }
    }

    /// Initiates the handshake. Fails if a previous attempt or connection is still
    ///  in progress.
    pub fn connect(&mut self, raddr: Address) -> anyhow::Result<()> {
        if self.master.state() != ConnectionState::Closed {
            bail!("a connection attempt is already in progress");
        }
        self.socket.init(Address::UNSPECIFIED)?;
        self.master.connect(self.socket.as_mut(), raddr);
        self.timer.reset();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.master.state() == ConnectionState::Established
    }

    pub fn remote_address(&self) -> Address {
        self.master.remote_address()
    }

    pub fn local_addr(&self) -> Address {
        self.socket.local_addr()
    }

    pub fn rtt_millis(&self) -> f32 {
        self.master.rtt_millis()
    }

    pub fn bandwidth(&self) -> f32 {
        self.master.bandwidth()
    }

    pub fn send(&mut self, data: &[u8], reliable: bool) {
        self.master.send(self.socket.as_mut(), data, reliable);
    }

    pub fn tick(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        if self.master.state() == ConnectionState::Closed {
            return out;
        }

        let mut conn_events = Vec::new();
        for _ in 0..self.config.max_packets_per_cycle {
            let Some((raddr, packet)) = self.socket.recv() else {
                break;
            };
            let Ok(header) = PacketHeader::deser(&mut &packet[..]) else {
                continue; // malformed
            };
            if PacketHeader::SERIALIZED_LEN + header.length as usize != packet.len() {
                continue; // malformed
            }

            self.master
                .handle_packet(self.socket.as_mut(), raddr, header, packet, &mut conn_events);
            translate_client_events(&mut conn_events, &mut out);
            if self.master.state() == ConnectionState::Closed {
                return out; // handling the packet reset the connection
            }
        }

        let elapsed = self.timer.elapsed(true);
        self.master.check_timeout(self.socket.as_mut(), elapsed, &mut conn_events);
        translate_client_events(&mut conn_events, &mut out);

        out
    }

    /// Closes the connection (or cancels an attempt in progress) without events.
    pub fn disconnect(&mut self) {
        self.master.close(self.socket.as_mut());
    }

    pub fn shutdown(&mut self) {
        self.master.close(self.socket.as_mut());
        self.socket.term();
    }
}

fn translate_client_events(conn_events: &mut Vec<ConnEvent>, out: &mut Vec<ClientEvent>) {
    for event in conn_events.drain(..) {
        match event {
            ConnEvent::Established => out.push(ClientEvent::Connected),
            ConnEvent::ConnectFailed => out.push(ClientEvent::ConnectFailed),
            ConnEvent::Broken => out.push(ClientEvent::ConnectionBroken),
            ConnEvent::Data(payload) => out.push(ClientEvent::Data(payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::FLAG_ACK;
    use crate::test_util::MemoryNetwork;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    const SERVER: &str = "10.0.0.1:8888";
    const CLIENT: &str = "10.0.0.2:3000";

    fn pair() -> (Server, Client) {
        let network = MemoryNetwork::new();
        let mut server = Server::with_socket(
            ProtocolConfig::default(),
            Box::new(network.endpoint(SERVER)),
        );
        server.host(Address::from(SERVER)).unwrap();
        let client = Client::with_socket(
            ProtocolConfig::default(),
            Box::new(network.endpoint(CLIENT)),
        );
        (server, client)
    }

    /// Reliable data packet on the wire: RLB flag and a payload.
    fn is_reliable_data(packet: &[u8]) -> bool {
        match PacketHeader::deser(&mut &packet[..]) {
            Ok(h) => h.flags() == FLAG_RLB && h.length > 0,
            Err(_) => false,
        }
    }

    #[test]
    fn test_handshake_completes_within_two_ticks() {
        let (mut server, mut client) = pair();
        client.connect(Address::from(SERVER)).unwrap();

        assert!(server.tick().is_empty()); // SYN consumed, SYN|ACK sent
        let events = client.tick();
        assert!(matches!(events[..], [ClientEvent::Connected]));
        let events = server.tick();
        assert!(matches!(events[..], [ServerEvent::ConnectionEstablished(a)] if a == Address::from(CLIENT)));

        assert!(client.is_connected());
        assert!(server.connection(&Address::from(CLIENT)).is_some());
    }

    #[test]
    fn test_reliable_echo() {
        let (mut server, mut client) = pair();
        client.connect(Address::from(SERVER)).unwrap();
        server.tick();
        client.tick();
        server.tick();

        client.send(b"hello world\0", true);
        let events = server.tick();
        let payload = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::Data { from, payload } if *from == Address::from(CLIENT) => Some(payload.clone()),
                _ => None,
            })
            .expect("no data event");
        assert_eq!(&payload[..], b"hello world\0");

        server.send(&Address::from(CLIENT), &payload, true);
        let events = client.tick();
        let echoed = events
            .iter()
            .find_map(|e| match e {
                ClientEvent::Data(payload) => Some(payload.clone()),
                _ => None,
            })
            .expect("no echo");
        assert_eq!(&echoed[..], b"hello world\0");
    }

    #[test]
    fn test_loss_and_retransmit_delivers_exactly_once() {
        let network = MemoryNetwork::new();
        let mut server = Server::with_socket(
            ProtocolConfig::default(),
            Box::new(network.endpoint(SERVER)),
        );
        server.host(Address::from(SERVER)).unwrap();

        let config = ProtocolConfig {
            retransmit_interval: Duration::from_millis(10),
            ..ProtocolConfig::default()
        };
        let mut socket = network.endpoint(CLIENT);
        let mut remaining_drops = 2;
        socket.set_drop_filter(Box::new(move |_, packet| {
            if is_reliable_data(packet) && remaining_drops > 0 {
                remaining_drops -= 1;
                return true;
            }
            false
        }));
        let mut client = Client::with_socket(config, Box::new(socket));

        client.connect(Address::from(SERVER)).unwrap();
        server.tick();
        client.tick();
        server.tick();

        client.send(b"lossy payload", true);

        let mut deliveries = 0;
        for _ in 0..40 {
            for event in server.tick() {
                if let ServerEvent::Data { payload, .. } = event {
                    assert_eq!(&payload[..], b"lossy payload");
                    deliveries += 1;
                }
            }
            client.tick();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(deliveries, 1);
    }

    #[test]
    fn test_fast_retransmit_beats_the_timer() {
        let network = MemoryNetwork::new();
        let mut server = Server::with_socket(
            ProtocolConfig::default(),
            Box::new(network.endpoint(SERVER)),
        );
        server.host(Address::from(SERVER)).unwrap();

        // default 500ms retransmission interval: recovery below must come from
        //  the duplicate-ack path, not the timer
        let sent_seqs = Rc::new(RefCell::new(Vec::new()));
        let seqs = sent_seqs.clone();
        let mut socket = network.endpoint(CLIENT);
        let mut dropped_first = false;
        socket.set_drop_filter(Box::new(move |_, packet| {
            if is_reliable_data(packet) {
                let header = PacketHeader::deser(&mut &packet[..]).unwrap();
                seqs.borrow_mut().push(header.seqnum.0);
                if !dropped_first {
                    dropped_first = true;
                    return true;
                }
            }
            false
        }));
        let mut client = Client::with_socket(ProtocolConfig::default(), Box::new(socket));

        client.connect(Address::from(SERVER)).unwrap();
        server.tick();
        client.tick();
        server.tick();

        for payload in [&b"one"[..], b"two", b"three", b"four"] {
            client.send(payload, true);
        }

        let started = std::time::Instant::now();
        let mut received = Vec::new();
        while received.len() < 4 && started.elapsed() < Duration::from_millis(400) {
            for event in server.tick() {
                if let ServerEvent::Data { payload, .. } = event {
                    received.push(payload);
                }
            }
            client.tick();
        }

        assert_eq!(received.len(), 4, "fast retransmit did not recover the loss");
        assert_eq!(&received[0][..], b"one");
        assert_eq!(&received[3][..], b"four");
        assert!(started.elapsed() < Duration::from_millis(400));

        // the first sequence number went out twice: the dropped original and the
        //  fast retransmit
        let seqs = sent_seqs.borrow();
        let first = seqs[0];
        assert_eq!(seqs.iter().filter(|&&s| s == first).count(), 2);
    }

    #[test]
    fn test_client_disconnect_closes_server_child() {
        let (mut server, mut client) = pair();
        client.connect(Address::from(SERVER)).unwrap();
        server.tick();
        client.tick();
        server.tick();

        client.disconnect();
        let events = server.tick();
        assert!(matches!(events[..], [ServerEvent::ConnectionClosed(a)] if a == Address::from(CLIENT)));
        assert!(server.connection(&Address::from(CLIENT)).is_none());
    }

    #[test]
    fn test_kick_breaks_the_client() {
        let (mut server, mut client) = pair();
        client.connect(Address::from(SERVER)).unwrap();
        server.tick();
        client.tick();
        server.tick();

        server.kick(&Address::from(CLIENT));
        let events = client.tick();
        assert!(matches!(events[..], [ClientEvent::ConnectionBroken]));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_unknown_peer_non_syn_draws_reset() {
        let network = MemoryNetwork::new();
        let mut server = Server::with_socket(
            ProtocolConfig::default(),
            Box::new(network.endpoint(SERVER)),
        );
        server.host(Address::from(SERVER)).unwrap();

        let mut stray = network.endpoint("10.0.0.9:9");
        let header = PacketHeader {
            seqnum: crate::seq::SeqNum(1),
            acknum: crate::seq::SeqNum(0),
            pflags: FLAG_ACK,
            length: 0,
        };
        let mut buf = bytes::BytesMut::new();
        header.ser(&mut buf);
        stray.send(Address::from(SERVER), &buf);

        assert!(server.tick().is_empty());
        let (_, packet) = stray.recv().expect("no reset received");
        let reset = PacketHeader::deser(&mut &packet[..]).unwrap();
        assert_eq!(reset.pflags, FLAG_RST);
    }

    #[test]
    fn test_connect_twice_fails() {
        let network = MemoryNetwork::new();
        let mut client = Client::with_socket(
            ProtocolConfig::default(),
            Box::new(network.endpoint(CLIENT)),
        );
        client.connect(Address::from(SERVER)).unwrap();
        assert!(client.connect(Address::from(SERVER)).is_err());
    }

    #[test]
    fn test_rtt_and_bandwidth_probes_converge() {
        let (mut server, mut client) = pair();
        client.connect(Address::from(SERVER)).unwrap();
        server.tick();
        client.tick();
        server.tick();

        // several tick rounds with real time in between so the probe round trips
        //  accumulate measurable elapsed time
        for _ in 0..6 {
            std::thread::sleep(Duration::from_millis(2));
            server.tick();
            client.tick();
        }

        assert!(client.rtt_millis() > 0.0);
        let server_conn = server.connection(&Address::from(CLIENT)).expect("child gone");
        assert!(server_conn.rtt_millis() > 0.0);
    }
}
