use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

use crate::addr::Address;
use crate::config::{ProtocolConfig, MAX_PACKET_SIZE, SIZE_BW_POLL};
use crate::datagram::Datagram;
use crate::packet_header::{
    PacketHeader, BW_SUB_FIRST, BW_SUB_SECOND, FLAG_ACK, FLAG_BWP, FLAG_BWR, FLAG_PIN, FLAG_PON,
    FLAG_RLB, FLAG_RST, FLAG_SYN,
};
use crate::seq::SeqNum;
use crate::timer::Timer;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Closed,
    /// Client master that sent its SYN and waits for the SYN|ACK.
    SynSent,
    /// Server child that answered a SYN and waits for the final ACK.
    SynRcvd,
    Established,
}

/// What a connection has to tell its owning endpoint after handling a packet or a
///  timer pass. The endpoint translates these into its public event type.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Established,
    ConnectFailed,
    Broken,
    Data(Bytes),
}

struct RetransmitEntry {
    seq: SeqNum,
    timeout: Duration,
    remaining: u32,
    packet: Bytes,
}

/// The per-peer reliability state machine.
///
/// A client endpoint owns one master connection; a server endpoint owns one child
///  connection per peer (the LISTEN role lives in the server itself). The socket is
///  owned by the endpoint and passed in for the duration of each call.
pub struct Connection {
    config: ProtocolConfig,
    master: bool,
    raddr: Address,
    state: ConnectionState,

    unreliable_outgoing: SeqNum,
    unreliable_incoming: SeqNum,
    reliable_outgoing: SeqNum,
    /// Next expected in-order reliable sequence; doubles as the cumulative ACK value.
    lowest_acceptable: SeqNum,
    latest_legal_ack: SeqNum,
    duplicate_ack_count: u32,

    /// Pending unacknowledged reliable packets. Entries are pushed in send order, so
    ///  the queue is always the contiguous range [oldest unacked, reliable_outgoing).
    retransmit_queue: VecDeque<RetransmitEntry>,
    /// Reliable packets received ahead of `lowest_acceptable`, keyed by raw sequence.
    reassembly: FxHashMap<u16, Bytes>,

    epoch: Instant,
    ping_time: f32,
    ping_timeout: Duration,
    ping_timestamp: f32,

    bandwidth: f32,
    bandwidth_timeout: Duration,
    bw_recv_timestamp: f32,
    bw_recv_timer: Timer,
}

impl Connection {
    fn new(config: ProtocolConfig, master: bool) -> Connection {
        Connection {
            config,
            master,
            raddr: Address::UNSPECIFIED,
            state: ConnectionState::Closed,
            unreliable_outgoing: SeqNum(0),
            unreliable_incoming: SeqNum(0),
            reliable_outgoing: SeqNum(0),
            lowest_acceptable: SeqNum(0),
            latest_legal_ack: SeqNum(0),
            duplicate_ack_count: 0,
            retransmit_queue: VecDeque::new(),
            reassembly: FxHashMap::default(),
            epoch: Instant::now(),
            ping_time: 0.0,
            ping_timeout: Duration::ZERO,
            ping_timestamp: 0.0,
            bandwidth: 0.0,
            bandwidth_timeout: Duration::ZERO,
            bw_recv_timestamp: 0.0,
            bw_recv_timer: Timer::new(),
        }
    }

    pub(crate) fn master(config: ProtocolConfig) -> Connection {
        Connection::new(config, true)
    }

    /// Server side of the handshake: allocates the child answering a fresh SYN.
    pub(crate) fn accept(
        config: ProtocolConfig,
        socket: &mut dyn Datagram,
        raddr: Address,
        peer_isn: SeqNum,
    ) -> Connection {
        let mut connection = Connection::new(config, false);
        connection.raddr = raddr;
        connection.unreliable_incoming = peer_isn;
        connection.lowest_acceptable = peer_isn.next();

        let isn = initial_sequence_number();
        let header = PacketHeader {
            seqnum: isn,
            acknum: peer_isn.next(),
            pflags: FLAG_RLB | FLAG_SYN | FLAG_ACK,
            length: 0,
        };
        let packet = bare_packet(header);
        socket.send(raddr, &packet);
        connection.enqueue_retransmit(isn, packet);

        connection.unreliable_outgoing = isn;
        connection.reliable_outgoing = isn.next();
        connection.state = ConnectionState::SynRcvd;

        debug!("accepting connection attempt from {}", raddr);
        connection
    }

    /// Client side of the handshake: sends the initial SYN.
    pub(crate) fn connect(&mut self, socket: &mut dyn Datagram, raddr: Address) {
        if !self.master || self.state != ConnectionState::Closed {
            // only an idle master connection can initiate
            return;
        }

        self.raddr = raddr;

        let isn = initial_sequence_number();
        let header = PacketHeader {
            seqnum: isn,
            acknum: SeqNum(0),
            pflags: FLAG_RLB | FLAG_SYN,
            length: 0,
        };
        let packet = bare_packet(header);
        socket.send(raddr, &packet);
        self.enqueue_retransmit(isn, packet);

        self.unreliable_outgoing = isn;
        self.reliable_outgoing = isn.next();
        self.state = ConnectionState::SynSent;

        debug!("connecting to {}", raddr);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_address(&self) -> Address {
        self.raddr
    }

    /// Last measured round trip time in milliseconds; 0 until the first PONG.
    pub fn rtt_millis(&self) -> f32 {
        self.ping_time
    }

    /// Last bandwidth reported by the peer, in bytes per second; 0 until the first
    ///  completed probe.
    pub fn bandwidth(&self) -> f32 {
        self.bandwidth
    }

    pub(crate) fn send(&mut self, socket: &mut dyn Datagram, data: &[u8], reliable: bool) {
        if self.state != ConnectionState::Established {
            trace!("dropping send on {:?} connection to {}", self.state, self.raddr);
            return;
        }
        if data.len() > MAX_PACKET_SIZE - PacketHeader::SERIALIZED_LEN {
            warn!("payload of {} bytes exceeds the packet size limit - dropping", data.len());
            return;
        }

        let seqnum = if reliable {
            let seq = self.reliable_outgoing;
            self.reliable_outgoing = seq.next();
            seq
        } else {
            let seq = self.unreliable_outgoing;
            self.unreliable_outgoing = seq.next();
            seq
        };
        let header = PacketHeader {
            seqnum,
            acknum: SeqNum(0),
            pflags: if reliable { FLAG_RLB } else { 0 },
            length: data.len() as u16,
        };

        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + data.len());
        header.ser(&mut buf);
        buf.put_slice(data);
        let packet = buf.freeze();

        socket.send(self.raddr, &packet);
        if reliable {
            self.enqueue_retransmit(seqnum, packet);
        }
    }

    /// Local close: emits a bare RST and resets without surfacing any event.
    pub(crate) fn close(&mut self, socket: &mut dyn Datagram) {
        if self.state == ConnectionState::Closed {
            return;
        }
        send_reset(socket, self.raddr);
        self.reset_state();
    }

    pub(crate) fn handle_packet(
        &mut self,
        socket: &mut dyn Datagram,
        raddr: Address,
        header: PacketHeader,
        packet: Bytes,
        events: &mut Vec<ConnEvent>,
    ) {
        match self.state {
            ConnectionState::Closed => self.state_closed(socket, raddr, header),
            ConnectionState::SynSent => self.state_synsent(socket, raddr, header, events),
            ConnectionState::SynRcvd => self.state_synrcvd(socket, raddr, header, events),
            ConnectionState::Established => {
                self.state_established(socket, raddr, header, packet, events)
            }
        }
    }

    fn state_closed(&mut self, socket: &mut dyn Datagram, raddr: Address, header: PacketHeader) {
        if header.flags() & FLAG_RST == 0 {
            send_reset(socket, raddr);
        }
    }

    fn state_synsent(
        &mut self,
        socket: &mut dyn Datagram,
        raddr: Address,
        header: PacketHeader,
        events: &mut Vec<ConnEvent>,
    ) {
        if header.flags() & FLAG_RST != 0 {
            return self.fail_connect(events);
        }
        if raddr != self.raddr {
            send_reset(socket, raddr);
            return self.fail_connect(events);
        }
        if header.flags() != FLAG_RLB | FLAG_SYN | FLAG_ACK {
            send_reset(socket, raddr);
            return self.fail_connect(events);
        }
        if header.acknum != self.reliable_outgoing {
            send_reset(socket, raddr);
            return self.fail_connect(events);
        }

        self.latest_legal_ack = header.acknum;
        // the only outstanding packet is our SYN, which this SYN|ACK covers
        self.retransmit_queue.clear();

        self.unreliable_incoming = header.seqnum;
        self.lowest_acceptable = header.seqnum.next();

        send_ack(socket, raddr, self.lowest_acceptable);

        self.state = ConnectionState::Established;
        debug!("connection to {} established", raddr);
        events.push(ConnEvent::Established);
    }

    fn fail_connect(&mut self, events: &mut Vec<ConnEvent>) {
        debug!("connection attempt to {} failed", self.raddr);
        events.push(ConnEvent::ConnectFailed);
        self.reset_state();
    }

    fn state_synrcvd(
        &mut self,
        socket: &mut dyn Datagram,
        raddr: Address,
        header: PacketHeader,
        events: &mut Vec<ConnEvent>,
    ) {
        if header.flags() & FLAG_RST != 0 {
            self.reset(true, events);
            return;
        }
        if header.flags() != FLAG_ACK {
            return; // could be an early arriving data packet
        }
        if header.acknum != self.reliable_outgoing {
            send_reset(socket, raddr);
            self.reset(true, events);
            return;
        }

        self.latest_legal_ack = header.acknum;
        // the only outstanding packet is our SYN|ACK, which this ACK covers
        self.retransmit_queue.clear();

        self.state = ConnectionState::Established;
        debug!("connection from {} established", raddr);
        events.push(ConnEvent::Established);
    }

    fn state_established(
        &mut self,
        socket: &mut dyn Datagram,
        raddr: Address,
        header: PacketHeader,
        packet: Bytes,
        events: &mut Vec<ConnEvent>,
    ) {
        if self.master && raddr != self.raddr {
            // a master client connection is bound to a single peer
            send_reset(socket, raddr);
            return;
        }

        let flags = header.flags();

        if flags & FLAG_RST != 0 {
            debug!("connection to {} reset by peer", self.raddr);
            self.reset(true, events);
            return;
        }

        if flags & FLAG_PIN != 0 {
            send_pong(socket, raddr, header.control_value());
            return;
        }

        if flags & FLAG_PON != 0 {
            let timestamp = header.control_value();
            if timestamp == self.ping_timestamp {
                self.ping_time = self.now_millis() - timestamp;
                trace!("rtt to {} is {}ms", self.raddr, self.ping_time);
            }
            return;
        }

        if flags & FLAG_BWP != 0 {
            match header.bw_sub() {
                BW_SUB_FIRST => {
                    self.bw_recv_timestamp = header.control_value();
                    self.bw_recv_timer.reset();
                }
                BW_SUB_SECOND => {
                    if self.bw_recv_timestamp == header.control_value() {
                        let elapsed = self.bw_recv_timer.elapsed_millis(true);
                        if elapsed > 0.0 {
                            let bandwidth = SIZE_BW_POLL as f32 / elapsed * 1000.0;
                            send_bw_rslt(socket, raddr, bandwidth);
                        }
                    }
                }
                _ => {}
            }
            return;
        }

        if flags & FLAG_BWR != 0 {
            self.bandwidth = header.control_value();
            trace!("bandwidth to {} is {} bytes/s", self.raddr, self.bandwidth);
            return;
        }

        if flags & FLAG_ACK != 0 {
            if header.length > 0 {
                return; // embedded ACK is reserved and unsupported
            }

            if header.acknum.gt(self.reliable_outgoing) {
                // acknowledging something we never sent
                warn!("ack beyond outgoing sequence from {} - resetting", raddr);
                send_reset(socket, raddr);
                self.reset(true, events);
                return;
            }

            // fast retransmit on the third duplicate ack
            if header.acknum == self.latest_legal_ack && !self.retransmit_queue.is_empty() {
                self.duplicate_ack_count += 1;
                if self.duplicate_ack_count >= 3 {
                    if let Some(entry) = self.retransmit_queue.front() {
                        trace!("fast retransmit of {} to {}", entry.seq, self.raddr);
                        socket.send(self.raddr, &entry.packet);
                    }
                    self.duplicate_ack_count = 0;
                    return;
                }
            }

            // NB: the ack is one past the highest sequence the receiver took delivery of
            let mut covered_anything = false;
            while let Some(front) = self.retransmit_queue.front() {
                if front.seq.lt(header.acknum) {
                    self.retransmit_queue.pop_front();
                    covered_anything = true;
                } else {
                    break;
                }
            }
            if covered_anything {
                self.latest_legal_ack = header.acknum;
                self.duplicate_ack_count = 0;
            }
        }

        if header.length == 0 {
            return;
        }
        let payload = packet.slice(PacketHeader::SERIALIZED_LEN..);

        if flags & FLAG_RLB != 0 {
            // buffer new packets in the reassembly map and deliver the contiguous
            //  prefix; old packets are discarded silently
            if header.seqnum.ge(self.lowest_acceptable) {
                self.reassembly.insert(header.seqnum.0, payload);

                let mut current = self.lowest_acceptable;
                while let Some(data) = self.reassembly.remove(&current.0) {
                    events.push(ConnEvent::Data(data));
                    current = current.next();
                }
                self.lowest_acceptable = current;
            }

            // always ack, even a stale packet - its ack may have been lost
            send_ack(socket, raddr, self.lowest_acceptable);
        } else {
            if header.seqnum.lt(self.unreliable_incoming) {
                return; // delayed or duplicated
            }
            self.unreliable_incoming = header.seqnum.next();
            events.push(ConnEvent::Data(payload));
        }
    }

    /// Advances retransmission, ping and bandwidth timers by the elapsed wall-clock
    ///  time since the last tick.
    pub(crate) fn check_timeout(
        &mut self,
        socket: &mut dyn Datagram,
        elapsed: Duration,
        events: &mut Vec<ConnEvent>,
    ) {
        // NB: walking the whole queue is fine - it is ordered by sequence number, not
        //  by deadline, so a cumulative ack can erase a whole prefix in one go
        for i in 0..self.retransmit_queue.len() {
            let entry = &mut self.retransmit_queue[i];
            if entry.timeout <= elapsed {
                if entry.remaining == 0 {
                    warn!("retransmission budget for {} exhausted - resetting", self.raddr);
                    self.reset(true, events);
                    return;
                }
                trace!("retransmitting {} to {}", entry.seq, self.raddr);
                socket.send(self.raddr, &entry.packet);
                entry.timeout = self.config.retransmit_interval;
                entry.remaining -= 1;
            } else {
                entry.timeout -= elapsed;
            }
        }

        if self.state == ConnectionState::Established {
            if self.ping_timeout <= elapsed {
                self.ping_timestamp = self.now_millis();
                send_ping(socket, self.raddr, self.ping_timestamp);
                self.ping_timeout = self.config.ping_interval;
            } else {
                self.ping_timeout -= elapsed;
            }

            if self.bandwidth_timeout <= elapsed {
                send_bw_poll(socket, self.raddr, self.now_millis());
                self.bandwidth_timeout = self.config.bandwidth_probe_interval;
            } else {
                self.bandwidth_timeout -= elapsed;
            }
        }
    }

    /// Resets the connection. A passive (`broken`) reset surfaces the appropriate
    ///  event: an established connection reports `Broken`, a connection attempt
    ///  reports `ConnectFailed`. A child that never reached `Established` dies
    ///  silently - the application never learned of it. Active resets (local close)
    ///  never surface events.
    fn reset(&mut self, broken: bool, events: &mut Vec<ConnEvent>) {
        if broken {
            match self.state {
                ConnectionState::Established => events.push(ConnEvent::Broken),
                ConnectionState::SynSent => events.push(ConnEvent::ConnectFailed),
                _ => {}
            }
        }
        self.reset_state();
    }

    fn reset_state(&mut self) {
        self.raddr = Address::UNSPECIFIED;
        self.state = ConnectionState::Closed;
        self.unreliable_outgoing = SeqNum(0);
        self.unreliable_incoming = SeqNum(0);
        self.reliable_outgoing = SeqNum(0);
        self.lowest_acceptable = SeqNum(0);
        self.latest_legal_ack = SeqNum(0);
        self.duplicate_ack_count = 0;
        self.retransmit_queue.clear();
        self.reassembly.clear();
        self.ping_time = 0.0;
        self.ping_timeout = Duration::ZERO;
        self.ping_timestamp = 0.0;
        self.bandwidth = 0.0;
        self.bandwidth_timeout = Duration::ZERO;
        self.bw_recv_timestamp = 0.0;
    }

    fn enqueue_retransmit(&mut self, seq: SeqNum, packet: Bytes) {
        self.retransmit_queue.push_back(RetransmitEntry {
            seq,
            timeout: self.config.retransmit_interval,
            remaining: self.config.retransmit_count,
            packet,
        });
    }

    fn now_millis(&self) -> f32 {
        self.epoch.elapsed().as_secs_f32() * 1000.0
    }
}

/// The handshake ISN: the low 16 bits of the wall-clock seconds.
fn initial_sequence_number() -> SeqNum {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_secs();
    SeqNum(seconds as u16)
}

fn bare_packet(header: PacketHeader) -> Bytes {
    let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
    header.ser(&mut buf);
    buf.freeze()
}

pub(crate) fn send_reset(socket: &mut dyn Datagram, raddr: Address) {
    let packet = bare_packet(PacketHeader {
        seqnum: SeqNum(0),
        acknum: SeqNum(0),
        pflags: FLAG_RST,
        length: 0,
    });
    socket.send(raddr, &packet);
}

fn send_ack(socket: &mut dyn Datagram, raddr: Address, acknum: SeqNum) {
    let packet = bare_packet(PacketHeader {
        seqnum: SeqNum(0),
        acknum,
        pflags: FLAG_ACK,
        length: 0,
    });
    socket.send(raddr, &packet);
}

fn send_ping(socket: &mut dyn Datagram, raddr: Address, timestamp: f32) {
    let packet = bare_packet(PacketHeader::control(FLAG_PIN, timestamp, 0));
    socket.send(raddr, &packet);
}

fn send_pong(socket: &mut dyn Datagram, raddr: Address, timestamp: f32) {
    let packet = bare_packet(PacketHeader::control(FLAG_PON, timestamp, 0));
    socket.send(raddr, &packet);
}

fn send_bw_poll(socket: &mut dyn Datagram, raddr: Address, timestamp: f32) {
    for sub in [BW_SUB_FIRST, BW_SUB_SECOND] {
        let header = PacketHeader::control(
            FLAG_BWP | sub,
            timestamp,
            (SIZE_BW_POLL - PacketHeader::SERIALIZED_LEN) as u16,
        );
        let mut buf = BytesMut::with_capacity(SIZE_BW_POLL);
        header.ser(&mut buf);
        buf.resize(SIZE_BW_POLL, 0);
        socket.send(raddr, &buf);
    }
}

fn send_bw_rslt(socket: &mut dyn Datagram, raddr: Address, bandwidth: f32) {
    let packet = bare_packet(PacketHeader::control(FLAG_BWR, bandwidth, 0));
    socket.send(raddr, &packet);
}
