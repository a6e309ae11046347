use std::time::Duration;

/// Datagrams beyond this size are truncated at the socket layer. The protocol never
///  sends anything bigger on its own; applications are responsible for keeping their
///  payloads under this bound.
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// Total size of a bandwidth-probe packet, header included. The probe measures how
///  long this many bytes take between two back-to-back packets on the receiving side.
pub const SIZE_BW_POLL: usize = 512;

/// Timing and budget knobs of the protocol.
///
/// The defaults are the values the protocol was designed around; tests shrink the
///  retransmission interval to keep loss scenarios fast.
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// How long an unacknowledged reliable packet waits before it is retransmitted.
    pub retransmit_interval: Duration,

    /// How many times a reliable packet is retransmitted before the connection is
    ///  considered broken. Together with `retransmit_interval` this is the only
    ///  hard deadline in the protocol (120 x 500ms = roughly one minute).
    pub retransmit_count: u32,

    /// Interval between PING probes on an established connection.
    pub ping_interval: Duration,

    /// Interval between bandwidth probes on an established connection.
    pub bandwidth_probe_interval: Duration,

    /// Upper bound on incoming datagrams drained per `tick()` call, so a flood
    ///  cannot starve timer processing.
    pub max_packets_per_cycle: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            retransmit_interval: Duration::from_millis(500),
            retransmit_count: 120,
            ping_interval: Duration::from_millis(1000),
            bandwidth_probe_interval: Duration::from_millis(1000),
            max_packets_per_cycle: 256,
        }
    }
}
