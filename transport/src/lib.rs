//! A connection-oriented transport protocol layered on UDP, providing both reliable
//!  in-order delivery and best-effort unreliable delivery over the same connection.
//!
//! ## Design goals
//!
//! * Connections are established with a TCP-style three-way handshake and torn down
//!   with a bare RST - there is no FIN/TIME_WAIT machinery, a connection is gone the
//!   moment either side resets it
//! * Each message is sent either *reliably* (acknowledged, retransmitted, delivered
//!   in send order) or *unreliably* (fire-and-forget, newer-wins, older duplicates
//!   are dropped), selectable per send call
//! * The abstraction is sending / receiving *messages* (defined-length chunks of
//!   data as opposed to streams of bytes)
//! * Single-threaded operation: the application drives all progress by calling
//!   `tick()` on its endpoint. All I/O is non-blocking, and everything the protocol
//!   has to say to the application is returned from `tick()` as events
//! * Per-connection round-trip-time probing (PING/PONG) and a simple two-packet
//!   bandwidth probe, both running continuously on established connections
//!
//! ## Header
//!
//! Every UDP datagram carries a fixed 8-byte header, all fields little-endian:
//!
//! ```ascii
//! 0: seqnum (u16) - sequence number of this packet
//! 2: acknum (u16) - cumulative acknowledgement (one past the highest
//!     contiguously received reliable sequence)
//! 4: pflags (u16) - low byte: packet flags; high byte: sub-opcode for
//!     bandwidth probes
//! 6: length (u16) - payload length in bytes; the payload follows the header
//! ```
//!
//! PING/PONG/bandwidth packets reinterpret bytes 0..4 as an IEEE-754 little-endian
//!  f32 (a millisecond timestamp, or the measured bandwidth in bytes per second for
//!  a bandwidth report).
//!
//! ## Reliability
//!
//! Reliable packets are buffered by the sender and retransmitted every 500ms until
//!  acknowledged, up to 120 times; exhausting the retransmission budget breaks the
//!  connection. Acknowledgements are cumulative, and the third duplicate ACK
//!  triggers a fast retransmit of the oldest unacknowledged packet without waiting
//!  for its timer.
//!
//! The receiver buffers out-of-order reliable packets in a reassembly map and
//!  delivers the contiguous prefix in sequence order, acknowledging after every
//!  reliable packet - including stale ones, so a lost ACK cannot stall the sender.

pub mod addr;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod end_point;
pub mod packet_header;
pub mod seq;
pub mod test_util;
pub mod timer;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
