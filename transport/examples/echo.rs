//! A server and a client in one process, echoing a reliable payload back and forth.

use std::time::Duration;

use transport::addr::Address;
use transport::config::ProtocolConfig;
use transport::end_point::{Client, ClientEvent, Server, ServerEvent};
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut server = Server::new(ProtocolConfig::default());
    server.host(Address::from("127.0.0.1:8888"))?;

    let mut client = Client::new(ProtocolConfig::default());
    client.connect(Address::from("127.0.0.1:8888"))?;

    let mut round = 0u32;
    loop {
        for event in server.tick() {
            match event {
                ServerEvent::ConnectionEstablished(addr) => info!("server: {} connected", addr),
                ServerEvent::ConnectionClosed(addr) => info!("server: {} gone", addr),
                ServerEvent::Data { from, payload } => {
                    info!("server: echoing {} bytes back to {}", payload.len(), from);
                    server.send(&from, &payload, true);
                }
            }
        }

        for event in client.tick() {
            match event {
                ClientEvent::Connected => {
                    info!("client: connected, rtt probe running");
                    client.send(b"hello world", true);
                }
                ClientEvent::Data(payload) => {
                    round += 1;
                    info!(
                        "client: round {} - got {:?} back (rtt {:.2}ms)",
                        round,
                        std::str::from_utf8(&payload)?,
                        client.rtt_millis()
                    );
                    if round >= 5 {
                        client.shutdown();
                        server.shutdown();
                        return Ok(());
                    }
                    client.send(&payload, true);
                }
                ClientEvent::ConnectFailed | ClientEvent::ConnectionBroken => {
                    anyhow::bail!("connection lost");
                }
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
