//! A server and one client in a single process over loopback UDP: the client
//! connects, receives its autonomous entity, drives it around, and the server
//! applies the updates to its authoritative world.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use distributed::client::DistributedObjectClient;
use distributed::object::DistributedObject;
use distributed::server::{DistributedObjectServer, ServerSystemEvent};
use distributed::test_util::{
    drop_orphaned_entities, spawn_autonomous_entity, Engine, EngineFactory, MasterObject, Vec3,
};
use transport::addr::Address;
use tracing::info;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let server_engine = Engine::new();
    let mut server = DistributedObjectServer::new(Rc::new(RefCell::new(MasterObject::default())));
    server.host(Address::from("127.0.0.1:8888"))?;

    let client_engine = Engine::new();
    let mut client = DistributedObjectClient::new(
        Rc::new(RefCell::new(MasterObject::default())),
        Box::new(EngineFactory { engine: client_engine.clone() }),
    );
    client.connect(Address::from("127.0.0.1:8888"))?;

    let started = Instant::now();
    let mut last_report = Instant::now();
    while started.elapsed() < Duration::from_secs(3) {
        for event in server.tick() {
            match event {
                ServerSystemEvent::ConnectionCreated(conn) => {
                    info!("server: {} joined, spawning its entity", conn);
                    spawn_autonomous_entity(&mut server, &server_engine, &conn);
                }
                ServerSystemEvent::ConnectionDeleted { conn, orphans } => {
                    info!("server: {} left, dropping {} entities", conn, orphans.len());
                    drop_orphaned_entities(&server_engine, &orphans);
                }
            }
        }
        client.tick();

        // the client drives its autonomous entity; the server is authoritative
        if let Some(entity) = client_engine.borrow().autonomous_entity() {
            let t = started.elapsed().as_secs_f64();
            let pos = Vec3::new(t.cos() * 10.0, 0.0, t.sin() * 10.0);
            entity.borrow_mut().set_physics(pos, t);
            client.invoke_remote_method(
                entity.borrow().id(),
                "Entity::UpdatePhysics",
                (pos, t, 0u64),
                false,
            );
        }

        if last_report.elapsed() > Duration::from_millis(500) {
            last_report = Instant::now();
            if let Some(entity) = server_engine.borrow().entities().first() {
                let pos = entity.borrow().position();
                info!(
                    "server world: entity {} at ({:.2}, {:.2}, {:.2}), rtt {:.2}ms",
                    entity.borrow().id(),
                    pos.x,
                    pos.y,
                    pos.z,
                    client.rtt_millis()
                );
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    client.shutdown();
    server.shutdown();
    info!("done");
    Ok(())
}
