//! Kick (spec.md §8 scenario).

mod common;

use std::time::Duration;

use common::new_group;
use riptide_core::prelude::*;

#[test]
fn kicked_client_is_notified_and_id_is_freed() {
    let config = RiptideConfig { max_client_count: 4, ..RiptideConfig::default() };
    let (mut server, mut clients, server_addr) = new_group(400, 0.0, Duration::ZERO, 7301, 8301, 2, config);
    let mut victim = clients.remove(0);
    let mut bystander = clients.remove(0);

    victim.connect(server_addr).unwrap();
    bystander.connect(server_addr).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while (victim.connection_id().is_none() || bystander.connection_id().is_none())
        && std::time::Instant::now() < deadline
    {
        server.tick();
        victim.tick();
        bystander.tick();
        server.poll_events();
        victim.poll_events();
        bystander.poll_events();
        std::thread::sleep(Duration::from_millis(2));
    }
    let victim_id = victim.connection_id().expect("victim never connected");
    assert_eq!(server.connection_count(), 2);

    server.disconnect_client(victim_id, "cheating");

    let mut victim_kicked = false;
    let mut bystander_saw_disconnect = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while (!victim_kicked || !bystander_saw_disconnect) && std::time::Instant::now() < deadline {
        server.tick();
        victim.tick();
        bystander.tick();
        server.poll_events();
        for e in victim.poll_events() {
            if let Event::ClientDisconnected { reason: DisconnectReason::Kicked(Some(msg)), .. } = e {
                assert_eq!(msg, "cheating");
                victim_kicked = true;
            }
        }
        for e in bystander.poll_events() {
            if let Event::PeerDisconnected { id } = e {
                assert_eq!(id, victim_id);
                bystander_saw_disconnect = true;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(victim_kicked, "kicked client never observed Disconnected{{Kicked}}");
    assert!(bystander_saw_disconnect, "bystander never observed the peer leaving");
    assert!(!server.is_connected(victim_id));
    assert_eq!(server.connection_count(), 1);
}
