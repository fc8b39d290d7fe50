//! Quality disconnect (spec.md §8 scenario): repeated reliable send failures
//! push the smoothed average attempt count over the quality threshold and
//! the connection is torn down locally with `PoorConnection`.

mod common;

use std::time::{Duration, Instant};

use common::addr;
use riptide_core::prelude::*;
use riptide_core::transport::sim::SimNetwork;

const PAYLOAD_ID: u16 = 55;

#[test]
fn repeated_reliable_exhaustion_triggers_poor_connection() {
    let net = SimNetwork::new(500, 0.0, Duration::ZERO);
    let server_addr = addr(7401);
    let config = RiptideConfig {
        max_client_count: 4,
        // Long enough that the unrelated timeout path never preempts this
        // test: once the network goes fully lossy even heartbeats stop
        // arriving, but quality should fire first.
        timeout_ms: 120_000,
        ..RiptideConfig::default()
    };
    let mut server = Server::new(Box::new(net.endpoint(server_addr)), config.clone());
    let mut client = Client::new(Box::new(net.endpoint(addr(8401))), config);

    client.connect(server_addr).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while client.connection_id().is_none() && Instant::now() < deadline {
        server.tick();
        client.tick();
        server.poll_events();
        client.poll_events();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(client.connection_id().is_some(), "handshake did not complete");

    // Degrade the network to total loss, then keep trying to push reliable
    // traffic so every send exhausts `max_send_attempts`.
    net.set_loss_rate(1.0);

    let mut next_send = 0u32;
    let mut saw_poor_connection = false;
    let deadline = Instant::now() + Duration::from_secs(30);
    while !saw_poor_connection && Instant::now() < deadline {
        if client.is_connected() {
            let mut msg = Message::create(SendMode::Reliable, PAYLOAD_ID).unwrap();
            msg.add_u32(next_send).unwrap();
            next_send += 1;
            let _ = client.send(msg);
        }

        server.tick();
        client.tick();
        server.poll_events();
        for e in client.poll_events() {
            if let Event::ClientDisconnected { reason: DisconnectReason::PoorConnection, .. } = e {
                saw_poor_connection = true;
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(saw_poor_connection, "client never disconnected for poor connection quality");
    assert!(!client.is_connected());
}
