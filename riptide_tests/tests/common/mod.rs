//! Shared helpers for driving a `Server`/`Client` pair over `SimNetwork`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use riptide_core::prelude::*;
use riptide_core::transport::sim::SimNetwork;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

pub fn new_pair(
    seed: u64,
    loss_rate: f64,
    jitter: Duration,
    server_port: u16,
    client_port: u16,
    config: RiptideConfig,
) -> (Server, Client, SocketAddr) {
    let net = SimNetwork::new(seed, loss_rate, jitter);
    let server_addr = addr(server_port);
    let server = Server::new(Box::new(net.endpoint(server_addr)), config.clone());
    let client = Client::new(Box::new(net.endpoint(addr(client_port))), config);
    (server, client, server_addr)
}

/// Builds one server plus `n` clients, all sharing a single simulated
/// network so every client can actually reach the server.
pub fn new_group(
    seed: u64,
    loss_rate: f64,
    jitter: Duration,
    server_port: u16,
    client_base_port: u16,
    n: u16,
    config: RiptideConfig,
) -> (Server, Vec<Client>, SocketAddr) {
    let net = SimNetwork::new(seed, loss_rate, jitter);
    let server_addr = addr(server_port);
    let server = Server::new(Box::new(net.endpoint(server_addr)), config.clone());
    let clients = (0..n)
        .map(|i| Client::new(Box::new(net.endpoint(addr(client_base_port + i))), config.clone()))
        .collect();
    (server, clients, server_addr)
}

/// Ticks `server` and `client` in lockstep, draining events through `on_event`,
/// until `done` returns true or `timeout` elapses. Returns whether `done` was
/// satisfied before timing out.
pub fn pump(
    server: &mut Server,
    client: &mut Client,
    timeout: Duration,
    mut on_server_event: impl FnMut(Event),
    mut on_client_event: impl FnMut(Event),
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        server.tick();
        client.tick();
        for e in server.poll_events() {
            on_server_event(e);
        }
        for e in client.poll_events() {
            on_client_event(e);
        }
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
