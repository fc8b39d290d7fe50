//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p riptide_server -- [--bind 0.0.0.0:40000] [--config config.json]
//!
//! Console commands:
//!   status      - Show connected client count
//!   kick <id>   - Disconnect a client
//!   quit        - Shut down the server

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Context;
use riptide_core::prelude::*;
use riptide_core::transport::UdpTransport;
use tracing::{info, warn};

struct Args {
    bind: SocketAddr,
    config_path: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut bind: SocketAddr = "0.0.0.0:40000".parse().unwrap();
    let mut config_path = None;
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" if i + 1 < args.len() => {
                bind = args[i + 1].parse().context("--bind")?;
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { bind, config_path })
}

fn load_config(args: &Args) -> anyhow::Result<RiptideConfig> {
    match &args.config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).context("read config file")?;
            RiptideConfig::from_json_str(&text).context("parse config file")
        }
        None => Ok(RiptideConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let config = load_config(&args)?;
    let transport = UdpTransport::bind(args.bind).context("bind udp socket")?;
    let local = transport.local_addr();
    info!(?local, max_clients = config.max_client_count, "server listening");

    let mut server = Server::new(Box::new(transport), config);

    let (console_tx, console_rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.send(line).is_err() {
                break;
            }
        }
    });

    println!("riptide server ready. Type 'status' for info, 'quit' to exit.");

    let tick_interval = Duration::from_millis(16);
    let mut next_tick = Instant::now();
    'outer: loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                break 'outer;
            }
            for out in riptide_server::console::exec(&mut server, &line) {
                println!("{out}");
            }
        }

        server.tick();
        for event in server.poll_events() {
            match event {
                Event::ClientConnected { id } => info!(id, "client connected"),
                Event::ClientDisconnected { id, reason } => {
                    info!(id, ?reason, "client disconnected");
                }
                Event::Message(m) => {
                    // No handlers registered by default; a real host would
                    // dispatch through its own `HandlerRegistry` here.
                    let _ = m;
                }
                Event::ReliableDelivered { .. } | Event::NotifyDelivered { .. } | Event::NotifyLost { .. } => {}
                Event::UnknownSender { addr } => warn!(%addr, "datagram from unknown sender"),
                Event::ConnectionFailed => {}
                // The server never constructs these; they exist for the
                // client side of the shared `Event` enum.
                Event::PeerConnected { .. } | Event::PeerDisconnected { .. } => {}
            }
        }

        next_tick += tick_interval;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    Ok(())
}
