//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p riptide_client -- [--bind 0.0.0.0:0] [--connect host:port]
//!
//! Console commands:
//!   connect <host:port> - Connect to a server
//!   disconnect          - Disconnect from the server
//!   status              - Show connection status
//!   say <message>       - Send a chat message over the unreliable channel
//!   quit                - Exit the client

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
    connect: Option<SocketAddr>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut bind: SocketAddr = "0.0.0.0:0".parse().unwrap();
    let mut connect = None;
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" if i + 1 < args.len() => {
                bind = args[i + 1].parse().context("--bind")?;
                i += 2;
            }
            "--connect" if i + 1 < args.len() => {
                connect = Some(args[i + 1].parse().context("--connect")?);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { bind, connect })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let transport = UdpTransport::bind(args.bind).context("bind udp socket")?;
    let local = transport.local_addr();
    info!(?local, "client bound");

    let mut client = Client::new(Box::new(transport), RiptideConfig::default());

    if let Some(remote) = args.connect {
        match client.connect(remote) {
            Ok(()) => info!(%remote, "connecting"),
            Err(e) => warn!(%remote, error = %e, "connect failed"),
        }
    }

    // Stdin reader thread feeds console lines into a channel; the main
    // thread stays the only one driving `client.tick()`.
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

    println!("riptide client ready. Type 'status' for info, 'quit' to exit.");

    let tick_interval = Duration::from_millis(16);
    let mut next_tick = Instant::now();
    'outer: loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                break 'outer;
            }
            for out in riptide_client::exec(&mut client, &line) {
                println!("{out}");
            }
        }

        client.tick();
        for event in client.poll_events() {
            match event {
                Event::ClientConnected { id } => println!("connected, assigned id {id}"),
                Event::ClientDisconnected { reason, .. } => {
                    println!("disconnected: {reason:?}");
                }
                Event::ConnectionFailed => println!("connection attempt failed"),
                Event::PeerConnected { id } => println!("peer {id} joined"),
                Event::PeerDisconnected { id } => println!("peer {id} left"),
                Event::Message(m) => {
                    if m.id == riptide_client::console::CHAT_MESSAGE_ID {
                        let mut body = m.body;
                        if let Ok(text) = body.get_string() {
                            println!("[chat] {text}");
                        }
                    }
                }
                Event::ReliableDelivered { .. } | Event::NotifyDelivered { .. } | Event::NotifyLost { .. } => {}
                Event::UnknownSender { .. } => {}
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
