//! Stdin console commands for the reference client binary.

use std::net::SocketAddr;

use riptide_core::prelude::*;

/// Message id used for the plaintext chat demo carried over an unreliable
/// channel. Arbitrary — a real host would keep its own id table.
pub const CHAT_MESSAGE_ID: u16 = 1;

/// Executes one console line against `client`, returning the lines to print.
pub fn exec(client: &mut Client, line: &str) -> Vec<String> {
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "connect" => match rest.parse::<SocketAddr>() {
            Ok(addr) => match client.connect(addr) {
                Ok(()) => vec![format!("connecting to {addr}")],
                Err(e) => vec![format!("connect failed: {e}")],
            },
            Err(_) => vec![format!("usage: connect <host:port>, got {rest:?}")],
        },
        "disconnect" => {
            client.disconnect();
            vec!["disconnected".into()]
        }
        "status" => vec![status_line(client)],
        "say" => {
            if !client.is_connected() {
                return vec!["not connected".into()];
            }
            match build_chat_message(rest) {
                Ok(msg) => match client.send(msg) {
                    Ok(()) => vec![format!("sent: {rest}")],
                    Err(e) => vec![format!("send failed: {e}")],
                },
                Err(e) => vec![format!("message too long: {e}")],
            }
        }
        "" => Vec::new(),
        other => vec![format!("unknown command: {other}")],
    }
}

fn status_line(client: &Client) -> String {
    if let Some(id) = client.connection_id() {
        format!(
            "connected as id {id}, remote {}",
            client.remote_addr().map(|a| a.to_string()).unwrap_or_default()
        )
    } else if client.is_connected() {
        "connecting".into()
    } else {
        "not connected".into()
    }
}

fn build_chat_message(text: &str) -> Result<Message> {
    let mut msg = Message::create(SendMode::Unreliable, CHAT_MESSAGE_ID)?;
    msg.add_string(text)?;
    Ok(msg)
}
