//! Stdin console commands for the reference server binary.

use riptide_core::prelude::*;

/// Executes one console line against `server`, returning the lines to print.
pub fn exec(server: &mut Server, line: &str) -> Vec<String> {
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "status" => vec![format!("{} client(s) connected", server.connection_count())],
        "kick" => match rest.parse::<u16>() {
            Ok(id) => {
                if server.is_connected(id) {
                    server.disconnect_client(id, "kicked by console");
                    vec![format!("kicked {id}")]
                } else {
                    vec![format!("no such client {id}")]
                }
            }
            Err(_) => vec![format!("usage: kick <id>, got {rest:?}")],
        },
        "" => Vec::new(),
        other => vec![format!("unknown command: {other}")],
    }
}
