//! `riptide_server`
//!
//! Thin console driver around [`riptide_core::server::Server`]. Owns no
//! protocol logic of its own — it wires a real [`riptide_core::transport::UdpTransport`]
//! to the core's synchronous `tick()` loop and exposes a stdin console for
//! manual testing.

pub mod console;
