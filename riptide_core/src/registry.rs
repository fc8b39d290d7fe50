//! Explicit handler registry keyed by a small integer message id, built by
//! the host application at startup (§9: re-architected away from the
//! reference protocol's reflection-based discovery).
//!
//! The core never calls into this by itself — `Server`/`Client::poll_events`
//! hands the host an [`crate::event::Event::Message`] to dispatch however it
//! likes. `HandlerRegistry` is offered as ambient convenience for hosts that
//! want the "table from id to callback" shape described in §4.5, with one
//! thing the reference protocol's reflection approach can't give you for
//! free: a handler that panics is isolated rather than taking the whole
//! dispatch loop down with it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::message::Message;

type Handler = Box<dyn FnMut(u16, &mut Message) + Send>;

/// Maps message id -> callback. `dispatch` logs and drops messages with no
/// registered handler instead of failing the caller.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for `id`.
    pub fn register<F>(&mut self, id: u16, handler: F)
    where
        F: FnMut(u16, &mut Message) + Send + 'static,
    {
        self.handlers.insert(id, Box::new(handler));
    }

    pub fn unregister(&mut self, id: u16) {
        self.handlers.remove(&id);
    }

    pub fn is_registered(&self, id: u16) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Dispatches `body` to the handler registered for `id`, if any. Returns
    /// `true` if a handler ran (whether or not it panicked). A panicking
    /// handler is caught and logged; it does not propagate.
    pub fn dispatch(&mut self, from: u16, id: u16, body: &mut Message) -> bool {
        let Some(handler) = self.handlers.get_mut(&id) else {
            warn!(from, id, "no handler registered for message id, dropping");
            return false;
        };
        if catch_unwind(AssertUnwindSafe(|| handler(from, body))).is_err() {
            warn!(from, id, "handler panicked, message dropped");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SendMode;

    #[test]
    fn dispatches_to_registered_handler() {
        let mut registry = HandlerRegistry::new();
        let mut seen = Vec::new();
        registry.register(1, move |from, _body| seen.push(from));
        let mut msg = Message::create(SendMode::Unreliable, 1).unwrap();
        assert!(registry.dispatch(7, 1, &mut msg));
    }

    #[test]
    fn unregistered_id_is_dropped_not_panicking() {
        let mut registry = HandlerRegistry::new();
        let mut msg = Message::create(SendMode::Unreliable, 1).unwrap();
        assert!(!registry.dispatch(7, 99, &mut msg));
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let mut registry = HandlerRegistry::new();
        registry.register(1, |_from, _body| panic!("boom"));
        let mut msg = Message::create(SendMode::Unreliable, 1).unwrap();
        assert!(registry.dispatch(7, 1, &mut msg));
        // A second dispatch still works: the registry itself is intact.
        registry.register(2, |_from, _body| {});
        assert!(registry.dispatch(7, 2, &mut msg));
    }
}
