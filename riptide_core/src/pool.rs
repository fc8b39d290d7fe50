//! Process-wide message pool.
//!
//! Acquisition is protected by a `Mutex`; the critical section is O(1) (a
//! `Vec::pop`/`Vec::push` of a pre-allocated byte buffer, no allocation on
//! the common path). Capacity grows by a fixed increment whenever a
//! [`crate::server::Server`] or [`crate::client::Client`] starts, and
//! shrinks symmetrically when it stops.
//!
//! A released [`Message`] cannot be read or written again: `release` takes
//! it by value, so the type system rules out use-after-release and
//! double-release outright — there is no runtime "already released" flag to
//! get wrong.

use std::sync::{Mutex, OnceLock};

use crate::message::{Message, SendMode, MAX_MESSAGE_SIZE};

/// Buffers added to (or removed from) the pool each time a peer starts (or
/// stops).
const GROWTH_INCREMENT: usize = 64;

struct PoolState {
    free: Vec<Box<[u8]>>,
}

fn pool() -> &'static Mutex<PoolState> {
    static POOL: OnceLock<Mutex<PoolState>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(PoolState { free: Vec::new() }))
}

/// Handle to the process-wide message pool.
pub struct Pool;

impl Pool {
    /// Adds `GROWTH_INCREMENT` fresh buffers to the free list. Called once
    /// per peer (`Server`/`Client`) on construction.
    pub fn grow() {
        let mut state = pool().lock().unwrap();
        for _ in 0..GROWTH_INCREMENT {
            state.free.push(vec![0u8; MAX_MESSAGE_SIZE].into_boxed_slice());
        }
    }

    /// Removes up to `GROWTH_INCREMENT` buffers from the free list. Called
    /// once per peer on shutdown. It is fine for this to remove fewer than
    /// `GROWTH_INCREMENT` if messages are still checked out.
    pub fn shrink() {
        let mut state = pool().lock().unwrap();
        let n = GROWTH_INCREMENT.min(state.free.len());
        state.free.truncate(state.free.len() - n);
    }

    /// Checks out a raw (headerless) message, reusing a pooled buffer when
    /// one is available.
    pub fn acquire_raw() -> Message {
        let buf = {
            let mut state = pool().lock().unwrap();
            state.free.pop()
        };
        match buf {
            Some(buf) => Message::from_pooled_buffer(buf),
            None => Message::create_raw(),
        }
    }

    /// Checks out a message with its header (and, for reliable/notify,
    /// sequence framing) already written.
    pub fn acquire(mode: SendMode, id: u16) -> crate::error::Result<Message> {
        let mut msg = Pool::acquire_raw();
        msg.reset_for(mode, id)?;
        Ok(msg)
    }

    /// Returns a message's backing buffer to the free list.
    pub fn release(msg: Message) {
        let mut state = pool().lock().unwrap();
        state.free.push(msg.into_buffer());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused() {
        Pool::grow();
        let msg = Pool::acquire(SendMode::Unreliable, 1).unwrap();
        Pool::release(msg);
        let msg2 = Pool::acquire(SendMode::Unreliable, 1).unwrap();
        // No residual bytes should be readable beyond the new write cursor.
        assert_eq!(msg2.write_bits_len(), 8 + 16);
        Pool::shrink();
    }
}
