use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;

/// Outgoing message counter of a session.
///
/// Starts at a random value in range 1..=2^28 so that counters of a new session
/// do not collide with counters of previous sessions using the same key.
#[derive(Debug)]
pub struct LocalMessageCounter {
    next: AtomicU32,
}

impl LocalMessageCounter {
    const RANDOM_INIT_MASK: u32 = 0x0fff_ffff;

    pub fn new() -> Self {
        Self::with_value((rand::random::<u32>() & Self::RANDOM_INIT_MASK) + 1)
    }

    pub fn with_value(value: u32) -> Self {
        Self {
            next: AtomicU32::new(value),
        }
    }

    /// Counter the next outgoing message will carry.
    pub fn value(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    /// Take the next counter value.
    ///
    /// Fails once the counter space is used up; the session then has to be
    /// established again with new keys.
    pub fn advance(&self) -> Result<u32> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(1))
            .map_err(|_| anyhow::anyhow!("message counter exhausted"))
    }
}

impl Default for LocalMessageCounter {
    fn default() -> Self {
        Self::new()
    }
}
