//! Shared helpers for the tests in this crate: a small message vocabulary of the kind an
//!  application would define, and deadline-based polling for asynchronous effects.

use std::time::{Duration, Instant};

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum TestMsg {
    Ping,
    Shout,
    Relay,
    Payload,
}

/// Polls `condition` until it holds or the deadline passes. Scenario tests use this
///  instead of fixed sleeps: reactor threads make almost every observable effect
///  asynchronous.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
