//! Wall-clock source for `last_access` bookkeeping.
//!
//! The engine treats `ttl`/`timestamp` as opaque values supplied by the
//! caller, but `last_access` is stamped by the engine itself on every `put`
//! and successful `get`, so it needs its own clock.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_nanos() as i64
}
