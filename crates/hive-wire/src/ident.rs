//! Correlation-id generation.
//!
//! A call id is `base36(now_ms)-<16 random hex chars>`: sortable by creation
//! time, unique enough for in-flight correlation. Spawn, monitor, and link
//! ids share the format with a single-letter prefix so log lines identify
//! the id's role at a glance.

use std::time::{SystemTime, UNIX_EPOCH};

/// A fresh call correlation id.
pub fn call_id() -> String {
    format!("{}-{}", base36(now_ms()), random_hex16())
}

/// A fresh spawn correlation id (`s` prefix).
pub fn spawn_id() -> String {
    format!("s{}", call_id())
}

/// A fresh monitor id (`m` prefix).
pub fn monitor_id() -> String {
    format!("m{}", call_id())
}

/// A fresh link id (`l` prefix).
pub fn link_id() -> String {
    format!("l{}", call_id())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn random_hex16() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

const BASE36_DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE36_DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
