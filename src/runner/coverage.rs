//! Process-global coverage signal.
//!
//! Instrumented targets mark edges via [`hit`]; the worker reads the
//! accumulated signal via [`observed`] immediately after each execution.
//! The value is opaque to the manager: it only ever compares it with
//! strict greater-than against the campaign total. The count of distinct
//! edges ever hit is monotone within the worker process, so an execution
//! that touches unseen code is exactly an execution whose signal exceeds
//! the previous total.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;

pub const MAP_SIZE: usize = 1 << 16;

lazy_static! {
    static ref EDGE_MAP: Mutex<Box<[bool]>> = Mutex::new(vec![false; MAP_SIZE].into_boxed_slice());
}

static OBSERVED: AtomicU64 = AtomicU64::new(0);

/// Marks an edge as exercised. Ids beyond the map size wrap.
pub fn hit(edge: usize) {
    if mark(edge % MAP_SIZE) {
        OBSERVED.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sets the map slot, returning whether it was previously unset.
fn mark(idx: usize) -> bool {
    let mut map = EDGE_MAP.lock().unwrap_or_else(|e| e.into_inner());
    if map[idx] {
        return false;
    }
    map[idx] = true;
    true
}

/// The coverage signal: distinct edges observed so far in this process.
pub fn observed() -> u64 {
    OBSERVED.load(Ordering::Relaxed)
}
