//! Process-unique identifiers for queue entries and offloaded results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Monotonic id source for [`QueueEntry`](crate::queue::QueueEntry) ids.
static ENTRY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Next queue entry id. Strictly increasing for the life of the process.
pub fn next_entry_id() -> u64 {
    ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Generate a unique reference id for an offloaded tool result.
pub fn generate_reference_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Counter disambiguates calls within the same clock tick.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ref-{ts:x}-{count:04x}")
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
