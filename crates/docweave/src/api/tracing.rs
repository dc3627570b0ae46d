//! Correlation identifiers.
//!
//! Run trace ids, per-round span ids, and bridge call ids all come from one
//! process-wide time + counter generator, so ids are unique across sessions
//! without any coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_stamp() -> (u128, u64) {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // The counter disambiguates calls within the same clock tick.
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    (ts, count)
}

/// Generate a unique trace ID for a session turn.
pub fn generate_trace_id() -> String {
    let (ts, count) = next_stamp();
    format!("tr-{ts:x}-{count:04x}")
}

/// Generate a correlation id for a host-bound tool call.
pub fn generate_call_id() -> String {
    let (ts, count) = next_stamp();
    format!("call-{ts:x}-{count:04x}")
}

/// Generate a span ID for a round within a turn.
pub fn generate_span_id(trace_id: &str, round: u32) -> String {
    format!("{trace_id}:r{round}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn trace_id_unique() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert_ne!(a, b);
        assert!(a.starts_with("tr-"));
    }

    #[test]
    fn call_ids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..250).map(|_| generate_call_id()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn span_id_includes_round() {
        assert_eq!(generate_span_id("tr-1", 3), "tr-1:r3");
    }
}
