//! Bounded duplicate suppression for inbound deliveries.
//!
//! The transport replays stored offline messages on reconnect, sometimes
//! more than once. The ring remembers the last 20,000 delivery fingerprints
//! (set + FIFO, oldest evicted); the stale-offline cutoff drops offline
//! replays older than five minutes before the sidecar started so agent
//! workflows aren't re-triggered by ancient messages.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Maximum fingerprints retained. Older entries may be accepted a second
/// time after eviction; bounded memory wins.
pub const RING_CAPACITY: usize = 20_000;

/// Offline messages older than this (relative to startup) are dropped.
pub const STALE_OFFLINE_SECS: i64 = 300;

/// Fingerprint of one inbound delivery, computed post-decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

/// Digest rule: full text up to 256 bytes, else first 192 bytes, the
/// length, and the last 48 bytes.
fn text_digest(text: &str) -> String {
    let bytes = text.as_bytes();
    if bytes.len() <= 256 {
        return text.to_string();
    }
    format!(
        "{}#{}#{}",
        String::from_utf8_lossy(&bytes[..192]),
        bytes.len(),
        String::from_utf8_lossy(&bytes[bytes.len() - 48..]),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn fingerprint(
    peer: &str,
    ts: i64,
    offline: bool,
    filename: &str,
    media_type: &str,
    size: u64,
    text: &str,
) -> Fingerprint {
    Fingerprint(format!(
        "{}|{}|{}|{}|{}|{}|{}",
        peer,
        ts,
        offline as u8,
        filename,
        media_type,
        size,
        text_digest(text),
    ))
}

/// True when an offline replay predates startup by more than the cutoff.
/// `ts` and `startup_ts` must share the transport's clock unit.
pub fn is_stale_offline(startup_ts: i64, ts: i64, offline: bool) -> bool {
    offline && startup_ts > 0 && ts > 0 && ts < startup_ts - STALE_OFFLINE_SECS
}

struct RingInner {
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
}

/// Set + FIFO of recent fingerprints. Fails silently; never surfaced.
pub struct DedupRing {
    inner: Mutex<RingInner>,
    capacity: usize,
}

impl DedupRing {
    pub fn new() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Record a fingerprint. Returns false when it was already present.
    pub fn remember(&self, fp: &Fingerprint) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.seen.contains(fp) {
            return false;
        }
        inner.seen.insert(fp.clone());
        inner.order.push_back(fp.clone());
        if inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        true
    }

    /// Current entry count (set and FIFO sizes always match).
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.seen.len(), inner.order.len());
        inner.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupRing {
    fn default() -> Self {
        Self::new()
    }
}
