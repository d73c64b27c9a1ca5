//! Per-peer outbound payload preference cache.
//!
//! The inbound router records which wire format a peer last sent us; the
//! dispatcher steers `auto` sends toward it. In-memory only, never
//! persisted.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::WireFormat;

pub struct PeerPrefs {
    inner: Mutex<HashMap<String, WireFormat>>,
}

impl PeerPrefs {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record the format of a successfully decoded inbound media payload.
    pub fn learn(&self, peer: &str, format: WireFormat) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(peer.to_string(), format);
    }

    pub fn hint(&self, peer: &str) -> Option<WireFormat> {
        let inner = self.inner.lock().unwrap();
        inner.get(peer).copied()
    }

    /// Whether the peer has shown it speaks an inline JSON dialect.
    pub fn prefers_inline(&self, peer: &str) -> bool {
        matches!(
            self.hint(peer),
            Some(WireFormat::InlineJson) | Some(WireFormat::SwiftJson)
        )
    }
}

impl Default for PeerPrefs {
    fn default() -> Self {
        Self::new()
    }
}
