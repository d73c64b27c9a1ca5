//! Welcome-once bookkeeping: one peer id per line in `welcomed_peers.txt`.
//!
//! The set is persisted under its own lock so a crash between greeting and
//! persisting can at worst repeat one welcome.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct WelcomedPeers {
    path: PathBuf,
    inner: Mutex<HashSet<String>>,
}

impl WelcomedPeers {
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("welcomed_peers.txt");
        let mut set = HashSet::new();
        if let Ok(content) = std::fs::read_to_string(&path) {
            for line in content.lines() {
                let peer = line.trim();
                if !peer.is_empty() {
                    set.insert(peer.to_string());
                }
            }
        }
        Self {
            path,
            inner: Mutex::new(set),
        }
    }

    /// Mark a peer as welcomed. Returns true the first time, persisting
    /// the updated set before releasing the lock.
    pub fn mark(&self, peer: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.insert(peer.to_string()) {
            return false;
        }
        let mut lines: Vec<&str> = inner.iter().map(|s| s.as_str()).collect();
        lines.sort_unstable();
        let body = lines.join("\n") + "\n";
        if let Err(e) = std::fs::write(&self.path, body) {
            tracing::warn!("failed to persist welcomed peers: {}", e);
        }
        true
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.inner.lock().unwrap().contains(peer)
    }
}
