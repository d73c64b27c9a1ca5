//! Friend state mirror and presence tracker.
//!
//! Consumes the transport's friend callbacks, keeps the in-memory friend
//! map, and projects equality-detected changes to `friend_state.tsv`, the
//! human-readable `friend_events.log`, and the optional SQLite sink.
//! Connection changes are annotated with a best-effort IP + location.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::events::StatusCounters;
use crate::geo::GeoProbe;
use crate::state::db::FriendDb;
use crate::transport::FriendInfo;

pub struct FriendRegistry {
    state: Mutex<HashMap<String, FriendInfo>>,
    tsv_path: PathBuf,
    log_path: PathBuf,
    db: Option<FriendDb>,
    geo: Arc<GeoProbe>,
    counters: Arc<StatusCounters>,
}

impl FriendRegistry {
    pub fn new(
        data_dir: &Path,
        db: Option<FriendDb>,
        geo: Arc<GeoProbe>,
        counters: Arc<StatusCounters>,
    ) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            tsv_path: data_dir.join("friend_state.tsv"),
            log_path: data_dir.join("friend_events.log"),
            db,
            geo,
            counters,
        }
    }

    pub fn is_online(&self, peer: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.get(peer).map(|f| f.status == 1).unwrap_or(false)
    }

    pub fn get(&self, peer: &str) -> Option<FriendInfo> {
        self.state.lock().unwrap().get(peer).cloned()
    }

    /// Online/offline transition. Always emits a friend event; the state
    /// file is rewritten only when the record actually changed.
    pub fn friend_connection(&self, peer: &str, online: bool) {
        let status = if online { 1 } else { 0 };
        let changed = {
            let mut state = self.state.lock().unwrap();
            let entry = state.entry(peer.to_string()).or_insert_with(|| FriendInfo {
                friendid: peer.to_string(),
                ..FriendInfo::default()
            });
            let changed = entry.status != status;
            entry.status = status;
            changed
        };

        self.counters
            .note_connection(peer, online, chrono::Utc::now().timestamp());

        let (ip, location) = self.geo.annotate(peer);
        let event = if online { "online" } else { "offline" };
        self.log_event(peer, event, &ip, &location, "");
        if let Some(db) = &self.db {
            if let Err(e) = db.record_event(peer, event, &ip, &location, "") {
                tracing::warn!("friend event projection failed: {}", e);
            }
        }
        if changed {
            self.persist();
            self.project(peer);
        }
    }

    /// Presence change. Silent: no event, just state.
    pub fn friend_presence(&self, peer: &str, presence: i32) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let entry = state.entry(peer.to_string()).or_insert_with(|| FriendInfo {
                friendid: peer.to_string(),
                ..FriendInfo::default()
            });
            let changed = entry.presence != presence;
            entry.presence = presence;
            changed
        };
        if changed {
            self.persist();
            self.project(peer);
        }
    }

    /// Full record upsert from `friend_info` / `friend_added` /
    /// `friend_list`. A history row is emitted on any field change.
    pub fn upsert(&self, info: &FriendInfo) {
        if info.friendid.is_empty() {
            return;
        }
        let changed = {
            let mut state = self.state.lock().unwrap();
            match state.get(&info.friendid) {
                Some(existing) if existing == info => false,
                _ => {
                    state.insert(info.friendid.clone(), info.clone());
                    true
                }
            }
        };
        if changed {
            self.log_event(
                &info.friendid,
                "updated",
                "",
                "",
                &format!("name={} status={}", info.name, info.status),
            );
            self.persist();
            self.project(&info.friendid);
        }
    }

    /// All friends, sorted by id.
    pub fn snapshot(&self) -> Vec<FriendInfo> {
        let state = self.state.lock().unwrap();
        let mut friends: Vec<FriendInfo> = state.values().cloned().collect();
        friends.sort_by(|a, b| a.friendid.cmp(&b.friendid));
        friends
    }

    /// Rewrite the TSV mirror. The snapshot is taken under the lock; the
    /// write happens outside it.
    fn persist(&self) {
        let friends = self.snapshot();
        let mut body = String::new();
        for f in &friends {
            body.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                f.friendid,
                f.name,
                f.gender,
                f.phone,
                f.email,
                f.description,
                f.region,
                f.label,
                f.status,
                f.presence,
            ));
        }
        if let Err(e) = std::fs::write(&self.tsv_path, body) {
            tracing::warn!("failed to write friend state: {}", e);
        }
    }

    fn project(&self, peer: &str) {
        if let Some(db) = &self.db {
            if let Some(info) = self.get(peer) {
                if let Err(e) = db.upsert_friend(&info) {
                    tracing::warn!("friend state projection failed: {}", e);
                }
            }
        }
    }

    fn log_event(&self, peer: &str, event: &str, ip: &str, location: &str, detail: &str) {
        use std::io::Write;
        let mut line = format!("{} {} {}", chrono::Utc::now().to_rfc3339(), peer, event);
        if !ip.is_empty() {
            line.push_str(&format!(" ip={} loc={}", ip, location));
        }
        if !detail.is_empty() {
            line.push_str(&format!(" {}", detail));
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            tracing::warn!("failed to append friend event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> FriendRegistry {
        FriendRegistry::new(
            dir,
            None,
            Arc::new(GeoProbe::disabled()),
            Arc::new(StatusCounters::new()),
        )
    }

    fn log_lines(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("friend_events.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_connection_tracks_status() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());

        assert!(!reg.is_online("P1"));
        reg.friend_connection("P1", true);
        assert!(reg.is_online("P1"));
        reg.friend_connection("P1", false);
        assert!(!reg.is_online("P1"));

        let lines = log_lines(dir.path());
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("P1 online"));
        assert!(lines[1].contains("P1 offline"));
    }

    #[test]
    fn test_tsv_has_ten_fields() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.upsert(&FriendInfo {
            friendid: "P1".into(),
            name: "alice".into(),
            region: "eu".into(),
            status: 1,
            presence: 2,
            ..FriendInfo::default()
        });

        let tsv = std::fs::read_to_string(dir.path().join("friend_state.tsv")).unwrap();
        let fields: Vec<&str> = tsv.lines().next().unwrap().split('\t').collect();
        assert_eq!(fields.len(), 10);
        assert_eq!(fields[0], "P1");
        assert_eq!(fields[1], "alice");
        assert_eq!(fields[8], "1");
        assert_eq!(fields[9], "2");
    }

    #[test]
    fn test_upsert_equality_gated() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let info = FriendInfo {
            friendid: "P1".into(),
            name: "alice".into(),
            ..FriendInfo::default()
        };

        reg.upsert(&info);
        reg.upsert(&info); // identical: no new history row
        assert_eq!(log_lines(dir.path()).len(), 1);

        let renamed = FriendInfo {
            name: "alicia".into(),
            ..info
        };
        reg.upsert(&renamed);
        assert_eq!(log_lines(dir.path()).len(), 2);
        assert_eq!(reg.get("P1").unwrap().name, "alicia");
    }

    #[test]
    fn test_presence_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.friend_presence("P1", 1);
        assert!(log_lines(dir.path()).is_empty());
        assert_eq!(reg.get("P1").unwrap().presence, 1);
    }

    #[test]
    fn test_counters_updated_on_connection() {
        let dir = tempfile::tempdir().unwrap();
        let counters = Arc::new(StatusCounters::new());
        let reg = FriendRegistry::new(
            dir.path(),
            None,
            Arc::new(GeoProbe::disabled()),
            counters.clone(),
        );
        reg.friend_connection("P1", true);
        reg.friend_connection("P2", true);
        reg.friend_connection("P1", false);

        let snap = counters.snapshot();
        assert_eq!(snap.online_count, 2);
        assert_eq!(snap.offline_count, 1);
        assert_eq!(snap.last_peer, "P1");
    }

    #[test]
    fn test_sqlite_projection() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("friends.db");
        let db = FriendDb::open(&db_path).unwrap();
        let reg = FriendRegistry::new(
            dir.path(),
            Some(db),
            Arc::new(GeoProbe::disabled()),
            Arc::new(StatusCounters::new()),
        );
        reg.friend_connection("P1", true);

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let status: i64 = conn
            .query_row(
                "SELECT status FROM friend_state WHERE friendid='P1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, 1);
        let events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM friend_events WHERE peer='P1' AND event='online'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(events, 1);
    }
}
