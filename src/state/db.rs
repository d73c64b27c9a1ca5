//! Optional SQLite projection of friend state and friend events.
//!
//! Enabled by `sqlitePath` in `beagle_db.json`; the core behaves
//! identically with the sink disabled. Rows are written only on
//! equality-detected changes, so the projection mirrors the in-memory
//! friend map rather than every callback.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Deserialize;

use crate::transport::FriendInfo;

/// `beagle_db.json`: projection sink and crawler-index configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbConfig {
    pub sqlite_path: String,
    pub crawler_url: String,
    pub crawler_path: String,
    pub crawler_refresh_seconds: u64,
}

impl DbConfig {
    /// Load `beagle_db.json`, defaulting to everything disabled.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("beagle_db.json");
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("corrupt db config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// SQLite sink for friend state and history rows.
pub struct FriendDb {
    conn: Mutex<Connection>,
}

impl FriendDb {
    /// Open (or create) the projection database with WAL mode.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating DB directory: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("opening SQLite DB: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS friend_state (
                friendid TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                gender TEXT NOT NULL DEFAULT '',
                phone TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                region TEXT NOT NULL DEFAULT '',
                label TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL DEFAULT 0,
                presence INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS friend_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at TEXT NOT NULL,
                peer TEXT NOT NULL,
                event TEXT NOT NULL,
                ip TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                detail TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_friend_events_peer
            ON friend_events(peer, at);",
        )?;

        tracing::debug!("opened friend projection DB: {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_friend(&self, info: &FriendInfo) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO friend_state
                (friendid, name, gender, phone, email, description, region, label, status, presence, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(friendid) DO UPDATE SET
                name=?2, gender=?3, phone=?4, email=?5, description=?6,
                region=?7, label=?8, status=?9, presence=?10, last_updated=?11",
            rusqlite::params![
                info.friendid,
                info.name,
                info.gender,
                info.phone,
                info.email,
                info.description,
                info.region,
                info.label,
                info.status as i64,
                info.presence as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn record_event(
        &self,
        peer: &str,
        event: &str,
        ip: &str,
        location: &str,
        detail: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO friend_events (at, peer, event, ip, location, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                chrono::Utc::now().to_rfc3339(),
                peer,
                event,
                ip,
                location,
                detail,
            ],
        )?;
        Ok(())
    }

    /// Open the sink named by config, if any. Open errors disable the
    /// projection rather than failing startup.
    pub fn from_config(config: &DbConfig) -> Option<Self> {
        if config.sqlite_path.is_empty() {
            return None;
        }
        match Self::open(&PathBuf::from(&config.sqlite_path)) {
            Ok(db) => Some(db),
            Err(e) => {
                tracing::warn!("friend projection disabled: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, status: u8) -> FriendInfo {
        FriendInfo {
            friendid: id.to_string(),
            name: "n".into(),
            status,
            ..FriendInfo::default()
        }
    }

    #[test]
    fn test_open_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db = FriendDb::open(&dir.path().join("friends.db")).unwrap();

        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('friend_state', 'friend_events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_upsert_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let db = FriendDb::open(&dir.path().join("friends.db")).unwrap();

        db.upsert_friend(&sample("f1", 0)).unwrap();
        db.upsert_friend(&sample("f1", 1)).unwrap();

        let conn = db.conn.lock().unwrap();
        let (rows, status): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(status) FROM friend_state WHERE friendid='f1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(status, 1);
    }

    #[test]
    fn test_record_event() {
        let dir = tempfile::tempdir().unwrap();
        let db = FriendDb::open(&dir.path().join("friends.db")).unwrap();

        db.record_event("f1", "online", "8.8.8.8", "public-network", "")
            .unwrap();

        let conn = db.conn.lock().unwrap();
        let event: String = conn
            .query_row(
                "SELECT event FROM friend_events WHERE peer='f1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(event, "online");
    }

    #[test]
    fn test_db_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DbConfig::load(dir.path());
        assert!(config.sqlite_path.is_empty());
        assert!(FriendDb::from_config(&config).is_none());

        std::fs::write(
            dir.path().join("beagle_db.json"),
            r#"{"sqlitePath":"","crawlerUrl":"http://idx.example/peers","crawlerRefreshSeconds":30}"#,
        )
        .unwrap();
        let config = DbConfig::load(dir.path());
        assert_eq!(config.crawler_url, "http://idx.example/peers");
        assert_eq!(config.crawler_refresh_seconds, 30);
    }
}
