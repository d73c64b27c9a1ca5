//! Normalized inbound events, the poll-and-drain queue, the router audit
//! log, and the status counters backing `GET /status`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Normalized inbound event, drained by `GET /events`. Wire keys are
/// camelCase; empty fields are omitted.
///
/// Invariant: when `media_path` is set, `text` is empty and `filename` is a
/// sanitized leaf name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IncomingMessage {
    pub peer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(rename = "mediaUrl", skip_serializing_if = "String::is_empty")]
    pub media_url: String,
    #[serde(rename = "mediaPath", skip_serializing_if = "String::is_empty")]
    pub media_path: String,
    #[serde(rename = "mediaType", skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub size: u64,
    #[serde(rename = "msgId", skip_serializing_if = "String::is_empty")]
    pub msg_id: String,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub ts: i64,
}

/// Queue of events awaiting an upstream poll. Drained in delivery order;
/// not durable across restarts.
pub struct EventQueue {
    inner: Mutex<Vec<IncomingMessage>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, event: IncomingMessage) {
        self.inner.lock().unwrap().push(event);
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<IncomingMessage> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Router verdict for one inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Forwarded,
    SkippedReplay,
    DroppedStaleOffline,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Forwarded => "forwarded",
            AuditAction::SkippedReplay => "skipped_replay",
            AuditAction::DroppedStaleOffline => "dropped_stale_offline",
        }
    }
}

/// Append-only JSONL audit trail of router decisions
/// (`incoming_events.jsonl` under the data dir).
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Best effort: a failed audit write never blocks delivery.
    pub fn record(&self, action: AuditAction, peer: &str, ts: i64, offline: bool, detail: &str) {
        let line = serde_json::json!({
            "at": chrono::Utc::now().to_rfc3339(),
            "action": action.as_str(),
            "peer": peer,
            "msgTs": ts,
            "offline": offline,
            "detail": detail,
        });
        if let Err(e) = append_line(&self.path, &line.to_string()) {
            tracing::warn!("audit log write failed: {}", e);
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line)
}

/// Counters behind `GET /status`, updated by the inbound router and the
/// presence tracker.
pub struct StatusCounters {
    inner: Mutex<CountersInner>,
}

#[derive(Default)]
struct CountersInner {
    last_peer: String,
    last_online_ts: i64,
    last_offline_ts: i64,
    online_count: u64,
    offline_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    #[serde(rename = "lastPeer")]
    pub last_peer: String,
    #[serde(rename = "lastOnlineTs")]
    pub last_online_ts: i64,
    #[serde(rename = "lastOfflineTs")]
    pub last_offline_ts: i64,
    #[serde(rename = "onlineCount")]
    pub online_count: u64,
    #[serde(rename = "offlineCount")]
    pub offline_count: u64,
}

impl StatusCounters {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CountersInner::default()),
        }
    }

    pub fn note_peer(&self, peer: &str) {
        self.inner.lock().unwrap().last_peer = peer.to_string();
    }

    pub fn note_connection(&self, peer: &str, online: bool, ts: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_peer = peer.to_string();
        if online {
            inner.online_count += 1;
            inner.last_online_ts = ts;
        } else {
            inner.offline_count += 1;
            inner.last_offline_ts = ts;
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.lock().unwrap();
        StatusSnapshot {
            last_peer: inner.last_peer.clone(),
            last_online_ts: inner.last_online_ts,
            last_offline_ts: inner.last_offline_ts,
            online_count: inner.online_count,
            offline_count: inner.offline_count,
        }
    }
}

impl Default for StatusCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let ev = IncomingMessage {
            peer: "P1".into(),
            text: "hi".into(),
            ..IncomingMessage::default()
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["peer"], "P1");
        assert_eq!(json["text"], "hi");
        // Empty and zero fields are omitted entirely.
        assert!(json.get("mediaPath").is_none());
        assert!(json.get("size").is_none());
        assert!(json.get("ts").is_none());
    }

    #[test]
    fn test_event_media_keys_camel_case() {
        let ev = IncomingMessage {
            peer: "P1".into(),
            media_path: "/tmp/x.png".into(),
            media_type: "image/png".into(),
            filename: "x.png".into(),
            size: 12,
            msg_id: "m1".into(),
            ts: 99,
            ..IncomingMessage::default()
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["mediaPath"], "/tmp/x.png");
        assert_eq!(json["mediaType"], "image/png");
        assert_eq!(json["msgId"], "m1");
        assert_eq!(json["size"], 12);
        assert_eq!(json["ts"], 99);
    }

    #[test]
    fn test_queue_drains_in_order() {
        let q = EventQueue::new();
        for i in 0..3 {
            q.push(IncomingMessage {
                peer: format!("p{}", i),
                ..IncomingMessage::default()
            });
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].peer, "p0");
        assert_eq!(drained[2].peer, "p2");
        assert!(q.is_empty());
    }

    #[test]
    fn test_audit_log_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incoming_events.jsonl");
        let log = AuditLog::new(&path);
        log.record(AuditAction::Forwarded, "P1", 100, false, "");
        log.record(AuditAction::SkippedReplay, "P1", 100, true, "");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "forwarded");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["action"], "skipped_replay");
        assert_eq!(second["offline"], true);
    }

    #[test]
    fn test_counters_track_transitions() {
        let c = StatusCounters::new();
        c.note_connection("P1", true, 100);
        c.note_connection("P2", false, 200);
        c.note_peer("P3");

        let snap = c.snapshot();
        assert_eq!(snap.online_count, 1);
        assert_eq!(snap.offline_count, 1);
        assert_eq!(snap.last_online_ts, 100);
        assert_eq!(snap.last_offline_ts, 200);
        assert_eq!(snap.last_peer, "P3");
    }
}
