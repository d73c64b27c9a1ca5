//! Inbound payload router and dedup gate.
//!
//! Runs on the transport loop thread, so it never blocks: classify the
//! body, learn the peer's payload dialect, run the stale-offline and dedup
//! gates, persist file-bearing payloads to the media directory, and push a
//! normalized event. Every verdict lands in `incoming_events.jsonl`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{self, Payload, OVERSIZE_REJECTION_TEXT};
use crate::dedup::{self, DedupRing};
use crate::events::{AuditAction, AuditLog, EventQueue, IncomingMessage, StatusCounters};
use crate::prefs::PeerPrefs;

enum Candidate {
    Text(String),
    File {
        filename: String,
        media_type: String,
        data: Vec<u8>,
    },
    Rejected {
        filename: String,
        media_type: String,
        declared_size: u64,
    },
}

pub struct InboundRouter {
    media_dir: PathBuf,
    startup_ts: i64,
    dedup: DedupRing,
    prefs: Arc<PeerPrefs>,
    queue: Arc<EventQueue>,
    audit: AuditLog,
    counters: Arc<StatusCounters>,
}

impl InboundRouter {
    pub fn new(
        data_dir: &Path,
        startup_ts: i64,
        prefs: Arc<PeerPrefs>,
        queue: Arc<EventQueue>,
        counters: Arc<StatusCounters>,
    ) -> Self {
        Self {
            media_dir: data_dir.join("media"),
            startup_ts,
            dedup: DedupRing::new(),
            prefs,
            queue,
            audit: AuditLog::new(&data_dir.join("incoming_events.jsonl")),
            counters,
        }
    }

    /// Route one friend message. Must not block the transport thread.
    pub fn handle_message(&self, peer: &str, bytes: &[u8], msg_id: &str, ts: i64, offline: bool) {
        self.counters.note_peer(peer);

        let candidate = match codec::classify(bytes) {
            Payload::Packed { meta, body } => {
                self.prefs.learn(peer, codec::WireFormat::Packed);
                let filename = codec::sanitize_filename(&meta.filename);
                let media_type = if meta.content_type.is_empty() {
                    codec::mime_for_filename(&filename).to_string()
                } else {
                    meta.content_type
                };
                Candidate::File {
                    filename,
                    media_type,
                    data: body,
                }
            }
            Payload::PackedOversize { meta, body_len } => {
                self.prefs.learn(peer, codec::WireFormat::Packed);
                tracing::warn!(
                    "rejecting oversize packed file from {}: {} ({} bytes)",
                    peer,
                    meta.filename,
                    body_len
                );
                Candidate::Rejected {
                    filename: codec::sanitize_filename(&meta.filename),
                    media_type: meta.content_type,
                    declared_size: meta.size,
                }
            }
            Payload::Inline(media) => {
                self.prefs.learn(peer, media.format);
                Candidate::File {
                    filename: codec::sanitize_filename(&media.filename),
                    media_type: media.media_type,
                    data: media.bytes,
                }
            }
            Payload::Text(text) => Candidate::Text(text),
        };

        // Gates run post-decode so a packed file and its degenerate text
        // fallback fingerprint differently.
        let fp = match &candidate {
            Candidate::Text(text) => dedup::fingerprint(peer, ts, offline, "", "", 0, text),
            Candidate::File {
                filename,
                media_type,
                data,
            } => dedup::fingerprint(
                peer,
                ts,
                offline,
                filename,
                media_type,
                data.len() as u64,
                "",
            ),
            Candidate::Rejected {
                filename,
                media_type,
                declared_size,
            } => dedup::fingerprint(
                peer,
                ts,
                offline,
                filename,
                media_type,
                *declared_size,
                OVERSIZE_REJECTION_TEXT,
            ),
        };

        if dedup::is_stale_offline(self.startup_ts, ts, offline) {
            self.audit
                .record(AuditAction::DroppedStaleOffline, peer, ts, offline, "");
            return;
        }
        if !self.dedup.remember(&fp) {
            self.audit
                .record(AuditAction::SkippedReplay, peer, ts, offline, "");
            return;
        }

        let event = match candidate {
            Candidate::Text(text) => IncomingMessage {
                peer: peer.to_string(),
                text,
                msg_id: msg_id.to_string(),
                ts,
                ..IncomingMessage::default()
            },
            Candidate::Rejected {
                filename,
                media_type,
                declared_size,
            } => IncomingMessage {
                peer: peer.to_string(),
                text: OVERSIZE_REJECTION_TEXT.to_string(),
                filename,
                media_type,
                size: declared_size,
                msg_id: msg_id.to_string(),
                ts,
                ..IncomingMessage::default()
            },
            Candidate::File {
                filename,
                media_type,
                data,
            } => {
                let size = data.len() as u64;
                // Persistence failure degrades: the event still goes out,
                // just without a media path.
                let media_path = match self.persist_media(&filename, &data) {
                    Ok(path) => path.display().to_string(),
                    Err(e) => {
                        tracing::warn!("failed to persist media from {}: {}", peer, e);
                        String::new()
                    }
                };
                IncomingMessage {
                    peer: peer.to_string(),
                    media_path,
                    media_type,
                    filename,
                    size,
                    msg_id: msg_id.to_string(),
                    ts,
                    ..IncomingMessage::default()
                }
            }
        };

        self.queue.push(event);
        self.audit
            .record(AuditAction::Forwarded, peer, ts, offline, "");
    }

    fn persist_media(&self, filename: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.media_dir)?;
        let path = self
            .media_dir
            .join(format!("{}_{}", chrono::Utc::now().timestamp(), filename));
        std::fs::write(&path, data)?;
        Ok(path)
    }

    #[cfg(test)]
    fn media_dir(&self) -> &Path {
        &self.media_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_inline_json, encode_packed};
    use crate::codec::WireFormat;

    struct Fixture {
        _dir: tempfile::TempDir,
        router: InboundRouter,
        prefs: Arc<PeerPrefs>,
        queue: Arc<EventQueue>,
        audit_path: PathBuf,
    }

    fn fixture(startup_ts: i64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Arc::new(PeerPrefs::new());
        let queue = Arc::new(EventQueue::new());
        let counters = Arc::new(StatusCounters::new());
        let router = InboundRouter::new(
            dir.path(),
            startup_ts,
            prefs.clone(),
            queue.clone(),
            counters,
        );
        let audit_path = dir.path().join("incoming_events.jsonl");
        Fixture {
            _dir: dir,
            router,
            prefs,
            queue,
            audit_path,
        }
    }

    fn audit_actions(path: &Path) -> Vec<String> {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        content
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["action"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn test_duplicate_offline_replay() {
        let fx = fixture(500);
        fx.router
            .handle_message("P1", b"hello", "", 1_000_000, true);
        fx.router
            .handle_message("P1", b"hello", "", 1_000_000, true);

        assert_eq!(fx.queue.len(), 1);
        assert_eq!(audit_actions(&fx.audit_path), ["forwarded", "skipped_replay"]);
    }

    #[test]
    fn test_stale_offline_drop() {
        let fx = fixture(1_000_000_000_000);
        fx.router.handle_message("P1", b"old", "", 1, true);

        assert!(fx.queue.is_empty());
        assert_eq!(audit_actions(&fx.audit_path), ["dropped_stale_offline"]);
    }

    #[test]
    fn test_live_message_with_old_ts_passes() {
        // The stale cutoff only applies to offline replays.
        let fx = fixture(1_000_000_000_000);
        fx.router.handle_message("P1", b"old", "", 1, false);
        assert_eq!(fx.queue.len(), 1);
    }

    #[test]
    fn test_packed_file_persisted_and_forwarded() {
        let fx = fixture(0);
        let body = b"file payload bytes";
        let packed = encode_packed("doc.pdf", "application/pdf", body);
        fx.router.handle_message("P1", &packed, "m1", 100, false);

        let events = fx.queue.drain();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert!(ev.text.is_empty());
        assert_eq!(ev.filename, "doc.pdf");
        assert_eq!(ev.media_type, "application/pdf");
        assert_eq!(ev.size, body.len() as u64);
        assert!(!ev.media_path.is_empty());
        assert_eq!(std::fs::read(&ev.media_path).unwrap(), body);
        assert_eq!(fx.prefs.hint("P1"), Some(WireFormat::Packed));
    }

    #[test]
    fn test_oversize_packed_rejected_with_text_event() {
        let fx = fixture(0);
        let body = vec![0u8; codec::MAX_PAYLOAD_BYTES + 1024 * 1024];
        let packed = encode_packed("big.bin", "application/octet-stream", &body);
        fx.router.handle_message("P1", &packed, "", 100, false);

        let events = fx.queue.drain();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.text, OVERSIZE_REJECTION_TEXT);
        assert_eq!(ev.filename, "big.bin");
        assert!(ev.media_path.is_empty());
        // Nothing persisted.
        let persisted = std::fs::read_dir(fx.router.media_dir())
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(persisted, 0);
        assert_eq!(fx.prefs.hint("P1"), Some(WireFormat::Packed));
    }

    #[test]
    fn test_inline_json_learns_preference() {
        let fx = fixture(0);
        let inline = encode_inline_json("pic.png", "image/png", b"png bytes");
        fx.router.handle_message("P2", &inline, "", 100, false);

        let events = fx.queue.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].filename, "pic.png");
        assert!(!events[0].media_path.is_empty());
        assert_eq!(fx.prefs.hint("P2"), Some(WireFormat::InlineJson));
    }

    #[test]
    fn test_traversal_filename_cannot_escape() {
        let fx = fixture(0);
        let packed = encode_packed("../../evil", "application/octet-stream", b"x");
        fx.router.handle_message("P1", &packed, "", 100, false);

        let events = fx.queue.drain();
        assert_eq!(events[0].filename, ".._.._evil");
        let path = PathBuf::from(&events[0].media_path);
        assert!(path.starts_with(fx.router.media_dir()));
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with(".._.._evil"));
    }

    #[test]
    fn test_packed_and_text_fallback_fingerprint_differently() {
        let fx = fixture(0);
        // A packed frame and an unrelated text with identical (peer, ts)
        // must both forward.
        let packed = encode_packed("a.bin", "application/octet-stream", b"x");
        fx.router.handle_message("P1", &packed, "", 42, false);
        fx.router.handle_message("P1", b"a.bin", "", 42, false);
        assert_eq!(fx.queue.len(), 2);
    }
}
