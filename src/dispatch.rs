//! Outbound dispatcher: `send_text`, the `send_media` dispatch ladder, and
//! ephemeral `send_status` signals.
//!
//! Mode resolution walks caller format → `BEAGLE_MEDIA_OUT_FORMAT` →
//! per-peer env overrides → learned peer preference. The ladder prefers the
//! filetransfer side channel for `auto`/`filetransfer` sends to online
//! peers and degrades to a message-payload encoding, with the express-node
//! relay as the last resort when the transport cannot deliver.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::codec::{self, WireFormat};
use crate::prefs::PeerPrefs;
use crate::presence::FriendRegistry;
use crate::relay::RelayClient;
use crate::transfer::{self, SessionMap, TransferWaits};
use crate::transport::Transport;

/// Failure kinds surfaced to the outbound caller. The HTTP surface
/// collapses all of these to `{ok:false}`; the kind appears only in logs.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("transport unavailable")]
    TransportUnavailable,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("file too large: {0} bytes")]
    FileTooLarge(u64),
    #[error("file not readable: {0}")]
    FileNotReadable(String),
    #[error("filetransfer connect timed out")]
    FiletransferConnectTimeout,
    #[error("filetransfer send timed out")]
    FiletransferSendTimeout,
    #[error("filetransfer failed: {0}")]
    FiletransferNotOk(String),
    #[error("transport send failed (errno {0})")]
    TransportSendFailed(i32),
    #[error("http fallback failed: {0}")]
    HttpFallbackFailed(String),
}

impl SendError {
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::TransportUnavailable => "transport_unavailable",
            SendError::InvalidArgument(_) => "invalid_argument",
            SendError::FileTooLarge(_) => "file_too_large",
            SendError::FileNotReadable(_) => "file_not_readable",
            SendError::FiletransferConnectTimeout => "filetransfer_connect_timeout",
            SendError::FiletransferSendTimeout => "filetransfer_send_timeout",
            SendError::FiletransferNotOk(_) => "filetransfer_not_ok",
            SendError::TransportSendFailed(_) => "transport_send_failed",
            SendError::HttpFallbackFailed(_) => "http_fallback_failed",
        }
    }
}

/// Resolved outbound mode for one `send_media` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutMode {
    Auto,
    Filetransfer,
    Wire(WireFormat),
}

impl OutMode {
    /// Parse a caller- or env-supplied format name. Unknown values and the
    /// empty string collapse to `auto`.
    pub fn parse(s: &str) -> OutMode {
        match s {
            "filetransfer" => OutMode::Filetransfer,
            "packed" => OutMode::Wire(WireFormat::Packed),
            "swift-json" => OutMode::Wire(WireFormat::SwiftJson),
            "inline-json" => OutMode::Wire(WireFormat::InlineJson),
            "legacy-inline" => OutMode::Wire(WireFormat::LegacyInline),
            _ => OutMode::Auto,
        }
    }
}

/// Snapshot of the mode-related environment, captured per call so long-
/// running processes honor changes.
#[derive(Debug, Default, Clone)]
pub struct ModeEnv {
    pub out_format: Option<String>,
    pub legacy_peers: Vec<String>,
    pub swift_peers: Vec<String>,
    pub inline_peers: Vec<String>,
}

impl ModeEnv {
    pub fn from_process_env() -> Self {
        Self {
            out_format: std::env::var("BEAGLE_MEDIA_OUT_FORMAT").ok(),
            legacy_peers: peer_list(std::env::var("BEAGLE_MEDIA_LEGACY_INLINE_PEERS").ok()),
            swift_peers: peer_list(std::env::var("BEAGLE_MEDIA_SWIFT_JSON_PEERS").ok()),
            inline_peers: peer_list(std::env::var("BEAGLE_MEDIA_INLINE_PEERS").ok()),
        }
    }
}

fn peer_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Resolve the outbound mode: caller format, then env format, then
/// per-peer env overrides (legacy → swift → inline, last wins), then the
/// learned preference when still `auto`.
pub fn resolve_mode(
    requested: &str,
    env: &ModeEnv,
    peer: &str,
    hint: Option<WireFormat>,
) -> OutMode {
    let mut mode = if !requested.is_empty() {
        OutMode::parse(requested)
    } else if let Some(fmt) = env.out_format.as_deref() {
        OutMode::parse(fmt)
    } else {
        OutMode::Auto
    };

    if env.legacy_peers.iter().any(|p| p == peer) {
        mode = OutMode::Wire(WireFormat::LegacyInline);
    }
    if env.swift_peers.iter().any(|p| p == peer) {
        mode = OutMode::Wire(WireFormat::SwiftJson);
    }
    if env.inline_peers.iter().any(|p| p == peer) {
        mode = OutMode::Wire(WireFormat::InlineJson);
    }

    // A learned preference steers auto sends and disables the
    // filetransfer-first heuristic by resolving to a concrete encoding.
    if mode == OutMode::Auto {
        if let Some(preferred) = hint {
            mode = OutMode::Wire(preferred);
        }
    }
    mode
}

/// Upstream `sendMedia` request.
#[derive(Debug, Default, Clone)]
pub struct MediaRequest {
    pub peer: String,
    pub caption: String,
    pub media_path: String,
    pub media_url: String,
    pub media_type: String,
    pub filename: String,
    pub out_format: String,
}

/// Upstream `sendStatus` request — ephemeral typing/phase signal.
#[derive(Debug, Default, Clone)]
pub struct StatusRequest {
    pub peer: String,
    pub state: String,
    pub phase: String,
    pub ttl_ms: i64,
    pub chat_type: String,
    pub group_user_id: String,
    pub group_address: String,
    pub group_name: String,
    pub seq: String,
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionMap>,
    prefs: Arc<PeerPrefs>,
    friends: Arc<FriendRegistry>,
    relay: RelayClient,
    waits: TransferWaits,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: Arc<SessionMap>,
        prefs: Arc<PeerPrefs>,
        friends: Arc<FriendRegistry>,
        relay: RelayClient,
        waits: TransferWaits,
    ) -> Self {
        Self {
            transport,
            sessions,
            prefs,
            friends,
            relay,
            waits,
        }
    }

    /// Send a text message, falling back to the express relay when the
    /// transport cannot deliver. Success on either path.
    pub fn send_text(&self, peer: &str, text: &str) -> Result<(), SendError> {
        if peer.is_empty() {
            return Err(SendError::InvalidArgument("peer is empty".into()));
        }
        self.send_bytes(peer, text.as_bytes())
    }

    fn send_bytes(&self, peer: &str, bytes: &[u8]) -> Result<(), SendError> {
        match self.transport.send_friend_message(peer, bytes) {
            Ok(msg_id) => {
                tracing::debug!("sent {} bytes to {} (msg {})", bytes.len(), peer, msg_id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "transport send to {} failed (errno {}), trying relay",
                    peer,
                    e.errno()
                );
                match self
                    .relay
                    .post_payload(peer, &self.transport.self_user_id(), bytes)
                {
                    Ok(()) => {
                        tracing::info!("relay delivered {} bytes for {}", bytes.len(), peer);
                        Ok(())
                    }
                    Err(relay_err) => {
                        tracing::warn!("relay delivery for {} failed: {}", peer, relay_err);
                        Err(SendError::HttpFallbackFailed(relay_err.to_string()))
                    }
                }
            }
        }
    }

    /// The `send_media` ladder.
    pub fn send_media(&self, req: &MediaRequest) -> Result<(), SendError> {
        if req.peer.is_empty() {
            return Err(SendError::InvalidArgument("peer is empty".into()));
        }

        // Degenerate case: nothing on disk to send, compose a text block.
        if req.media_path.is_empty() {
            let text = compose_media_text(req);
            if text.is_empty() {
                return Err(SendError::InvalidArgument("empty media request".into()));
            }
            return self.send_text(&req.peer, &text);
        }

        let source = PathBuf::from(&req.media_path);
        let size = file_size(&source)?;
        if size == 0 {
            return Err(SendError::FileNotReadable(format!(
                "{} is empty",
                source.display()
            )));
        }
        if size > codec::MAX_PAYLOAD_BYTES as u64 {
            return Err(SendError::FileTooLarge(size));
        }

        let filename = if req.filename.is_empty() {
            source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file.bin".to_string())
        } else {
            req.filename.clone()
        };
        let media_type = if req.media_type.is_empty() {
            codec::mime_for_filename(&filename).to_string()
        } else {
            req.media_type.clone()
        };

        let env = ModeEnv::from_process_env();
        let mode = resolve_mode(&req.out_format, &env, &req.peer, self.prefs.hint(&req.peer));
        tracing::debug!("media send to {} resolved to {:?}", req.peer, mode);

        match mode {
            OutMode::Filetransfer => {
                // Forced mode attempts the connect even when the presence
                // cache says offline; the cache may be stale. Failures
                // surface immediately, no degrade.
                if !self.friends.is_online(&req.peer) {
                    tracing::info!(
                        "presence says {} is offline; forced filetransfer proceeds anyway",
                        req.peer
                    );
                }
                transfer::send_file(
                    &*self.transport,
                    &self.sessions,
                    &req.peer,
                    &source,
                    &filename,
                    &media_type,
                    self.waits,
                )
            }
            OutMode::Auto => {
                if self.friends.is_online(&req.peer) {
                    match transfer::send_file(
                        &*self.transport,
                        &self.sessions,
                        &req.peer,
                        &source,
                        &filename,
                        &media_type,
                        self.waits,
                    ) {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            tracing::warn!(
                                "filetransfer to {} failed ({}), degrading to message payload",
                                req.peer,
                                e.kind()
                            );
                        }
                    }
                }
                self.send_encoded(&req.peer, WireFormat::Packed, &source, &filename, &media_type)
            }
            OutMode::Wire(format) => {
                self.send_encoded(&req.peer, format, &source, &filename, &media_type)
            }
        }
    }

    fn send_encoded(
        &self,
        peer: &str,
        format: WireFormat,
        source: &Path,
        filename: &str,
        media_type: &str,
    ) -> Result<(), SendError> {
        let body = std::fs::read(source)
            .map_err(|_| SendError::FileNotReadable(source.display().to_string()))?;
        let payload = match format {
            WireFormat::Packed => codec::encode_packed(filename, media_type, &body),
            WireFormat::InlineJson => codec::encode_inline_json(filename, media_type, &body),
            WireFormat::SwiftJson => codec::encode_swift_json(filename, media_type, &body),
            WireFormat::LegacyInline => codec::encode_legacy_inline(&body),
        };
        tracing::debug!(
            "encoding {} ({} bytes) as {} for {}",
            filename,
            body.len(),
            format.as_str(),
            peer
        );
        self.send_bytes(peer, &payload)
    }

    /// Transport-only ephemeral status. An expired status is worse than a
    /// missing one, so there is no relay fallback and no retry.
    pub fn send_status(&self, req: &StatusRequest) -> Result<(), SendError> {
        if req.peer.is_empty() {
            return Err(SendError::InvalidArgument("peer is empty".into()));
        }
        let payload = status_payload(req);
        self.transport
            .send_friend_message(&req.peer, payload.to_string().as_bytes())
            .map(|_| ())
            .map_err(|e| SendError::TransportSendFailed(e.errno()))
    }
}

/// Text block for a `send_media` call with no local file: non-empty parts
/// joined by newlines.
fn compose_media_text(req: &MediaRequest) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !req.caption.is_empty() {
        parts.push(req.caption.clone());
    }
    if !req.media_url.is_empty() {
        parts.push(req.media_url.clone());
    }
    if !req.filename.is_empty() {
        parts.push(format!("filename: {}", req.filename));
    }
    if !req.media_type.is_empty() {
        parts.push(format!("mediaType: {}", req.media_type));
    }
    parts.join("\n")
}

fn status_payload(req: &StatusRequest) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    obj.insert("type".into(), "status".into());
    for (key, value) in [
        ("state", &req.state),
        ("phase", &req.phase),
        ("chatType", &req.chat_type),
        ("groupUserId", &req.group_user_id),
        ("groupAddress", &req.group_address),
        ("groupName", &req.group_name),
        ("seq", &req.seq),
    ] {
        if !value.is_empty() {
            obj.insert(key.into(), serde_json::Value::String(value.clone()));
        }
    }
    if req.ttl_ms > 0 {
        obj.insert("ttlMs".into(), req.ttl_ms.into());
    }
    serde_json::Value::Object(obj)
}

fn file_size(path: &Path) -> Result<u64, SendError> {
    let meta = std::fs::metadata(path)
        .map_err(|_| SendError::FileNotReadable(path.display().to_string()))?;
    if !meta.is_file() {
        return Err(SendError::FileNotReadable(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok(meta.len())
}
