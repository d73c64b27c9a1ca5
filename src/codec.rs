//! Payload codec for the four media wire formats.
//!
//! Inbound classification runs one decision procedure: packed framing first,
//! then the JSON inline variants (with the Swift FileModel probe), then plain
//! UTF-8 text. Legacy inline (`{"data": <base64>}` only) is send-only and is
//! deliberately not recognized on the receive path.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Hard ceiling on a decoded message payload.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Largest accepted packed-framing metadata block.
pub const MAX_PACKED_META: usize = 4096;

/// Text emitted when a packed file exceeds the payload ceiling.
pub const OVERSIZE_REJECTION_TEXT: &str = "[file rejected: exceeds 5MB beaglechat payload limit]";

/// Wire encodings a media payload can take on the message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Packed,
    InlineJson,
    SwiftJson,
    LegacyInline,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Packed => "packed",
            WireFormat::InlineJson => "inline-json",
            WireFormat::SwiftJson => "swift-json",
            WireFormat::LegacyInline => "legacy-inline",
        }
    }
}

/// Metadata block of the packed framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedMeta {
    #[serde(rename = "type")]
    pub kind: String,
    pub filename: String,
    #[serde(rename = "contentType", default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
}

/// A successfully decoded inline media payload (Format B or C).
#[derive(Debug, Clone)]
pub struct DecodedMedia {
    pub format: WireFormat,
    pub kind: String,
    pub filename: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Outcome of classifying one inbound message body.
#[derive(Debug)]
pub enum Payload {
    /// Packed framing within the payload ceiling.
    Packed { meta: PackedMeta, body: Vec<u8> },
    /// Packed framing recognized, body over the ceiling. Body not retained.
    PackedOversize { meta: PackedMeta, body_len: usize },
    /// Inline JSON media (Format B or Swift FileModel).
    Inline(DecodedMedia),
    /// Everything else.
    Text(String),
}

/// Classify an inbound message body. Never fails; the fallback is text.
pub fn classify(bytes: &[u8]) -> Payload {
    if let Some((meta, body)) = decode_packed(bytes) {
        if body.len() > MAX_PAYLOAD_BYTES {
            return Payload::PackedOversize {
                meta,
                body_len: body.len(),
            };
        }
        return Payload::Packed {
            meta,
            body: body.to_vec(),
        };
    }
    if let Some(media) = decode_inline(bytes) {
        return Payload::Inline(media);
    }
    Payload::Text(String::from_utf8_lossy(bytes).into_owned())
}

// ---------------------------------------------------------------------------
// Format A — packed framing
// ---------------------------------------------------------------------------

/// Decode `[4-byte BE meta_len][meta_json][raw bytes]`. Recognition is exact:
/// meta_len in 1..=4096, metadata a JSON object with `type == "file"` and a
/// non-empty filename. Anything else is not packed.
pub fn decode_packed(bytes: &[u8]) -> Option<(PackedMeta, &[u8])> {
    if bytes.len() < 4 {
        return None;
    }
    let meta_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if meta_len == 0 || meta_len > MAX_PACKED_META {
        return None;
    }
    if bytes.len() < 4 + meta_len {
        return None;
    }
    let meta: PackedMeta = serde_json::from_slice(&bytes[4..4 + meta_len]).ok()?;
    if meta.kind != "file" || meta.filename.is_empty() {
        return None;
    }
    Some((meta, &bytes[4 + meta_len..]))
}

pub fn encode_packed(filename: &str, media_type: &str, body: &[u8]) -> Vec<u8> {
    let meta = PackedMeta {
        kind: "file".to_string(),
        filename: filename.to_string(),
        content_type: media_type.to_string(),
        size: body.len() as u64,
    };
    let meta_json = serde_json::to_vec(&meta).expect("packed meta serializes");
    let mut out = Vec::with_capacity(4 + meta_json.len() + body.len());
    out.extend_from_slice(&(meta_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(body);
    out
}

// ---------------------------------------------------------------------------
// Formats B/C — inline JSON and Swift FileModel
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct InlineWire {
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<String>,
    #[serde(rename = "fileName")]
    file_name: Option<String>,
    filename: Option<String>,
    #[serde(rename = "fileExtension")]
    file_extension: Option<String>,
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

/// Decode Format B or C. A bare `{"data": ...}` object (legacy inline) is
/// send-only and falls through to the text branch, as does any decoded
/// payload over the ceiling.
pub fn decode_inline(bytes: &[u8]) -> Option<DecodedMedia> {
    let wire: InlineWire = serde_json::from_slice(bytes).ok()?;
    let data = wire.data.as_deref()?;

    // Legacy inline carries nothing but `data`; don't recognize it here.
    let has_shape = wire.kind.is_some()
        || wire.file_name.is_some()
        || wire.filename.is_some()
        || wire.file_extension.is_some()
        || wire.media_type.is_some();
    if !has_shape {
        return None;
    }

    let is_swift =
        wire.file_name.is_some() && wire.file_extension.is_some() && !data.contains("base64,");

    let (payload_b64, url_mime) = split_data_url(data);
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload_b64.trim())
        .ok()?;
    if decoded.len() > MAX_PAYLOAD_BYTES {
        return None;
    }

    let kind = wire.kind.unwrap_or_else(|| "file".to_string());

    if is_swift {
        let stem = wire.file_name.unwrap_or_default();
        let ext = wire.file_extension.unwrap_or_default();
        let filename = format!("{}{}", stem, ext);
        let media_type = wire
            .media_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| mime_for_filename(&filename).to_string());
        return Some(DecodedMedia {
            format: WireFormat::SwiftJson,
            kind,
            filename,
            media_type,
            bytes: decoded,
        });
    }

    let mut filename = wire
        .file_name
        .or(wire.filename)
        .filter(|f| !f.is_empty())
        .unwrap_or_default();
    let media_type = url_mime
        .filter(|m| !m.is_empty())
        .or(wire.media_type.filter(|m| !m.is_empty()))
        .unwrap_or_else(|| mime_for_filename(&filename).to_string());
    if filename.is_empty() {
        filename = format!("file{}", extension_for_mime(&media_type).unwrap_or(".bin"));
    } else {
        filename = ensure_extension(&filename, &media_type);
    }

    Some(DecodedMedia {
        format: WireFormat::InlineJson,
        kind,
        filename,
        media_type,
        bytes: decoded,
    })
}

/// Strip an optional `data:<mime>;base64,` prefix. Returns the raw base64
/// payload and the data-URL mime, if any.
fn split_data_url(data: &str) -> (&str, Option<String>) {
    if let Some(rest) = data.strip_prefix("data:") {
        if let Some(idx) = rest.find("base64,") {
            let head = &rest[..idx];
            let mime = head.trim_end_matches(';').to_string();
            let mime = if mime.is_empty() { None } else { Some(mime) };
            return (&rest[idx + "base64,".len()..], mime);
        }
    }
    (data, None)
}

pub fn encode_inline_json(filename: &str, media_type: &str, body: &[u8]) -> Vec<u8> {
    let b64 = base64::engine::general_purpose::STANDARD.encode(body);
    let value = serde_json::json!({
        "type": kind_for_mime(media_type),
        "fileName": filename,
        "mediaType": media_type,
        "data": format!("data:{};base64,{}", media_type, b64),
    });
    serde_json::to_vec(&value).expect("inline payload serializes")
}

pub fn encode_swift_json(filename: &str, media_type: &str, body: &[u8]) -> Vec<u8> {
    let (stem, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], filename[idx..].to_string()),
        _ => (
            filename,
            extension_for_mime(media_type).unwrap_or(".bin").to_string(),
        ),
    };
    let value = serde_json::json!({
        "fileName": stem,
        "fileExtension": ext,
        "type": kind_for_mime(media_type),
        "data": base64::engine::general_purpose::STANDARD.encode(body),
    });
    serde_json::to_vec(&value).expect("swift payload serializes")
}

pub fn encode_legacy_inline(body: &[u8]) -> Vec<u8> {
    let value = serde_json::json!({
        "data": base64::engine::general_purpose::STANDARD.encode(body),
    });
    serde_json::to_vec(&value).expect("legacy payload serializes")
}

// ---------------------------------------------------------------------------
// Filenames and MIME
// ---------------------------------------------------------------------------

/// Replace path separators and NUL in a peer-supplied filename. An empty
/// name becomes `file.bin`. The result never escapes the media directory.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        "file.bin".to_string()
    } else {
        cleaned
    }
}

const MIME_TABLE: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("pdf", "application/pdf"),
];

/// MIME from a filename extension, defaulting to octet-stream.
pub fn mime_for_filename(filename: &str) -> &'static str {
    let ext = filename
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    MIME_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, m)| *m)
        .unwrap_or("application/octet-stream")
}

/// Canonical extension (with leading dot) for a known MIME type.
pub fn extension_for_mime(media_type: &str) -> Option<&'static str> {
    match media_type {
        "image/jpeg" => Some(".jpg"),
        "image/png" => Some(".png"),
        "image/gif" => Some(".gif"),
        "image/webp" => Some(".webp"),
        "video/mp4" => Some(".mp4"),
        "audio/mpeg" => Some(".mp3"),
        "audio/wav" => Some(".wav"),
        "application/pdf" => Some(".pdf"),
        _ => None,
    }
}

fn ensure_extension(filename: &str, media_type: &str) -> String {
    if filename.contains('.') {
        return filename.to_string();
    }
    match extension_for_mime(media_type) {
        Some(ext) => format!("{}{}", filename, ext),
        None => filename.to_string(),
    }
}

fn kind_for_mime(media_type: &str) -> &'static str {
    if media_type.starts_with("image/") {
        "image"
    } else if media_type.starts_with("audio/") {
        "audio"
    } else {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_packed_round_trip() {
        let body = b"hello packed world";
        let encoded = encode_packed("photo.png", "image/png", body);
        let (meta, decoded) = decode_packed(&encoded).expect("round trip");
        assert_eq!(meta.filename, "photo.png");
        assert_eq!(meta.content_type, "image/png");
        assert_eq!(meta.size, body.len() as u64);
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_packed_meta_len_zero_is_text() {
        let mut bytes = vec![0u8, 0, 0, 0];
        bytes.extend_from_slice(b"{}");
        assert!(decode_packed(&bytes).is_none());
        assert!(matches!(classify(&bytes), Payload::Text(_)));
    }

    #[test]
    fn test_packed_meta_len_too_large_is_text() {
        let meta_len = (MAX_PACKED_META as u32 + 1).to_be_bytes();
        let mut bytes = meta_len.to_vec();
        bytes.extend_from_slice(&vec![b'x'; 5000]);
        assert!(decode_packed(&bytes).is_none());
    }

    #[test]
    fn test_packed_requires_file_type_and_filename() {
        let meta = br#"{"type":"blob","filename":"a.bin"}"#;
        let mut bytes = (meta.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(meta);
        bytes.extend_from_slice(b"body");
        assert!(decode_packed(&bytes).is_none());

        let meta = br#"{"type":"file","filename":""}"#;
        let mut bytes = (meta.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(meta);
        assert!(decode_packed(&bytes).is_none());
    }

    #[test]
    fn test_packed_at_limit_accepted_over_limit_rejected() {
        let at_limit = vec![0u8; MAX_PAYLOAD_BYTES];
        let encoded = encode_packed("big.bin", "application/octet-stream", &at_limit);
        assert!(matches!(classify(&encoded), Payload::Packed { .. }));

        let over = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        let encoded = encode_packed("big.bin", "application/octet-stream", &over);
        match classify(&encoded) {
            Payload::PackedOversize { meta, body_len } => {
                assert_eq!(meta.filename, "big.bin");
                assert_eq!(body_len, MAX_PAYLOAD_BYTES + 1);
            }
            other => panic!("expected oversize, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_json_round_trip() {
        let body = b"\x89PNG fake image bytes";
        let encoded = encode_inline_json("shot.png", "image/png", body);
        let media = decode_inline(&encoded).expect("round trip");
        assert_eq!(media.format, WireFormat::InlineJson);
        assert_eq!(media.filename, "shot.png");
        assert_eq!(media.media_type, "image/png");
        assert_eq!(media.bytes, body);
    }

    #[test]
    fn test_inline_json_extends_bare_filename() {
        let encoded = encode_inline_json("shot", "image/png", b"bytes");
        let media = decode_inline(&encoded).expect("decodes");
        assert_eq!(media.filename, "shot.png");
    }

    #[test]
    fn test_swift_json_round_trip() {
        let body = b"voice note";
        let encoded = encode_swift_json("note.wav", "audio/wav", body);
        let media = decode_inline(&encoded).expect("round trip");
        assert_eq!(media.format, WireFormat::SwiftJson);
        assert_eq!(media.filename, "note.wav");
        assert_eq!(media.media_type, "audio/wav");
        assert_eq!(media.bytes, body);
    }

    #[test]
    fn test_swift_probe_requires_raw_base64() {
        // fileName + fileExtension but a data: URL payload is Format B.
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"x");
        let raw = serde_json::json!({
            "fileName": "a",
            "fileExtension": ".png",
            "type": "image",
            "data": format!("data:image/png;base64,{}", b64),
        });
        let media = decode_inline(&serde_json::to_vec(&raw).unwrap()).expect("decodes");
        assert_eq!(media.format, WireFormat::InlineJson);
    }

    #[test]
    fn test_legacy_inline_not_recognized_inbound() {
        let encoded = encode_legacy_inline(b"opaque blob");
        assert!(decode_inline(&encoded).is_none());
        assert!(matches!(classify(&encoded), Payload::Text(_)));
    }

    #[test]
    fn test_classify_plain_text() {
        match classify("just words".as_bytes()) {
            Payload::Text(t) => assert_eq!(t, "just words"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_prefers_packed_over_inline() {
        // A packed frame whose body happens to be inline JSON must classify
        // as packed: the framing probe runs first.
        let inner = encode_inline_json("x.png", "image/png", b"b");
        let packed = encode_packed("outer.bin", "application/octet-stream", &inner);
        assert!(matches!(classify(&packed), Payload::Packed { .. }));
    }

    #[test]
    fn test_sanitize_filename_traversal() {
        assert_eq!(sanitize_filename("../../evil"), ".._.._evil");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("nul\0byte"), "nul_byte");
        assert_eq!(sanitize_filename(""), "file.bin");
    }

    #[test]
    fn test_mime_table() {
        assert_eq!(mime_for_filename("a.JPG"), "image/jpeg");
        assert_eq!(mime_for_filename("b.webp"), "image/webp");
        assert_eq!(mime_for_filename("noext"), "application/octet-stream");
        assert_eq!(mime_for_filename("c.xyz"), "application/octet-stream");
    }
}
