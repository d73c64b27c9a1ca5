//! Best-effort IP and location annotation for friend events.
//!
//! Two sources, tried in order: a crawler index mapping peer ids to IPs
//! (fetched from a URL or read from a local file, refreshed at most once
//! per configured interval), then a scan of this process's established TCP
//! connections on the Carrier port. Empty annotations are acceptable; the
//! core works identically with the probe disabled.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Carrier DHT/session port scanned in `/proc/net/tcp`.
const CARRIER_PORT: u16 = 33445;

/// Floor for the crawler refresh cadence.
const MIN_REFRESH_SECS: u64 = 5;

enum CrawlerSource {
    Url(String),
    File(PathBuf),
}

struct CrawlerInner {
    entries: HashMap<String, String>,
    refreshed_at: Option<Instant>,
}

struct CrawlerIndex {
    source: CrawlerSource,
    refresh_every: Duration,
    inner: Mutex<CrawlerInner>,
}

impl CrawlerIndex {
    /// Look up a peer's IP, refreshing the index if it has gone stale.
    fn lookup(&self, peer: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let stale = match inner.refreshed_at {
            Some(at) => at.elapsed() >= self.refresh_every,
            None => true,
        };
        if stale {
            match self.fetch() {
                Ok(entries) => {
                    tracing::debug!("crawler index refreshed: {} entries", entries.len());
                    inner.entries = entries;
                }
                Err(e) => tracing::debug!("crawler index refresh failed: {}", e),
            }
            // Failed refreshes also wait out the interval; the index is
            // best-effort and must not hammer its source.
            inner.refreshed_at = Some(Instant::now());
        }
        inner.entries.get(peer).cloned()
    }

    fn fetch(&self) -> anyhow::Result<HashMap<String, String>> {
        let body = match &self.source {
            CrawlerSource::Url(url) => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()?;
                client.get(url).send()?.error_for_status()?.text()?
            }
            CrawlerSource::File(path) => std::fs::read_to_string(path)?,
        };
        Ok(serde_json::from_str(&body)?)
    }
}

/// Peer IP/location annotator. Construct `disabled()` when no crawler is
/// configured; the TCP scan still runs.
pub struct GeoProbe {
    crawler: Option<CrawlerIndex>,
}

impl GeoProbe {
    pub fn disabled() -> Self {
        Self { crawler: None }
    }

    pub fn with_crawler_url(url: &str, refresh_secs: u64) -> Self {
        Self {
            crawler: Some(CrawlerIndex {
                source: CrawlerSource::Url(url.to_string()),
                refresh_every: Duration::from_secs(refresh_secs.max(MIN_REFRESH_SECS)),
                inner: Mutex::new(CrawlerInner {
                    entries: HashMap::new(),
                    refreshed_at: None,
                }),
            }),
        }
    }

    pub fn with_crawler_file(path: PathBuf, refresh_secs: u64) -> Self {
        Self {
            crawler: Some(CrawlerIndex {
                source: CrawlerSource::File(path),
                refresh_every: Duration::from_secs(refresh_secs.max(MIN_REFRESH_SECS)),
                inner: Mutex::new(CrawlerInner {
                    entries: HashMap::new(),
                    refreshed_at: None,
                }),
            }),
        }
    }

    /// Best-effort `(ip, location)` for a peer. Either may be empty.
    pub fn annotate(&self, peer: &str) -> (String, String) {
        let ip = self
            .crawler
            .as_ref()
            .and_then(|c| c.lookup(peer))
            .or_else(established_carrier_peer)
            .unwrap_or_default();
        let location = if ip.is_empty() {
            String::new()
        } else {
            classify_ip(&ip).to_string()
        };
        (ip, location)
    }
}

/// Coarse location class from an IP literal. Unparsable input is treated
/// as public.
pub fn classify_ip(ip: &str) -> &'static str {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            if v4.is_loopback() {
                "loopback"
            } else if v4.is_private() || v4.is_link_local() {
                "private-network"
            } else {
                "public-network"
            }
        }
        Ok(IpAddr::V6(v6)) => {
            if v6.is_loopback() {
                "loopback"
            } else if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                "private-network-ipv6"
            } else if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                "link-local-ipv6"
            } else {
                "public-network"
            }
        }
        Err(_) => "public-network",
    }
}

/// Remote address of an established TCP connection on the Carrier port
/// belonging to this process. Linux-only; None anywhere it cannot look.
fn established_carrier_peer() -> Option<String> {
    let own_inodes = own_socket_inodes()?;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let content = match std::fs::read_to_string(table) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for line in content.lines().skip(1) {
            if let Some(ip) = parse_tcp_row(line, CARRIER_PORT, &own_inodes) {
                return Some(ip);
            }
        }
    }
    None
}

/// Socket inodes held by this process, from `/proc/self/fd`.
fn own_socket_inodes() -> Option<Vec<u64>> {
    let mut inodes = Vec::new();
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    for entry in entries.flatten() {
        if let Ok(target) = std::fs::read_link(entry.path()) {
            let target = target.to_string_lossy();
            if let Some(rest) = target.strip_prefix("socket:[") {
                if let Ok(inode) = rest.trim_end_matches(']').parse::<u64>() {
                    inodes.push(inode);
                }
            }
        }
    }
    Some(inodes)
}

/// One `/proc/net/tcp` row: remote port must match, state must be
/// ESTABLISHED (01), and the inode must belong to this process.
fn parse_tcp_row(line: &str, port: u16, own_inodes: &[u64]) -> Option<String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    let (rem_hex, rem_port_hex) = fields[2].split_once(':')?;
    let rem_port = u16::from_str_radix(rem_port_hex, 16).ok()?;
    if rem_port != port || fields[3] != "01" {
        return None;
    }
    let inode: u64 = fields[9].parse().ok()?;
    if !own_inodes.contains(&inode) {
        return None;
    }
    decode_proc_addr(rem_hex)
}

/// `/proc/net/tcp` stores IPv4 as 8 little-endian hex chars, IPv6 as 32.
fn decode_proc_addr(hex: &str) -> Option<String> {
    if hex.len() == 8 {
        let raw = u32::from_str_radix(hex, 16).ok()?;
        let octets = raw.to_le_bytes();
        return Some(format!(
            "{}.{}.{}.{}",
            octets[0], octets[1], octets[2], octets[3]
        ));
    }
    if hex.len() == 32 {
        // Four 32-bit little-endian groups.
        let mut bytes = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
            let group = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
            bytes[i * 4..i * 4 + 4].copy_from_slice(&group.to_le_bytes());
        }
        return Some(std::net::Ipv6Addr::from(bytes).to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classify_ip() {
        assert_eq!(classify_ip("127.0.0.1"), "loopback");
        assert_eq!(classify_ip("10.1.2.3"), "private-network");
        assert_eq!(classify_ip("172.16.9.9"), "private-network");
        assert_eq!(classify_ip("192.168.0.10"), "private-network");
        assert_eq!(classify_ip("8.8.8.8"), "public-network");
        assert_eq!(classify_ip("::1"), "loopback");
        assert_eq!(classify_ip("fc00::1"), "private-network-ipv6");
        assert_eq!(classify_ip("fd12::9"), "private-network-ipv6");
        assert_eq!(classify_ip("fe80::2"), "link-local-ipv6");
        assert_eq!(classify_ip("2001:4860:4860::8888"), "public-network");
        assert_eq!(classify_ip("not-an-ip"), "public-network");
    }

    #[test]
    fn test_decode_proc_addr_v4() {
        // 0100007F is 127.0.0.1 little-endian.
        assert_eq!(decode_proc_addr("0100007F").as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_parse_tcp_row_filters() {
        // remote 127.0.0.1:33445 (0x82B5), established, inode 555.
        let row = "  1: 0100007F:1F90 0100007F:82B5 01 00000000:00000000 00:00000000 00000000  1000        0 555 1";
        assert_eq!(
            parse_tcp_row(row, CARRIER_PORT, &[555]).as_deref(),
            Some("127.0.0.1")
        );
        // Wrong inode: not ours.
        assert!(parse_tcp_row(row, CARRIER_PORT, &[556]).is_none());
        // Not established.
        let closing = row.replace(" 01 ", " 06 ");
        assert!(parse_tcp_row(&closing, CARRIER_PORT, &[555]).is_none());
    }

    #[test]
    fn test_crawler_file_lookup_and_refresh_floor() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("crawler.json");
        std::fs::write(&index, r#"{"peer-a":"8.8.8.8"}"#).unwrap();

        let probe = GeoProbe::with_crawler_file(index.clone(), 0);
        let (ip, loc) = probe.annotate("peer-a");
        assert_eq!(ip, "8.8.8.8");
        assert_eq!(loc, "public-network");

        // Within the refresh floor, updates are not picked up yet.
        std::fs::write(&index, r#"{"peer-a":"10.0.0.1"}"#).unwrap();
        let (ip, _) = probe.annotate("peer-a");
        assert_eq!(ip, "8.8.8.8");
    }

    #[test]
    fn test_disabled_probe_never_panics() {
        let probe = GeoProbe::disabled();
        let (_ip, _loc) = probe.annotate("whoever");
    }
}
