//! Sidecar configuration.
//!
//! Precedence: CLI flags > environment > config file (`--config` or
//! `BEAGLE_CONFIG`) > defaults. The filetransfer wait budgets come from
//! `BEAGLE_FILETRANSFER_WAIT_MS` / `BEAGLE_FILETRANSFER_SEND_WAIT_MS`,
//! clamped to sane ranges.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::relay::DEFAULT_RELAY_URL;
use crate::transfer::TransferWaits;

/// Default loopback API port.
pub const DEFAULT_PORT: u16 = 39091;

const DEFAULT_WAIT_CONNECT_MS: u64 = 8000;
const DEFAULT_WAIT_TRANSFER_MS: u64 = 15000;

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub port: u16,
    pub token: Option<String>,
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub relay_url: String,
    pub wait_connect_ms: u64,
    pub wait_transfer_ms: u64,
    /// Root of an external Carrier SDK install, when one is plugged in.
    pub sdk_root: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: None,
            data_dir: PathBuf::from("./data"),
            log_dir: None,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            wait_connect_ms: DEFAULT_WAIT_CONNECT_MS,
            wait_transfer_ms: DEFAULT_WAIT_TRANSFER_MS,
            sdk_root: None,
        }
    }
}

/// Shape of the optional JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    port: Option<u16>,
    token: Option<String>,
    data_dir: Option<String>,
    relay_url: Option<String>,
}

impl SidecarConfig {
    /// Load config file (explicit path beats `BEAGLE_CONFIG`) and the
    /// environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let file_path = config_path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("BEAGLE_CONFIG").ok().map(PathBuf::from));
        if let Some(path) = file_path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let file: FileConfig = serde_json::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            if let Some(port) = file.port {
                config.port = port;
            }
            if let Some(token) = file.token.filter(|t| !t.is_empty()) {
                config.token = Some(token);
            }
            if let Some(dir) = file.data_dir.filter(|d| !d.is_empty()) {
                config.data_dir = PathBuf::from(dir);
            }
            if let Some(url) = file.relay_url.filter(|u| !u.is_empty()) {
                config.relay_url = url;
            }
        }

        config.wait_connect_ms = wait_from(
            std::env::var("BEAGLE_FILETRANSFER_WAIT_MS").ok(),
            DEFAULT_WAIT_CONNECT_MS,
            1000,
            60_000,
        );
        config.wait_transfer_ms = wait_from(
            std::env::var("BEAGLE_FILETRANSFER_SEND_WAIT_MS").ok(),
            DEFAULT_WAIT_TRANSFER_MS,
            1000,
            120_000,
        );
        config.sdk_root = std::env::var("BEAGLE_SDK_ROOT").ok().map(PathBuf::from);

        Ok(config)
    }

    /// Apply CLI flags on top.
    pub fn with_overrides(
        mut self,
        port: Option<u16>,
        token: Option<&str>,
        data_dir: Option<&Path>,
        log_dir: Option<&Path>,
    ) -> Self {
        if let Some(p) = port {
            self.port = p;
        }
        if let Some(t) = token {
            if !t.is_empty() {
                self.token = Some(t.to_string());
            }
        }
        if let Some(d) = data_dir {
            self.data_dir = d.to_path_buf();
        }
        if let Some(l) = log_dir {
            self.log_dir = Some(l.to_path_buf());
        }
        self
    }

    pub fn waits(&self) -> TransferWaits {
        TransferWaits {
            connect: Duration::from_millis(self.wait_connect_ms),
            transfer: Duration::from_millis(self.wait_transfer_ms),
        }
    }
}

/// Parse a wait override, clamped to `[lo, hi]`. Unset or unparsable
/// values fall back to the default.
fn wait_from(raw: Option<String>, default: u64, lo: u64, hi: u64) -> u64 {
    match raw.and_then(|s| s.trim().parse::<u64>().ok()) {
        Some(v) => v.clamp(lo, hi),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_clamping() {
        assert_eq!(wait_from(None, 8000, 1000, 60_000), 8000);
        assert_eq!(wait_from(Some("junk".into()), 8000, 1000, 60_000), 8000);
        assert_eq!(wait_from(Some("500".into()), 8000, 1000, 60_000), 1000);
        assert_eq!(wait_from(Some("30000".into()), 8000, 1000, 60_000), 30_000);
        assert_eq!(
            wait_from(Some("999999".into()), 8000, 1000, 60_000),
            60_000
        );
    }

    #[test]
    fn test_file_config_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beagle.json");
        std::fs::write(
            &path,
            r#"{"port": 40000, "token": "secret", "dataDir": "/tmp/beagle-data"}"#,
        )
        .unwrap();

        let config = SidecarConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 40000);
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/beagle-data"));
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);

        let config = config.with_overrides(
            Some(41000),
            Some("cli-token"),
            Some(Path::new("/tmp/other")),
            None,
        );
        assert_eq!(config.port, 41000);
        assert_eq!(config.token.as_deref(), Some("cli-token"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/other"));
    }

    #[test]
    fn test_defaults() {
        let config = SidecarConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.waits().connect, Duration::from_millis(8000));
        assert_eq!(config.waits().transfer, Duration::from_millis(15000));
    }

    #[test]
    fn test_missing_config_file_errors() {
        let missing = Path::new("/definitely/not/here.json");
        assert!(SidecarConfig::load(Some(missing)).is_err());
    }
}
