//! HTTP fallback to the express relay node.
//!
//! When the transport cannot reach a peer, the raw payload is POSTed to
//! `{relay_url}/{peer}/{self_user_id}` as an octet stream. One attempt, a
//! 25-second ceiling, and only 200/201 count as delivered.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "https://lens.beagle.chat:443";

/// Total budget for one fallback POST.
const RELAY_TIMEOUT: Duration = Duration::from_secs(25);

pub struct RelayClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        let client = reqwest::blocking::Client::builder()
            .default_headers(default_headers)
            .timeout(RELAY_TIMEOUT)
            .build()
            .context("building relay HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST one payload for `peer`. Ok only on HTTP 200/201.
    pub fn post_payload(&self, peer: &str, self_user_id: &str, bytes: &[u8]) -> Result<()> {
        let url = format!("{}/{}/{}", self.base_url, peer, self_user_id);
        let response = self
            .client
            .post(&url)
            .body(bytes.to_vec())
            .send()
            .with_context(|| format!("relay POST to {}", url))?;

        let status = response.status().as_u16();
        match status {
            200 | 201 => Ok(()),
            _ => anyhow::bail!("relay answered {}", status),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = RelayClient::new("https://relay.example:443/").unwrap();
        assert_eq!(client.base_url(), "https://relay.example:443");
    }

    #[test]
    fn test_post_to_unreachable_relay_fails() {
        // Nothing listens on this port; the error must surface, not panic.
        let client = RelayClient::new("http://127.0.0.1:9").unwrap();
        assert!(client.post_payload("peer", "me", b"x").is_err());
    }
}
