//! Preview backend wire types
//!
//! - Token request: `POST {host}/voice/preview/token` with
//!   `{"agentRef": ..., "tenantRef": ...}`, answered by `{"token": ...}`
//! - Channel: `{host}/voice/preview?agentRef=..&tenantRef=..&token=..` over
//!   WebSocket. Binary frames are PCM16 audio, text frames are JSON control
//!   messages such as `{"type": "interrupt"}`.

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::StreamingError;

/// Path of the token-issuance endpoint relative to the backend host
pub const TOKEN_PATH: &str = "/voice/preview/token";

/// Path of the duplex preview channel relative to the backend host
pub const CHANNEL_PATH: &str = "/voice/preview";

/// Body of the token request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub agent_ref: String,
    pub tenant_ref: String,
}

/// Body of a successful token response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Short-lived credential for one preview channel
#[derive(Clone, PartialEq, Eq)]
pub struct PreviewToken(String);

impl PreviewToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PreviewToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the credential itself
        write!(f, "PreviewToken(<{} chars>)", self.0.len())
    }
}

/// Control messages received as text frames.
///
/// Unknown tags deserialize to [`ControlMessage::Unknown`]; anything that is
/// not a tagged JSON object fails to parse and is dropped by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// The agent detected the user talking over it
    Interrupt,

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse a text payload, `None` when it is malformed
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// URLs of the preview backend derived from the configured host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewEndpoint {
    base: Url,
}

impl PreviewEndpoint {
    /// `host` must be an absolute http(s) URL such as `http://127.0.0.1:8000`
    pub fn new(host: &str) -> Result<Self, StreamingError> {
        let base = Url::parse(host)
            .map_err(|e| StreamingError::ConnectionFailed(format!("invalid host {}: {}", host, e)))?;
        match base.scheme() {
            "http" | "https" => Ok(Self { base }),
            other => Err(StreamingError::ConnectionFailed(format!(
                "unsupported scheme {} in {}",
                other, host
            ))),
        }
    }

    pub fn token_url(&self) -> Url {
        self.join(TOKEN_PATH)
    }

    /// WebSocket URL carrying the credential and refs as query parameters
    pub fn channel_url(&self, agent_ref: &str, tenant_ref: &str, token: &PreviewToken) -> Url {
        let mut url = self.join(CHANNEL_PATH);
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        // http -> ws and https -> wss are both special schemes, so this cannot fail
        let _ = url.set_scheme(scheme);
        url.query_pairs_mut()
            .append_pair("agentRef", agent_ref)
            .append_pair("tenantRef", tenant_ref)
            .append_pair("token", token.as_str());
        url
    }

    fn join(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", prefix, path));
        url.set_query(None);
        url
    }
}
