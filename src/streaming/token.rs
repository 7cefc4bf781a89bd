//! Preview token acquisition

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::protocol::{PreviewEndpoint, PreviewToken, TokenRequest, TokenResponse};
use super::StreamingError;

/// Source of short-lived preview credentials
#[async_trait]
pub trait TokenIssuer: Send + Sync + 'static {
    async fn issue(&self, agent_ref: &str, tenant_ref: &str)
        -> Result<PreviewToken, StreamingError>;
}

/// Token issuer backed by the backend's HTTP endpoint
pub struct HttpTokenIssuer {
    client: Client,
    endpoint: PreviewEndpoint,
}

impl HttpTokenIssuer {
    pub fn new(endpoint: PreviewEndpoint, timeout: Duration) -> Result<Self, StreamingError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StreamingError::AuthFailed(format!("HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(
        &self,
        agent_ref: &str,
        tenant_ref: &str,
    ) -> Result<PreviewToken, StreamingError> {
        let url = self.endpoint.token_url();
        log::info!("Requesting preview token from {}", url);

        let body = TokenRequest {
            agent_ref: agent_ref.to_string(),
            tenant_ref: tenant_ref.to_string(),
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StreamingError::AuthFailed(format!("endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::warn!("Token endpoint returned {}: {}", status, detail);
            return Err(StreamingError::AuthFailed(format!("HTTP {}", status.as_u16())));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| StreamingError::AuthFailed(format!("invalid token response: {}", e)))?;

        if parsed.token.is_empty() {
            return Err(StreamingError::AuthFailed("empty token".to_string()));
        }

        log::debug!("Preview token acquired");
        Ok(PreviewToken::new(parsed.token))
    }
}
