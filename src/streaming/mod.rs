//! Duplex streaming to the voice-agent backend
//!
//! # Architecture
//!
//! ```text
//! TokenIssuer ──POST /voice/preview/token──▶ PreviewToken
//!                                                │
//!                                                ▼
//! FrameOutlet ──▶ writer task ──binary──▶  ws {host}/voice/preview
//!                                                │
//!        ChannelEvent ◀── reader task ◀──binary/text
//! ```
//!
//! The channel never retries or reconnects. A transport error or remote
//! close is reported once as a [`ChannelEvent`] and the session tears down.

mod protocol;
mod token;
mod transport;

pub use protocol::{ControlMessage, PreviewEndpoint, PreviewToken, TokenRequest, TokenResponse};
pub use token::{HttpTokenIssuer, TokenIssuer};
pub use transport::{ChannelEvent, FrameOutlet, SendOutcome, TransportChannel};

/// Errors that can occur on the token request or the duplex channel
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingError {
    /// Token endpoint unreachable or returned a non-success status
    AuthFailed(String),
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send a frame
    SendFailed(String),
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::AuthFailed(e) => write!(f, "Preview token request failed: {}", e),
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to preview backend: {}", e)
            }
            StreamingError::ProtocolError(e) => write!(f, "WebSocket protocol error: {}", e),
            StreamingError::Disconnected(e) => write!(f, "WebSocket disconnected: {}", e),
            StreamingError::SendFailed(e) => write!(f, "Failed to send audio: {}", e),
        }
    }
}

impl std::error::Error for StreamingError {}
