//! Session-level error taxonomy and terminal outcome

use serde::Serialize;

use crate::audio::AudioError;
use crate::streaming::StreamingError;

/// Why a preview session could not start or did not end cleanly
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum PreviewError {
    /// Microphone or speaker could not be acquired
    DeviceUnavailable(String),
    /// Token endpoint unreachable or refused the request
    AuthFailed(String),
    /// Network or protocol failure on the preview channel
    ChannelError(String),
    /// The preview engine itself has shut down
    EngineStopped,
}

impl std::fmt::Display for PreviewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {}", e),
            PreviewError::AuthFailed(e) => write!(f, "Preview authorization failed: {}", e),
            PreviewError::ChannelError(e) => write!(f, "Preview channel error: {}", e),
            PreviewError::EngineStopped => write!(f, "Preview engine has shut down"),
        }
    }
}

impl std::error::Error for PreviewError {}

impl From<AudioError> for PreviewError {
    fn from(err: AudioError) -> Self {
        PreviewError::DeviceUnavailable(err.to_string())
    }
}

impl From<StreamingError> for PreviewError {
    fn from(err: StreamingError) -> Self {
        match err {
            StreamingError::AuthFailed(e) => PreviewError::AuthFailed(e),
            other => PreviewError::ChannelError(other.to_string()),
        }
    }
}

/// The single terminal status a session reports
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "camelCase")]
pub enum SessionOutcome {
    EndedNormally,
    EndedWithError(PreviewError),
}

impl SessionOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, SessionOutcome::EndedWithError(_))
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::EndedNormally => write!(f, "ended normally"),
            SessionOutcome::EndedWithError(e) => write!(f, "ended with error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_auth_maps_to_auth_failed() {
        let err: PreviewError = StreamingError::AuthFailed("HTTP 401".to_string()).into();
        assert_eq!(err, PreviewError::AuthFailed("HTTP 401".to_string()));
    }

    #[test]
    fn test_other_streaming_errors_map_to_channel_error() {
        let err: PreviewError = StreamingError::Disconnected("reset".to_string()).into();
        assert!(matches!(err, PreviewError::ChannelError(ref m) if m.contains("reset")));

        let err: PreviewError = StreamingError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, PreviewError::ChannelError(_)));
    }

    #[test]
    fn test_audio_error_maps_to_device_unavailable() {
        let err: PreviewError = AudioError::NoOutputDevice.into();
        assert!(matches!(err, PreviewError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(SessionOutcome::EndedNormally).unwrap();
        assert_eq!(json["outcome"], "endedNormally");

        let json = serde_json::to_value(SessionOutcome::EndedWithError(
            PreviewError::ChannelError("boom".to_string()),
        ))
        .unwrap();
        assert_eq!(json["outcome"], "endedWithError");
        assert_eq!(json["error"]["kind"], "channelError");
        assert_eq!(json["error"]["message"], "boom");
    }
}
