//! Audio capture and playback for voice preview
//!
//! Capture runs off the default input device and emits fixed-size PCM16
//! frames; playback schedules inbound frames back-to-back on the output
//! device clock. Both sides sit behind the capability traits in [`device`]
//! so the session logic never touches cpal directly.

pub mod capture;
pub mod codec;
pub mod device;
pub mod output;
pub mod playback;

pub use capture::{AudioCaptureSession, BlockAssembler, CpalInputSource};
pub use codec::{decode, encode, AudioFrame};
pub use device::{
    AudioInputSource, AudioOutputDevice, AudioOutputSink, BlockCallback, CaptureConstraints,
    InputSubscription, OutputConfig, SegmentId,
};
pub use output::{resample_linear, CpalOutputDevice, Mixer};
pub use playback::{PlaybackScheduler, ScheduledSegment};

/// Errors that can occur while acquiring or releasing audio devices.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Permission denied or no input device present
    DeviceUnavailable(String),
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    ReleaseFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::DeviceUnavailable(e) => write!(f, "Audio input unavailable: {}", e),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::ReleaseFailed(e) => write!(f, "Failed to release audio device: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}
