//! Capability traits for audio hardware
//!
//! `AudioInputSource` delivers fixed-size blocks of mono float samples on a
//! periodic callback. `AudioOutputSink` is an output graph with its own
//! monotonic clock on which decoded segments are scheduled.

use super::AudioError;

/// Identifier of one scheduled playback segment
pub type SegmentId = u64;

/// Callback receiving one block of mono float samples at the requested rate
pub type BlockCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Requested capture format.
///
/// Echo cancellation and noise suppression are hints; a source may ignore them.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            block_size: 4096,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Something that can open a microphone subscription
pub trait AudioInputSource: Send + Sync + 'static {
    /// Start delivering blocks to `on_block` until the subscription is closed.
    ///
    /// Fails with [`AudioError::DeviceUnavailable`] when access is denied or
    /// no device exists.
    fn open(
        &self,
        constraints: &CaptureConstraints,
        on_block: BlockCallback,
    ) -> Result<Box<dyn InputSubscription>, AudioError>;
}

/// A live input device subscription
pub trait InputSubscription: Send {
    /// Stop delivery and release the device. Must be idempotent.
    fn close(&mut self) -> Result<(), AudioError>;
}

/// Output graph parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Sample rate of the segments that will be scheduled
    pub sample_rate: u32,
    /// Static gain applied between segments and the device
    pub gain: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            gain: 2.0,
        }
    }
}

/// Something that can open an output graph
pub trait AudioOutputDevice: Send + Sync + 'static {
    fn open(&self, config: &OutputConfig) -> Result<Box<dyn AudioOutputSink>, AudioError>;
}

/// An open output graph with a monotonic clock
pub trait AudioOutputSink: Send {
    /// Current audio clock in seconds
    fn now(&self) -> f64;

    /// Schedule `samples` (at `sample_rate`) to begin at `start_at` seconds on
    /// the audio clock.
    fn schedule(&mut self, id: SegmentId, samples: Vec<f32>, sample_rate: u32, start_at: f64);

    /// Halt a segment and detach it from the graph. Unknown ids are ignored.
    fn stop(&mut self, id: SegmentId);

    /// Drain ids of segments that finished playing on their own
    fn take_completed(&mut self) -> Vec<SegmentId>;

    /// Release the output device. Must be idempotent.
    fn release(&mut self) -> Result<(), AudioError>;
}
