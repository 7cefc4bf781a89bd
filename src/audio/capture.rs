//! Microphone capture using CPAL
//!
//! `AudioCaptureSession` turns a live input subscription into a steady stream
//! of outbound PCM16 frames. Each block is encoded and handed to the channel
//! outlet; if the channel is not open the block is dropped. Capture is never
//! paused or buffered on behalf of the network.
//!
//! ```text
//! Audio Thread (sync)                          Tokio Runtime (async)
//! ┌──────────────────────┐                     ┌──────────────────────┐
//! │ CPAL Callback        │                     │ TransportChannel     │
//! │  ├─ downmix/resample │──outlet.try_send──▶ │  writer task         │
//! │  ├─ 4096-sample block│                     │  (binary WS frames)  │
//! │  └─ encode PCM16     │                     └──────────────────────┘
//! └──────────────────────┘
//! ```

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, SupportedStreamConfig};

use super::codec::AudioFrame;
use super::device::{AudioInputSource, BlockCallback, CaptureConstraints, InputSubscription};
use super::output::resample_linear;
use super::AudioError;
use crate::metrics::SessionMetrics;
use crate::streaming::{FrameOutlet, SendOutcome};

/// An open microphone subscription feeding the preview channel.
pub struct AudioCaptureSession {
    subscription: Option<Box<dyn InputSubscription>>,
    metrics: Arc<SessionMetrics>,
}

impl AudioCaptureSession {
    /// Open the input device and start pushing frames to `outlet`.
    pub fn open(
        source: &dyn AudioInputSource,
        constraints: &CaptureConstraints,
        outlet: FrameOutlet,
        metrics: Arc<SessionMetrics>,
    ) -> Result<Self, AudioError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            log::debug!(
                "Capture: requested echo_cancellation={}, noise_suppression={} (best effort)",
                constraints.echo_cancellation,
                constraints.noise_suppression
            );
        }

        let callback_metrics = metrics.clone();
        let on_block: BlockCallback = Box::new(move |block: &[f32]| {
            let frame = AudioFrame::from_float(block);
            match outlet.send(frame) {
                SendOutcome::Queued => {
                    let sent = callback_metrics.record_frame_sent();
                    if sent % 50 == 0 {
                        log::debug!("Capture: sent {} frames", sent);
                    }
                }
                SendOutcome::NotOpen | SendOutcome::QueueFull => {
                    callback_metrics.record_frame_dropped();
                }
            }
        });

        let subscription = source.open(constraints, on_block)?;
        log::info!(
            "Capture: started ({} Hz mono, {}-sample blocks)",
            constraints.sample_rate,
            constraints.block_size
        );

        Ok(Self {
            subscription: Some(subscription),
            metrics,
        })
    }

    pub fn is_open(&self) -> bool {
        self.subscription.is_some()
    }

    /// Release the device subscription. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), AudioError> {
        let Some(mut subscription) = self.subscription.take() else {
            return Ok(());
        };
        let result = subscription.close();
        let counters = self.metrics.snapshot();
        log::info!(
            "Capture: stopped ({} frames sent, {} dropped)",
            counters.frames_sent,
            counters.frames_dropped
        );
        result
    }
}

impl Drop for AudioCaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Capture: error releasing input on drop: {}", e);
        }
    }
}

/// Accumulates device callback data into fixed-size mono blocks at the wire rate.
#[derive(Debug)]
pub struct BlockAssembler {
    channels: usize,
    source_rate: u32,
    target_rate: u32,
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(channels: u16, source_rate: u32, target_rate: u32, block_size: usize) -> Self {
        Self {
            channels: channels.max(1) as usize,
            source_rate,
            target_rate,
            block_size: block_size.max(1),
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Feed interleaved device samples; `emit` is called once per complete block.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(&[f32])) {
        let mono = downmix(interleaved, self.channels);
        let converted = convert_rate(&mono, self.source_rate, self.target_rate);
        self.pending.extend(converted);

        while self.pending.len() >= self.block_size {
            emit(&self.pending[..self.block_size]);
            self.pending.drain(..self.block_size);
        }
    }

    /// Samples waiting for the next block
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved channels down to mono
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Integer ratios average neighbouring samples; anything else is interpolated.
fn convert_rate(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 || source_rate == target_rate {
        return samples.to_vec();
    }
    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }
    resample_linear(samples, source_rate, target_rate)
}

/// Default input device via CPAL.
///
/// cpal streams are not `Send`, so each subscription owns a dedicated thread
/// that builds the stream, parks until told to stop, then drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInputSource;

impl AudioInputSource for CpalInputSource {
    fn open(
        &self,
        constraints: &CaptureConstraints,
        on_block: BlockCallback,
    ) -> Result<Box<dyn InputSubscription>, AudioError> {
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let constraints = constraints.clone();

        let thread = std::thread::Builder::new()
            .name("preview-capture".to_string())
            .spawn(move || {
                let stream = match build_capture_stream(&constraints, on_block) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = init_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = init_tx.send(Ok(()));

                // Park until close() or the subscription is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalInputSubscription {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamCreationFailed(
                    "Capture thread exited during setup".to_string(),
                ))
            }
        }
    }
}

struct CpalInputSubscription {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputSubscription for CpalInputSubscription {
    fn close(&mut self) -> Result<(), AudioError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| AudioError::ReleaseFailed("capture thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CpalInputSubscription {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn build_capture_stream(
    constraints: &CaptureConstraints,
    on_block: BlockCallback,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("No audio input device found".to_string()))?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = choose_input_config(&device, constraints)?;
    log::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let assembler = BlockAssembler::new(
        supported.channels(),
        supported.sample_rate().0,
        constraints.sample_rate,
        constraints.block_size,
    );

    match supported.sample_format() {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &supported, assembler, on_block),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &supported, assembler, on_block),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &supported, assembler, on_block),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

/// Prefer an exact mono config at the wire rate, else the device default.
fn choose_input_config(
    device: &cpal::Device,
    constraints: &CaptureConstraints,
) -> Result<SupportedStreamConfig, AudioError> {
    let wanted = cpal::SampleRate(constraints.sample_rate);

    if let Ok(ranges) = device.supported_input_configs() {
        let exact = ranges
            .filter(|r| r.channels() == constraints.channels)
            .filter(|r| matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16))
            .find(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate());
        if let Some(range) = exact {
            return Ok(range.with_sample_rate(wanted));
        }
    }

    device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            AudioError::DeviceUnavailable("Input device not available".to_string())
        }
        _ => AudioError::NoSupportedConfig,
    })
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    supported: &SupportedStreamConfig,
    mut assembler: BlockAssembler,
    mut on_block: BlockCallback,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let config = supported.config();
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            &config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data
                    .iter()
                    .map(|&s| <f32 as cpal::Sample>::from_sample(s))
                    .collect();
                assembler.push(&samples, |block| on_block(block));
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable("Input device not available".to_string())
            }
            other => AudioError::StreamCreationFailed(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::FrameOutlet;
    use std::sync::Mutex;

    /// Input source whose callback is driven by the test
    #[derive(Default)]
    struct ManualInput {
        callback: Arc<Mutex<Option<BlockCallback>>>,
        closes: Arc<Mutex<u32>>,
    }

    struct ManualSubscription {
        callback: Arc<Mutex<Option<BlockCallback>>>,
        closes: Arc<Mutex<u32>>,
        closed: bool,
    }

    impl InputSubscription for ManualSubscription {
        fn close(&mut self) -> Result<(), AudioError> {
            if !self.closed {
                self.closed = true;
                *self.closes.lock().unwrap() += 1;
                self.callback.lock().unwrap().take();
            }
            Ok(())
        }
    }

    impl AudioInputSource for ManualInput {
        fn open(
            &self,
            _constraints: &CaptureConstraints,
            on_block: BlockCallback,
        ) -> Result<Box<dyn InputSubscription>, AudioError> {
            *self.callback.lock().unwrap() = Some(on_block);
            Ok(Box::new(ManualSubscription {
                callback: self.callback.clone(),
                closes: self.closes.clone(),
                closed: false,
            }))
        }
    }

    impl ManualInput {
        fn deliver(&self, block: &[f32]) {
            if let Some(cb) = self.callback.lock().unwrap().as_mut() {
                cb(block);
            }
        }
    }

    struct DeniedInput;

    impl AudioInputSource for DeniedInput {
        fn open(
            &self,
            _constraints: &CaptureConstraints,
            _on_block: BlockCallback,
        ) -> Result<Box<dyn InputSubscription>, AudioError> {
            Err(AudioError::DeviceUnavailable("permission denied".to_string()))
        }
    }

    #[test]
    fn blocks_are_dropped_while_channel_is_not_open() {
        let input = ManualInput::default();
        let (outlet, mut rx) = FrameOutlet::channel(8);
        let metrics = Arc::new(SessionMetrics::default());
        let _session = AudioCaptureSession::open(
            &input,
            &CaptureConstraints::default(),
            outlet,
            metrics.clone(),
        )
        .unwrap();

        input.deliver(&[0.5; 16]);

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().frames_dropped, 1);
        assert_eq!(metrics.snapshot().frames_sent, 0);
    }

    #[test]
    fn blocks_are_encoded_and_forwarded_when_open() {
        let input = ManualInput::default();
        let (outlet, mut rx) = FrameOutlet::channel(8);
        outlet.mark_open();
        let metrics = Arc::new(SessionMetrics::default());
        let _session = AudioCaptureSession::open(
            &input,
            &CaptureConstraints::default(),
            outlet,
            metrics.clone(),
        )
        .unwrap();

        input.deliver(&[1.0, -1.0, 0.0]);
        input.deliver(&[0.25]);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.samples(), &[i16::MAX, i16::MIN, 0]);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.samples(), &[8191]);
        assert_eq!(metrics.snapshot().frames_sent, 2);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let input = ManualInput::default();
        let (outlet, _rx) = FrameOutlet::channel(1);
        outlet.mark_open();
        let metrics = Arc::new(SessionMetrics::default());
        let _session = AudioCaptureSession::open(
            &input,
            &CaptureConstraints::default(),
            outlet,
            metrics.clone(),
        )
        .unwrap();

        input.deliver(&[0.1; 4]);
        input.deliver(&[0.1; 4]);
        input.deliver(&[0.1; 4]);

        let counters = metrics.snapshot();
        assert_eq!(counters.frames_sent, 1);
        assert_eq!(counters.frames_dropped, 2);
    }

    #[test]
    fn close_is_idempotent() {
        let input = ManualInput::default();
        let (outlet, _rx) = FrameOutlet::channel(8);
        let mut session = AudioCaptureSession::open(
            &input,
            &CaptureConstraints::default(),
            outlet,
            Arc::new(SessionMetrics::default()),
        )
        .unwrap();

        assert!(session.is_open());
        session.close().unwrap();
        session.close().unwrap();
        drop(session);

        assert_eq!(*input.closes.lock().unwrap(), 1);
    }

    #[test]
    fn denied_device_surfaces_device_unavailable() {
        let (outlet, _rx) = FrameOutlet::channel(8);
        let result = AudioCaptureSession::open(
            &DeniedInput,
            &CaptureConstraints::default(),
            outlet,
            Arc::new(SessionMetrics::default()),
        );
        assert!(matches!(result, Err(AudioError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_block_assembler_emits_fixed_blocks() {
        let mut assembler = BlockAssembler::new(1, 24000, 24000, 4);
        let mut blocks = Vec::new();

        assembler.push(&[0.1, 0.2, 0.3], |b| blocks.push(b.to_vec()));
        assert!(blocks.is_empty());
        assert_eq!(assembler.pending_len(), 3);

        assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9], |b| blocks.push(b.to_vec()));
        assert_eq!(blocks, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(assembler.pending_len(), 1);
    }

    #[test]
    fn test_block_assembler_downmixes_and_downsamples() {
        // Stereo 48kHz -> mono 24kHz
        let mut assembler = BlockAssembler::new(2, 48000, 24000, 2);
        let mut blocks = Vec::new();
        let interleaved = [0.2, 0.4, 0.4, 0.6, -0.2, -0.4, -0.4, -0.6];

        assembler.push(&interleaved, |b| blocks.push(b.to_vec()));

        assert_eq!(blocks.len(), 1);
        // mono: [0.3, 0.5, -0.3, -0.5] -> pairs averaged: [0.4, -0.4]
        assert!((blocks[0][0] - 0.4).abs() < 1e-6);
        assert!((blocks[0][1] + 0.4).abs() < 1e-6);
    }
}
