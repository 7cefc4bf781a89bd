//! Output graph on the default playback device
//!
//! The [`Mixer`] is the whole graph: scheduled segments start at an exact
//! frame on the output clock, are summed, pass through a static gain stage,
//! are clamped and duplicated to every device channel. The clock is the
//! number of frames the device has pulled so far.

use std::collections::HashSet;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, SupportedStreamConfig};

use super::device::{AudioOutputDevice, AudioOutputSink, OutputConfig, SegmentId};
use super::AudioError;

/// Linear interpolation between sample rates
pub fn resample_linear(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 || source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * target_rate as u64) / source_rate as u64) as usize;
    let step = source_rate as f64 / target_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[idx + 1] - samples[idx]) * frac
        })
        .collect()
}

#[derive(Debug)]
struct Voice {
    id: SegmentId,
    start_frame: u64,
    samples: Vec<f32>,
    cursor: usize,
}

/// Sample-accurate segment mixer driven by the output callback.
#[derive(Debug)]
pub struct Mixer {
    device_rate: u32,
    channels: usize,
    gain: f32,
    rendered_frames: u64,
    /// End frame of the most recently added segment
    tail_frame: Option<u64>,
    voices: Vec<Voice>,
    completed: Vec<SegmentId>,
    scratch: Vec<f32>,
}

impl Mixer {
    pub fn new(device_rate: u32, channels: u16, gain: f32) -> Self {
        Self {
            device_rate: device_rate.max(1),
            channels: channels.max(1) as usize,
            gain,
            rendered_frames: 0,
            tail_frame: None,
            voices: Vec::new(),
            completed: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Output clock in seconds
    pub fn clock_secs(&self) -> f64 {
        self.rendered_frames as f64 / self.device_rate as f64
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Add a segment already at the device rate.
    ///
    /// A start time that has already passed plays from the next rendered frame.
    pub fn add(&mut self, id: SegmentId, samples: Vec<f32>, start_at: f64) {
        let mut start_frame = (start_at.max(0.0) * self.device_rate as f64).round() as u64;
        // Rounded starts and floored resample lengths drift by a frame at
        // non-integer rate ratios; chain onto the previous segment instead
        if let Some(tail) = self.tail_frame {
            if start_frame.abs_diff(tail) <= 1 {
                start_frame = tail;
            }
        }
        self.tail_frame = Some(start_frame + samples.len() as u64);
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
            cursor: 0,
        });
    }

    /// Remove a segment without reporting it as completed
    pub fn stop(&mut self, id: SegmentId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn active_len(&self) -> usize {
        self.voices.len()
    }

    pub fn take_completed(&mut self) -> Vec<SegmentId> {
        std::mem::take(&mut self.completed)
    }

    /// Render one interleaved buffer and advance the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        let frames = out.len() / self.channels;
        let block_start = self.rendered_frames;
        let block_end = block_start + frames as u64;

        self.scratch.clear();
        self.scratch.resize(frames, 0.0);

        for voice in self.voices.iter_mut() {
            if voice.start_frame >= block_end {
                continue;
            }
            let offset = if voice.cursor == 0 {
                voice.start_frame.saturating_sub(block_start) as usize
            } else {
                0
            };
            let n = (frames - offset).min(voice.samples.len() - voice.cursor);
            for i in 0..n {
                self.scratch[offset + i] += voice.samples[voice.cursor + i];
            }
            voice.cursor += n;
        }

        let completed = &mut self.completed;
        self.voices.retain(|v| {
            let done = v.cursor >= v.samples.len();
            if done {
                completed.push(v.id);
            }
            !done
        });

        for (frame, &mono) in out.chunks_mut(self.channels).zip(self.scratch.iter()) {
            let value = (mono * self.gain).clamp(-1.0, 1.0);
            frame.fill(value);
        }
        // Trailing partial frame, if any
        let tail = frames * self.channels;
        out[tail..].fill(0.0);

        self.rendered_frames = block_end;
    }
}

/// Default output device via CPAL.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutputDevice;

impl AudioOutputDevice for CpalOutputDevice {
    fn open(&self, config: &OutputConfig) -> Result<Box<dyn AudioOutputSink>, AudioError> {
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<Arc<Mutex<Mixer>>, AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = config.clone();

        let thread = std::thread::Builder::new()
            .name("preview-playback".to_string())
            .spawn(move || {
                let (stream, mixer) = match build_playback_stream(&config) {
                    Ok(parts) => parts,
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
                let _ = init_tx.send(Ok(mixer));

                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Playback thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(mixer)) => Ok(Box::new(CpalOutputSink {
                mixer,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
                known: HashSet::new(),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamCreationFailed(
                    "Playback thread exited during setup".to_string(),
                ))
            }
        }
    }
}

struct CpalOutputSink {
    mixer: Arc<Mutex<Mixer>>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    known: HashSet<SegmentId>,
}

impl CpalOutputSink {
    fn lock(&self) -> std::sync::MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AudioOutputSink for CpalOutputSink {
    fn now(&self) -> f64 {
        self.lock().clock_secs()
    }

    fn schedule(&mut self, id: SegmentId, samples: Vec<f32>, sample_rate: u32, start_at: f64) {
        if self.thread.is_none() {
            log::debug!("Playback: ignoring segment {} after release", id);
            return;
        }
        let device_rate = self.lock().device_rate();
        // Resample outside the lock; the callback contends for it
        let samples = resample_linear(&samples, sample_rate, device_rate);
        self.lock().add(id, samples, start_at);
        self.known.insert(id);
    }

    fn stop(&mut self, id: SegmentId) {
        if self.known.remove(&id) {
            self.lock().stop(id);
        }
    }

    fn take_completed(&mut self) -> Vec<SegmentId> {
        let completed = self.lock().take_completed();
        for id in &completed {
            self.known.remove(id);
        }
        completed
    }

    fn release(&mut self) -> Result<(), AudioError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| AudioError::ReleaseFailed("playback thread panicked".to_string()))?;
            log::info!("Playback: output device released");
        }
        self.known.clear();
        Ok(())
    }
}

impl Drop for CpalOutputSink {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn build_playback_stream(config: &OutputConfig) -> Result<(Stream, Arc<Mutex<Mixer>>), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported = choose_output_config(&device, config.sample_rate)?;
    log::info!(
        "Playback config: {} Hz, {} channels, {:?}, gain {:.1}x",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format(),
        config.gain
    );

    let mixer = Arc::new(Mutex::new(Mixer::new(
        supported.sample_rate().0,
        supported.channels(),
        config.gain,
    )));

    let stream = match supported.sample_format() {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &supported, mixer.clone()),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &supported, mixer.clone()),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &supported, mixer.clone()),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, mixer))
}

fn choose_output_config(
    device: &cpal::Device,
    sample_rate: u32,
) -> Result<SupportedStreamConfig, AudioError> {
    let wanted = cpal::SampleRate(sample_rate);

    if let Ok(ranges) = device.supported_output_configs() {
        let exact = ranges
            .filter(|r| r.sample_format() == SampleFormat::F32)
            .find(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate());
        if let Some(range) = exact {
            return Ok(range.with_sample_rate(wanted));
        }
    }

    device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    supported: &SupportedStreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let config = supported.config();
    let err_fn = |err| log::error!("Audio output stream error: {}", err);
    let mut buffer: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            &config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                buffer.resize(data.len(), 0.0);
                {
                    let mut guard = mixer.lock().unwrap_or_else(|e| e.into_inner());
                    guard.render(&mut buffer);
                }
                for (out, &sample) in data.iter_mut().zip(buffer.iter()) {
                    *out = <T as cpal::Sample>::from_sample(sample);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_linear_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 24000, 24000), input);
    }

    #[test]
    fn test_resample_linear_upsample_interpolates() {
        let out = resample_linear(&[0.0, 1.0], 24000, 48000);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resample_linear_zero_rate_returns_input() {
        let input = vec![0.1, 0.2];
        assert_eq!(resample_linear(&input, 0, 24000), input);
    }

    #[test]
    fn mixer_starts_segment_at_its_frame() {
        let mut mixer = Mixer::new(10, 1, 1.0);
        mixer.add(1, vec![0.5, 0.5], 0.3); // frame 3

        let mut out = vec![0.0; 6];
        mixer.render(&mut out);

        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.5, 0.5, 0.0]);
        assert_eq!(mixer.take_completed(), vec![1]);
        assert!((mixer.clock_secs() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn mixer_plays_back_to_back_segments_without_gap() {
        let mut mixer = Mixer::new(10, 1, 1.0);
        mixer.add(1, vec![0.1, 0.1, 0.1], 0.0);
        mixer.add(2, vec![0.2, 0.2], 0.3);

        let mut out = vec![0.0; 5];
        mixer.render(&mut out);

        assert_eq!(out, vec![0.1, 0.1, 0.1, 0.2, 0.2]);
        assert_eq!(mixer.take_completed(), vec![1, 2]);
    }

    #[test]
    fn mixer_chains_resampled_segments_at_fractional_rate_ratio() {
        // 100 wire samples at 24 kHz are 183.75 frames at 44.1 kHz
        let segment = resample_linear(&[0.25; 100], 24000, 44100);
        assert_eq!(segment.len(), 183);

        let mut mixer = Mixer::new(44100, 1, 1.0);
        mixer.add(1, segment.clone(), 0.0);
        mixer.add(2, segment, 100.0 / 24000.0);

        let mut out = vec![0.0; 400];
        mixer.render(&mut out);

        assert!(out[..366].iter().all(|&s| s == 0.25), "gap or overlap at the seam");
        assert!(out[366..].iter().all(|&s| s == 0.0));
        assert_eq!(mixer.take_completed(), vec![1, 2]);
    }

    #[test]
    fn mixer_continues_segment_across_buffers() {
        let mut mixer = Mixer::new(10, 1, 1.0);
        mixer.add(7, vec![0.1, 0.2, 0.3, 0.4], 0.0);

        let mut first = vec![0.0; 3];
        mixer.render(&mut first);
        assert_eq!(first, vec![0.1, 0.2, 0.3]);
        assert!(mixer.take_completed().is_empty());

        let mut second = vec![0.0; 3];
        mixer.render(&mut second);
        assert_eq!(second, vec![0.4, 0.0, 0.0]);
        assert_eq!(mixer.take_completed(), vec![7]);
    }

    #[test]
    fn mixer_applies_gain_clamps_and_duplicates_channels() {
        let mut mixer = Mixer::new(10, 2, 2.0);
        mixer.add(1, vec![0.25, 0.75], 0.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);

        assert_eq!(out, vec![0.5, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn mixer_stop_silences_without_completion() {
        let mut mixer = Mixer::new(10, 1, 1.0);
        mixer.add(1, vec![0.5; 10], 0.0);
        assert!(mixer.stop(1));
        assert!(!mixer.stop(1));

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);

        assert_eq!(out, vec![0.0; 4]);
        assert!(mixer.take_completed().is_empty());
        assert_eq!(mixer.active_len(), 0);
    }

    #[test]
    fn mixer_late_segment_plays_immediately() {
        let mut mixer = Mixer::new(10, 1, 1.0);
        let mut out = vec![0.0; 5];
        mixer.render(&mut out);

        // Clock is at frame 5; a segment scheduled for frame 2 starts now
        mixer.add(3, vec![0.3], 0.2);
        let mut out = vec![0.0; 2];
        mixer.render(&mut out);

        assert_eq!(out, vec![0.3, 0.0]);
    }
}
