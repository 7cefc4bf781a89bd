//! Sample conversion between float audio and 16-bit linear PCM
//!
//! Negative samples scale by 32768 and non-negative samples by 32767, so both
//! ends of the float range map exactly onto `i16::MIN` / `i16::MAX` and
//! decoding mirrors encoding.

/// Scale for negative samples
const NEG_SCALE: f32 = 32768.0;

/// Scale for non-negative samples
const POS_SCALE: f32 = 32767.0;

/// Encode float samples in [-1.0, 1.0] to PCM16.
///
/// Out-of-range input is clamped, never rejected.
pub fn encode(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

/// Decode PCM16 samples to floats in [-1.0, 1.0].
pub fn decode(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| decode_sample(s)).collect()
}

#[inline]
fn encode_sample(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    let scaled = if clamped < 0.0 {
        clamped * NEG_SCALE
    } else {
        clamped * POS_SCALE
    };
    // `as` truncates toward zero and saturates (NaN becomes 0)
    scaled as i16
}

#[inline]
fn decode_sample(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / NEG_SCALE
    } else {
        sample as f32 / POS_SCALE
    }
}

/// One unit of raw audio on the preview channel: mono PCM16, little-endian.
///
/// Frames carry no sequence number; ordering comes from the channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Encode a block of captured float samples into a frame
    pub fn from_float(samples: &[f32]) -> Self {
        Self::new(encode(samples))
    }

    /// Parse a binary payload received from the channel.
    ///
    /// A trailing odd byte cannot form a sample and is discarded.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        if bytes.len() % 2 != 0 {
            log::debug!(
                "AudioFrame: discarding trailing byte of {}-byte payload",
                bytes.len()
            );
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { samples }
    }

    /// Serialize for the wire
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Decode to float samples for playback
    pub fn to_float(&self) -> Vec<f32> {
        decode(&self.samples)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds at the given sample rate
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / sample_rate as f64
    }
}
