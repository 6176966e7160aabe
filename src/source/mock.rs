//! Mock PCM generator for testing without hardware or decoders.

use std::time::Duration;

/// Generates synthetic little-endian s16 PCM for tests.
///
/// This lets the buffer, level, and producer paths run without a capture
/// device or an external decoder, making them testable in CI.
///
/// # Example
///
/// ```
/// use fieldstream::MockPcm;
///
/// let mut mock = MockPcm::new(48_000, 1);
/// mock.silence(100);
/// mock.sine(440.0, 100, 0.5);
/// let bytes = mock.take_bytes();
/// assert_eq!(bytes.len(), 2 * 48_000 / 5); // 200ms of mono s16
/// ```
pub struct MockPcm {
    sample_rate: u32,
    channels: u16,
    samples: Vec<i16>,
}

impl MockPcm {
    /// Creates a new generator with the given format.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            samples: Vec::new(),
        }
    }

    /// Appends silence for the given duration in milliseconds.
    pub fn silence(&mut self, duration_ms: u64) {
        let num_samples = self.samples_for_duration(duration_ms);
        self.samples.extend(std::iter::repeat(0i16).take(num_samples));
    }

    /// Appends a sine wave at the given frequency and amplitude (0.0 to 1.0).
    pub fn sine(&mut self, frequency: f64, duration_ms: u64, amplitude: f64) {
        let num_frames = self.samples_for_duration(duration_ms) / self.channels as usize;
        let sample_rate = f64::from(self.sample_rate);

        for i in 0..num_frames {
            let t = i as f64 / sample_rate;
            let value = (2.0 * std::f64::consts::PI * frequency * t).sin() * amplitude;
            let sample = (value * 32767.0) as i16;

            for _ in 0..self.channels {
                self.samples.push(sample);
            }
        }
    }

    /// Appends one frame of samples at the positive 16-bit extreme.
    pub fn clipped_frame(&mut self) {
        for _ in 0..self.channels {
            self.samples.push(i16::MAX);
        }
    }

    /// Appends raw samples directly.
    pub fn add_samples(&mut self, samples: &[i16]) {
        self.samples.extend_from_slice(samples);
    }

    /// Returns the duration of accumulated audio.
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / self.channels as usize;
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }

    /// Takes all accumulated audio as little-endian PCM bytes.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        let samples = std::mem::take(&mut self.samples);
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// Takes accumulated audio split into chunks of at most `chunk_bytes`.
    pub fn take_chunks(&mut self, chunk_bytes: usize) -> Vec<Vec<u8>> {
        self.take_bytes()
            .chunks(chunk_bytes.max(2))
            .map(<[u8]>::to_vec)
            .collect()
    }

    fn samples_for_duration(&self, duration_ms: u64) -> usize {
        let frames = (u64::from(self.sample_rate) * duration_ms / 1000) as usize;
        frames * self.channels as usize
    }
}
