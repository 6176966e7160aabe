//! Configuration types for the capture engine.

use std::time::Duration;

use crate::CaptureError;

/// Top-level configuration for a [`CaptureEngine`](crate::CaptureEngine).
///
/// All sources share one PCM format: fixed-rate interleaved little-endian
/// signed 16-bit samples. Network decoders are invoked with matching output
/// arguments, so no format conversion happens inside the engine.
///
/// # Example
///
/// ```
/// use fieldstream::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     capture_seconds: 30,
///     overlap: Duration::from_millis(500),
///     ..Default::default()
/// };
/// assert_eq!(config.capture_capacity(), 30 * 48_000 * 2);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sample rate in Hz shared by every source. Default: 48000.
    pub sample_rate: u32,

    /// Channel count shared by every source. Default: 1 (mono).
    pub channels: u16,

    /// Bytes per sample. Only 16-bit PCM is supported, so this must be 2.
    pub bytes_per_sample: u16,

    /// Seconds of raw audio retained per source for clip extraction.
    ///
    /// Default: 60 seconds.
    pub capture_seconds: u32,

    /// Duration of one classifier analysis window. Default: 3 seconds.
    pub window: Duration,

    /// Overlap carried from one analysis window into the next.
    ///
    /// Must be shorter than `window`. Default: 1.5 seconds.
    pub overlap: Duration,

    /// Analysis ring capacity as a multiple of the window size.
    ///
    /// Default: 3 windows.
    pub analysis_slack: u32,

    /// Target duration of each chunk read from a device or decoder.
    ///
    /// Default: 100ms.
    pub read_chunk: Duration,

    /// Capacity of the per-source chunk channel between a source and its
    /// capture producer. Default: 100 chunks (~10 seconds at 100ms chunks).
    pub chunk_channel_capacity: usize,

    /// Signal-level metering configuration.
    pub level: LevelConfig,

    /// External decoder configuration for network sources.
    pub decoder: DecoderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            bytes_per_sample: 2,
            capture_seconds: 60,
            window: Duration::from_secs(3),
            overlap: Duration::from_millis(1500),
            analysis_slack: 3,
            read_chunk: Duration::from_millis(100),
            chunk_channel_capacity: 100,
            level: LevelConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Bytes per interleaved sample frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Raw PCM byte rate for the configured format.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Capture ring capacity in bytes.
    pub fn capture_capacity(&self) -> usize {
        self.capture_seconds as usize * self.bytes_per_second()
    }

    /// Analysis window size in bytes, aligned to a whole frame.
    pub fn window_bytes(&self) -> usize {
        self.duration_bytes(self.window)
    }

    /// Window overlap in bytes, aligned to a whole frame.
    pub fn overlap_bytes(&self) -> usize {
        self.duration_bytes(self.overlap)
    }

    /// Size in bytes of one chunk read from a device or decoder.
    pub fn read_chunk_bytes(&self) -> usize {
        self.duration_bytes(self.read_chunk).max(self.frame_bytes())
    }

    fn duration_bytes(&self, d: Duration) -> usize {
        let bytes = (d.as_secs_f64() * self.bytes_per_second() as f64) as usize;
        bytes - bytes % self.frame_bytes().max(1)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::InvalidConfig`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.sample_rate == 0 {
            return Err(CaptureError::invalid_config("sample_rate must be non-zero"));
        }
        if self.channels == 0 {
            return Err(CaptureError::invalid_config("channels must be non-zero"));
        }
        if self.bytes_per_sample != 2 {
            return Err(CaptureError::invalid_config(
                "only 16-bit PCM is supported (bytes_per_sample must be 2)",
            ));
        }
        if self.capture_seconds == 0 {
            return Err(CaptureError::invalid_config(
                "capture_seconds must be non-zero",
            ));
        }
        if self.window.is_zero() {
            return Err(CaptureError::invalid_config("window must be non-zero"));
        }
        if self.overlap >= self.window {
            return Err(CaptureError::invalid_config(
                "overlap must be shorter than window",
            ));
        }
        if self.analysis_slack == 0 {
            return Err(CaptureError::invalid_config(
                "analysis_slack must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for the signal-level monitor.
#[derive(Debug, Clone)]
pub struct LevelConfig {
    /// dBFS value mapped to level 0. Default: -60.0.
    pub floor_db: f64,

    /// dB span mapped onto the 0-100 range above the floor. Default: 50.0.
    ///
    /// With the defaults, -60 dBFS reports 0 and -10 dBFS reports 100.
    pub span_db: f64,

    /// A source with no update or no non-zero signal for this long reports
    /// level 0 while remaining registered. Default: 15 seconds.
    pub inactivity_timeout: Duration,

    /// Capacity of the level-event broadcast channel.
    ///
    /// Slow subscribers lose the oldest events once they lag this far behind.
    /// Default: 64.
    pub event_capacity: usize,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            floor_db: -60.0,
            span_db: 50.0,
            inactivity_timeout: Duration::from_secs(15),
            event_capacity: 64,
        }
    }
}

/// Configuration for external stream decoders.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Decoder executable. Default: `ffmpeg`.
    pub program: String,

    /// Restart policy for crashed decoders.
    pub restart: RestartPolicy,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Restart pacing for a supervised decoder process.
///
/// Two mechanisms combine: an exponential backoff after each failure, and a
/// hard minimum interval between consecutive spawns. The interval bounds the
/// spawn rate over any time window even if backoff state is reset.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before the first restart after a failure. Default: 1 second.
    pub initial_backoff: Duration,

    /// Upper bound for the exponential backoff. Default: 30 seconds.
    pub max_backoff: Duration,

    /// Minimum time between consecutive process spawns. Default: 5 seconds.
    pub min_spawn_interval: Duration,

    /// Consecutive failures before the stream is reported degraded.
    ///
    /// Default: 5.
    pub restart_budget: u32,

    /// A run at least this long resets the consecutive-failure count.
    ///
    /// Default: 30 seconds.
    pub stability_threshold: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            min_spawn_interval: Duration::from_secs(5),
            restart_budget: 5,
            stability_threshold: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Backoff delay after the given number of consecutive failures.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }
}
