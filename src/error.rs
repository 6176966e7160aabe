//! Error types for the capture engine.
//!
//! Errors split into two categories:
//! - [`CaptureError`]: registry and buffer operations that fail synchronously
//!   and are returned to the caller.
//! - [`DecoderError`]: decoder subprocess failures. These are recovered
//!   locally by the supervisor; callers only see them through
//!   [`EngineEvent::StreamDegraded`](crate::EngineEvent::StreamDegraded).

/// Errors returned by registry, buffer, and configuration operations.
///
/// Nothing here is fatal to the engine as a whole. A failed allocation or an
/// invalid source is skipped and retried on the next reconfiguration; buffer
/// range errors are returned to the requesting caller only.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// A buffer is already allocated for this source.
    #[error("duplicate source: {source_id}")]
    DuplicateSource {
        /// Id of the source that is already present.
        source_id: String,
    },

    /// The source has no allocated buffers (unknown or already removed).
    #[error("unknown source: {source_id}")]
    NotFound {
        /// Id of the source that wasn't found.
        source_id: String,
    },

    /// The requested time range is not available in the capture ring.
    ///
    /// Either the oldest requested byte has already been overwritten or the
    /// newest one has not been captured yet. Never retried internally.
    #[error("range unavailable for {source_id}: {reason}")]
    RangeUnavailable {
        /// Source the range was requested from.
        source_id: String,
        /// Why the range cannot be served.
        reason: String,
    },

    /// A buffer reservation was rejected.
    #[error("invalid buffer capacity: {reason}")]
    InvalidCapacity {
        /// Why the reservation was rejected.
        reason: String,
    },

    /// A source specification cannot be used.
    #[error("invalid source: {reason}")]
    InvalidSource {
        /// Why the source was rejected.
        reason: String,
    },

    /// The engine configuration is inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// The first problem found.
        reason: String,
    },

    /// A capture device could not be opened or started.
    #[error("device error: {reason}")]
    Device {
        /// Description from the audio backend.
        reason: String,
    },
}

impl CaptureError {
    /// Creates a `NotFound` error for the given source id.
    pub fn not_found(source_id: impl Into<String>) -> Self {
        Self::NotFound {
            source_id: source_id.into(),
        }
    }

    /// Creates a `DuplicateSource` error for the given source id.
    pub fn duplicate(source_id: impl Into<String>) -> Self {
        Self::DuplicateSource {
            source_id: source_id.into(),
        }
    }

    /// Creates a `RangeUnavailable` error.
    pub fn range_unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RangeUnavailable {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidSource` error.
    pub fn invalid_source(reason: impl Into<String>) -> Self {
        Self::InvalidSource {
            reason: reason.into(),
        }
    }
}

/// Errors raised inside a decoder supervision loop.
///
/// These never cross the engine boundary directly; the supervisor logs them,
/// applies backoff, and restarts the subprocess.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// The decoder executable could not be spawned.
    #[error("failed to spawn decoder: {source}")]
    SpawnFailed {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The decoder exited on its own.
    #[error("decoder exited: {status}")]
    Exited {
        /// Exit status description.
        status: String,
    },

    /// The spawned decoder exposed no stdout pipe.
    #[error("decoder stdout unavailable")]
    NoStdout,
}
