//! Runtime events for monitoring engine health.
//!
//! Events are non-fatal notifications about source lifecycle and stream
//! behavior. The engine continues running after every event; they exist for
//! logging, metrics, and the presentation layer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::Prediction;
use crate::source::SourceId;

/// A signal-level reading for one source.
///
/// Delivered on the level broadcast channel and from
/// [`CaptureEngine::level_snapshot`](crate::CaptureEngine::level_snapshot).
/// The field names match what the presentation layer serializes over SSE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelUpdate {
    /// Scaled signal level, 0-100.
    pub level: u8,
    /// True if any sample in the observed chunk hit the 16-bit extremes.
    pub clipping: bool,
    /// Source identifier (device name or stream URL).
    pub source: String,
    /// Human-readable name with credentials scrubbed.
    pub name: String,
}

/// Runtime events emitted during capture.
///
/// These are informational. Use the [`EventCallback`] registered on the
/// engine builder to log them or update metrics.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A source was added and its capture producer started.
    SourceStarted {
        /// Id of the source that started.
        source_id: SourceId,
    },

    /// A source was removed, its writer drained, and its buffers freed.
    SourceStopped {
        /// Id of the source that stopped.
        source_id: SourceId,
        /// Why the source stopped.
        reason: String,
    },

    /// A decoder subprocess exited and a restart is scheduled.
    DecoderRestarting {
        /// Source whose decoder exited.
        source_id: SourceId,
        /// Consecutive failures including this one.
        consecutive_failures: u32,
        /// Backoff delay before the next spawn attempt.
        delay: Duration,
    },

    /// A decoder has crashed often enough to exhaust its restart budget.
    ///
    /// Supervision continues at the throttled rate; this fires once per
    /// degradation episode.
    StreamDegraded {
        /// Source whose stream is degraded.
        source_id: SourceId,
        /// Consecutive failures when the budget ran out.
        consecutive_failures: u32,
    },

    /// The analysis ring dropped unread bytes because the classifier could
    /// not keep up. Writers are never blocked.
    AnalysisOverflow {
        /// Source whose analysis ring overflowed.
        source_id: SourceId,
        /// Unread bytes discarded.
        dropped_bytes: usize,
    },

    /// A classifier window was analyzed.
    WindowClassified {
        /// Source the window was extracted from.
        source_id: SourceId,
        /// Ranked classifier output, best first.
        predictions: Vec<Prediction>,
    },
}

/// Callback type for receiving runtime events.
///
/// Register via [`CaptureEngineBuilder::on_event()`]. The callback runs on
/// engine tasks and must not block.
///
/// [`CaptureEngineBuilder::on_event()`]: crate::CaptureEngineBuilder::on_event
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use fieldstream::{event_callback, EngineEvent};
///
/// let callback = event_callback(|event| {
///     tracing::info!(?event, "engine event");
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
