//! Capture engine facade and lifetime statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::broadcast;

use crate::buffer::{AnalysisStore, CaptureStore};
use crate::classifier::Classifier;
use crate::config::EngineConfig;
use crate::event::{event_callback, EngineEvent, EventCallback, LevelUpdate};
use crate::pipeline::LevelMonitor;
use crate::registry::{ReconfigureReport, StreamRegistry};
use crate::source::{SourceId, SourceSpec};
use crate::CaptureError;

/// Counters shared between the engine handle and its background tasks.
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    chunks_captured: AtomicU64,
    bytes_captured: AtomicU64,
    analysis_bytes_dropped: AtomicU64,
    windows_classified: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_chunk(&self, bytes: usize) {
        self.chunks_captured.fetch_add(1, Ordering::Relaxed);
        self.bytes_captured
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_analysis_dropped(&self, bytes: usize) {
        self.analysis_bytes_dropped
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_window(&self) {
        self.windows_classified.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            chunks_captured: self.chunks_captured.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            analysis_bytes_dropped: self.analysis_bytes_dropped.load(Ordering::Relaxed),
            windows_classified: self.windows_classified.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// PCM chunks ingested across all sources.
    pub chunks_captured: u64,
    /// PCM bytes ingested across all sources.
    pub bytes_captured: u64,
    /// Unread analysis bytes dropped because classification lagged.
    pub analysis_bytes_dropped: u64,
    /// Analysis windows handed to the classifier.
    pub windows_classified: u64,
}

/// Builder for a [`CaptureEngine`].
///
/// # Example
///
/// ```no_run
/// use fieldstream::{CaptureEngine, EngineConfig, SourceSpec, Transport};
///
/// # async fn run() -> Result<(), fieldstream::CaptureError> {
/// let engine = CaptureEngine::builder()
///     .config(EngineConfig::default())
///     .on_event(|event| tracing::info!(?event, "engine event"))
///     .build()?;
///
/// engine
///     .reconfigure(&[SourceSpec::stream("rtsp://cam-1/live", Transport::Tcp)])
///     .await;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct CaptureEngineBuilder {
    config: EngineConfig,
    classifier: Option<Arc<dyn Classifier>>,
    event_callback: Option<EventCallback>,
}

impl Default for CaptureEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureEngineBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            classifier: None,
            event_callback: None,
        }
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a classifier. Without one, analysis rings still fill and
    /// overflow by dropping their oldest bytes, but no windows are extracted.
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Registers a callback for runtime events.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// The engine starts idle, with zero active sources; call
    /// [`CaptureEngine::reconfigure`] to start capturing.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::InvalidConfig`] for inconsistent settings.
    pub fn build(self) -> Result<CaptureEngine, CaptureError> {
        self.config.validate()?;

        let capture = Arc::new(CaptureStore::new());
        let analysis = Arc::new(AnalysisStore::new());
        let levels = Arc::new(LevelMonitor::new(&self.config.level));
        let stats = Arc::new(EngineStats::default());

        let registry = Arc::new(StreamRegistry::new(
            self.config.clone(),
            Arc::clone(&capture),
            Arc::clone(&analysis),
            Arc::clone(&levels),
            Arc::clone(&stats),
            self.classifier,
            self.event_callback,
        ));

        Ok(CaptureEngine {
            config: self.config,
            registry,
            capture,
            levels,
            stats,
        })
    }
}

/// Handle to the capture engine.
///
/// Owns the registry, the ring buffer stores, and the level monitor. All
/// methods take `&self`; the handle can be shared behind an `Arc` between a
/// configuration watcher and the presentation layer.
pub struct CaptureEngine {
    config: EngineConfig,
    registry: Arc<StreamRegistry>,
    capture: Arc<CaptureStore>,
    levels: Arc<LevelMonitor>,
    stats: Arc<EngineStats>,
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CaptureEngine {
    /// Creates a new builder.
    pub fn builder() -> CaptureEngineBuilder {
        CaptureEngineBuilder::new()
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reconciles the active sources against `desired`.
    ///
    /// See [`StreamRegistry::reconfigure`] for the exact semantics; calls are
    /// serialized internally, and an unchanged desired set is a no-op.
    pub async fn reconfigure(&self, desired: &[SourceSpec]) -> ReconfigureReport {
        self.registry.reconfigure(desired).await
    }

    /// Returns the ids of currently active sources.
    pub async fn active_sources(&self) -> Vec<SourceId> {
        self.registry.active_sources().await
    }

    /// Subscribes to per-chunk level events.
    ///
    /// The channel is bounded; a subscriber that falls behind loses the
    /// oldest events rather than slowing capture down.
    pub fn level_events(&self) -> broadcast::Receiver<LevelUpdate> {
        self.levels.subscribe()
    }

    /// Returns the current level of every registered source, with stale
    /// sources reported at level 0.
    pub fn level_snapshot(&self) -> Vec<LevelUpdate> {
        self.levels.snapshot()
    }

    /// Copies out raw PCM captured between `start` and `end` for one source,
    /// for on-demand clip export.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources and
    /// [`CaptureError::RangeUnavailable`] when the interval has been
    /// overwritten or not yet captured.
    pub fn read_range(
        &self,
        source_id: &SourceId,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<Vec<u8>, CaptureError> {
        self.capture.read_range(source_id, start, end)
    }

    /// Returns cumulative engine statistics.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Stops every source, waiting for each drain acknowledgment.
    ///
    /// The engine is reusable afterwards; a later `reconfigure` starts fresh
    /// sources.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_validates_config() {
        let config = EngineConfig {
            sample_rate: 0,
            ..Default::default()
        };
        let err = CaptureEngine::builder().config(config).build().unwrap_err();
        assert!(matches!(err, CaptureError::InvalidConfig { .. }));
    }

    #[test]
    fn test_build_default_is_idle() {
        let engine = CaptureEngine::builder().build().unwrap();
        assert_eq!(engine.stats(), Stats::default());
        assert!(engine.level_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_zero_sources_is_valid() {
        let engine = CaptureEngine::builder().build().unwrap();
        let report = engine.reconfigure(&[]).await;
        assert!(report.is_noop());
        assert!(engine.active_sources().await.is_empty());
        engine.shutdown().await;
    }

    #[test]
    fn test_stats_snapshot_accumulates() {
        let stats = EngineStats::default();
        stats.record_chunk(100);
        stats.record_chunk(50);
        stats.record_analysis_dropped(10);
        stats.record_window();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks_captured, 2);
        assert_eq!(snapshot.bytes_captured, 150);
        assert_eq!(snapshot.analysis_bytes_dropped, 10);
        assert_eq!(snapshot.windows_classified, 1);
    }
}
