//! Source registry and runtime reconfiguration.
//!
//! The registry is the source of truth for which sources are active and owns
//! every per-source resource: ring buffer pair, capture producer, decoder
//! supervisor or device thread, and classifier pump. [`reconfigure`] diffs a
//! desired source list against the active set and starts or tears down
//! sources to match.
//!
//! Teardown honors one hard ordering rule, stop-before-free: a source's
//! buffers are only freed after its decoder is reaped and its producer has
//! acknowledged draining. The acknowledgment is an explicit oneshot from the
//! producer task, never a timed sleep.
//!
//! [`reconfigure`]: StreamRegistry::reconfigure

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::buffer::{AnalysisStore, CaptureStore};
use crate::classifier::{spawn_window_pump, Classifier, PumpHandle};
use crate::config::EngineConfig;
use crate::decoder::{spawn_supervisor, SupervisorHandle};
use crate::engine::EngineStats;
use crate::event::{EngineEvent, EventCallback};
use crate::pipeline::{spawn_producer, LevelMonitor, ProducerHandle};
use crate::source::{start_device_capture, DeviceCapture, SourceId, SourceKind, SourceSpec};
use crate::CaptureError;

/// Everything owned on behalf of one active source.
struct SourceEntry {
    spec: SourceSpec,
    producer: Option<ProducerHandle>,
    supervisor: Option<SupervisorHandle>,
    device: Option<DeviceCapture>,
    pump: Option<PumpHandle>,
}

/// Outcome of one [`StreamRegistry::reconfigure`] call.
///
/// A failed source is skipped without affecting the others and will be
/// retried on the next call that still desires it.
#[derive(Debug, Default)]
pub struct ReconfigureReport {
    /// Sources started by this call.
    pub added: Vec<SourceId>,
    /// Sources torn down by this call.
    pub removed: Vec<SourceId>,
    /// Sources that failed to start, with the reason.
    pub failed: Vec<(SourceId, CaptureError)>,
}

impl ReconfigureReport {
    /// Returns `true` if the call changed nothing and nothing failed.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

/// Source-of-truth mapping from source identity to its running resources.
pub struct StreamRegistry {
    config: EngineConfig,
    capture: Arc<CaptureStore>,
    analysis: Arc<AnalysisStore>,
    levels: Arc<LevelMonitor>,
    stats: Arc<EngineStats>,
    classifier: Option<Arc<dyn Classifier>>,
    event_callback: Option<EventCallback>,
    /// Active sources. The async mutex serializes reconfiguration; data-path
    /// operations go through the stores and never take this lock.
    entries: tokio::sync::Mutex<HashMap<SourceId, SourceEntry>>,
}

impl StreamRegistry {
    pub(crate) fn new(
        config: EngineConfig,
        capture: Arc<CaptureStore>,
        analysis: Arc<AnalysisStore>,
        levels: Arc<LevelMonitor>,
        stats: Arc<EngineStats>,
        classifier: Option<Arc<dyn Classifier>>,
        event_callback: Option<EventCallback>,
    ) -> Self {
        Self {
            config,
            capture,
            analysis,
            levels,
            stats,
            classifier,
            event_callback,
            entries: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the ids of currently active sources.
    pub async fn active_sources(&self) -> Vec<SourceId> {
        let entries = self.entries.lock().await;
        let mut ids: Vec<SourceId> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconciles the active set against `desired`.
    ///
    /// Removals complete before additions start, so replacing a source's
    /// transport in one call behaves as remove-then-add. Calling twice with
    /// an unchanged desired set is a no-op: no allocation and no process
    /// spawn happens the second time.
    pub async fn reconfigure(&self, desired: &[SourceSpec]) -> ReconfigureReport {
        let mut report = ReconfigureReport::default();
        let mut entries = self.entries.lock().await;

        let mut desired_ids = HashSet::new();
        let mut unique: Vec<&SourceSpec> = Vec::new();
        for spec in desired {
            if desired_ids.insert(spec.id()) {
                unique.push(spec);
            } else {
                tracing::warn!(source = %spec.id(), "duplicate source in desired set ignored");
            }
        }

        let to_remove: Vec<SourceId> = entries
            .keys()
            .filter(|id| !desired_ids.contains(*id))
            .cloned()
            .collect();

        // Teardowns are independent per source; run them concurrently so one
        // slow decoder reap does not stall the rest.
        let mut teardowns = Vec::new();
        for id in to_remove {
            if let Some(entry) = entries.remove(&id) {
                teardowns.push(async move {
                    self.teardown(&id, entry).await;
                    id
                });
            }
        }
        report.removed = futures::future::join_all(teardowns).await;

        for spec in unique {
            let id = spec.id();
            if entries.contains_key(&id) {
                continue;
            }
            match self.start_source(spec).await {
                Ok(entry) => {
                    entries.insert(id.clone(), entry);
                    self.emit(EngineEvent::SourceStarted {
                        source_id: id.clone(),
                    });
                    tracing::info!(source = %id, "source started");
                    report.added.push(id);
                }
                Err(e) => {
                    tracing::warn!(source = %id, error = %e, "source skipped, will retry on next reconfigure");
                    report.failed.push((id, e));
                }
            }
        }

        report
    }

    /// Tears down every active source. Used for engine shutdown.
    pub async fn shutdown(&self) {
        let report = self.reconfigure(&[]).await;
        if !report.removed.is_empty() {
            tracing::info!(count = report.removed.len(), "all sources stopped");
        }
    }

    /// Brings one source up. On failure the partially started pieces are
    /// stopped again; allocated rings are kept for the retry.
    async fn start_source(&self, spec: &SourceSpec) -> Result<SourceEntry, CaptureError> {
        let id = spec.id();
        validate_spec(spec)?;

        // Ring allocation is idempotent across retries: a ring left behind by
        // an earlier failed start is reused, not an error.
        if !self.capture.contains(&id) {
            self.capture.allocate(
                &id,
                self.config.capture_seconds,
                self.config.sample_rate,
                self.config.bytes_per_sample,
                self.config.channels,
            )?;
        }
        if !self.analysis.contains(&id) {
            let window = self.config.window_bytes();
            let capacity = window * self.config.analysis_slack as usize;
            if let Err(e) =
                self.analysis
                    .allocate(&id, window, self.config.overlap_bytes(), capacity)
            {
                // Keep the pair symmetric: drop a capture ring we just made.
                let _ = self.capture.remove(&id);
                return Err(e);
            }
        }

        self.levels.register(&id, spec.display_name());

        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.chunk_channel_capacity);
        let producer = spawn_producer(
            id.clone(),
            chunk_rx,
            Arc::clone(&self.capture),
            Arc::clone(&self.analysis),
            Arc::clone(&self.levels),
            Arc::clone(&self.stats),
            self.event_callback.clone(),
        );

        let mut entry = SourceEntry {
            spec: spec.clone(),
            producer: Some(producer),
            supervisor: None,
            device: None,
            pump: None,
        };

        match spec.kind() {
            SourceKind::NetworkStream { url, transport } => {
                entry.supervisor = Some(spawn_supervisor(
                    id.clone(),
                    self.config.decoder.program.clone(),
                    url.clone(),
                    *transport,
                    self.config.sample_rate,
                    self.config.channels,
                    self.config.read_chunk_bytes(),
                    self.config.decoder.restart.clone(),
                    chunk_tx,
                    self.event_callback.clone(),
                ));
            }
            SourceKind::Device { device } => {
                match start_device_capture(device.clone(), &self.config, id.clone(), chunk_tx) {
                    Ok(capture) => entry.device = Some(capture),
                    Err(e) => {
                        self.stop_tasks(&id, &mut entry).await;
                        self.levels.remove(&id);
                        return Err(e);
                    }
                }
            }
        }

        if let Some(classifier) = &self.classifier {
            entry.pump = Some(spawn_window_pump(
                id.clone(),
                Arc::clone(&self.analysis),
                Arc::clone(classifier),
                Arc::clone(&self.stats),
                self.event_callback.clone(),
            ));
        }

        Ok(entry)
    }

    /// Stops a source's feed and writer and waits for the drain
    /// acknowledgment. Buffers stay allocated.
    async fn stop_tasks(&self, id: &SourceId, entry: &mut SourceEntry) {
        // Feed side first so no new chunks enter the channel.
        if let Some(supervisor) = entry.supervisor.take() {
            supervisor.shutdown().await;
        }
        if let Some(mut device) = entry.device.take() {
            device.stop();
        }

        // Writer side: signal, then wait for the explicit drain ack.
        if let Some(producer) = entry.producer.take() {
            let _ = producer.stop_tx.send(());
            if producer.drained_rx.await.is_err() {
                tracing::warn!(source = %id, "producer exited without drain acknowledgment");
            }
            let _ = producer.join.await;
        }

        if let Some(pump) = entry.pump.take() {
            pump.shutdown().await;
        }
    }

    /// Full removal: stop everything, then free the rings.
    async fn teardown(&self, id: &SourceId, mut entry: SourceEntry) {
        self.stop_tasks(id, &mut entry).await;

        // Drain is acknowledged; freeing is now race-free.
        if let Err(e) = self.analysis.remove(id) {
            tracing::warn!(source = %id, error = %e, "failed to remove analysis ring");
        }
        if let Err(e) = self.capture.remove(id) {
            tracing::warn!(source = %id, error = %e, "failed to remove capture ring");
        }
        self.levels.remove(id);

        self.emit(EngineEvent::SourceStopped {
            source_id: id.clone(),
            reason: "removed from configuration".to_string(),
        });
        tracing::info!(source = %id, name = %entry.spec.display_name(), "source removed");
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }
}

/// Rejects specs the engine cannot start.
fn validate_spec(spec: &SourceSpec) -> Result<(), CaptureError> {
    if let SourceKind::NetworkStream { url, .. } = spec.kind() {
        if url.is_empty() {
            return Err(CaptureError::invalid_source("stream URL is empty"));
        }
        if !url.contains("://") {
            return Err(CaptureError::invalid_source(format!(
                "stream URL has no scheme: {url}"
            )));
        }
    }
    Ok(())
}
