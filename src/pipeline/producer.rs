//! Capture producer task - the single writer for one source's buffers.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::{AnalysisStore, CaptureStore};
use crate::engine::EngineStats;
use crate::event::{EngineEvent, EventCallback};
use crate::pipeline::LevelMonitor;
use crate::source::SourceId;
use crate::PcmChunk;

/// Handle held by the registry for one running producer.
///
/// Teardown order matters: signal `stop_tx`, await `drained_rx`, then await
/// `join`. Only after the drain acknowledgment may the source's buffers be
/// freed.
pub(crate) struct ProducerHandle {
    pub stop_tx: oneshot::Sender<()>,
    pub drained_rx: oneshot::Receiver<()>,
    pub join: JoinHandle<()>,
}

/// Receives PCM chunks from a device thread or decoder supervisor and fans
/// each one into the capture ring, the analysis ring, and the level monitor.
pub(crate) struct CaptureProducer {
    source_id: SourceId,
    chunk_rx: mpsc::Receiver<PcmChunk>,
    stop_rx: oneshot::Receiver<()>,
    drained_tx: oneshot::Sender<()>,
    capture: Arc<CaptureStore>,
    analysis: Arc<AnalysisStore>,
    levels: Arc<LevelMonitor>,
    stats: Arc<EngineStats>,
    event_callback: Option<EventCallback>,
}

impl CaptureProducer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source_id: SourceId,
        chunk_rx: mpsc::Receiver<PcmChunk>,
        stop_rx: oneshot::Receiver<()>,
        drained_tx: oneshot::Sender<()>,
        capture: Arc<CaptureStore>,
        analysis: Arc<AnalysisStore>,
        levels: Arc<LevelMonitor>,
        stats: Arc<EngineStats>,
        event_callback: Option<EventCallback>,
    ) -> Self {
        Self {
            source_id,
            chunk_rx,
            stop_rx,
            drained_tx,
            capture,
            analysis,
            levels,
            stats,
            event_callback,
        }
    }

    /// Runs until stopped or until every chunk sender is gone, then drains
    /// the queue and sends the drain acknowledgment.
    pub(crate) async fn run(mut self) {
        tracing::debug!(source = %self.source_id, "capture producer started");

        loop {
            tokio::select! {
                maybe_chunk = self.chunk_rx.recv() => match maybe_chunk {
                    Some(chunk) => {
                        if !self.ingest(&chunk) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut self.stop_rx => {
                    // Drain whatever was queued before the stop signal so no
                    // captured audio is silently discarded.
                    while let Ok(chunk) = self.chunk_rx.try_recv() {
                        if !self.ingest(&chunk) {
                            break;
                        }
                    }
                    break;
                }
            }
        }

        tracing::debug!(source = %self.source_id, "capture producer drained");
        let _ = self.drained_tx.send(());
    }

    /// Writes one chunk everywhere it belongs. Returns `false` when the
    /// source's buffers are gone and the producer should exit.
    fn ingest(&mut self, chunk: &PcmChunk) -> bool {
        if self.capture.write(&self.source_id, &chunk.bytes).is_err() {
            tracing::warn!(source = %self.source_id, "capture ring missing, producer exiting");
            return false;
        }

        match self.analysis.write(&self.source_id, &chunk.bytes) {
            Ok(0) => {}
            Ok(dropped_bytes) => {
                self.stats.record_analysis_dropped(dropped_bytes);
                self.emit(EngineEvent::AnalysisOverflow {
                    source_id: self.source_id.clone(),
                    dropped_bytes,
                });
            }
            Err(_) => {
                tracing::warn!(source = %self.source_id, "analysis ring missing, producer exiting");
                return false;
            }
        }

        self.levels.observe(&self.source_id, &chunk.bytes);
        self.stats.record_chunk(chunk.len());
        true
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }
}

/// Spawns a capture producer and returns its teardown handle.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_producer(
    source_id: SourceId,
    chunk_rx: mpsc::Receiver<PcmChunk>,
    capture: Arc<CaptureStore>,
    analysis: Arc<AnalysisStore>,
    levels: Arc<LevelMonitor>,
    stats: Arc<EngineStats>,
    event_callback: Option<EventCallback>,
) -> ProducerHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let (drained_tx, drained_rx) = oneshot::channel();

    let producer = CaptureProducer::new(
        source_id,
        chunk_rx,
        stop_rx,
        drained_tx,
        capture,
        analysis,
        levels,
        stats,
        event_callback,
    );
    let join = tokio::spawn(producer.run());

    ProducerHandle {
        stop_tx,
        drained_rx,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LevelConfig;
    use crate::source::MockPcm;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    struct Fixture {
        capture: Arc<CaptureStore>,
        analysis: Arc<AnalysisStore>,
        levels: Arc<LevelMonitor>,
        stats: Arc<EngineStats>,
        id: SourceId,
        anchor: SystemTime,
    }

    fn fixture(window_bytes: usize, overlap_bytes: usize) -> Fixture {
        let id = SourceId::new("test");
        let anchor = SystemTime::now();
        let capture = Arc::new(CaptureStore::new());
        capture.allocate_at(&id, 10, 48_000, 2, 1, anchor).unwrap();
        let analysis = Arc::new(AnalysisStore::new());
        analysis
            .allocate(&id, window_bytes, overlap_bytes, window_bytes * 3)
            .unwrap();
        let levels = Arc::new(LevelMonitor::new(&LevelConfig::default()));
        levels.register(&id, "test");
        Fixture {
            capture,
            analysis,
            levels,
            stats: Arc::new(EngineStats::default()),
            id,
            anchor,
        }
    }

    #[tokio::test]
    async fn test_producer_fans_chunks_into_all_paths() {
        let fx = fixture(9600, 4800);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let handle = spawn_producer(
            fx.id.clone(),
            chunk_rx,
            fx.capture.clone(),
            fx.analysis.clone(),
            fx.levels.clone(),
            fx.stats.clone(),
            None,
        );

        let mut mock = MockPcm::new(48_000, 1);
        mock.sine(440.0, 300, 0.5);
        for bytes in mock.take_chunks(9600) {
            chunk_tx.send(PcmChunk::new(fx.id.clone(), bytes)).await.unwrap();
        }

        // 300ms of audio is more than one 100ms window.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !fx.analysis.has_window(&fx.id).unwrap() {
            assert!(tokio::time::Instant::now() < deadline, "window never filled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let clip = fx
            .capture
            .read_range(&fx.id, fx.anchor, fx.anchor + Duration::from_millis(100))
            .unwrap();
        assert_eq!(clip.len(), 9600);

        let stats = fx.stats.snapshot();
        assert_eq!(stats.bytes_captured, 28_800);
        assert_eq!(stats.chunks_captured, 3);

        drop(chunk_tx);
        handle.join.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_queued_chunks_before_ack() {
        let fx = fixture(9600, 4800);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (drained_tx, drained_rx) = oneshot::channel();

        let producer = CaptureProducer::new(
            fx.id.clone(),
            chunk_rx,
            stop_rx,
            drained_tx,
            fx.capture.clone(),
            fx.analysis.clone(),
            fx.levels.clone(),
            fx.stats.clone(),
            None,
        );

        // Queue chunks and the stop signal before the producer ever runs.
        let mut mock = MockPcm::new(48_000, 1);
        mock.silence(100);
        for bytes in mock.take_chunks(4800) {
            chunk_tx.send(PcmChunk::new(fx.id.clone(), bytes)).await.unwrap();
        }
        stop_tx.send(()).unwrap();

        producer.run().await;
        drained_rx.await.unwrap();

        // Everything queued before the stop was still written.
        assert_eq!(fx.stats.snapshot().bytes_captured, 9600);
    }

    #[tokio::test]
    async fn test_producer_exits_when_buffers_removed() {
        let fx = fixture(9600, 4800);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let handle = spawn_producer(
            fx.id.clone(),
            chunk_rx,
            fx.capture.clone(),
            fx.analysis.clone(),
            fx.levels.clone(),
            fx.stats.clone(),
            None,
        );

        // Simulate a bug where rings vanish early; the producer must exit
        // cleanly rather than spin.
        fx.capture.remove(&fx.id).unwrap();
        chunk_tx
            .send(PcmChunk::new(fx.id.clone(), vec![0u8; 64]))
            .await
            .unwrap();

        handle.drained_rx.await.unwrap();
        handle.join.await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_emits_event() {
        let fx = fixture(960, 480);
        let (chunk_tx, chunk_rx) = mpsc::channel(16);

        let overflows = Arc::new(AtomicUsize::new(0));
        let overflows_clone = overflows.clone();
        let callback = crate::event::event_callback(move |event| {
            if matches!(event, EngineEvent::AnalysisOverflow { .. }) {
                overflows_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let handle = spawn_producer(
            fx.id.clone(),
            chunk_rx,
            fx.capture.clone(),
            fx.analysis.clone(),
            fx.levels.clone(),
            fx.stats.clone(),
            Some(callback),
        );

        // 3 windows of capacity; write well past it with no reader.
        let mut mock = MockPcm::new(48_000, 1);
        mock.silence(200); // 19200 bytes vs 2880 capacity
        for bytes in mock.take_chunks(960) {
            chunk_tx.send(PcmChunk::new(fx.id.clone(), bytes)).await.unwrap();
        }
        drop(chunk_tx);
        handle.join.await.unwrap();

        assert!(overflows.load(Ordering::SeqCst) > 0);
        assert!(fx.stats.snapshot().analysis_bytes_dropped > 0);
    }
}
