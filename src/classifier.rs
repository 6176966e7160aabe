//! Species classifier seam and per-source window pump.
//!
//! The classifier itself lives outside this crate. The engine treats it as an
//! opaque, potentially slow call: one pump task per source extracts analysis
//! windows and awaits predictions without holding any buffer lock, so a slow
//! model never blocks the capture writers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::buffer::AnalysisStore;
use crate::engine::EngineStats;
use crate::event::{EngineEvent, EventCallback};
use crate::source::SourceId;

/// One ranked classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Species (or other) label.
    pub label: String,
    /// Model confidence, 0.0 to 1.0.
    pub confidence: f32,
}

/// A species classifier consuming fixed-size PCM windows.
///
/// Implementations receive exactly one analysis window of little-endian s16
/// PCM per call and return results ranked best first. Calls may be slow;
/// they run on a dedicated pump task per source.
///
/// # Example
///
/// ```
/// use fieldstream::{Classifier, Prediction};
/// use async_trait::async_trait;
///
/// struct NullClassifier;
///
/// #[async_trait]
/// impl Classifier for NullClassifier {
///     async fn predict(&self, _window: &[u8]) -> Vec<Prediction> {
///         Vec::new()
///     }
/// }
/// ```
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classifies one analysis window, returning ranked results.
    async fn predict(&self, window: &[u8]) -> Vec<Prediction>;
}

/// How often a pump checks its source for a full window.
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Handle held by the registry for one running window pump.
pub(crate) struct PumpHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PumpHandle {
    /// Stops the pump and waits for it to finish any in-flight prediction.
    pub(crate) async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

/// Spawns the window pump for one source.
pub(crate) fn spawn_window_pump(
    source_id: SourceId,
    analysis: Arc<AnalysisStore>,
    classifier: Arc<dyn Classifier>,
    stats: Arc<EngineStats>,
    event_callback: Option<EventCallback>,
) -> PumpHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(PUMP_POLL_INTERVAL) => {}
            }

            loop {
                if *stop_rx.borrow() {
                    return;
                }
                match analysis.extract_window(&source_id) {
                    Ok(Some(window)) => {
                        let predictions = classifier.predict(&window).await;
                        stats.record_window();
                        tracing::debug!(
                            source = %source_id,
                            results = predictions.len(),
                            "window classified"
                        );
                        if let Some(ref callback) = event_callback {
                            callback(EngineEvent::WindowClassified {
                                source_id: source_id.clone(),
                                predictions,
                            });
                        }
                    }
                    Ok(None) => break,
                    // Ring freed, source removed while we were polling.
                    Err(_) => return,
                }
            }
        }
    });

    PumpHandle { stop_tx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_callback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClassifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for CountingClassifier {
        async fn predict(&self, window: &[u8]) -> Vec<Prediction> {
            assert_eq!(window.len(), 960);
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![Prediction {
                label: "Turdus merula".to_string(),
                confidence: 0.9,
            }]
        }
    }

    #[tokio::test]
    async fn test_pump_extracts_and_classifies() {
        let id = SourceId::new("test");
        let analysis = Arc::new(AnalysisStore::new());
        analysis.allocate(&id, 960, 480, 2880).unwrap();

        let classifier = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
        });
        let results = Arc::new(AtomicUsize::new(0));
        let results_clone = results.clone();
        let callback = event_callback(move |event| {
            if let EngineEvent::WindowClassified { predictions, .. } = event {
                assert_eq!(predictions.len(), 1);
                results_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let stats = Arc::new(EngineStats::default());
        let pump = spawn_window_pump(
            id.clone(),
            analysis.clone(),
            classifier.clone(),
            stats.clone(),
            Some(callback),
        );

        // Two windows plus the retained overlap.
        analysis.write(&id, &vec![1u8; 960 + 480]).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while results.load(Ordering::SeqCst) < 2 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "pump never classified both windows"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.snapshot().windows_classified, 2);
        pump.shutdown().await;
    }

    #[tokio::test]
    async fn test_pump_exits_when_ring_removed() {
        let id = SourceId::new("test");
        let analysis = Arc::new(AnalysisStore::new());
        analysis.allocate(&id, 960, 480, 2880).unwrap();

        let classifier = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
        });
        let stats = Arc::new(EngineStats::default());
        let pump = spawn_window_pump(id.clone(), analysis.clone(), classifier, stats, None);

        analysis.remove(&id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pump.join)
            .await
            .expect("pump did not exit after ring removal")
            .unwrap();
    }
}
