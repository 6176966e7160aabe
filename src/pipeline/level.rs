//! Signal-level metering and activity tracking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::LevelConfig;
use crate::event::LevelUpdate;
use crate::source::SourceId;

/// Full-scale reference for 16-bit samples.
const FULL_SCALE: f64 = 32768.0;

/// Floor that clipping forces the reported level up to.
const CLIPPING_FLOOR: f64 = 95.0;

/// Per-source metering state.
struct SourceLevel {
    display_name: String,
    level: u8,
    clipping: bool,
    last_update: Instant,
    last_non_zero: Instant,
}

/// Computes signal level and clipping per chunk and tracks per-source
/// activity.
///
/// Levels are derived from the RMS of the signed 16-bit samples, converted to
/// dBFS and rescaled so `floor_db` maps to 0 and `floor_db + span_db` maps to
/// 100. A chunk containing a sample at either 16-bit extreme is flagged as
/// clipping and reports at least level 95.
///
/// Every observation is fanned out on a bounded broadcast channel. Lagging
/// subscribers lose the oldest events; the capture path never blocks on them.
pub struct LevelMonitor {
    states: Mutex<HashMap<SourceId, SourceLevel>>,
    tx: broadcast::Sender<LevelUpdate>,
    floor_db: f64,
    span_db: f64,
    inactivity_timeout: Duration,
}

impl LevelMonitor {
    /// Creates a monitor with the given metering configuration.
    pub fn new(config: &LevelConfig) -> Self {
        let (tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            states: Mutex::new(HashMap::new()),
            tx,
            floor_db: config.floor_db,
            span_db: config.span_db,
            inactivity_timeout: config.inactivity_timeout,
        }
    }

    /// Subscribes to level events.
    pub fn subscribe(&self) -> broadcast::Receiver<LevelUpdate> {
        self.tx.subscribe()
    }

    /// Registers a source so it appears in snapshots before its first chunk.
    ///
    /// A freshly registered source counts as active.
    pub fn register(&self, source_id: &SourceId, display_name: impl Into<String>) {
        let now = Instant::now();
        self.states
            .lock()
            .entry(source_id.clone())
            .or_insert_with(|| SourceLevel {
                display_name: display_name.into(),
                level: 0,
                clipping: false,
                last_update: now,
                last_non_zero: now,
            });
    }

    /// Drops a source's metering state. Called on registry removal.
    pub fn remove(&self, source_id: &SourceId) {
        self.states.lock().remove(source_id);
    }

    /// Meters one PCM chunk and broadcasts the resulting update.
    pub fn observe(&self, source_id: &SourceId, bytes: &[u8]) {
        let (level, clipping) = compute_level(bytes, self.floor_db, self.span_db);

        let now = Instant::now();
        let update = {
            let mut states = self.states.lock();
            let state = states.entry(source_id.clone()).or_insert_with(|| SourceLevel {
                display_name: source_id.to_string(),
                level: 0,
                clipping: false,
                last_update: now,
                last_non_zero: now,
            });

            state.level = level;
            state.clipping = clipping;
            state.last_update = now;
            if level > 0 {
                state.last_non_zero = now;
            }

            LevelUpdate {
                level,
                clipping,
                source: source_id.to_string(),
                name: state.display_name.clone(),
            }
        };

        // No receivers is fine; the engine may run headless.
        let _ = self.tx.send(update);
    }

    /// Returns the current level of every registered source.
    ///
    /// Sources inactive for longer than the inactivity timeout report level 0
    /// but stay present, which distinguishes "silent" from "removed".
    pub fn snapshot(&self) -> Vec<LevelUpdate> {
        let now = Instant::now();
        let states = self.states.lock();
        let mut updates: Vec<LevelUpdate> = states
            .iter()
            .map(|(id, state)| {
                let inactive = self.is_inactive_at(state, now);
                LevelUpdate {
                    level: if inactive { 0 } else { state.level },
                    clipping: if inactive { false } else { state.clipping },
                    source: id.to_string(),
                    name: state.display_name.clone(),
                }
            })
            .collect();
        updates.sort_by(|a, b| a.source.cmp(&b.source));
        updates
    }

    /// Returns `true` if the source has gone stale.
    pub fn is_inactive(&self, source_id: &SourceId) -> bool {
        let now = Instant::now();
        self.states
            .lock()
            .get(source_id)
            .map(|state| self.is_inactive_at(state, now))
            .unwrap_or(false)
    }

    fn is_inactive_at(&self, state: &SourceLevel, now: Instant) -> bool {
        now.duration_since(state.last_update) > self.inactivity_timeout
            || now.duration_since(state.last_non_zero) > self.inactivity_timeout
    }
}

/// Computes the scaled 0-100 level and clipping flag for a PCM chunk.
///
/// An odd trailing byte is ignored; an empty chunk reports level 0.
pub(crate) fn compute_level(bytes: &[u8], floor_db: f64, span_db: f64) -> (u8, bool) {
    let usable = bytes.len() - bytes.len() % 2;
    if usable == 0 {
        return (0, false);
    }

    let mut sum_squares = 0.0f64;
    let mut clipping = false;
    for pair in bytes[..usable].chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let value = f64::from(sample);
        sum_squares += value * value;
        if sample == i16::MAX || sample == i16::MIN {
            clipping = true;
        }
    }

    let sample_count = usable / 2;
    let rms = (sum_squares / sample_count as f64).sqrt();
    let db = if rms > 0.0 {
        20.0 * (rms / FULL_SCALE).log10()
    } else {
        f64::NEG_INFINITY
    };

    let mut scaled = (db - floor_db) * (100.0 / span_db);
    if clipping {
        scaled = scaled.max(CLIPPING_FLOOR);
    }

    (scaled.clamp(0.0, 100.0) as u8, clipping)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: f64 = -60.0;
    const SPAN: f64 = 50.0;

    fn bytes_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn monitor_with_timeout(timeout: Duration) -> LevelMonitor {
        LevelMonitor::new(&LevelConfig {
            inactivity_timeout: timeout,
            ..Default::default()
        })
    }

    #[test]
    fn test_silence_is_level_zero() {
        let (level, clipping) = compute_level(&bytes_of(&[0i16; 4800]), FLOOR, SPAN);
        assert_eq!(level, 0);
        assert!(!clipping);
    }

    #[test]
    fn test_single_max_sample_clips() {
        let mut samples = vec![0i16; 4799];
        samples.push(i16::MAX);
        let (level, clipping) = compute_level(&bytes_of(&samples), FLOOR, SPAN);
        assert!(clipping);
        assert!(level >= 95);
    }

    #[test]
    fn test_min_sample_also_clips() {
        let (_, clipping) = compute_level(&bytes_of(&[i16::MIN, 0, 0, 0]), FLOOR, SPAN);
        assert!(clipping);
    }

    #[test]
    fn test_full_scale_pegs_at_100() {
        let (level, clipping) = compute_level(&bytes_of(&[i16::MAX; 100]), FLOOR, SPAN);
        assert_eq!(level, 100);
        assert!(clipping);
    }

    #[test]
    fn test_scaling_anchor_points() {
        // Constant 33 is ~-60 dBFS: the floor, so essentially 0.
        let (quiet, _) = compute_level(&bytes_of(&[33i16; 1000]), FLOOR, SPAN);
        assert!(quiet <= 1, "got {quiet}");

        // Constant 10400 is just above -10 dBFS: the top of the span.
        let (loud, clipping) = compute_level(&bytes_of(&[10400i16; 1000]), FLOOR, SPAN);
        assert_eq!(loud, 100);
        assert!(!clipping);
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        let mut bytes = bytes_of(&[0i16; 10]);
        bytes.push(0xFF);
        let (level, clipping) = compute_level(&bytes, FLOOR, SPAN);
        assert_eq!(level, 0);
        assert!(!clipping);
    }

    #[test]
    fn test_empty_chunk() {
        assert_eq!(compute_level(&[], FLOOR, SPAN), (0, false));
    }

    #[test]
    fn test_observe_broadcasts_update() {
        let monitor = LevelMonitor::new(&LevelConfig::default());
        let id = SourceId::new("rtsp://cam/live");
        monitor.register(&id, "rtsp://cam");
        let mut rx = monitor.subscribe();

        monitor.observe(&id, &bytes_of(&[8000i16; 480]));

        let update = rx.try_recv().unwrap();
        assert_eq!(update.source, "rtsp://cam/live");
        assert_eq!(update.name, "rtsp://cam");
        assert!(update.level > 0);
    }

    #[test]
    fn test_snapshot_reports_inactive_as_zero_but_retained() {
        let monitor = monitor_with_timeout(Duration::from_millis(30));
        let id = SourceId::new("mic");
        monitor.register(&id, "mic");
        monitor.observe(&id, &bytes_of(&[8000i16; 480]));

        std::thread::sleep(Duration::from_millis(60));

        assert!(monitor.is_inactive(&id));
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].level, 0);
        assert_eq!(snapshot[0].source, "mic");
    }

    #[test]
    fn test_silent_source_goes_inactive_despite_updates() {
        let monitor = monitor_with_timeout(Duration::from_millis(30));
        let id = SourceId::new("mic");
        monitor.register(&id, "mic");

        // Keep observing pure silence past the timeout; last_update stays
        // fresh but last_non_zero ages out.
        for _ in 0..4 {
            monitor.observe(&id, &bytes_of(&[0i16; 480]));
            std::thread::sleep(Duration::from_millis(15));
        }

        assert!(monitor.is_inactive(&id));
    }

    #[test]
    fn test_remove_drops_state() {
        let monitor = LevelMonitor::new(&LevelConfig::default());
        let id = SourceId::new("mic");
        monitor.register(&id, "mic");
        monitor.remove(&id);
        assert!(monitor.snapshot().is_empty());
    }
}
