//! Analysis buffer with overlapping window extraction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::source::SourceId;
use crate::CaptureError;

/// A circular byte store holding unconsumed classifier input for one source.
///
/// Extraction returns one full window and advances the read cursor by
/// `window_bytes - overlap_bytes`, so the trailing overlap is included in the
/// next window without recopying unconsumed audio.
struct AnalysisRing {
    data: Vec<u8>,
    /// Total bytes ever written.
    head: u64,
    /// Total bytes consumed (cursor of the next window start).
    tail: u64,
    window_bytes: usize,
    overlap_bytes: usize,
}

impl AnalysisRing {
    fn new(capacity: usize, window_bytes: usize, overlap_bytes: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            head: 0,
            tail: 0,
            window_bytes,
            overlap_bytes,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn unread(&self) -> usize {
        (self.head - self.tail) as usize
    }

    /// Appends bytes. Returns the count of unread bytes discarded because the
    /// ring was full; the writer is never blocked.
    fn write(&mut self, bytes: &[u8]) -> usize {
        let cap = self.data.len();
        let skip = bytes.len().saturating_sub(cap);
        let src = &bytes[skip..];

        let pos = ((self.head + skip as u64) % cap as u64) as usize;
        let first = (cap - pos).min(src.len());
        self.data[pos..pos + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&src[first..]);
        }

        self.head += bytes.len() as u64;

        // Oldest unread bytes fall off once the reader lags a full ring.
        let unread = self.head - self.tail;
        if unread > cap as u64 {
            let dropped = unread - cap as u64;
            self.tail += dropped;
            dropped as usize
        } else {
            0
        }
    }

    fn has_window(&self) -> bool {
        self.unread() >= self.window_bytes
    }

    /// Copies out one window and advances the cursor by the window stride.
    fn extract_window(&mut self) -> Option<Vec<u8>> {
        if !self.has_window() {
            return None;
        }

        let cap = self.capacity();
        let pos = (self.tail % cap as u64) as usize;
        let mut window = Vec::with_capacity(self.window_bytes);
        let first = (cap - pos).min(self.window_bytes);
        window.extend_from_slice(&self.data[pos..pos + first]);
        window.extend_from_slice(&self.data[..self.window_bytes - first]);

        self.tail += (self.window_bytes - self.overlap_bytes) as u64;
        Some(window)
    }
}

/// Keyed store of per-source analysis rings.
pub struct AnalysisStore {
    rings: RwLock<HashMap<SourceId, Arc<Mutex<AnalysisRing>>>>,
}

impl Default for AnalysisStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Reserves an analysis ring for the given source.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::DuplicateSource`] if the source already has a
    /// ring, [`CaptureError::InvalidCapacity`] if the window is zero, the
    /// overlap is not shorter than the window, or the capacity cannot hold
    /// one window.
    pub fn allocate(
        &self,
        source_id: &SourceId,
        window_bytes: usize,
        overlap_bytes: usize,
        capacity_bytes: usize,
    ) -> Result<(), CaptureError> {
        if window_bytes == 0 {
            return Err(CaptureError::InvalidCapacity {
                reason: "window_bytes must be non-zero".to_string(),
            });
        }
        if overlap_bytes >= window_bytes {
            return Err(CaptureError::InvalidCapacity {
                reason: "overlap_bytes must be smaller than window_bytes".to_string(),
            });
        }
        if capacity_bytes < window_bytes {
            return Err(CaptureError::InvalidCapacity {
                reason: "capacity must hold at least one window".to_string(),
            });
        }

        let mut rings = self.rings.write();
        if rings.contains_key(source_id) {
            return Err(CaptureError::duplicate(source_id.as_str()));
        }
        rings.insert(
            source_id.clone(),
            Arc::new(Mutex::new(AnalysisRing::new(
                capacity_bytes,
                window_bytes,
                overlap_bytes,
            ))),
        );
        tracing::debug!(source = %source_id, capacity_bytes, window_bytes, "analysis ring allocated");
        Ok(())
    }

    /// Returns `true` if the source has an allocated ring.
    pub fn contains(&self, source_id: &SourceId) -> bool {
        self.rings.read().contains_key(source_id)
    }

    /// Appends PCM bytes for the source.
    ///
    /// Returns the number of unread bytes dropped to make room; the write
    /// itself always succeeds for a known source.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources.
    pub fn write(&self, source_id: &SourceId, bytes: &[u8]) -> Result<usize, CaptureError> {
        let ring = self.ring(source_id)?;
        let dropped = ring.lock().write(bytes);
        Ok(dropped)
    }

    /// Returns `true` once at least one full window of unconsumed bytes is
    /// buffered.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources.
    pub fn has_window(&self, source_id: &SourceId) -> Result<bool, CaptureError> {
        let ring = self.ring(source_id)?;
        let guard = ring.lock();
        Ok(guard.has_window())
    }

    /// Extracts exactly one window, retaining the configured overlap for the
    /// next one. Returns `None` when less than one window is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources.
    pub fn extract_window(&self, source_id: &SourceId) -> Result<Option<Vec<u8>>, CaptureError> {
        let ring = self.ring(source_id)?;
        let mut guard = ring.lock();
        Ok(guard.extract_window())
    }

    /// Frees the source's ring. Called by the registry after drain.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources.
    pub fn remove(&self, source_id: &SourceId) -> Result<(), CaptureError> {
        match self.rings.write().remove(source_id) {
            Some(_) => {
                tracing::debug!(source = %source_id, "analysis ring freed");
                Ok(())
            }
            None => Err(CaptureError::not_found(source_id.as_str())),
        }
    }

    fn ring(&self, source_id: &SourceId) -> Result<Arc<Mutex<AnalysisRing>>, CaptureError> {
        self.rings
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| CaptureError::not_found(source_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: usize = 1000;
    const OVERLAP: usize = 400;

    fn store_with_ring() -> (AnalysisStore, SourceId) {
        let store = AnalysisStore::new();
        let id = SourceId::new("test");
        store.allocate(&id, WINDOW, OVERLAP, WINDOW * 3).unwrap();
        (store, id)
    }

    /// Ramp bytes so window contents encode their absolute offset.
    fn ramp(start: usize, len: usize) -> Vec<u8> {
        (start..start + len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_has_window_threshold() {
        let (store, id) = store_with_ring();
        store.write(&id, &ramp(0, WINDOW - 1)).unwrap();
        assert!(!store.has_window(&id).unwrap());
        store.write(&id, &ramp(WINDOW - 1, 1)).unwrap();
        assert!(store.has_window(&id).unwrap());
    }

    #[test]
    fn test_extract_advances_by_stride() {
        let (store, id) = store_with_ring();
        store.write(&id, &ramp(0, WINDOW * 2)).unwrap();

        let w1 = store.extract_window(&id).unwrap().unwrap();
        let w2 = store.extract_window(&id).unwrap().unwrap();

        assert_eq!(w1, ramp(0, WINDOW));
        // Second window starts one stride (window - overlap) later.
        assert_eq!(w2, ramp(WINDOW - OVERLAP, WINDOW));
    }

    #[test]
    fn test_consecutive_windows_share_overlap() {
        let (store, id) = store_with_ring();
        store.write(&id, &ramp(0, WINDOW * 2)).unwrap();

        let w1 = store.extract_window(&id).unwrap().unwrap();
        let w2 = store.extract_window(&id).unwrap().unwrap();

        assert_eq!(w1[WINDOW - OVERLAP..], w2[..OVERLAP]);
    }

    #[test]
    fn test_extraction_across_wraparound() {
        let (store, id) = store_with_ring();

        // Fill and drain repeatedly so the cursor wraps the 3-window ring.
        let mut offset = 0usize;
        let mut extracted = 0;
        while extracted < 10 {
            store.write(&id, &ramp(offset, WINDOW)).unwrap();
            offset += WINDOW;
            while let Some(window) = store.extract_window(&id).unwrap() {
                let start = extracted * (WINDOW - OVERLAP);
                assert_eq!(window, ramp(start, WINDOW), "window {extracted}");
                extracted += 1;
            }
        }
    }

    #[test]
    fn test_overflow_drops_oldest_and_reports() {
        let (store, id) = store_with_ring();
        let capacity = WINDOW * 3;

        store.write(&id, &ramp(0, capacity)).unwrap();
        let dropped = store.write(&id, &ramp(capacity, 500)).unwrap();
        assert_eq!(dropped, 500);

        // The next window starts where the drop left the cursor.
        let window = store.extract_window(&id).unwrap().unwrap();
        assert_eq!(window, ramp(500, WINDOW));
    }

    #[test]
    fn test_empty_extract_returns_none() {
        let (store, id) = store_with_ring();
        assert!(store.extract_window(&id).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_allocation_rejected() {
        let (store, id) = store_with_ring();
        let err = store.allocate(&id, WINDOW, OVERLAP, WINDOW * 3).unwrap_err();
        assert!(matches!(err, CaptureError::DuplicateSource { .. }));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let store = AnalysisStore::new();
        let err = store
            .allocate(&SourceId::new("x"), WINDOW, WINDOW, WINDOW * 3)
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidCapacity { .. }));
    }

    #[test]
    fn test_capacity_must_hold_one_window() {
        let store = AnalysisStore::new();
        let err = store
            .allocate(&SourceId::new("x"), WINDOW, OVERLAP, WINDOW - 1)
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidCapacity { .. }));
    }

    #[test]
    fn test_remove_then_not_found() {
        let (store, id) = store_with_ring();
        store.remove(&id).unwrap();
        assert!(matches!(
            store.write(&id, &[0u8; 2]).unwrap_err(),
            CaptureError::NotFound { .. }
        ));
        assert!(matches!(
            store.extract_window(&id).unwrap_err(),
            CaptureError::NotFound { .. }
        ));
    }
}
