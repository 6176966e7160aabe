//! Rolling capture buffer with time-range clip extraction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use crate::source::SourceId;
use crate::CaptureError;

/// A fixed-capacity circular byte store for one source.
///
/// The ring is anchored to the wall-clock instant of its allocation; byte
/// offsets for a requested time range are derived from that anchor and the
/// constant byte rate, so a range maps to ring positions without per-chunk
/// timestamps.
struct CaptureRing {
    source_id: SourceId,
    data: Vec<u8>,
    /// Total bytes ever written. `total_written % capacity` is the write
    /// position; `total_written - capacity` is the oldest retrievable offset.
    total_written: u64,
    anchor: SystemTime,
    byte_rate: u64,
    frame_bytes: usize,
}

impl CaptureRing {
    fn new(
        source_id: SourceId,
        capacity: usize,
        byte_rate: u64,
        frame_bytes: usize,
        anchor: SystemTime,
    ) -> Self {
        Self {
            source_id,
            data: vec![0u8; capacity],
            total_written: 0,
            anchor,
            byte_rate,
            frame_bytes,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Appends bytes, overwriting the oldest data once the ring is full.
    fn write(&mut self, bytes: &[u8]) {
        let cap = self.data.len();
        // A chunk larger than the ring only leaves its tail behind.
        let skip = bytes.len().saturating_sub(cap);
        let src = &bytes[skip..];

        let mut pos = ((self.total_written + skip as u64) % cap as u64) as usize;
        let first = (cap - pos).min(src.len());
        self.data[pos..pos + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&src[first..]);
        }
        pos = (pos + src.len()) % cap;
        debug_assert_eq!(
            pos as u64,
            (self.total_written + bytes.len() as u64) % cap as u64
        );

        self.total_written += bytes.len() as u64;
    }

    /// Copies out the bytes captured between `start` and `end`.
    fn read_range(&self, start: SystemTime, end: SystemTime) -> Result<Vec<u8>, CaptureError> {
        if end <= start {
            return Err(CaptureError::range_unavailable(
                self.source_id.as_str(),
                "empty or inverted range",
            ));
        }

        let mut start_off = self.offset_for(start)?;
        let mut end_off = self.offset_for(end)?;
        start_off -= start_off % self.frame_bytes as u64;
        end_off -= end_off % self.frame_bytes as u64;

        if end_off > self.total_written {
            return Err(CaptureError::range_unavailable(
                self.source_id.as_str(),
                "range extends past captured audio",
            ));
        }
        let oldest = self.total_written.saturating_sub(self.capacity() as u64);
        if start_off < oldest {
            return Err(CaptureError::range_unavailable(
                self.source_id.as_str(),
                "range already overwritten",
            ));
        }

        let cap = self.capacity() as u64;
        let len = (end_off - start_off) as usize;
        let mut out = Vec::with_capacity(len);
        let pos = (start_off % cap) as usize;
        let first = (self.capacity() - pos).min(len);
        out.extend_from_slice(&self.data[pos..pos + first]);
        out.extend_from_slice(&self.data[..len - first]);
        Ok(out)
    }

    fn offset_for(&self, t: SystemTime) -> Result<u64, CaptureError> {
        let elapsed = t.duration_since(self.anchor).map_err(|_| {
            CaptureError::range_unavailable(self.source_id.as_str(), "range precedes capture start")
        })?;
        Ok((elapsed.as_secs_f64() * self.byte_rate as f64) as u64)
    }
}

/// Keyed store of per-source capture rings.
///
/// The outer map is read-locked just long enough to clone a ring handle, so
/// writes and reads on distinct sources proceed in parallel.
pub struct CaptureStore {
    rings: RwLock<HashMap<SourceId, Arc<Mutex<CaptureRing>>>>,
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Reserves a capture ring sized
    /// `duration_secs × sample_rate × bytes_per_sample × channels` for the
    /// given source, anchored at the current wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::DuplicateSource`] if the source already has a
    /// ring, [`CaptureError::InvalidCapacity`] if any sizing parameter is
    /// zero.
    pub fn allocate(
        &self,
        source_id: &SourceId,
        duration_secs: u32,
        sample_rate: u32,
        bytes_per_sample: u16,
        channels: u16,
    ) -> Result<(), CaptureError> {
        self.allocate_at(
            source_id,
            duration_secs,
            sample_rate,
            bytes_per_sample,
            channels,
            SystemTime::now(),
        )
    }

    /// Like [`allocate`](Self::allocate), with an explicit time anchor.
    pub(crate) fn allocate_at(
        &self,
        source_id: &SourceId,
        duration_secs: u32,
        sample_rate: u32,
        bytes_per_sample: u16,
        channels: u16,
        anchor: SystemTime,
    ) -> Result<(), CaptureError> {
        if duration_secs == 0 || sample_rate == 0 || bytes_per_sample == 0 || channels == 0 {
            return Err(CaptureError::InvalidCapacity {
                reason: "all capture sizing parameters must be non-zero".to_string(),
            });
        }

        let frame_bytes = bytes_per_sample as usize * channels as usize;
        let byte_rate = sample_rate as u64 * frame_bytes as u64;
        let capacity = duration_secs as usize * byte_rate as usize;

        let mut rings = self.rings.write();
        if rings.contains_key(source_id) {
            return Err(CaptureError::duplicate(source_id.as_str()));
        }
        rings.insert(
            source_id.clone(),
            Arc::new(Mutex::new(CaptureRing::new(
                source_id.clone(),
                capacity,
                byte_rate,
                frame_bytes,
                anchor,
            ))),
        );
        tracing::debug!(source = %source_id, capacity, "capture ring allocated");
        Ok(())
    }

    /// Returns `true` if the source has an allocated ring.
    pub fn contains(&self, source_id: &SourceId) -> bool {
        self.rings.read().contains_key(source_id)
    }

    /// Returns the ring capacity in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources.
    pub fn capacity(&self, source_id: &SourceId) -> Result<usize, CaptureError> {
        Ok(self.ring(source_id)?.lock().capacity())
    }

    /// Appends PCM bytes for the source, overwriting the oldest audio once
    /// the ring is full.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources.
    pub fn write(&self, source_id: &SourceId, bytes: &[u8]) -> Result<(), CaptureError> {
        let ring = self.ring(source_id)?;
        ring.lock().write(bytes);
        Ok(())
    }

    /// Copies out the audio captured between `start` and `end`.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::RangeUnavailable`] if any requested byte has
    /// been overwritten or not yet captured, [`CaptureError::NotFound`] for
    /// unknown sources.
    pub fn read_range(
        &self,
        source_id: &SourceId,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<Vec<u8>, CaptureError> {
        let ring = self.ring(source_id)?;
        let guard = ring.lock();
        guard.read_range(start, end)
    }

    /// Frees the source's ring.
    ///
    /// The registry only calls this after the source's writer has
    /// acknowledged its drain.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NotFound`] for unknown sources.
    pub fn remove(&self, source_id: &SourceId) -> Result<(), CaptureError> {
        match self.rings.write().remove(source_id) {
            Some(_) => {
                tracing::debug!(source = %source_id, "capture ring freed");
                Ok(())
            }
            None => Err(CaptureError::not_found(source_id.as_str())),
        }
    }

    fn ring(&self, source_id: &SourceId) -> Result<Arc<Mutex<CaptureRing>>, CaptureError> {
        self.rings
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| CaptureError::not_found(source_id.as_str()))
    }
}
