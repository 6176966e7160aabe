//! Per-source ring buffer pair.
//!
//! Each active source owns two fixed-capacity circular stores:
//!
//! - [`CaptureStore`]: retains the most recent N seconds of raw PCM for
//!   on-demand clip extraction by wall-clock time range.
//! - [`AnalysisStore`]: holds a small amount of unconsumed PCM and hands the
//!   classifier overlapping windows without recopying unconsumed audio.
//!
//! Both stores key their rings by [`SourceId`](crate::SourceId). The map lock
//! is held only long enough to clone a per-source handle, so writers and
//! readers on distinct sources never contend with each other. Within one
//! source there is exactly one writer and at most one reader, each taking the
//! ring's own lock.

mod analysis;
mod capture;

pub use analysis::AnalysisStore;
pub use capture::CaptureStore;
