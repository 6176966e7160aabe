//! Concurrent capture core: per-source producers and the level monitor.
//!
//! One capture producer task runs per active source. It is the single writer
//! for that source's ring buffer pair and the only component that observes
//! chunks into the level monitor, which keeps per-source write ordering
//! trivial.

mod level;
mod producer;

pub use level::LevelMonitor;
pub(crate) use producer::{spawn_producer, ProducerHandle};
