//! Source identification type.

use std::sync::Arc;

/// Unique identifier for a capture source.
///
/// `SourceId` is a lightweight, cloneable identifier used as the key for a
/// source's buffers, producer, and decoder. It uses `Arc<str>` internally so
/// cloning is a pointer copy with no heap allocation.
///
/// # Example
///
/// ```
/// use fieldstream::SourceId;
///
/// let mic = SourceId::new("hw:1,0");
/// let cam = SourceId::new("rtsp://cam-1/stream");
///
/// assert_ne!(mic, cam);
/// assert_eq!(mic, SourceId::new("hw:1,0"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Arc<str>);

impl SourceId {
    /// Creates a new source ID from a string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_equality() {
        let a = SourceId::new("hw:1,0");
        let b = SourceId::new("hw:1,0");
        let c = SourceId::new("rtsp://cam/stream");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_source_id_display() {
        let id = SourceId::new("rtsp://cam/stream");
        assert_eq!(format!("{id}"), "rtsp://cam/stream");
    }

    #[test]
    fn test_source_id_from_str() {
        let id: SourceId = "test".into();
        assert_eq!(id.as_str(), "test");
    }

    #[test]
    fn test_source_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(SourceId::new("a"));
        set.insert(SourceId::new("b"));
        set.insert(SourceId::new("a")); // duplicate

        assert_eq!(set.len(), 2);
    }
}
