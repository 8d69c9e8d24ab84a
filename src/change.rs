use std::collections::HashMap;
use std::time::SystemTime;

/// Opaque identity of a submitted change, unique within a coordinator run.
///
/// We don't use the newtype-over-String pattern with private fields here
/// because producers need to construct and compare these freely; there's no
/// invariant beyond "it's a string" to protect.
pub type ChangeId = String;

/// A path in the file namespace a change touches. Kept as an owned `String`
/// rather than `PathBuf` because these are logical keys (may not exist on
/// any real filesystem), not filesystem paths to operate on directly.
pub type PathKey = String;

/// A submitted unit of work. Immutable after submission: once a `Change` is
/// admitted, nothing mutates its fields. If a producer needs to change
/// something, it submits a new `Change`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub id: ChangeId,
    /// Ordered list of modified paths (the order matters for some conflict
    /// predicates, so we don't coerce this into a Set).
    pub paths: Vec<PathKey>,
    /// Opaque commit/revision handle the external VCS collaborator
    /// understands. The coordinator never parses this.
    pub revision: String,
    pub arrived_at: SystemTime,
    pub metadata: HashMap<String, String>,
    /// Identity of the producer that submitted this change. Used by the
    /// validator's ownership check.
    pub producer: String,
}

impl Change {
    pub fn new(id: impl Into<ChangeId>, revision: impl Into<String>, producer: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            paths: Vec::new(),
            revision: revision.into(),
            arrived_at: SystemTime::now(),
            metadata: HashMap::new(),
            producer: producer.into(),
        }
    }

    pub fn with_paths(mut self, paths: impl IntoIterator<Item = impl Into<PathKey>>) -> Self {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_paths() {
        let c = Change::new("c1", "deadbeef", "agent-1").with_paths(["a/b", "c/d"]);
        assert_eq!(c.paths, vec!["a/b".to_string(), "c/d".to_string()]);
        assert_eq!(c.producer, "agent-1");
    }
}
