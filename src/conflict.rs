//! The conflict predicate: a pure, deterministic, symmetric function over
//! two changes' modified paths.
//!
//! The base policy must not be left as an always-`false` stub; here the
//! reference `DirectoryOverlapConflictPredicate` is the default, and
//! whichever policy is configured gets logged once at startup (see
//! `Coordinator::new`).

use std::path::Path;

use crate::change::Change;

pub trait ConflictPredicate: Send + Sync {
    /// True iff `a` and `b` conflict. Must be pure, deterministic, and
    /// symmetric (`conflicts(a, b) == conflicts(b, a)`); implementations
    /// must not assume transitivity.
    fn conflicts(&self, a: &Change, b: &Change) -> bool;

    /// Human-readable name of the policy, for the startup log line.
    fn describe(&self) -> String;
}

/// Two changes conflict iff any pair of their modified paths shares an
/// ancestor directory at `depth` components from the root.
///
/// `depth = 1` means "conflict iff they share a top-level directory";
/// `depth = 0` means every pair of changes conflicts (all paths share the
/// empty-depth ancestor, the root).
pub struct DirectoryOverlapConflictPredicate {
    pub depth: usize,
}

impl DirectoryOverlapConflictPredicate {
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }

    fn ancestor_at_depth(&self, path: &str) -> String {
        let components: Vec<&str> = Path::new(path).components().map(|c| c.as_os_str().to_str().unwrap_or("")).collect();
        let take = self.depth.min(components.len());
        components[..take].join("/")
    }
}

impl ConflictPredicate for DirectoryOverlapConflictPredicate {
    fn conflicts(&self, a: &Change, b: &Change) -> bool {
        for pa in &a.paths {
            let anc_a = self.ancestor_at_depth(pa);
            for pb in &b.paths {
                if anc_a == self.ancestor_at_depth(pb) {
                    return true;
                }
            }
        }
        false
    }

    fn describe(&self) -> String {
        format!("directory-overlap(depth={})", self.depth)
    }
}

/// Reference "everything conflicts" predicate, useful as a conservative
/// default or in tests that want full serialization.
pub struct AlwaysConflictPredicate;

impl ConflictPredicate for AlwaysConflictPredicate {
    fn conflicts(&self, _a: &Change, _b: &Change) -> bool {
        true
    }

    fn describe(&self) -> String {
        "always-conflict".to_string()
    }
}

/// Reference "nothing conflicts" predicate: an intentional, documented
/// policy choice for workloads known to be fully independent, not a TODO.
pub struct NeverConflictPredicate;

impl ConflictPredicate for NeverConflictPredicate {
    fn conflicts(&self, _a: &Change, _b: &Change) -> bool {
        false
    }

    fn describe(&self) -> String {
        "never-conflict".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn change(paths: &[&str]) -> Change {
        Change::new("c", "rev", "agent").with_paths(paths.to_vec())
    }

    #[test]
    fn symmetric() {
        let pred = DirectoryOverlapConflictPredicate::new(1);
        let a = change(&["src/foo.rs"]);
        let b = change(&["src/bar.rs"]);
        assert_eq!(pred.conflicts(&a, &b), pred.conflicts(&b, &a));
    }

    #[test_case(1, "src/foo.rs", "src/bar.rs", true; "same top-level dir at depth 1")]
    #[test_case(1, "src/foo.rs", "docs/bar.rs", false; "different top-level dir at depth 1")]
    #[test_case(2, "src/mod_a/foo.rs", "src/mod_b/bar.rs", false; "different subdir at depth 2")]
    #[test_case(2, "src/mod_a/foo.rs", "src/mod_a/bar.rs", true; "same subdir at depth 2")]
    fn overlap_at_depth(depth: usize, path_a: &str, path_b: &str, want_conflict: bool) {
        let pred = DirectoryOverlapConflictPredicate::new(depth);
        let a = change(&[path_a]);
        let b = change(&[path_b]);
        assert_eq!(pred.conflicts(&a, &b), want_conflict);
    }
}
