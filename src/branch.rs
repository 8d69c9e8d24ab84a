use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Serialize;

use crate::change::ChangeId;

/// Deterministic, content-addressed identity of a speculative branch:
/// `"branch-" + ChangeId1 + "-" + ... + ChangeIdn`, in prefix order.
pub type BranchId = String;

pub fn branch_id(changes: &[ChangeId]) -> BranchId {
    let mut id = String::from("branch");
    for c in changes {
        id.push('-');
        id.push_str(c);
    }
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    Pending,
    Testing,
    Passed,
    Failed,
    Killed,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub changes: Vec<ChangeId>,
    pub depth: usize,
    pub status: Status,
    pub parent: Option<BranchId>,
    pub children: Vec<BranchId>,
    pub killed_at: Option<SystemTime>,
    pub kill_reason: Option<String>,
    /// Opaque handle to the external test-run resource, if the executor has
    /// launched one. Not interpreted by the registry.
    pub test_run_handle: Option<String>,
    pub container_handle: Option<String>,
}

impl Branch {
    fn new(changes: Vec<ChangeId>, parent: Option<BranchId>) -> Self {
        let depth = changes.len();
        let id = branch_id(&changes);
        Self {
            id,
            changes,
            depth,
            status: Status::Pending,
            parent,
            children: Vec::new(),
            killed_at: None,
            kill_reason: None,
            test_run_handle: None,
            container_handle: None,
        }
    }
}

/// In-memory map of active speculative branches, guarded by a single
/// reader-writer lock: short critical sections, no collaborator calls
/// while the lock is held.
#[derive(Default)]
pub struct BranchRegistry {
    branches: RwLock<HashMap<BranchId, Branch>>,
}

impl BranchRegistry {
    pub fn new() -> Self {
        Self {
            branches: RwLock::new(HashMap::new()),
        }
    }

    /// Creates (or returns the existing) branch for `prefix`, wiring it up
    /// as a child of the branch for `prefix[..prefix.len()-1]` if that
    /// parent exists. Returns `(id, already_existed)`.
    pub fn get_or_create(&self, prefix: &[ChangeId]) -> (BranchId, bool) {
        let id = branch_id(prefix);
        let mut branches = self.branches.write();
        if branches.contains_key(&id) {
            return (id, true);
        }
        let parent = if prefix.len() > 1 {
            Some(branch_id(&prefix[..prefix.len() - 1]))
        } else {
            None
        };
        let branch = Branch::new(prefix.to_vec(), parent.clone());
        branches.insert(id.clone(), branch);
        if let Some(parent_id) = parent {
            if let Some(p) = branches.get_mut(&parent_id) {
                p.children.push(id.clone());
            }
        }
        (id, false)
    }

    pub fn get(&self, id: &str) -> Option<Branch> {
        self.branches.read().get(id).cloned()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.branches.read().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Branch> {
        self.branches.write().remove(id)
    }

    /// Applies `f` to the branch's status/metadata under the write lock,
    /// returning `None` if the branch no longer exists (removed or never
    /// created -- traversals and kills must tolerate this silently).
    pub fn mutate<R>(&self, id: &str, f: impl FnOnce(&mut Branch) -> R) -> Option<R> {
        let mut branches = self.branches.write();
        branches.get_mut(id).map(f)
    }

    /// Snapshot of direct children, breadth-first source of truth for
    /// cascades: taken entirely under the read lock then handed back as an
    /// owned Vec so callers never hold the lock across recursion.
    pub fn children_of(&self, id: &str) -> Vec<BranchId> {
        self.branches
            .read()
            .get(id)
            .map(|b| b.children.clone())
            .unwrap_or_default()
    }

    /// Ancestry from root to self (inclusive), as a snapshot.
    pub fn ancestry(&self, id: &str) -> Vec<BranchId> {
        let branches = self.branches.read();
        let mut chain = Vec::new();
        let mut cur = Some(id.to_string());
        while let Some(c) = cur {
            match branches.get(&c) {
                Some(b) => {
                    chain.push(c.clone());
                    cur = b.parent.clone();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// Breadth-first descendants of `id`, not including `id` itself.
    /// Snapshots under the read lock, then walks the snapshot -- tolerates
    /// branches removed concurrently by skipping them.
    pub fn descendants(&self, id: &str) -> Vec<BranchId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(id.to_string());
        while let Some(cur) = queue.pop_front() {
            let children = self.children_of(&cur);
            for child in children {
                out.push(child.clone());
                queue.push_back(child);
            }
        }
        out
    }

    pub fn root_of(&self, id: &str) -> BranchId {
        self.ancestry(id).into_iter().next().unwrap_or_else(|| id.to_string())
    }

    /// The root of `id`'s chain plus all descendants of that root.
    pub fn family(&self, id: &str) -> Vec<BranchId> {
        let root = self.root_of(id);
        let mut out = vec![root.clone()];
        out.extend(self.descendants(&root));
        out
    }

    pub fn siblings_of(&self, id: &str) -> Vec<BranchId> {
        let branches = self.branches.read();
        let Some(b) = branches.get(id) else {
            return Vec::new();
        };
        match &b.parent {
            None => Vec::new(),
            Some(parent_id) => branches
                .get(parent_id)
                .map(|p| p.children.iter().filter(|c| c.as_str() != id).cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn len(&self) -> usize {
        self.branches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<ChangeId> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn branch_id_is_pure() {
        let seq = ids(&["c1", "c2"]);
        assert_eq!(branch_id(&seq), branch_id(&seq));
    }

    #[test]
    fn branch_id_joins_change_ids_literally() {
        assert_eq!(branch_id(&ids(&["c1"])), "branch-c1");
        assert_eq!(branch_id(&ids(&["c1", "c2"])), "branch-c1-c2");
        assert_eq!(branch_id(&ids(&["c1", "c2", "c3"])), "branch-c1-c2-c3");
    }

    #[test]
    fn create_wires_parent_child() {
        let reg = BranchRegistry::new();
        let (b1, existed1) = reg.get_or_create(&ids(&["c1"]));
        assert!(!existed1);
        let (b2, existed2) = reg.get_or_create(&ids(&["c1", "c2"]));
        assert!(!existed2);
        let branch1 = reg.get(&b1).unwrap();
        assert_eq!(branch1.depth, 1);
        assert_eq!(branch1.children, vec![b2.clone()]);
        let branch2 = reg.get(&b2).unwrap();
        assert_eq!(branch2.parent, Some(b1));
        assert_eq!(branch2.depth, 2);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let reg = BranchRegistry::new();
        let (b1, _) = reg.get_or_create(&ids(&["c1"]));
        let (b1_again, existed) = reg.get_or_create(&ids(&["c1"]));
        assert!(existed);
        assert_eq!(b1, b1_again);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn traversals_cover_family_exactly_once() {
        let reg = BranchRegistry::new();
        let (b1, _) = reg.get_or_create(&ids(&["c1"]));
        let (b2, _) = reg.get_or_create(&ids(&["c1", "c2"]));
        let (b3, _) = reg.get_or_create(&ids(&["c1", "c2", "c3"]));

        let root = reg.root_of(&b3);
        assert_eq!(root, b1);

        let mut family = reg.family(&b2);
        family.sort();
        let mut want = vec![b1, b2, b3];
        want.sort();
        assert_eq!(family, want);
    }

    #[test]
    fn descendants_are_breadth_first() {
        let reg = BranchRegistry::new();
        let (b1, _) = reg.get_or_create(&ids(&["c1"]));
        let (b2, _) = reg.get_or_create(&ids(&["c1", "c2"]));
        let (_b3, _) = reg.get_or_create(&ids(&["c1", "c2", "c3"]));
        let desc = reg.descendants(&b1);
        assert_eq!(desc[0], b2);
    }

    #[test]
    fn descendants_skip_missing_nodes() {
        let reg = BranchRegistry::new();
        let (b1, _) = reg.get_or_create(&ids(&["c1"]));
        let (b2, _) = reg.get_or_create(&ids(&["c1", "c2"]));
        reg.remove(&b2);
        // b1 still lists b2 as a child (removal doesn't rewrite the parent),
        // but the traversal must not panic or fabricate a descendant for it.
        let desc = reg.descendants(&b1);
        assert!(desc.is_empty());
    }
}
