//! # Inheritance Graph
//!
//! Directed acyclic graph of `child → parent` role edges. A role is also
//! every role it (transitively) inherits from, so a user holding `architect`
//! also passes the checks of `team_lead` and `user` when
//! `architect → team_lead → user`.
//!
//! Edges that would introduce a cycle are rejected before anything is
//! written: the graph never contains one.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use crate::error::{AuthzError, AuthzResult};

/// A single `child → parent` edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InheritanceEdge {
    /// The inheriting role.
    pub child: String,
    /// The role inherited from.
    pub parent: String,
}

/// Lock-protected graph contents.
#[derive(Default)]
pub(crate) struct GraphState {
    parents: HashMap<String, BTreeSet<String>>,
}

impl GraphState {
    /// Check if `to` is reachable from `from` following parent edges.
    fn reachable(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            for parent in self.parents.get(current).into_iter().flatten() {
                if parent == to {
                    return true;
                }
                queue.push_back(parent.as_str());
            }
        }
        false
    }

    pub(crate) fn add_edge(&mut self, child: &str, parent: &str) -> AuthzResult<bool> {
        // child → parent closes a cycle iff child is already an ancestor of parent
        if self.reachable(parent, child) {
            return Err(AuthzError::conflict(format!(
                "circular inheritance: '{child}' -> '{parent}'"
            )));
        }
        Ok(self
            .parents
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string()))
    }

    pub(crate) fn remove_edge(&mut self, child: &str, parent: &str) -> bool {
        let Some(parents) = self.parents.get_mut(child) else {
            return false;
        };
        let removed = parents.remove(parent);
        if parents.is_empty() {
            self.parents.remove(child);
        }
        removed
    }

    pub(crate) fn direct_parents(&self, role: &str) -> Vec<String> {
        self.parents
            .get(role)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Transitive closure of parents, excluding `role` itself.
    pub(crate) fn ancestors(&self, role: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([role]);
        while let Some(current) = queue.pop_front() {
            for parent in self.parents.get(current).into_iter().flatten() {
                if parent != role && out.insert(parent.clone()) {
                    queue.push_back(parent.as_str());
                }
            }
        }
        out
    }

    pub(crate) fn depth(&self, role: &str) -> usize {
        let mut memo = HashMap::new();
        self.depth_memo(role, &mut memo)
    }

    fn depth_memo<'a>(&'a self, role: &'a str, memo: &mut HashMap<&'a str, usize>) -> usize {
        if let Some(depth) = memo.get(role) {
            return *depth;
        }
        let depth = self
            .parents
            .get(role)
            .into_iter()
            .flatten()
            .map(|parent| self.depth_memo(parent.as_str(), memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(role, depth);
        depth
    }

    pub(crate) fn common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        let left = self.ancestors(a);
        let right = self.ancestors(b);
        left.intersection(&right)
            .max_by_key(|candidate| (self.depth(candidate), std::cmp::Reverse((*candidate).clone())))
            .cloned()
    }

    pub(crate) fn children(&self, role: &str) -> Vec<String> {
        let mut children: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, parents)| parents.contains(role))
            .map(|(child, _)| child.clone())
            .collect();
        children.sort();
        children
    }

    /// Drop every edge touching `role`. Returns the number removed.
    pub(crate) fn remove_role(&mut self, role: &str) -> usize {
        let mut removed = self.parents.remove(role).map(|p| p.len()).unwrap_or(0);
        for parents in self.parents.values_mut() {
            if parents.remove(role) {
                removed += 1;
            }
        }
        self.parents.retain(|_, parents| !parents.is_empty());
        removed
    }

    pub(crate) fn rename_role(&mut self, from: &str, to: &str) {
        if let Some(parents) = self.parents.remove(from) {
            self.parents.insert(to.to_string(), parents);
        }
        for parents in self.parents.values_mut() {
            if parents.remove(from) {
                parents.insert(to.to_string());
            }
        }
    }

    pub(crate) fn edges(&self) -> Vec<InheritanceEdge> {
        let mut edges: Vec<InheritanceEdge> = self
            .parents
            .iter()
            .flat_map(|(child, parents)| {
                parents.iter().map(move |parent| InheritanceEdge {
                    child: child.clone(),
                    parent: parent.clone(),
                })
            })
            .collect();
        edges.sort();
        edges
    }
}

/// Role inheritance graph with cycle prevention.
///
/// # Example
///
/// ```
/// use platform_authz::InheritanceGraph;
///
/// let graph = InheritanceGraph::new();
/// graph.add_edge("architect", "team_lead").unwrap();
/// graph.add_edge("team_lead", "user").unwrap();
///
/// assert_eq!(graph.depth("architect"), 2);
/// assert!(graph.inherited_roles("architect").contains("user"));
///
/// // user -> architect would close a loop
/// assert!(graph.add_edge("user", "architect").is_err());
/// ```
#[derive(Default)]
pub struct InheritanceGraph {
    state: RwLock<GraphState>,
}

impl fmt::Debug for InheritanceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InheritanceGraph")
            .field("edges", &self.state.read().edges().len())
            .finish()
    }
}

impl InheritanceGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write()
    }

    /// Add a `child → parent` edge.
    ///
    /// Adding an edge that already exists is a no-op.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `child` is reachable from `parent` (including
    ///   `child == parent`); the graph is left unchanged
    pub fn add_edge(&self, child: &str, parent: &str) -> AuthzResult<()> {
        if self.state.write().add_edge(child, parent)? {
            tracing::debug!(child = %child, parent = %parent, "Added inheritance edge");
        }
        Ok(())
    }

    /// Remove an edge. Removing an absent edge is a no-op.
    pub fn remove_edge(&self, child: &str, parent: &str) {
        if self.state.write().remove_edge(child, parent) {
            tracing::debug!(child = %child, parent = %parent, "Removed inheritance edge");
        }
    }

    /// Immediate parents of a role.
    pub fn direct_parents(&self, role: &str) -> Vec<String> {
        self.state.read().direct_parents(role)
    }

    /// Every role `role` inherits from, transitively. Never contains `role`.
    pub fn inherited_roles(&self, role: &str) -> BTreeSet<String> {
        self.state.read().ancestors(role)
    }

    /// Roles that directly inherit from `role`.
    pub fn children(&self, role: &str) -> Vec<String> {
        self.state.read().children(role)
    }

    /// Length of the longest parent chain above `role`. Roots are depth 0.
    pub fn depth(&self, role: &str) -> usize {
        self.state.read().depth(role)
    }

    /// A role both `a` and `b` inherit from.
    ///
    /// When several qualify, which one is returned is unspecified. The
    /// current implementation prefers the deepest candidate, then the
    /// lexicographically smallest name, but callers must not depend on it.
    pub fn find_common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        self.state.read().common_ancestor(a, b)
    }

    /// Every edge, sorted.
    pub fn edges(&self) -> Vec<InheritanceEdge> {
        self.state.read().edges()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_cycle_rejected_and_graph_unchanged() {
        let graph = InheritanceGraph::new();
        graph.add_edge("alpha", "beta").unwrap();

        let err = graph.add_edge("beta", "alpha").unwrap_err();
        assert!(matches!(err, AuthzError::Conflict(ref m) if m.contains("circular")));
        assert_eq!(graph.direct_parents("alpha"), vec!["beta"]);
        assert!(graph.direct_parents("beta").is_empty());
    }

    #[test]
    fn test_self_loop_rejected() {
        let graph = InheritanceGraph::new();
        assert!(graph.add_edge("alpha", "alpha").is_err());
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_indirect_cycle_rejected() {
        let graph = InheritanceGraph::new();
        graph.add_edge("aaa", "bbb").unwrap();
        graph.add_edge("bbb", "ccc").unwrap();
        assert!(graph.add_edge("ccc", "aaa").is_err());
        assert_eq!(graph.edges().len(), 2);
    }

    #[test]
    fn test_inherited_roles_excludes_self() {
        let graph = InheritanceGraph::new();
        graph.add_edge("architect", "team_lead").unwrap();
        graph.add_edge("team_lead", "user").unwrap();
        graph.add_edge("architect", "reviewer").unwrap();

        let inherited = graph.inherited_roles("architect");
        assert_eq!(
            inherited.into_iter().collect::<Vec<_>>(),
            vec!["reviewer", "team_lead", "user"]
        );
        assert!(!graph.inherited_roles("user").contains("user"));
    }

    #[test]
    fn test_depth_is_longest_path() {
        let graph = InheritanceGraph::new();
        graph.add_edge("ddd", "ccc").unwrap();
        graph.add_edge("ccc", "bbb").unwrap();
        graph.add_edge("bbb", "aaa").unwrap();
        graph.add_edge("ddd", "aaa").unwrap();

        assert_eq!(graph.depth("aaa"), 0);
        assert_eq!(graph.depth("ddd"), 3);
        assert_eq!(graph.depth("unknown"), 0);
    }

    #[test]
    fn test_common_ancestor() {
        let graph = InheritanceGraph::new();
        graph.add_edge("frontend", "developer").unwrap();
        graph.add_edge("backend", "developer").unwrap();
        graph.add_edge("developer", "user").unwrap();
        graph.add_edge("designer", "user").unwrap();

        assert_eq!(
            graph.find_common_ancestor("frontend", "backend"),
            Some("developer".to_string())
        );
        assert_eq!(
            graph.find_common_ancestor("frontend", "designer"),
            Some("user".to_string())
        );
        assert_eq!(graph.find_common_ancestor("frontend", "stranger"), None);
    }

    #[test]
    fn test_remove_and_rename_role() {
        let graph = InheritanceGraph::new();
        graph.add_edge("aaa", "bbb").unwrap();
        graph.add_edge("bbb", "ccc").unwrap();

        graph.write().rename_role("bbb", "middle");
        assert_eq!(graph.direct_parents("aaa"), vec!["middle"]);
        assert_eq!(graph.direct_parents("middle"), vec!["ccc"]);

        assert_eq!(graph.write().remove_role("middle"), 2);
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_remove_edge_is_idempotent() {
        let graph = InheritanceGraph::new();
        graph.add_edge("aaa", "bbb").unwrap();
        graph.remove_edge("aaa", "bbb");
        graph.remove_edge("aaa", "bbb");
        assert!(graph.children("bbb").is_empty());
    }
}
