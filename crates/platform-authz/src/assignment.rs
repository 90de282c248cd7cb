//! Assignment store
//!
//! Maps each user to the roles they hold directly. Inheritance is not
//! expanded here; that is the resolver's job.
//!
//! Assigning a role twice and revoking a role that is not held both succeed
//! without changing anything.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{AuthzError, AuthzResult};
use crate::role::{Role, RoleRegistry, RoleState};

/// A single `user ↔ role` relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoleAssignment {
    /// User id.
    pub user_id: String,
    /// Role name.
    pub role: String,
}

/// Lock-protected assignments.
#[derive(Default)]
pub(crate) struct AssignmentState {
    by_user: BTreeMap<String, BTreeSet<String>>,
}

impl AssignmentState {
    pub(crate) fn assign(&mut self, user: &str, role: &str) -> bool {
        self.by_user
            .entry(user.to_string())
            .or_default()
            .insert(role.to_string())
    }

    pub(crate) fn revoke(&mut self, user: &str, role: &str) -> bool {
        let Some(roles) = self.by_user.get_mut(user) else {
            return false;
        };
        let removed = roles.remove(role);
        if roles.is_empty() {
            self.by_user.remove(user);
        }
        removed
    }

    pub(crate) fn roles_of(&self, user: &str) -> impl Iterator<Item = &String> {
        self.by_user.get(user).into_iter().flatten()
    }

    pub(crate) fn has(&self, user: &str, role: &str) -> bool {
        self.by_user
            .get(user)
            .map(|roles| roles.contains(role))
            .unwrap_or(false)
    }

    pub(crate) fn users_with(&self, role: &str) -> Vec<String> {
        self.by_user
            .iter()
            .filter(|(_, roles)| roles.contains(role))
            .map(|(user, _)| user.clone())
            .collect()
    }

    pub(crate) fn highest<'r>(&self, user: &str, roles: &'r RoleState) -> Option<&'r Role> {
        self.roles_of(user)
            .filter_map(|name| roles.get(name))
            .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.name.cmp(&a.name)))
    }

    pub(crate) fn remove_role(&mut self, role: &str) -> usize {
        let mut removed = 0;
        for roles in self.by_user.values_mut() {
            if roles.remove(role) {
                removed += 1;
            }
        }
        self.by_user.retain(|_, roles| !roles.is_empty());
        removed
    }

    pub(crate) fn rename_role(&mut self, from: &str, to: &str) {
        for roles in self.by_user.values_mut() {
            if roles.remove(from) {
                roles.insert(to.to_string());
            }
        }
    }

    pub(crate) fn all(&self) -> Vec<RoleAssignment> {
        self.by_user
            .iter()
            .flat_map(|(user, roles)| {
                roles.iter().map(move |role| RoleAssignment {
                    user_id: user.clone(),
                    role: role.clone(),
                })
            })
            .collect()
    }
}

/// Direct user → role assignments, validated against the role registry.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use platform_authz::{AssignmentStore, Role, RoleRegistry};
///
/// let roles = Arc::new(RoleRegistry::new());
/// roles.create(Role::custom("developer", "Developer", 40)).unwrap();
///
/// let store = AssignmentStore::new(roles);
/// store.assign_role("u1", "developer").unwrap();
/// store.assign_role("u1", "developer").unwrap();
///
/// assert_eq!(store.user_roles("u1"), vec!["developer"]);
/// assert!(store.assign_role("u1", "missing").is_err());
/// ```
pub struct AssignmentStore {
    roles: Arc<RoleRegistry>,
    state: RwLock<AssignmentState>,
}

impl fmt::Debug for AssignmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignmentStore")
            .field("users", &self.state.read().by_user.len())
            .finish()
    }
}

impl AssignmentStore {
    /// Create an empty store backed by a role registry.
    pub fn new(roles: Arc<RoleRegistry>) -> Self {
        Self {
            roles,
            state: RwLock::new(AssignmentState::default()),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, AssignmentState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, AssignmentState> {
        self.state.write()
    }

    /// Give a user a role.
    ///
    /// Returns `true` if the assignment is new. Assigning a held role is a
    /// successful no-op.
    ///
    /// # Errors
    ///
    /// - `Validation` if the user id is blank
    /// - `NotFound` if the role is not registered
    pub fn assign_role(&self, user: &str, role: &str) -> AuthzResult<bool> {
        if user.trim().is_empty() {
            return Err(AuthzError::validation("user id is empty"));
        }
        let roles = self.roles.read();
        if !roles.contains(role) {
            return Err(AuthzError::not_found("role", role));
        }
        let added = self.state.write().assign(user, role);
        drop(roles);
        if added {
            tracing::debug!(user = %user, role = %role, "Assigned role");
        }
        Ok(added)
    }

    /// Take a role away from a user.
    ///
    /// Returns `true` if the user held the role. Revoking a role that is not
    /// held is a successful no-op.
    pub fn revoke_role(&self, user: &str, role: &str) -> bool {
        let removed = self.state.write().revoke(user, role);
        if removed {
            tracing::debug!(user = %user, role = %role, "Revoked role");
        }
        removed
    }

    /// Roles held directly by a user, sorted by name.
    pub fn user_roles(&self, user: &str) -> Vec<String> {
        self.state.read().roles_of(user).cloned().collect()
    }

    /// Check if a user holds a role directly.
    pub fn user_has_role(&self, user: &str, role: &str) -> bool {
        self.state.read().has(user, role)
    }

    /// The directly held role with the highest priority.
    ///
    /// Equal priorities are broken by the lexicographically smallest name.
    pub fn highest_role(&self, user: &str) -> Option<Role> {
        let roles = self.roles.read();
        let state = self.state.read();
        state.highest(user, &roles).cloned()
    }

    /// Users holding a role directly, sorted.
    pub fn users_with_role(&self, role: &str) -> Vec<String> {
        self.state.read().users_with(role)
    }

    /// Every assignment, sorted by user then role.
    pub fn assignments(&self) -> Vec<RoleAssignment> {
        self.state.read().all()
    }
}
