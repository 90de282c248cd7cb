//! # Resolver
//!
//! The single decision function. For a user and a permission:
//!
//! 1. An unregistered permission is denied (fail-closed).
//! 2. The user's roles are their direct roles plus everything those roles
//!    inherit.
//! 3. A denial on any of those roles denies.
//! 4. Otherwise the permission is allowed if any role gets it from the seed
//!    matrix, a static grant or an unexpired temporary grant.
//! 5. Failing that, a conditional permission is allowed when its condition
//!    holds for the supplied context and the user holds at least one role.
//!    A missing context never satisfies a condition.
//!
//! Resolution only takes read locks, in the global order (catalog, roles,
//! graph, assignments, overlay), and never writes. Expired temporary grants
//! are observed as absent, not removed.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::assignment::{AssignmentState, AssignmentStore};
use crate::catalog::{CatalogState, PermissionCatalog};
use crate::condition::PermissionContext;
use crate::grants::{GrantOverlay, GrantState};
use crate::hierarchy::{GraphState, InheritanceGraph};
use crate::role::{RoleRegistry, RoleState};

/// Read-only view over every component a decision needs.
pub(crate) struct DecisionView<'a> {
    pub(crate) catalog: &'a CatalogState,
    pub(crate) roles: &'a RoleState,
    pub(crate) graph: &'a GraphState,
    pub(crate) assignments: &'a AssignmentState,
    pub(crate) grants: &'a GrantState,
    pub(crate) now: DateTime<Utc>,
}

impl DecisionView<'_> {
    /// Direct roles plus their transitive parents.
    pub(crate) fn effective_roles(&self, user: &str) -> BTreeSet<String> {
        let mut roles = BTreeSet::new();
        for role in self.assignments.roles_of(user) {
            roles.insert(role.clone());
            roles.extend(self.graph.ancestors(role));
        }
        roles
    }

    pub(crate) fn decide(
        &self,
        roles: &BTreeSet<String>,
        permission: &str,
        context: Option<&PermissionContext>,
    ) -> bool {
        if !self.catalog.contains(permission) {
            return false;
        }
        if roles.iter().any(|role| self.grants.is_denied(role, permission)) {
            return false;
        }
        let granted = roles.iter().any(|role| {
            self.roles.matrix_allows(role, permission)
                || self.grants.has_static(role, permission)
                || self.grants.has_live_temporary(role, permission, self.now)
        });
        if granted {
            return true;
        }
        // A satisfied condition is a grant of its own, for any user holding a role
        !roles.is_empty() && self.catalog.condition_grants(permission, context)
    }

    /// Candidate permissions for a role set: everything the matrix, the
    /// overlay or a condition could grant, before denials.
    fn candidates(&self, roles: &BTreeSet<String>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for permission in self.catalog.all() {
            let conditional = !roles.is_empty() && permission.is_conditional();
            if conditional || roles.iter().any(|role| self.roles.matrix_allows(role, &permission.name)) {
                out.insert(permission.name);
            }
        }
        for role in roles {
            out.extend(self.grants.granted_to(role, self.now));
        }
        out
    }
}

/// Answers "can user U do permission P in context C?".
///
/// The resolver holds the components it reads and nothing else; it never
/// mutates them. See [`crate::AccessEngine::has_permission`] for the audited
/// variant.
#[derive(Clone)]
pub struct Resolver {
    catalog: Arc<PermissionCatalog>,
    roles: Arc<RoleRegistry>,
    graph: Arc<InheritanceGraph>,
    assignments: Arc<AssignmentStore>,
    grants: Arc<GrantOverlay>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl Resolver {
    /// Create a resolver over a set of components.
    pub fn new(
        catalog: Arc<PermissionCatalog>,
        roles: Arc<RoleRegistry>,
        graph: Arc<InheritanceGraph>,
        assignments: Arc<AssignmentStore>,
        grants: Arc<GrantOverlay>,
    ) -> Self {
        Self {
            catalog,
            roles,
            graph,
            assignments,
            grants,
        }
    }

    /// Run `f` with read locks held on every component, taken in order.
    fn with_view<T>(&self, f: impl FnOnce(&DecisionView<'_>) -> T) -> T {
        let catalog = self.catalog.read();
        let roles = self.roles.read();
        let graph = self.graph.read();
        let assignments = self.assignments.read();
        let grants = self.grants.read();
        let view = DecisionView {
            catalog: &catalog,
            roles: &roles,
            graph: &graph,
            assignments: &assignments,
            grants: &grants,
            now: Utc::now(),
        };
        f(&view)
    }

    /// Decide whether a user holds a permission.
    ///
    /// A condition without a context never grants; any matrix or overlay
    /// grant still does.
    pub fn has_permission(&self, user: &str, permission: &str, context: Option<&PermissionContext>) -> bool {
        let allowed = self.with_view(|view| {
            let roles = view.effective_roles(user);
            view.decide(&roles, permission, context)
        });
        tracing::debug!(user = %user, permission = %permission, allowed, "Resolved permission");
        allowed
    }

    /// Check if the user holds at least one of the permissions.
    pub fn has_any_permission(
        &self,
        user: &str,
        permissions: &[&str],
        context: Option<&PermissionContext>,
    ) -> bool {
        self.with_view(|view| {
            let roles = view.effective_roles(user);
            permissions.iter().any(|p| view.decide(&roles, p, context))
        })
    }

    /// Check if the user holds every one of the permissions.
    ///
    /// An empty list is vacuously held.
    pub fn has_all_permissions(
        &self,
        user: &str,
        permissions: &[&str],
        context: Option<&PermissionContext>,
    ) -> bool {
        self.with_view(|view| {
            let roles = view.effective_roles(user);
            permissions.iter().all(|p| view.decide(&roles, p, context))
        })
    }

    /// Decide whether a role (with everything it inherits) holds a
    /// permission, independent of any user.
    pub fn role_has_permission(&self, role: &str, permission: &str, context: Option<&PermissionContext>) -> bool {
        self.with_view(|view| {
            if !view.roles.contains(role) {
                return false;
            }
            let mut roles = view.graph.ancestors(role);
            roles.insert(role.to_string());
            view.decide(&roles, permission, context)
        })
    }

    /// Direct roles plus everything they inherit, sorted.
    pub fn effective_roles(&self, user: &str) -> Vec<String> {
        self.with_view(|view| view.effective_roles(user).into_iter().collect())
    }

    /// Every registered permission that resolves to `true` for the user.
    ///
    /// Conditional permissions are included only if their condition holds
    /// for `context`.
    pub fn effective_permissions(&self, user: &str, context: Option<&PermissionContext>) -> Vec<String> {
        self.with_view(|view| {
            let roles = view.effective_roles(user);
            view.candidates(&roles)
                .into_iter()
                .filter(|p| view.decide(&roles, p, context))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::role::Role;
    use crate::catalog::PermissionPattern;
    use std::time::Duration;

    struct Fixture {
        catalog: Arc<PermissionCatalog>,
        roles: Arc<RoleRegistry>,
        graph: Arc<InheritanceGraph>,
        assignments: Arc<AssignmentStore>,
        grants: Arc<GrantOverlay>,
        resolver: Resolver,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(PermissionCatalog::new());
        for name in ["user.read", "user.write", "storage.read", "storage.write"] {
            catalog.register(name, name, None).unwrap();
        }
        let roles = Arc::new(RoleRegistry::new());
        roles.create(Role::system("user", "User", 50)).unwrap();
        roles.create(Role::custom("team_lead", "Team Lead", 60)).unwrap();
        roles.create(Role::custom("architect", "Architect", 70)).unwrap();
        roles
            .write()
            .set_matrix("user", vec![PermissionPattern::parse("user.read").unwrap()]);

        let graph = Arc::new(InheritanceGraph::new());
        let assignments = Arc::new(AssignmentStore::new(roles.clone()));
        let grants = Arc::new(GrantOverlay::new(catalog.clone(), roles.clone()));
        let resolver = Resolver::new(
            catalog.clone(),
            roles.clone(),
            graph.clone(),
            assignments.clone(),
            grants.clone(),
        );
        Fixture {
            catalog,
            roles,
            graph,
            assignments,
            grants,
            resolver,
        }
    }

    #[test]
    fn test_inherited_matrix_permission() {
        let f = fixture();
        f.graph.add_edge("architect", "team_lead").unwrap();
        f.graph.add_edge("team_lead", "user").unwrap();
        f.assignments.assign_role("u1", "architect").unwrap();

        assert!(f.resolver.has_permission("u1", "user.read", None));
        assert!(!f.resolver.has_permission("u1", "user.write", None));
        assert_eq!(
            f.resolver.effective_roles("u1"),
            vec!["architect", "team_lead", "user"]
        );
    }

    #[test]
    fn test_user_without_roles_is_denied() {
        let f = fixture();
        assert!(!f.resolver.has_permission("nobody", "user.read", None));
        assert!(f.resolver.effective_permissions("nobody", None).is_empty());
    }

    #[test]
    fn test_denial_on_inherited_role_wins() {
        let f = fixture();
        f.graph.add_edge("architect", "user").unwrap();
        f.assignments.assign_role("u1", "architect").unwrap();
        f.grants.grant_static("architect", "storage.read").unwrap();
        f.grants.deny("user", "storage.read").unwrap();

        assert!(!f.resolver.has_permission("u1", "storage.read", None));
        assert!(f.resolver.has_permission("u1", "user.read", None));
    }

    #[test]
    fn test_denial_from_other_direct_role_wins() {
        let f = fixture();
        f.assignments.assign_role("u1", "architect").unwrap();
        f.assignments.assign_role("u1", "team_lead").unwrap();
        f.grants.grant_static("architect", "storage.write").unwrap();
        assert!(f.resolver.has_permission("u1", "storage.write", None));

        f.grants.deny("team_lead", "storage.write").unwrap();
        assert!(!f.resolver.has_permission("u1", "storage.write", None));
    }

    #[test]
    fn test_unregistered_permission_fails_closed() {
        let f = fixture();
        f.assignments.assign_role("u1", "team_lead").unwrap();
        f.grants.grant_static("team_lead", "storage.write").unwrap();
        assert!(f.resolver.has_permission("u1", "storage.write", None));

        f.catalog.unregister("storage.write").unwrap();
        assert!(!f.resolver.has_permission("u1", "storage.write", None));
    }

    #[test]
    fn test_satisfied_condition_grants_on_its_own() {
        let f = fixture();
        f.assignments.assign_role("u1", "team_lead").unwrap();
        f.grants
            .register_conditional("storage.write", Condition::attribute_at_least("tier", 2))
            .unwrap();

        let gold = PermissionContext::new("u1").with_attribute("tier", 3);
        let free = PermissionContext::new("u1").with_attribute("tier", 1);
        assert!(f.resolver.has_permission("u1", "storage.write", Some(&gold)));
        assert!(!f.resolver.has_permission("u1", "storage.write", Some(&free)));
        assert!(!f.resolver.has_permission("u1", "storage.write", None));

        // no roles, no grants of any kind
        let stranger = PermissionContext::new("nobody").with_attribute("tier", 3);
        assert!(!f.resolver.has_permission("nobody", "storage.write", Some(&stranger)));

        f.grants.deny("team_lead", "storage.write").unwrap();
        assert!(!f.resolver.has_permission("u1", "storage.write", Some(&gold)));
    }

    #[test]
    fn test_condition_never_removes_existing_grants() {
        let f = fixture();
        f.assignments.assign_role("u1", "user").unwrap();
        f.grants.grant_static("user", "storage.write").unwrap();
        assert!(f.resolver.has_permission("u1", "user.read", None));
        assert!(f.resolver.has_permission("u1", "storage.write", None));

        let never = Condition::attribute_at_least("tier", 99);
        f.grants.register_conditional("user.read", never.clone()).unwrap();
        f.grants.register_conditional("storage.write", never).unwrap();

        let ctx = PermissionContext::new("u1").with_attribute("tier", 0);
        assert!(f.resolver.has_permission("u1", "user.read", None));
        assert!(f.resolver.has_permission("u1", "user.read", Some(&ctx)));
        assert!(f.resolver.has_permission("u1", "storage.write", Some(&ctx)));
    }

    #[test]
    fn test_temporary_grant_counts_until_expiry() {
        let f = fixture();
        f.assignments.assign_role("u1", "team_lead").unwrap();
        f.grants
            .grant_temporary("team_lead", "storage.read", Duration::from_secs(60))
            .unwrap();
        assert!(f.resolver.has_permission("u1", "storage.read", None));

        let past = Utc::now() - chrono::Duration::seconds(1);
        f.grants.write().grant_temporary("team_lead", "storage.read", past);
        assert!(!f.resolver.has_permission("u1", "storage.read", None));
        // observed, not evicted
        assert_eq!(f.grants.temporary_grants().len(), 1);
    }

    #[test]
    fn test_any_all_and_role_checks() {
        let f = fixture();
        f.assignments.assign_role("u1", "user").unwrap();

        assert!(f.resolver.has_any_permission("u1", &["user.write", "user.read"], None));
        assert!(!f.resolver.has_all_permissions("u1", &["user.write", "user.read"], None));
        assert!(f.resolver.has_all_permissions("u1", &[], None));
        assert!(f.resolver.role_has_permission("user", "user.read", None));
        assert!(!f.resolver.role_has_permission("ghost", "user.read", None));
    }

    #[test]
    fn test_effective_permissions() {
        let f = fixture();
        f.graph.add_edge("team_lead", "user").unwrap();
        f.assignments.assign_role("u1", "team_lead").unwrap();
        f.grants.grant_static("team_lead", "storage.read").unwrap();
        f.grants.grant_static("team_lead", "storage.write").unwrap();
        f.grants.deny("team_lead", "storage.write").unwrap();

        assert_eq!(
            f.resolver.effective_permissions("u1", None),
            vec!["storage.read", "user.read"]
        );

        f.grants
            .register_conditional("user.write", Condition::AlwaysTrue)
            .unwrap();
        let ctx = PermissionContext::new("u1");
        assert_eq!(
            f.resolver.effective_permissions("u1", Some(&ctx)),
            vec!["storage.read", "user.read", "user.write"]
        );
        assert!(!f.resolver.effective_permissions("u1", None).contains(&"user.write".to_string()));
        assert!(f.roles.exists("team_lead"));
    }
}
