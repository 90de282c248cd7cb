//! # Access Engine
//!
//! Composition root. The engine owns one instance of every component,
//! seeds them from an [`EngineConfig`] and wires them together explicitly:
//! each component holds `Arc`s to the components it validates against and
//! nothing else.
//!
//! Operations that span components (template instantiation, role deletion
//! and rename, snapshot restore) take write locks in the global order:
//!
//! ```text
//! catalog -> roles -> graph -> assignments -> grants -> templates -> audit
//! ```
//!
//! Mutations made through the engine are recorded in the audit log when
//! auditing is enabled. Recording happens after every other lock has been
//! released and never changes the outcome of the mutation.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::assignment::AssignmentStore;
use crate::audit::AuditLog;
use crate::catalog::{Permission, PermissionCatalog, PermissionPattern};
use crate::condition::PermissionContext;
use crate::config::EngineConfig;
use crate::error::{AuthzError, AuthzResult};
use crate::grants::GrantOverlay;
use crate::hierarchy::InheritanceGraph;
use crate::resolver::Resolver;
use crate::role::{Role, RoleRegistry};
use crate::template::{BulkAssignResult, RoleWithPermissions, TemplateStore};

/// Subject recorded for role-level changes with no acting user.
const SYSTEM_ACTOR: &str = "system";

/// The access-control engine.
///
/// # Example
///
/// ```
/// use platform_authz::{AccessEngine, EngineConfig};
///
/// let engine = AccessEngine::new(EngineConfig::default()).unwrap();
/// engine.assign_role("u1", "viewer", Some("admin-1")).unwrap();
///
/// assert!(engine.has_permission("u1", "storage.read", None));
/// assert!(!engine.has_permission("u1", "storage.write", None));
/// ```
pub struct AccessEngine {
    config: EngineConfig,
    catalog: Arc<PermissionCatalog>,
    roles: Arc<RoleRegistry>,
    graph: Arc<InheritanceGraph>,
    assignments: Arc<AssignmentStore>,
    grants: Arc<GrantOverlay>,
    templates: Arc<TemplateStore>,
    audit: Arc<AuditLog>,
    resolver: Resolver,
}

impl fmt::Debug for AccessEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessEngine")
            .field("catalog", &self.catalog)
            .field("roles", &self.roles)
            .field("assignments", &self.assignments)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

impl AccessEngine {
    /// Build an engine and seed it from configuration.
    ///
    /// # Errors
    ///
    /// - `Validation` if the configuration is malformed
    pub fn new(config: EngineConfig) -> AuthzResult<Self> {
        config.validate()?;

        let catalog = Arc::new(PermissionCatalog::new());
        {
            let mut state = catalog.write();
            for seed in &config.permissions {
                let mut permission = Permission::new(
                    seed.name.as_str(),
                    seed.display_name.as_deref().unwrap_or(&seed.name),
                    seed.category.as_deref(),
                );
                permission.condition = seed.condition.clone();
                state.insert(permission)?;
            }
        }

        let roles = Arc::new(RoleRegistry::new());
        {
            let mut state = roles.write();
            for seed in &config.roles {
                let role = if seed.system {
                    Role::system(seed.name.as_str(), seed.display_name.as_str(), seed.priority)
                } else {
                    Role::custom(seed.name.as_str(), seed.display_name.as_str(), seed.priority)
                };
                state.insert(role)?;
            }
            for (role, patterns) in &config.matrix {
                let patterns = patterns
                    .iter()
                    .map(|p| PermissionPattern::parse(p))
                    .collect::<AuthzResult<Vec<_>>>()?;
                state.set_matrix(role, patterns);
            }
        }

        let graph = Arc::new(InheritanceGraph::new());
        let assignments = Arc::new(AssignmentStore::new(Arc::clone(&roles)));
        let grants = Arc::new(GrantOverlay::new(Arc::clone(&catalog), Arc::clone(&roles)));
        let resolver = Resolver::new(
            Arc::clone(&catalog),
            Arc::clone(&roles),
            Arc::clone(&graph),
            Arc::clone(&assignments),
            Arc::clone(&grants),
        );

        tracing::info!(
            roles = config.roles.len(),
            permissions = config.permissions.len(),
            audit_enabled = config.audit.enabled,
            "Access engine initialized"
        );

        Ok(Self {
            audit: Arc::new(AuditLog::with_capacity(config.audit.capacity)),
            templates: Arc::new(TemplateStore::new()),
            config,
            catalog,
            roles,
            graph,
            assignments,
            grants,
            resolver,
        })
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Permission catalog.
    pub fn catalog(&self) -> &Arc<PermissionCatalog> {
        &self.catalog
    }

    /// Role registry.
    pub fn roles(&self) -> &Arc<RoleRegistry> {
        &self.roles
    }

    /// Inheritance graph.
    pub fn graph(&self) -> &Arc<InheritanceGraph> {
        &self.graph
    }

    /// Assignment store. Mutations made here directly are not audited.
    pub fn assignments(&self) -> &Arc<AssignmentStore> {
        &self.assignments
    }

    /// Grant overlay. Mutations made here directly are not audited.
    pub fn grants(&self) -> &Arc<GrantOverlay> {
        &self.grants
    }

    /// Template store.
    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    /// Audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Resolver over this engine's components.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    fn audit_changes(&self) -> bool {
        self.config.audit.enabled
    }

    // ------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------

    /// Decide whether a user holds a permission, recording the check when
    /// `audit.log_checks` is enabled.
    ///
    /// Recording appends under the audit log's write lock, so audited checks
    /// serialize on that short append. Callers that need checks which only
    /// ever take read locks use [`AccessEngine::resolver`] directly, or turn
    /// `log_checks` off.
    pub fn has_permission(&self, user: &str, permission: &str, context: Option<&PermissionContext>) -> bool {
        let allowed = self.resolver.has_permission(user, permission, context);
        if self.config.audit.enabled && self.config.audit.log_checks {
            self.audit.log_check(user, permission, allowed, context);
        }
        allowed
    }

    // ------------------------------------------------------------------
    // Audited mutations
    // ------------------------------------------------------------------

    /// Assign a role to a user. Idempotent; only a new assignment is
    /// recorded.
    pub fn assign_role(&self, user: &str, role: &str, performed_by: Option<&str>) -> AuthzResult<bool> {
        let added = self.assignments.assign_role(user, role)?;
        if added && self.audit_changes() {
            self.audit.log_role_change(user, performed_by, role, true);
        }
        Ok(added)
    }

    /// Revoke a role from a user. Idempotent; only an actual removal is
    /// recorded.
    pub fn revoke_role(&self, user: &str, role: &str, performed_by: Option<&str>) -> bool {
        let removed = self.assignments.revoke_role(user, role);
        if removed && self.audit_changes() {
            self.audit.log_role_change(user, performed_by, role, false);
        }
        removed
    }

    /// Grant a permission to a role.
    pub fn grant_permission(&self, role: &str, permission: &str, performed_by: Option<&str>) -> AuthzResult<bool> {
        let added = self.grants.grant_static(role, permission)?;
        if added {
            self.record_grant(role, permission, performed_by, true);
        }
        Ok(added)
    }

    /// Revoke a static grant from a role.
    pub fn revoke_permission(&self, role: &str, permission: &str, performed_by: Option<&str>) -> bool {
        let removed = self.grants.revoke_static(role, permission);
        if removed {
            self.record_grant(role, permission, performed_by, false);
        }
        removed
    }

    /// Grant a permission to a role for `ttl`. Returns the expiry.
    pub fn grant_temporary(
        &self,
        role: &str,
        permission: &str,
        ttl: Duration,
        performed_by: Option<&str>,
    ) -> AuthzResult<DateTime<Utc>> {
        let expires_at = self.grants.grant_temporary(role, permission, ttl)?;
        self.record_grant(role, permission, performed_by, true);
        Ok(expires_at)
    }

    /// Deny a permission to a role. Recorded as a revocation.
    pub fn deny_permission(&self, role: &str, permission: &str, performed_by: Option<&str>) -> AuthzResult<bool> {
        let added = self.grants.deny(role, permission)?;
        if added {
            self.record_grant(role, permission, performed_by, false);
        }
        Ok(added)
    }

    /// Lift a denial. Recorded as a grant.
    pub fn undeny_permission(&self, role: &str, permission: &str, performed_by: Option<&str>) -> bool {
        let removed = self.grants.undeny(role, permission);
        if removed {
            self.record_grant(role, permission, performed_by, true);
        }
        removed
    }

    fn record_grant(&self, role: &str, permission: &str, performed_by: Option<&str>, granted: bool) {
        if self.audit_changes() {
            let subject = performed_by.unwrap_or(SYSTEM_ACTOR);
            self.audit
                .log_grant_change(subject, performed_by, Some(role), permission, granted);
        }
    }

    // ------------------------------------------------------------------
    // Role lifecycle
    // ------------------------------------------------------------------

    /// Create a custom role.
    pub fn create_role(&self, name: &str, display_name: &str, priority: i32) -> AuthzResult<Role> {
        let role = Role::custom(name, display_name, priority);
        self.roles.create(role.clone())?;
        Ok(role)
    }

    /// Delete a custom role and everything that references it: inheritance
    /// edges, user assignments, grants, denials and groups.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the role does not exist
    /// - `State` if the role is a system role
    pub fn delete_role(&self, name: &str) -> AuthzResult<Role> {
        let mut roles = self.roles.write();
        let mut graph = self.graph.write();
        let mut assignments = self.assignments.write();
        let mut grants = self.grants.write();

        let role = roles.remove(name)?;
        let edges = graph.remove_role(name);
        let users = assignments.users_with(name);
        assignments.remove_role(name);
        grants.remove_role(name);

        drop(grants);
        drop(assignments);
        drop(graph);
        drop(roles);

        tracing::info!(role = %name, edges, users = users.len(), "Deleted role");
        if self.audit_changes() {
            for user in &users {
                self.audit.log_role_change(user, None, name, false);
            }
        }
        Ok(role)
    }

    /// Rename a custom role everywhere it is referenced.
    ///
    /// # Errors
    ///
    /// - `Validation` if the new name is malformed
    /// - `NotFound` if the role does not exist
    /// - `State` if the role is a system role
    /// - `Conflict` if the new name is taken
    pub fn rename_role(&self, from: &str, to: &str) -> AuthzResult<()> {
        let mut roles = self.roles.write();
        let mut graph = self.graph.write();
        let mut assignments = self.assignments.write();
        let mut grants = self.grants.write();

        roles.rename(from, to)?;
        graph.rename_role(from, to);
        assignments.rename_role(from, to);
        grants.rename_role(from, to);

        drop(grants);
        drop(assignments);
        drop(graph);
        drop(roles);

        tracing::info!(from = %from, to = %to, "Renamed role");
        Ok(())
    }

    /// Make `child` inherit from `parent`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if either role does not exist
    /// - `Conflict` if the edge would close a cycle
    pub fn add_inheritance(&self, child: &str, parent: &str) -> AuthzResult<()> {
        let roles = self.roles.read();
        let mut graph = self.graph.write();
        for role in [child, parent] {
            if !roles.contains(role) {
                return Err(AuthzError::not_found("role", role));
            }
        }
        if graph.add_edge(child, parent)? {
            tracing::info!(child = %child, parent = %parent, "Added inheritance");
        }
        Ok(())
    }

    /// Remove an inheritance edge. No-op if absent.
    pub fn remove_inheritance(&self, child: &str, parent: &str) {
        self.graph.remove_edge(child, parent);
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    /// Remove a permission from the catalog together with every static,
    /// temporary and grouped grant of it, so registering the name again
    /// starts from nothing. Denials are kept.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the permission is not registered
    pub fn unregister_permission(&self, name: &str, performed_by: Option<&str>) -> AuthzResult<Permission> {
        let mut catalog = self.catalog.write();
        let mut grants = self.grants.write();

        let removed = catalog.remove(name)?;
        let affected = grants.remove_permission(name);

        drop(grants);
        drop(catalog);

        tracing::info!(permission = %name, roles = affected.len(), "Unregistered permission");
        for role in &affected {
            self.record_grant(role, name, performed_by, false);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Instantiate the current version of a template as a role.
    ///
    /// The role is created if it does not exist yet. Parent edges are
    /// wired and permissions granted, with wildcard entries expanded
    /// against the permissions registered right now. The whole call fails
    /// without changing anything if a parent or listed permission is
    /// unknown, or if an edge would close a cycle.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the template, a parent role or a permission is unknown
    /// - `Conflict` if wiring the parents would create a cycle
    pub fn create_role_from_template(&self, name: &str) -> AuthzResult<RoleWithPermissions> {
        let template = self.templates.get_template(name)?;

        let catalog = self.catalog.read();
        let mut roles = self.roles.write();
        let mut graph = self.graph.write();
        let mut grants = self.grants.write();

        for parent in &template.inherits_from {
            if !roles.contains(parent) {
                return Err(AuthzError::not_found("role", parent));
            }
        }

        let mut permissions = BTreeSet::new();
        for entry in &template.permissions {
            let pattern = PermissionPattern::parse(entry)?;
            if !pattern.is_wildcard() && !catalog.contains(entry) {
                return Err(AuthzError::not_found("permission", entry));
            }
            permissions.extend(catalog.expand(&pattern));
        }

        let mut added_edges = Vec::new();
        for parent in &template.inherits_from {
            match graph.add_edge(name, parent) {
                Ok(true) => added_edges.push(parent.as_str()),
                Ok(false) => {}
                Err(err) => {
                    for parent in added_edges {
                        graph.remove_edge(name, parent);
                    }
                    return Err(err);
                }
            }
        }

        let created = !roles.contains(name);
        if created {
            let role = Role::custom(name, template.display_name.as_str(), template.priority);
            if let Err(err) = roles.insert(role) {
                for parent in added_edges {
                    graph.remove_edge(name, parent);
                }
                return Err(err);
            }
        }
        let role = roles
            .get(name)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("role", name))?;

        let newly_granted: Vec<String> = permissions
            .iter()
            .filter(|permission| grants.grant(name, permission))
            .cloned()
            .collect();

        drop(grants);
        drop(graph);
        drop(roles);
        drop(catalog);

        tracing::info!(
            template = %name,
            version = template.version,
            created,
            permissions = permissions.len(),
            "Instantiated role from template"
        );
        for permission in &newly_granted {
            self.record_grant(name, permission, None, true);
        }

        Ok(RoleWithPermissions {
            role,
            permissions: permissions.into_iter().collect(),
            inherits_from: template.inherits_from,
            template_version: template.version,
        })
    }

    /// Instantiate a template once, then assign the role to each user
    /// independently.
    ///
    /// One user's failure does not affect the others. If instantiation
    /// fails, every result carries that error and no assignment changes.
    pub fn bulk_apply_template(
        &self,
        name: &str,
        users: &[&str],
        performed_by: Option<&str>,
    ) -> Vec<BulkAssignResult> {
        let instantiated = match self.create_role_from_template(name) {
            Ok(instantiated) => instantiated,
            Err(err) => {
                tracing::warn!(template = %name, error = %err, "Bulk template apply failed");
                let error = err.to_string();
                return users
                    .iter()
                    .map(|user| BulkAssignResult {
                        user_id: user.to_string(),
                        success: false,
                        error: Some(error.clone()),
                    })
                    .collect();
            }
        };

        let results: Vec<BulkAssignResult> = users
            .iter()
            .map(|user| match self.assign_role(user, &instantiated.role.name, performed_by) {
                Ok(_) => BulkAssignResult {
                    user_id: user.to_string(),
                    success: true,
                    error: None,
                },
                Err(err) => BulkAssignResult {
                    user_id: user.to_string(),
                    success: false,
                    error: Some(err.to_string()),
                },
            })
            .collect();

        tracing::info!(
            template = %name,
            users = users.len(),
            succeeded = results.iter().filter(|r| r.success).count(),
            "Applied template to users"
        );
        results
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Remove temporary grants that have already expired. Never needed for
    /// correct decisions.
    pub fn sweep_expired(&self) -> usize {
        self.grants.purge_expired()
    }

    /// Remove audit entries older than the configured retention.
    pub fn prune_audit(&self) -> usize {
        self.audit.prune(self.config.audit.retention())
    }
}
