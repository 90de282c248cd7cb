//! # Snapshots
//!
//! Export and import of the complete engine state as plain serializable
//! records. The engine does no I/O of its own; a persistence layer stores
//! the snapshot wherever it likes and hands it back on restart.
//!
//! Condition predicates registered with
//! [`PermissionCatalog::register_condition_fn`](crate::PermissionCatalog::register_condition_fn)
//! are code, not data. They are not part of a snapshot and survive a
//! restore untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::assignment::{AssignmentState, RoleAssignment};
use crate::audit::AuditEntry;
use crate::catalog::{CatalogState, Permission, PermissionPattern};
use crate::engine::AccessEngine;
use crate::error::{AuthzError, AuthzResult};
use crate::grants::{Denial, GrantState, PermissionGroup, StaticGrant, TemporaryGrant};
use crate::hierarchy::{GraphState, InheritanceEdge};
use crate::role::{Role, RoleState};
use crate::template::RoleTemplate;

/// Everything an engine holds, as plain records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Roles, highest priority first.
    pub roles: Vec<Role>,
    /// Static matrix: role to permission patterns.
    #[serde(default)]
    pub matrix: BTreeMap<String, Vec<String>>,
    /// Catalog entries with their conditions.
    pub permissions: Vec<Permission>,
    /// Inheritance edges.
    #[serde(default)]
    pub edges: Vec<InheritanceEdge>,
    /// User to role assignments.
    #[serde(default)]
    pub assignments: Vec<RoleAssignment>,
    /// Static grants.
    #[serde(default)]
    pub static_grants: Vec<StaticGrant>,
    /// Temporary grants, including expired ones not yet swept.
    #[serde(default)]
    pub temporary_grants: Vec<TemporaryGrant>,
    /// Denials.
    #[serde(default)]
    pub denials: Vec<Denial>,
    /// Permission groups.
    #[serde(default)]
    pub groups: Vec<PermissionGroup>,
    /// Template histories, one list of versions per template.
    #[serde(default)]
    pub templates: Vec<Vec<RoleTemplate>>,
    /// Audit entries, oldest first.
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

impl EngineSnapshot {
    /// Serialize to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Component states rebuilt from a snapshot, ready to swap in.
struct Rebuilt {
    permissions: Vec<Permission>,
    roles: RoleState,
    graph: GraphState,
    assignments: AssignmentState,
    grants: GrantState,
}

fn rebuild(snapshot: &EngineSnapshot) -> AuthzResult<Rebuilt> {
    let mut catalog = CatalogState::default();
    for permission in &snapshot.permissions {
        catalog.insert(permission.clone())?;
    }

    let mut roles = RoleState::default();
    for role in &snapshot.roles {
        roles.insert(role.clone())?;
    }
    for (role, patterns) in &snapshot.matrix {
        if !roles.contains(role) {
            return Err(AuthzError::not_found("role", role));
        }
        let patterns = patterns
            .iter()
            .map(|p| PermissionPattern::parse(p))
            .collect::<AuthzResult<Vec<_>>>()?;
        roles.set_matrix(role, patterns);
    }
    let require_role = |role: &str| {
        if roles.contains(role) {
            Ok(())
        } else {
            Err(AuthzError::not_found("role", role))
        }
    };

    let mut graph = GraphState::default();
    for edge in &snapshot.edges {
        require_role(&edge.child)?;
        require_role(&edge.parent)?;
        graph.add_edge(&edge.child, &edge.parent)?;
    }

    let mut assignments = AssignmentState::default();
    for assignment in &snapshot.assignments {
        require_role(&assignment.role)?;
        assignments.assign(&assignment.user_id, &assignment.role);
    }

    let mut grants = GrantState::default();
    for grant in &snapshot.static_grants {
        require_role(&grant.role)?;
        grants.grant(&grant.role, &grant.permission);
    }
    for grant in &snapshot.temporary_grants {
        require_role(&grant.role)?;
        grants.grant_temporary(&grant.role, &grant.permission, grant.expires_at);
    }
    for denial in &snapshot.denials {
        require_role(&denial.role)?;
        grants.deny(&denial.role, &denial.permission);
    }
    for group in &snapshot.groups {
        require_role(&group.role)?;
        grants.record_group(&group.role, &group.name, group.permissions.clone());
    }

    Ok(Rebuilt {
        permissions: snapshot.permissions.clone(),
        roles,
        graph,
        assignments,
        grants,
    })
}

impl AccessEngine {
    /// Export the complete state.
    ///
    /// Read locks are taken on every component in the global order, so the
    /// snapshot is consistent.
    pub fn snapshot(&self) -> EngineSnapshot {
        let catalog = self.catalog().read();
        let roles = self.roles().read();
        let graph = self.graph().read();
        let assignments = self.assignments().read();
        let grants = self.grants().read();
        let templates = self.templates().read();
        let audit = self.audit().read();

        EngineSnapshot {
            taken_at: Utc::now(),
            roles: roles.all(),
            matrix: roles.matrix_entries(),
            permissions: catalog.all(),
            edges: graph.edges(),
            assignments: assignments.all(),
            static_grants: grants.static_grants(),
            temporary_grants: grants.temporary_grants(),
            denials: grants.denials(),
            groups: grants.all_groups(),
            templates: templates.histories(),
            audit: audit.entries(),
        }
    }

    /// Replace the complete state with a snapshot.
    ///
    /// The snapshot is validated in full before anything changes; on error
    /// the engine is left as it was. Registered condition predicates are
    /// kept.
    ///
    /// # Errors
    ///
    /// - `Validation` if a name or pattern is malformed
    /// - `NotFound` if a record references a role the snapshot lacks
    /// - `Conflict` on duplicates or an inheritance cycle
    pub fn restore(&self, snapshot: EngineSnapshot) -> AuthzResult<()> {
        let rebuilt = rebuild(&snapshot)?;
        let capacity = self.audit().capacity();

        let mut catalog = self.catalog().write();
        let mut roles = self.roles().write();
        let mut graph = self.graph().write();
        let mut assignments = self.assignments().write();
        let mut grants = self.grants().write();
        let mut templates = self.templates().write();
        let mut audit = self.audit().write();

        catalog.replace_all(rebuilt.permissions)?;
        *roles = rebuilt.roles;
        *graph = rebuilt.graph;
        *assignments = rebuilt.assignments;
        *grants = rebuilt.grants;
        templates.replace_all(snapshot.templates);
        let dropped = audit.replace_all(snapshot.audit, capacity);

        drop(audit);
        drop(templates);
        drop(grants);
        drop(assignments);
        drop(graph);
        drop(roles);
        drop(catalog);

        tracing::info!(
            roles = snapshot.roles.len(),
            permissions = snapshot.permissions.len(),
            taken_at = %snapshot.taken_at,
            "Restored engine snapshot"
        );
        if dropped > 0 {
            tracing::warn!(dropped, capacity, "Restored audit log exceeded capacity, dropped oldest entries");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, PermissionContext};
    use crate::config::EngineConfig;
    use crate::template::TemplateDefinition;
    use std::time::Duration;

    fn populated() -> AccessEngine {
        let engine = AccessEngine::new(EngineConfig::default()).unwrap();
        engine.create_role("developer", "Developer", 40).unwrap();
        engine.add_inheritance("developer", "user").unwrap();
        engine.assign_role("u1", "developer", Some("admin-1")).unwrap();
        engine.catalog().register("code.deploy", "Deploy", None).unwrap();
        engine.grant_permission("developer", "code.deploy", None).unwrap();
        engine
            .grant_temporary("developer", "role.manage", Duration::from_secs(3600), None)
            .unwrap();
        engine.deny_permission("developer", "storage.write", None).unwrap();
        engine
            .grants()
            .grant_group("developer", "audit-pack", &["audit.read", "role.read"])
            .unwrap();
        engine
            .templates()
            .register_template("ops", TemplateDefinition::new("Ops").with_permissions(["user.*"]))
            .unwrap();
        engine
            .catalog()
            .register_condition_fn("business_hours", |ctx: &PermissionContext| {
                ctx.metadata.get("hours").map(|h| h == "open").unwrap_or(false)
            });
        engine
            .catalog()
            .register_conditional("storage.delete", Condition::custom("business_hours"))
            .unwrap();
        engine
    }

    #[test]
    fn test_snapshot_restore_into_fresh_engine() {
        let source = populated();
        let json = source.snapshot().to_json().unwrap();

        let target = AccessEngine::new(EngineConfig::empty()).unwrap();
        target
            .catalog()
            .register_condition_fn("business_hours", |ctx: &PermissionContext| {
                ctx.metadata.get("hours").map(|h| h == "open").unwrap_or(false)
            });
        target.restore(EngineSnapshot::from_json(&json).unwrap()).unwrap();

        assert!(target.has_permission("u1", "user.read", None));
        assert!(target.has_permission("u1", "code.deploy", None));
        assert!(target.has_permission("u1", "role.manage", None));
        assert!(target.has_permission("u1", "audit.read", None));
        assert!(!target.has_permission("u1", "storage.write", None));

        let open = PermissionContext::new("u1").with_metadata("hours", "open");
        assert!(target.has_permission("u1", "storage.delete", Some(&open)));
        assert!(!target.has_permission("u1", "storage.delete", None));

        assert_eq!(target.templates().get_template_version("ops").unwrap(), 1);
        assert_eq!(target.grants().groups("developer").len(), 1);
        assert!(!target.audit().is_empty());
    }

    #[test]
    fn test_snapshot_matches_after_roundtrip() {
        let source = populated();
        let snapshot = source.snapshot();

        let target = AccessEngine::new(EngineConfig::empty()).unwrap();
        target.restore(snapshot.clone()).unwrap();
        let again = target.snapshot();

        assert_eq!(again.roles, snapshot.roles);
        assert_eq!(again.matrix, snapshot.matrix);
        assert_eq!(again.edges, snapshot.edges);
        assert_eq!(again.static_grants, snapshot.static_grants);
        assert_eq!(again.temporary_grants, snapshot.temporary_grants);
        assert_eq!(again.templates, snapshot.templates);
        assert_eq!(again.audit, snapshot.audit);
    }

    #[test]
    fn test_restore_trims_audit_to_capacity() {
        let source = populated();
        let snapshot = source.snapshot();
        assert!(snapshot.audit.len() > 3);

        let mut config = EngineConfig::empty();
        config.audit.capacity = 3;
        let target = AccessEngine::new(config).unwrap();
        target.restore(snapshot.clone()).unwrap();

        let newest = snapshot.audit[snapshot.audit.len() - 3..].to_vec();
        assert_eq!(target.audit().entries(), newest);
        assert_eq!(target.audit().len(), target.audit().capacity());
    }

    #[test]
    fn test_invalid_snapshot_leaves_engine_untouched() {
        let engine = populated();
        let before = engine.snapshot();

        let mut broken = before.clone();
        broken.assignments.push(RoleAssignment {
            user_id: "u9".to_string(),
            role: "ghost".to_string(),
        });
        assert!(matches!(engine.restore(broken), Err(AuthzError::NotFound(_))));

        let mut cyclic = before.clone();
        cyclic.edges.push(InheritanceEdge {
            child: "user".to_string(),
            parent: "developer".to_string(),
        });
        assert!(matches!(engine.restore(cyclic), Err(AuthzError::Conflict(_))));

        assert!(engine.has_permission("u1", "code.deploy", None));
        assert_eq!(engine.snapshot().edges, before.edges);
    }
}
