//! # Grant Overlay
//!
//! Permission grants layered on top of role membership:
//!
//! - **static** grants: `role → permission`, no expiry
//! - **temporary** grants: `role → permission` until an expiry timestamp
//! - **denials**: `role → permission` negatives that beat every positive grant
//! - **groups**: named bundles of static grants, granted and revoked as a unit
//!
//! Temporary grants expire lazily: a grant whose expiry has passed is simply
//! ignored by readers. [`GrantOverlay::purge_expired`] reclaims the memory
//! but is never required for a correct decision.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{validate_permission_name, CatalogState, PermissionCatalog};
use crate::condition::Condition;
use crate::error::{AuthzError, AuthzResult};
use crate::role::{RoleRegistry, RoleState};

/// A static `role → permission` grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaticGrant {
    /// Role name.
    pub role: String,
    /// Permission name.
    pub permission: String,
}

/// A time-bounded `role → permission` grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemporaryGrant {
    /// Role name.
    pub role: String,
    /// Permission name.
    pub permission: String,
    /// The grant stops applying once `now >= expires_at`.
    pub expires_at: DateTime<Utc>,
}

/// An explicit `role → permission` denial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Denial {
    /// Role name.
    pub role: String,
    /// Permission name.
    pub permission: String,
}

/// A named bundle of permissions granted to a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionGroup {
    /// Role the bundle was granted to.
    pub role: String,
    /// Bundle name.
    pub name: String,
    /// Permissions in the bundle.
    pub permissions: Vec<String>,
}

/// Lock-protected overlay contents.
#[derive(Default)]
pub(crate) struct GrantState {
    static_grants: HashMap<String, BTreeSet<String>>,
    temporary: HashMap<String, HashMap<String, DateTime<Utc>>>,
    denials: HashMap<String, BTreeSet<String>>,
    groups: HashMap<String, BTreeMap<String, Vec<String>>>,
}

impl GrantState {
    pub(crate) fn grant(&mut self, role: &str, permission: &str) -> bool {
        self.static_grants
            .entry(role.to_string())
            .or_default()
            .insert(permission.to_string())
    }

    pub(crate) fn revoke(&mut self, role: &str, permission: &str) -> bool {
        remove_from(&mut self.static_grants, role, permission)
    }

    pub(crate) fn has_static(&self, role: &str, permission: &str) -> bool {
        self.static_grants
            .get(role)
            .map(|perms| perms.contains(permission))
            .unwrap_or(false)
    }

    pub(crate) fn grant_temporary(&mut self, role: &str, permission: &str, expires_at: DateTime<Utc>) {
        self.temporary
            .entry(role.to_string())
            .or_default()
            .insert(permission.to_string(), expires_at);
    }

    pub(crate) fn revoke_temporary(&mut self, role: &str, permission: &str) -> bool {
        let Some(perms) = self.temporary.get_mut(role) else {
            return false;
        };
        let removed = perms.remove(permission).is_some();
        if perms.is_empty() {
            self.temporary.remove(role);
        }
        removed
    }

    pub(crate) fn temporary_expiry(&self, role: &str, permission: &str) -> Option<DateTime<Utc>> {
        self.temporary.get(role)?.get(permission).copied()
    }

    pub(crate) fn has_live_temporary(&self, role: &str, permission: &str, now: DateTime<Utc>) -> bool {
        self.temporary_expiry(role, permission)
            .map(|expires_at| now < expires_at)
            .unwrap_or(false)
    }

    pub(crate) fn deny(&mut self, role: &str, permission: &str) -> bool {
        self.denials
            .entry(role.to_string())
            .or_default()
            .insert(permission.to_string())
    }

    pub(crate) fn undeny(&mut self, role: &str, permission: &str) -> bool {
        remove_from(&mut self.denials, role, permission)
    }

    pub(crate) fn is_denied(&self, role: &str, permission: &str) -> bool {
        self.denials
            .get(role)
            .map(|perms| perms.contains(permission))
            .unwrap_or(false)
    }

    /// Permissions a role holds through the overlay at `now`.
    pub(crate) fn granted_to(&self, role: &str, now: DateTime<Utc>) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.static_grants.get(role).cloned().unwrap_or_default();
        if let Some(temporary) = self.temporary.get(role) {
            out.extend(
                temporary
                    .iter()
                    .filter(|(_, expires_at)| now < **expires_at)
                    .map(|(perm, _)| perm.clone()),
            );
        }
        out
    }

    pub(crate) fn record_group(&mut self, role: &str, group: &str, permissions: Vec<String>) {
        self.groups
            .entry(role.to_string())
            .or_default()
            .insert(group.to_string(), permissions);
    }

    pub(crate) fn take_group(&mut self, role: &str, group: &str) -> Option<Vec<String>> {
        let groups = self.groups.get_mut(role)?;
        let permissions = groups.remove(group);
        if groups.is_empty() {
            self.groups.remove(role);
        }
        permissions
    }

    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for perms in self.temporary.values_mut() {
            let before = perms.len();
            perms.retain(|_, expires_at| now < *expires_at);
            purged += before - perms.len();
        }
        self.temporary.retain(|_, perms| !perms.is_empty());
        purged
    }

    /// Drop every positive grant of a permission: static, temporary and
    /// group membership. Denials stay. Returns the roles that lost a grant.
    pub(crate) fn remove_permission(&mut self, permission: &str) -> BTreeSet<String> {
        let mut affected = BTreeSet::new();
        for (role, perms) in self.static_grants.iter_mut() {
            if perms.remove(permission) {
                affected.insert(role.clone());
            }
        }
        self.static_grants.retain(|_, perms| !perms.is_empty());
        for (role, perms) in self.temporary.iter_mut() {
            if perms.remove(permission).is_some() {
                affected.insert(role.clone());
            }
        }
        self.temporary.retain(|_, perms| !perms.is_empty());
        for groups in self.groups.values_mut() {
            for members in groups.values_mut() {
                members.retain(|p| p != permission);
            }
        }
        affected
    }

    pub(crate) fn remove_role(&mut self, role: &str) {
        self.static_grants.remove(role);
        self.temporary.remove(role);
        self.denials.remove(role);
        self.groups.remove(role);
    }

    pub(crate) fn rename_role(&mut self, from: &str, to: &str) {
        if let Some(v) = self.static_grants.remove(from) {
            self.static_grants.insert(to.to_string(), v);
        }
        if let Some(v) = self.temporary.remove(from) {
            self.temporary.insert(to.to_string(), v);
        }
        if let Some(v) = self.denials.remove(from) {
            self.denials.insert(to.to_string(), v);
        }
        if let Some(v) = self.groups.remove(from) {
            self.groups.insert(to.to_string(), v);
        }
    }

    pub(crate) fn static_grants(&self) -> Vec<StaticGrant> {
        let mut out: Vec<StaticGrant> = flatten(&self.static_grants)
            .map(|(role, permission)| StaticGrant { role, permission })
            .collect();
        out.sort();
        out
    }

    pub(crate) fn temporary_grants(&self) -> Vec<TemporaryGrant> {
        let mut out: Vec<TemporaryGrant> = self
            .temporary
            .iter()
            .flat_map(|(role, perms)| {
                perms.iter().map(move |(permission, expires_at)| TemporaryGrant {
                    role: role.clone(),
                    permission: permission.clone(),
                    expires_at: *expires_at,
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.role, &a.permission).cmp(&(&b.role, &b.permission)));
        out
    }

    pub(crate) fn denials(&self) -> Vec<Denial> {
        let mut out: Vec<Denial> = flatten(&self.denials)
            .map(|(role, permission)| Denial { role, permission })
            .collect();
        out.sort();
        out
    }

    pub(crate) fn groups_of(&self, role: &str) -> Vec<PermissionGroup> {
        self.groups
            .get(role)
            .into_iter()
            .flatten()
            .map(|(name, permissions)| PermissionGroup {
                role: role.to_string(),
                name: name.clone(),
                permissions: permissions.clone(),
            })
            .collect()
    }

    pub(crate) fn all_groups(&self) -> Vec<PermissionGroup> {
        let mut roles: Vec<&String> = self.groups.keys().collect();
        roles.sort();
        roles.into_iter().flat_map(|role| self.groups_of(role)).collect()
    }
}

fn remove_from(map: &mut HashMap<String, BTreeSet<String>>, role: &str, permission: &str) -> bool {
    let Some(perms) = map.get_mut(role) else {
        return false;
    };
    let removed = perms.remove(permission);
    if perms.is_empty() {
        map.remove(role);
    }
    removed
}

fn flatten(map: &HashMap<String, BTreeSet<String>>) -> impl Iterator<Item = (String, String)> + '_ {
    map.iter()
        .flat_map(|(role, perms)| perms.iter().map(move |perm| (role.clone(), perm.clone())))
}

/// Grants, temporary grants, denials and permission groups.
///
/// Positive grants require the role to exist and the permission to be in
/// the catalog. Denials only require the role to exist and the permission
/// string to be well formed, so a denial can be placed ahead of the
/// permission's registration.
pub struct GrantOverlay {
    catalog: Arc<PermissionCatalog>,
    roles: Arc<RoleRegistry>,
    state: RwLock<GrantState>,
}

impl fmt::Debug for GrantOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("GrantOverlay")
            .field("static_roles", &state.static_grants.len())
            .field("temporary_roles", &state.temporary.len())
            .field("denial_roles", &state.denials.len())
            .finish()
    }
}

impl GrantOverlay {
    /// Create an empty overlay.
    pub fn new(catalog: Arc<PermissionCatalog>, roles: Arc<RoleRegistry>) -> Self {
        Self {
            catalog,
            roles,
            state: RwLock::new(GrantState::default()),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, GrantState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, GrantState> {
        self.state.write()
    }

    /// Take the catalog and role read guards and check that `role` exists
    /// and every permission is registered.
    ///
    /// The guards are returned so the caller can hold them across its
    /// overlay write; a role deletion or permission removal cannot slip in
    /// between the check and the write.
    fn lock_grantable(
        &self,
        role: &str,
        permissions: &[&str],
    ) -> AuthzResult<(RwLockReadGuard<'_, CatalogState>, RwLockReadGuard<'_, RoleState>)> {
        let catalog = self.catalog.read();
        let roles = self.roles.read();
        if !roles.contains(role) {
            return Err(AuthzError::not_found("role", role));
        }
        for permission in permissions {
            if !catalog.contains(permission) {
                return Err(AuthzError::not_found("permission", permission));
            }
        }
        Ok((catalog, roles))
    }

    /// Grant a permission to a role. Granting twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the role or permission is unknown
    pub fn grant_static(&self, role: &str, permission: &str) -> AuthzResult<bool> {
        let guards = self.lock_grantable(role, &[permission])?;
        let added = self.state.write().grant(role, permission);
        drop(guards);
        if added {
            tracing::debug!(role = %role, permission = %permission, "Granted permission");
        }
        Ok(added)
    }

    /// Revoke a static grant. Revoking an absent grant is a no-op.
    pub fn revoke_static(&self, role: &str, permission: &str) -> bool {
        let removed = self.state.write().revoke(role, permission);
        if removed {
            tracing::debug!(role = %role, permission = %permission, "Revoked permission");
        }
        removed
    }

    /// Attach or replace a condition on a catalog permission.
    ///
    /// Registers the permission if it is not in the catalog yet.
    pub fn register_conditional(&self, permission: &str, condition: Condition) -> AuthzResult<()> {
        self.catalog.register_conditional(permission, condition)
    }

    /// Grant a permission to a role for `ttl`.
    ///
    /// Replaces any earlier temporary grant for the same pair.
    ///
    /// # Errors
    ///
    /// - `Validation` if `ttl` is zero or too large to represent
    /// - `NotFound` if the role or permission is unknown
    pub fn grant_temporary(&self, role: &str, permission: &str, ttl: Duration) -> AuthzResult<DateTime<Utc>> {
        if ttl.is_zero() {
            return Err(AuthzError::validation("temporary grant ttl must be positive"));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| AuthzError::validation("temporary grant ttl is out of range"))?;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthzError::validation("temporary grant ttl is out of range"))?;
        let guards = self.lock_grantable(role, &[permission])?;
        self.state.write().grant_temporary(role, permission, expires_at);
        drop(guards);
        tracing::debug!(
            role = %role,
            permission = %permission,
            expires_at = %expires_at,
            "Granted temporary permission"
        );
        Ok(expires_at)
    }

    /// Revoke a temporary grant before it expires. No-op if absent.
    pub fn revoke_temporary(&self, role: &str, permission: &str) -> bool {
        self.state.write().revoke_temporary(role, permission)
    }

    /// Time left on a temporary grant; zero if absent or expired.
    pub fn remaining_ttl(&self, role: &str, permission: &str) -> Duration {
        let now = Utc::now();
        self.state
            .read()
            .temporary_expiry(role, permission)
            .and_then(|expires_at| (expires_at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Explicitly deny a permission to a role.
    ///
    /// A denial overrides every positive grant for any user holding the
    /// role, directly or through inheritance.
    ///
    /// # Errors
    ///
    /// - `Validation` if the permission string is malformed
    /// - `NotFound` if the role is unknown
    pub fn deny(&self, role: &str, permission: &str) -> AuthzResult<bool> {
        validate_permission_name(permission)?;
        let roles = self.roles.read();
        if !roles.contains(role) {
            return Err(AuthzError::not_found("role", role));
        }
        let added = self.state.write().deny(role, permission);
        drop(roles);
        if added {
            tracing::debug!(role = %role, permission = %permission, "Denied permission");
        }
        Ok(added)
    }

    /// Lift a denial. No-op if absent.
    pub fn undeny(&self, role: &str, permission: &str) -> bool {
        self.state.write().undeny(role, permission)
    }

    /// Check if a role carries an explicit denial.
    pub fn is_denied(&self, role: &str, permission: &str) -> bool {
        self.state.read().is_denied(role, permission)
    }

    /// Grant a named bundle of permissions.
    ///
    /// Every permission is validated before anything is written, then all
    /// grants are applied under one lock. Each individual grant is
    /// idempotent, so calling again with the same bundle is safe.
    ///
    /// # Errors
    ///
    /// - `Validation` if the group name is empty
    /// - `NotFound` if the role or any permission is unknown
    pub fn grant_group(&self, role: &str, group: &str, permissions: &[&str]) -> AuthzResult<()> {
        if group.trim().is_empty() {
            return Err(AuthzError::validation("permission group name is empty"));
        }
        let guards = self.lock_grantable(role, permissions)?;
        let mut state = self.state.write();
        for permission in permissions {
            state.grant(role, permission);
        }
        state.record_group(role, group, permissions.iter().map(|p| p.to_string()).collect());
        drop(state);
        drop(guards);
        tracing::debug!(role = %role, group = %group, count = permissions.len(), "Granted permission group");
        Ok(())
    }

    /// Revoke every permission of a group and forget the group.
    ///
    /// Returns `false` if the role has no such group.
    pub fn revoke_group(&self, role: &str, group: &str) -> bool {
        let mut state = self.state.write();
        let Some(permissions) = state.take_group(role, group) else {
            return false;
        };
        for permission in &permissions {
            state.revoke(role, permission);
        }
        true
    }

    /// Groups granted to a role, sorted by name.
    pub fn groups(&self, role: &str) -> Vec<PermissionGroup> {
        self.state.read().groups_of(role)
    }

    /// Permissions a role holds through the overlay right now (static plus
    /// unexpired temporary grants).
    pub fn role_permissions(&self, role: &str) -> Vec<String> {
        self.state.read().granted_to(role, Utc::now()).into_iter().collect()
    }

    /// Remove temporary grants that have already expired.
    pub fn purge_expired(&self) -> usize {
        let purged = self.state.write().purge_expired(Utc::now());
        if purged > 0 {
            tracing::debug!(purged, "Purged expired temporary grants");
        }
        purged
    }

    /// Every static grant, sorted.
    pub fn static_grants(&self) -> Vec<StaticGrant> {
        self.state.read().static_grants()
    }

    /// Every temporary grant, including expired ones not yet purged.
    pub fn temporary_grants(&self) -> Vec<TemporaryGrant> {
        self.state.read().temporary_grants()
    }

    /// Every denial, sorted.
    pub fn denials(&self) -> Vec<Denial> {
        self.state.read().denials()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;

    fn overlay() -> GrantOverlay {
        let catalog = Arc::new(PermissionCatalog::new());
        catalog.register("storage.read", "Read storage", None).unwrap();
        catalog.register("storage.write", "Write storage", None).unwrap();
        let roles = Arc::new(RoleRegistry::new());
        roles.create(Role::custom("developer", "Developer", 40)).unwrap();
        GrantOverlay::new(catalog, roles)
    }

    #[test]
    fn test_grant_static_validates_and_is_idempotent() {
        let overlay = overlay();
        assert!(overlay.grant_static("developer", "storage.read").unwrap());
        assert!(!overlay.grant_static("developer", "storage.read").unwrap());
        assert_eq!(overlay.static_grants().len(), 1);

        assert!(matches!(
            overlay.grant_static("ghost", "storage.read"),
            Err(AuthzError::NotFound(_))
        ));
        assert!(matches!(
            overlay.grant_static("developer", "storage.delete"),
            Err(AuthzError::NotFound(_))
        ));
    }

    #[test]
    fn test_revoke_static() {
        let overlay = overlay();
        overlay.grant_static("developer", "storage.read").unwrap();
        assert!(overlay.revoke_static("developer", "storage.read"));
        assert!(!overlay.revoke_static("developer", "storage.read"));
        assert!(overlay.role_permissions("developer").is_empty());
    }

    #[test]
    fn test_temporary_grant_overwrites_and_reports_ttl() {
        let overlay = overlay();
        overlay
            .grant_temporary("developer", "storage.write", Duration::from_secs(60))
            .unwrap();
        let first = overlay.remaining_ttl("developer", "storage.write");
        assert!(first > Duration::from_secs(50));

        overlay
            .grant_temporary("developer", "storage.write", Duration::from_secs(3600))
            .unwrap();
        assert!(overlay.remaining_ttl("developer", "storage.write") > Duration::from_secs(3000));
        assert_eq!(overlay.temporary_grants().len(), 1);

        assert_eq!(overlay.remaining_ttl("developer", "storage.read"), Duration::ZERO);
        assert!(overlay
            .grant_temporary("developer", "storage.write", Duration::ZERO)
            .is_err());
    }

    #[test]
    fn test_expired_grants_are_ignored_then_purged() {
        let overlay = overlay();
        let past = Utc::now() - chrono::Duration::seconds(5);
        overlay.write().grant_temporary("developer", "storage.write", past);

        assert!(!overlay.read().has_live_temporary("developer", "storage.write", Utc::now()));
        assert_eq!(overlay.remaining_ttl("developer", "storage.write"), Duration::ZERO);
        assert!(overlay.role_permissions("developer").is_empty());

        assert_eq!(overlay.purge_expired(), 1);
        assert!(overlay.temporary_grants().is_empty());
    }

    #[test]
    fn test_deny_before_registration() {
        let overlay = overlay();
        assert!(overlay.deny("developer", "billing.refund").unwrap());
        assert!(overlay.is_denied("developer", "billing.refund"));
        assert!(overlay.deny("developer", "billing").is_err());

        assert!(overlay.undeny("developer", "billing.refund"));
        assert!(!overlay.is_denied("developer", "billing.refund"));
    }

    #[test]
    fn test_grant_group_is_all_or_nothing() {
        let overlay = overlay();
        let err = overlay
            .grant_group("developer", "storage", &["storage.read", "storage.purge"])
            .unwrap_err();
        assert!(matches!(err, AuthzError::NotFound(_)));
        assert!(overlay.role_permissions("developer").is_empty());
        assert!(overlay.groups("developer").is_empty());

        overlay
            .grant_group("developer", "storage", &["storage.read", "storage.write"])
            .unwrap();
        overlay
            .grant_group("developer", "storage", &["storage.read", "storage.write"])
            .unwrap();
        assert_eq!(
            overlay.role_permissions("developer"),
            vec!["storage.read", "storage.write"]
        );
        assert_eq!(overlay.groups("developer").len(), 1);

        assert!(overlay.revoke_group("developer", "storage"));
        assert!(overlay.role_permissions("developer").is_empty());
        assert!(!overlay.revoke_group("developer", "storage"));
    }
}
