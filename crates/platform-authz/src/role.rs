//! Role registry
//!
//! Named roles with a priority used to answer "highest role" queries, plus
//! the seed permission matrix: the role → permission patterns table supplied
//! through [`crate::EngineConfig`].
//!
//! System roles are seeded at engine construction and cannot be deleted or
//! renamed. Custom roles are created at runtime.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::catalog::PermissionPattern;
use crate::error::{AuthzError, AuthzResult};

/// Minimum role name length.
pub const ROLE_NAME_MIN_LEN: usize = 3;

/// Maximum role name length.
pub const ROLE_NAME_MAX_LEN: usize = 32;

/// Validate a role name.
///
/// Names are 3–32 characters of lowercase ASCII letters, digits, `-` and
/// `_`, starting with a letter.
///
/// # Example
///
/// ```
/// use platform_authz::role::validate_role_name;
///
/// assert!(validate_role_name("team_lead").is_ok());
/// assert!(validate_role_name("db-admin2").is_ok());
/// assert!(validate_role_name("ab").is_err());
/// assert!(validate_role_name("2fast").is_err());
/// assert!(validate_role_name("Admin").is_err());
/// ```
pub fn validate_role_name(name: &str) -> AuthzResult<()> {
    let len = name.chars().count();
    if !(ROLE_NAME_MIN_LEN..=ROLE_NAME_MAX_LEN).contains(&len) {
        return Err(AuthzError::validation(format!(
            "role name '{name}' must be {ROLE_NAME_MIN_LEN}-{ROLE_NAME_MAX_LEN} characters"
        )));
    }
    let mut chars = name.chars();
    if !chars.next().map(|c| c.is_ascii_lowercase()).unwrap_or(false) {
        return Err(AuthzError::validation(format!(
            "role name '{name}' must start with a lowercase letter"
        )));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
        return Err(AuthzError::validation(format!(
            "role name '{name}' may only contain lowercase letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// A named role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Role {
    /// Unique name.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Priority used for "highest role" queries; larger wins.
    pub priority: i32,
    /// System roles cannot be deleted or renamed.
    pub is_system: bool,
    /// When the role was created.
    pub created_at: DateTime<Utc>,
}

impl Role {
    /// Create a custom role.
    pub fn custom(name: impl Into<String>, display_name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            priority,
            is_system: false,
            created_at: Utc::now(),
        }
    }

    /// Create a system role.
    pub fn system(name: impl Into<String>, display_name: impl Into<String>, priority: i32) -> Self {
        Self {
            is_system: true,
            ..Self::custom(name, display_name, priority)
        }
    }
}

/// Lock-protected registry contents.
#[derive(Default)]
pub(crate) struct RoleState {
    roles: HashMap<String, Role>,
    matrix: HashMap<String, Vec<PermissionPattern>>,
}

impl RoleState {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    pub(crate) fn insert(&mut self, role: Role) -> AuthzResult<()> {
        validate_role_name(&role.name)?;
        if self.roles.contains_key(&role.name) {
            return Err(AuthzError::conflict(format!("role '{}' already exists", role.name)));
        }
        self.roles.insert(role.name.clone(), role);
        Ok(())
    }

    pub(crate) fn remove(&mut self, name: &str) -> AuthzResult<Role> {
        let role = self
            .roles
            .get(name)
            .ok_or_else(|| AuthzError::not_found("role", name))?;
        if role.is_system {
            return Err(AuthzError::state(format!("system role '{name}' cannot be deleted")));
        }
        self.matrix.remove(name);
        self.roles
            .remove(name)
            .ok_or_else(|| AuthzError::not_found("role", name))
    }

    pub(crate) fn rename(&mut self, from: &str, to: &str) -> AuthzResult<()> {
        validate_role_name(to)?;
        let role = self
            .roles
            .get(from)
            .ok_or_else(|| AuthzError::not_found("role", from))?;
        if role.is_system {
            return Err(AuthzError::state(format!("system role '{from}' cannot be renamed")));
        }
        if self.roles.contains_key(to) {
            return Err(AuthzError::conflict(format!("role '{to}' already exists")));
        }
        if let Some(mut role) = self.roles.remove(from) {
            role.name = to.to_string();
            self.roles.insert(to.to_string(), role);
        }
        if let Some(patterns) = self.matrix.remove(from) {
            self.matrix.insert(to.to_string(), patterns);
        }
        Ok(())
    }

    pub(crate) fn set_matrix(&mut self, role: &str, patterns: Vec<PermissionPattern>) {
        self.matrix.insert(role.to_string(), patterns);
    }

    /// Seed matrix lookup.
    pub(crate) fn matrix_allows(&self, role: &str, permission: &str) -> bool {
        self.matrix
            .get(role)
            .map(|patterns| patterns.iter().any(|p| p.matches(permission)))
            .unwrap_or(false)
    }

    pub(crate) fn matrix_entries(&self) -> BTreeMap<String, Vec<String>> {
        self.matrix
            .iter()
            .map(|(role, patterns)| (role.clone(), patterns.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.roles.values().cloned().collect();
        roles.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        roles
    }
}

/// Registry of system and custom roles.
///
/// # Example
///
/// ```
/// use platform_authz::{Role, RoleRegistry};
///
/// let roles = RoleRegistry::new();
/// roles.create(Role::custom("developer", "Developer", 40)).unwrap();
///
/// assert!(roles.exists("developer"));
/// assert_eq!(roles.get("developer").unwrap().priority, 40);
/// ```
#[derive(Default)]
pub struct RoleRegistry {
    state: RwLock<RoleState>,
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("roles", &self.state.read().roles.len())
            .finish()
    }
}

impl RoleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, RoleState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, RoleState> {
        self.state.write()
    }

    /// Register a role.
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed name
    /// - `Conflict` if the name is taken
    pub fn create(&self, role: Role) -> AuthzResult<()> {
        let name = role.name.clone();
        self.state.write().insert(role)?;
        tracing::info!(role = %name, "Created role");
        Ok(())
    }

    /// Get a role.
    pub fn get(&self, name: &str) -> AuthzResult<Role> {
        self.state
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("role", name))
    }

    /// Check if a role exists.
    pub fn exists(&self, name: &str) -> bool {
        self.state.read().contains(name)
    }

    /// List all roles, highest priority first.
    pub fn list(&self) -> Vec<Role> {
        self.state.read().all()
    }

    /// Change a role's priority.
    pub fn set_priority(&self, name: &str, priority: i32) -> AuthzResult<()> {
        let mut state = self.state.write();
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| AuthzError::not_found("role", name))?;
        role.priority = priority;
        Ok(())
    }

    /// Change a role's display name.
    pub fn set_display_name(&self, name: &str, display_name: &str) -> AuthzResult<()> {
        let mut state = self.state.write();
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| AuthzError::not_found("role", name))?;
        role.display_name = display_name.to_string();
        Ok(())
    }

    /// Seed matrix patterns for a role, as strings.
    pub fn matrix_for(&self, name: &str) -> Vec<String> {
        self.state
            .read()
            .matrix
            .get(name)
            .map(|patterns| patterns.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_name_rules() {
        assert!(validate_role_name("admin").is_ok());
        assert!(validate_role_name("a12").is_ok());
        assert!(validate_role_name(&"a".repeat(32)).is_ok());
        assert!(validate_role_name(&"a".repeat(33)).is_err());
        assert!(validate_role_name("_admin").is_err());
        assert!(validate_role_name("ad min").is_err());
        assert!(validate_role_name("adm.in").is_err());
    }

    #[test]
    fn test_create_conflict() {
        let roles = RoleRegistry::new();
        roles.create(Role::custom("developer", "Developer", 40)).unwrap();
        assert!(matches!(
            roles.create(Role::custom("developer", "Dev", 1)),
            Err(AuthzError::Conflict(_))
        ));
    }

    #[test]
    fn test_system_roles_are_protected() {
        let roles = RoleRegistry::new();
        roles.create(Role::system("admin", "Administrator", 100)).unwrap();

        let mut state = roles.write();
        assert!(matches!(state.remove("admin"), Err(AuthzError::State(_))));
        assert!(matches!(state.rename("admin", "root"), Err(AuthzError::State(_))));
        assert!(state.contains("admin"));
    }

    #[test]
    fn test_rename_moves_matrix() {
        let roles = RoleRegistry::new();
        roles.create(Role::custom("support", "Support", 30)).unwrap();
        {
            let mut state = roles.write();
            state.set_matrix("support", vec![PermissionPattern::parse("ticket.*").unwrap()]);
            state.rename("support", "helpdesk").unwrap();
        }

        assert!(!roles.exists("support"));
        assert_eq!(roles.matrix_for("helpdesk"), vec!["ticket.*"]);
        assert!(roles.read().matrix_allows("helpdesk", "ticket.close"));
    }

    #[test]
    fn test_list_orders_by_priority() {
        let roles = RoleRegistry::new();
        roles.create(Role::system("guest", "Guest", 10)).unwrap();
        roles.create(Role::system("admin", "Administrator", 100)).unwrap();
        roles.create(Role::custom("developer", "Developer", 40)).unwrap();

        let names: Vec<String> = roles.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["admin", "developer", "guest"]);
    }
}
