//! # Role Templates
//!
//! Named, versioned bundles of permissions and inheritance declarations.
//! A template is instantiated as a role with
//! [`crate::AccessEngine::create_role_from_template`].
//!
//! ## Versioning
//!
//! History is append-only. Registering a template creates version 1; every
//! update appends a new version; reverting to version `n` appends a new
//! version whose content equals version `n`. The current template is always
//! the highest version.
//!
//! ```text
//! register  "ops"      -> v1
//! update    "ops", A   -> v2
//! update    "ops", B   -> v3
//! revert    "ops", 2   -> v4 (content == A)
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::catalog::PermissionPattern;
use crate::error::{AuthzError, AuthzResult};
use crate::role::{validate_role_name, Role};

/// The editable content of a template.
///
/// # Example
///
/// ```
/// use platform_authz::TemplateDefinition;
///
/// let def = TemplateDefinition::new("Developer")
///     .with_permissions(["code.read", "code.write", "*.read"])
///     .inherits(["user"]);
/// assert_eq!(def.permissions.len(), 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateDefinition {
    /// Display name of the role the template creates.
    pub display_name: String,
    /// Permission names or patterns (`category.*`, `*.action`, `*`).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Roles the created role inherits from.
    #[serde(default)]
    pub inherits_from: Vec<String>,
    /// Priority of the created role.
    #[serde(default)]
    pub priority: i32,
}

impl TemplateDefinition {
    /// Create an empty definition.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    /// Add permissions or patterns.
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Add parent roles.
    pub fn inherits<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inherits_from.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Set the priority of the created role.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Check every permission entry and parent name.
    pub fn validate(&self) -> AuthzResult<()> {
        for permission in &self.permissions {
            PermissionPattern::parse(permission)?;
        }
        for parent in &self.inherits_from {
            validate_role_name(parent)?;
        }
        Ok(())
    }
}

/// One version of a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleTemplate {
    /// Template name; also the name of the role it creates.
    pub name: String,
    /// Display name of the created role.
    pub display_name: String,
    /// Permission names or patterns.
    pub permissions: Vec<String>,
    /// Parent roles.
    pub inherits_from: Vec<String>,
    /// Priority of the created role.
    #[serde(default)]
    pub priority: i32,
    /// Monotonic version, starting at 1.
    pub version: u32,
    /// When version 1 was registered.
    pub created_at: DateTime<Utc>,
    /// When this version was written.
    pub updated_at: DateTime<Utc>,
}

impl RoleTemplate {
    /// The editable content of this version.
    pub fn definition(&self) -> TemplateDefinition {
        TemplateDefinition {
            display_name: self.display_name.clone(),
            permissions: self.permissions.clone(),
            inherits_from: self.inherits_from.clone(),
            priority: self.priority,
        }
    }

    fn from_definition(
        name: &str,
        definition: TemplateDefinition,
        version: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            display_name: definition.display_name,
            permissions: definition.permissions,
            inherits_from: definition.inherits_from,
            priority: definition.priority,
            version,
            created_at,
            updated_at: Utc::now(),
        }
    }
}

/// A role created from a template, with what it was granted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleWithPermissions {
    /// The role.
    pub role: Role,
    /// Concrete permissions granted, wildcards expanded.
    pub permissions: Vec<String>,
    /// Parents wired into the inheritance graph.
    pub inherits_from: Vec<String>,
    /// The template version that was applied.
    pub template_version: u32,
}

/// Outcome of applying a template to one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkAssignResult {
    /// The user.
    pub user_id: String,
    /// Whether the role is now assigned.
    pub success: bool,
    /// Why it failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lock-protected template histories.
#[derive(Default)]
pub(crate) struct TemplateState {
    histories: HashMap<String, Vec<RoleTemplate>>,
}

impl TemplateState {
    pub(crate) fn current(&self, name: &str) -> Option<&RoleTemplate> {
        self.histories.get(name).and_then(|versions| versions.last())
    }

    fn push(&mut self, name: &str, definition: TemplateDefinition) -> AuthzResult<RoleTemplate> {
        let versions = self
            .histories
            .get_mut(name)
            .ok_or_else(|| AuthzError::not_found("template", name))?;
        let (version, created_at) = versions
            .last()
            .map(|t| (t.version + 1, t.created_at))
            .unwrap_or((1, Utc::now()));
        let template = RoleTemplate::from_definition(name, definition, version, created_at);
        versions.push(template.clone());
        Ok(template)
    }

    pub(crate) fn histories(&self) -> Vec<Vec<RoleTemplate>> {
        let mut names: Vec<&String> = self.histories.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.histories.get(name).cloned())
            .collect()
    }

    pub(crate) fn replace_all(&mut self, histories: Vec<Vec<RoleTemplate>>) {
        self.histories = histories
            .into_iter()
            .filter_map(|versions| versions.first().map(|t| t.name.clone()).map(|name| (name, versions)))
            .collect();
    }
}

/// Versioned template storage.
#[derive(Default)]
pub struct TemplateStore {
    state: RwLock<TemplateState>,
}

impl fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateStore")
            .field("templates", &self.state.read().histories.len())
            .finish()
    }
}

impl TemplateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, TemplateState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, TemplateState> {
        self.state.write()
    }

    /// Register a new template as version 1.
    ///
    /// # Errors
    ///
    /// - `Validation` if the name is not a valid role name or the
    ///   definition contains a malformed permission or parent
    /// - `Conflict` if a template with that name exists
    pub fn register_template(&self, name: &str, definition: TemplateDefinition) -> AuthzResult<RoleTemplate> {
        validate_role_name(name)?;
        definition.validate()?;
        let mut state = self.state.write();
        if state.histories.contains_key(name) {
            return Err(AuthzError::conflict(format!("template '{name}' already exists")));
        }
        let template = RoleTemplate::from_definition(name, definition, 1, Utc::now());
        state.histories.insert(name.to_string(), vec![template.clone()]);
        drop(state);
        tracing::info!(template = %name, "Registered role template");
        Ok(template)
    }

    /// Current version of a template.
    pub fn get_template(&self, name: &str) -> AuthzResult<RoleTemplate> {
        self.state
            .read()
            .current(name)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("template", name))
    }

    /// Current version number of a template.
    pub fn get_template_version(&self, name: &str) -> AuthzResult<u32> {
        self.state
            .read()
            .current(name)
            .map(|t| t.version)
            .ok_or_else(|| AuthzError::not_found("template", name))
    }

    /// A specific version of a template.
    pub fn get_version(&self, name: &str, version: u32) -> AuthzResult<RoleTemplate> {
        let state = self.state.read();
        let versions = state
            .histories
            .get(name)
            .ok_or_else(|| AuthzError::not_found("template", name))?;
        versions
            .iter()
            .find(|t| t.version == version)
            .cloned()
            .ok_or_else(|| AuthzError::NotFound(format!("template '{name}' version {version}")))
    }

    /// Every version of a template, oldest first.
    pub fn history(&self, name: &str) -> AuthzResult<Vec<RoleTemplate>> {
        self.state
            .read()
            .histories
            .get(name)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("template", name))
    }

    /// Current versions of every template, sorted by name.
    pub fn list_templates(&self) -> Vec<RoleTemplate> {
        let state = self.state.read();
        let mut templates: Vec<RoleTemplate> = state
            .histories
            .keys()
            .filter_map(|name| state.current(name).cloned())
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    /// Append a new version with new content.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the template does not exist
    /// - `Validation` if the definition is malformed
    pub fn update_template(&self, name: &str, definition: TemplateDefinition) -> AuthzResult<RoleTemplate> {
        definition.validate()?;
        let template = self.state.write().push(name, definition)?;
        tracing::info!(template = %name, version = template.version, "Updated role template");
        Ok(template)
    }

    /// Append a new version equal in content to an earlier one.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the template or the version does not exist
    pub fn revert_template(&self, name: &str, version: u32) -> AuthzResult<RoleTemplate> {
        let mut state = self.state.write();
        let target = state
            .histories
            .get(name)
            .ok_or_else(|| AuthzError::not_found("template", name))?
            .iter()
            .find(|t| t.version == version)
            .map(RoleTemplate::definition)
            .ok_or_else(|| AuthzError::NotFound(format!("template '{name}' version {version}")))?;
        let template = state.push(name, target)?;
        drop(state);
        tracing::info!(
            template = %name,
            from_version = version,
            version = template.version,
            "Reverted role template"
        );
        Ok(template)
    }

    /// Remove a template and its history.
    pub fn delete_template(&self, name: &str) -> AuthzResult<()> {
        self.state
            .write()
            .histories
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AuthzError::not_found("template", name))
    }

    /// Merge the current versions of several templates into a new, unsaved
    /// template.
    ///
    /// Permissions and parents are unioned in first-seen order. The
    /// priority is the highest of the inputs. Register the result with
    /// [`TemplateStore::register_template`] to keep it.
    ///
    /// # Errors
    ///
    /// - `Validation` if `new_name` is not a valid role name or no
    ///   templates are given
    /// - `NotFound` if any input template does not exist
    pub fn combine_templates(&self, new_name: &str, names: &[&str]) -> AuthzResult<RoleTemplate> {
        validate_role_name(new_name)?;
        if names.is_empty() {
            return Err(AuthzError::validation("combine_templates needs at least one template"));
        }
        let state = self.state.read();
        let mut definition = TemplateDefinition::new(new_name);
        definition.priority = i32::MIN;
        for name in names {
            let template = state
                .current(name)
                .ok_or_else(|| AuthzError::not_found("template", name))?;
            for permission in &template.permissions {
                if !definition.permissions.contains(permission) {
                    definition.permissions.push(permission.clone());
                }
            }
            for parent in &template.inherits_from {
                if !definition.inherits_from.contains(parent) {
                    definition.inherits_from.push(parent.clone());
                }
            }
            definition.priority = definition.priority.max(template.priority);
        }
        Ok(RoleTemplate::from_definition(new_name, definition, 1, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TemplateStore {
        let store = TemplateStore::new();
        store
            .register_template(
                "developer",
                TemplateDefinition::new("Developer")
                    .with_permissions(["code.read", "code.write"])
                    .inherits(["user"]),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_register_conflict_and_validation() {
        let store = store();
        assert!(matches!(
            store.register_template("developer", TemplateDefinition::new("Dup")),
            Err(AuthzError::Conflict(_))
        ));
        assert!(matches!(
            store.register_template("x", TemplateDefinition::new("Short")),
            Err(AuthzError::Validation(_))
        ));
        assert!(matches!(
            store.register_template(
                "broken",
                TemplateDefinition::new("Broken").with_permissions(["code"])
            ),
            Err(AuthzError::Validation(_))
        ));
    }

    #[test]
    fn test_update_then_revert_creates_new_version() {
        let store = store();
        let def_a = TemplateDefinition::new("Developer A").with_permissions(["code.read"]);
        let def_b = TemplateDefinition::new("Developer B").with_permissions(["code.*"]);

        assert_eq!(store.update_template("developer", def_a.clone()).unwrap().version, 2);
        assert_eq!(store.update_template("developer", def_b).unwrap().version, 3);

        let reverted = store.revert_template("developer", 2).unwrap();
        assert_eq!(reverted.version, 4);
        assert_eq!(reverted.definition(), def_a);
        assert_eq!(store.get_template_version("developer").unwrap(), 4);

        // earlier versions stay retrievable
        assert_eq!(store.get_version("developer", 1).unwrap().display_name, "Developer");
        assert_eq!(store.history("developer").unwrap().len(), 4);
    }

    #[test]
    fn test_revert_unknown_version() {
        let store = store();
        assert!(matches!(
            store.revert_template("developer", 9),
            Err(AuthzError::NotFound(_))
        ));
        assert!(matches!(
            store.revert_template("ghost", 1),
            Err(AuthzError::NotFound(_))
        ));
        assert_eq!(store.get_template_version("developer").unwrap(), 1);
    }

    #[test]
    fn test_created_at_survives_updates() {
        let store = store();
        let v1 = store.get_template("developer").unwrap();
        let v2 = store
            .update_template("developer", TemplateDefinition::new("Dev"))
            .unwrap();
        assert_eq!(v1.created_at, v2.created_at);
        assert!(v2.updated_at >= v1.updated_at);
    }

    #[test]
    fn test_combine_templates_unions_without_persisting() {
        let store = store();
        store
            .register_template(
                "reviewer",
                TemplateDefinition::new("Reviewer")
                    .with_permissions(["code.read", "review.approve"])
                    .inherits(["user", "viewer"])
                    .with_priority(30),
            )
            .unwrap();

        let combined = store
            .combine_templates("dev_reviewer", &["developer", "reviewer"])
            .unwrap();
        assert_eq!(
            combined.permissions,
            vec!["code.read", "code.write", "review.approve"]
        );
        assert_eq!(combined.inherits_from, vec!["user", "viewer"]);
        assert_eq!(combined.priority, 30);
        assert_eq!(combined.version, 1);
        assert!(store.get_template("dev_reviewer").is_err());

        assert!(matches!(
            store.combine_templates("combo", &["developer", "ghost"]),
            Err(AuthzError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_and_delete() {
        let store = store();
        store
            .register_template("analyst", TemplateDefinition::new("Analyst"))
            .unwrap();
        let names: Vec<String> = store.list_templates().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["analyst", "developer"]);

        store.delete_template("analyst").unwrap();
        assert!(store.delete_template("analyst").is_err());
        assert_eq!(store.list_templates().len(), 1);
    }
}
