//! # Permission Catalog
//!
//! Registry of known permission names. A permission is an opaque
//! dot-namespaced string (`category.action`); the engine never interprets the
//! segments beyond deriving a category from the first one.
//!
//! The catalog also owns the table of named predicates that
//! [`Condition::Custom`] resolves to, so a permission check only needs the
//! catalog lock to evaluate a condition.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::condition::{Condition, ConditionFn, ConditionResolver, PermissionContext};
use crate::error::{AuthzError, AuthzResult};

/// Validate a permission name.
///
/// A valid name is non-empty, has at least one dot, no empty segments
/// (leading, trailing or doubled dots), no whitespace and no `*`.
///
/// # Example
///
/// ```
/// use platform_authz::catalog::validate_permission_name;
///
/// assert!(validate_permission_name("storage.read").is_ok());
/// assert!(validate_permission_name("storage.objects.read").is_ok());
/// assert!(validate_permission_name("storage").is_err());
/// assert!(validate_permission_name("storage..read").is_err());
/// assert!(validate_permission_name(".read").is_err());
/// ```
pub fn validate_permission_name(name: &str) -> AuthzResult<()> {
    if name.is_empty() {
        return Err(AuthzError::validation("permission name is empty"));
    }
    if !name.contains('.') {
        return Err(AuthzError::validation(format!(
            "permission '{name}' must have the form category.action"
        )));
    }
    if name.split('.').any(str::is_empty) {
        return Err(AuthzError::validation(format!(
            "permission '{name}' has an empty segment"
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '*') {
        return Err(AuthzError::validation(format!(
            "permission '{name}' contains whitespace or '*'"
        )));
    }
    Ok(())
}

/// Category of a permission name: the substring before the first dot.
pub fn category_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// A permission name or a wildcard over registered permission names.
///
/// Supported forms:
/// - `*`: every permission
/// - `category.*`: every permission starting with `category.`
/// - `*.action`: every permission ending with `.action`
/// - `category.action`: exactly that permission
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PermissionPattern {
    /// Matches every permission.
    Any,
    /// Matches names starting with `prefix.`.
    Category(String),
    /// Matches names ending with `.suffix`.
    Action(String),
    /// Matches a single name.
    Exact(String),
}

impl PermissionPattern {
    /// Parse a pattern.
    ///
    /// # Example
    ///
    /// ```
    /// use platform_authz::catalog::PermissionPattern;
    ///
    /// let p = PermissionPattern::parse("*.read").unwrap();
    /// assert!(p.matches("storage.read"));
    /// assert!(!p.matches("storage.write"));
    /// assert!(p.is_wildcard());
    /// ```
    pub fn parse(s: &str) -> AuthzResult<Self> {
        if s == "*" {
            return Ok(PermissionPattern::Any);
        }
        if let Some(prefix) = s.strip_suffix(".*") {
            if prefix.is_empty() || prefix.contains('*') || prefix.split('.').any(str::is_empty) {
                return Err(AuthzError::validation(format!("invalid permission pattern '{s}'")));
            }
            return Ok(PermissionPattern::Category(prefix.to_string()));
        }
        if let Some(suffix) = s.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') || suffix.split('.').any(str::is_empty) {
                return Err(AuthzError::validation(format!("invalid permission pattern '{s}'")));
            }
            return Ok(PermissionPattern::Action(suffix.to_string()));
        }
        validate_permission_name(s)?;
        Ok(PermissionPattern::Exact(s.to_string()))
    }

    /// Check if a permission name matches this pattern.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            PermissionPattern::Any => true,
            PermissionPattern::Category(prefix) => name
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false),
            PermissionPattern::Action(suffix) => name
                .strip_suffix(suffix.as_str())
                .map(|rest| rest.ends_with('.'))
                .unwrap_or(false),
            PermissionPattern::Exact(exact) => exact == name,
        }
    }

    /// Check if this pattern can match more than one name.
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, PermissionPattern::Exact(_))
    }
}

impl fmt::Display for PermissionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionPattern::Any => write!(f, "*"),
            PermissionPattern::Category(prefix) => write!(f, "{prefix}.*"),
            PermissionPattern::Action(suffix) => write!(f, "*.{suffix}"),
            PermissionPattern::Exact(name) => write!(f, "{name}"),
        }
    }
}

/// A registered permission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permission {
    /// Unique name (e.g. "storage.read").
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Category used for grouping (defaults to the first name segment).
    pub category: String,
    /// Optional condition evaluated at check time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Permission {
    /// Create a permission, deriving the category when none is supplied.
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, category: Option<&str>) -> Self {
        let name = name.into();
        let category = category
            .map(str::to_string)
            .unwrap_or_else(|| category_of(&name).to_string());
        Self {
            name,
            display_name: display_name.into(),
            category,
            condition: None,
        }
    }

    /// Check if the permission carries a condition.
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

/// Lock-protected catalog contents.
#[derive(Default)]
pub(crate) struct CatalogState {
    permissions: HashMap<String, Permission>,
    by_category: HashMap<String, BTreeSet<String>>,
    condition_fns: HashMap<String, ConditionFn>,
}

impl CatalogState {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.permissions.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Permission> {
        self.permissions.get(name)
    }

    pub(crate) fn insert(&mut self, permission: Permission) -> AuthzResult<()> {
        validate_permission_name(&permission.name)?;
        if self.permissions.contains_key(&permission.name) {
            return Err(AuthzError::conflict(format!(
                "permission '{}' already registered",
                permission.name
            )));
        }
        self.by_category
            .entry(permission.category.clone())
            .or_default()
            .insert(permission.name.clone());
        self.permissions.insert(permission.name.clone(), permission);
        Ok(())
    }

    pub(crate) fn remove(&mut self, name: &str) -> AuthzResult<Permission> {
        let permission = self
            .permissions
            .remove(name)
            .ok_or_else(|| AuthzError::not_found("permission", name))?;
        if let Some(names) = self.by_category.get_mut(&permission.category) {
            names.remove(name);
            if names.is_empty() {
                self.by_category.remove(&permission.category);
            }
        }
        Ok(permission)
    }

    pub(crate) fn set_condition(&mut self, name: &str, condition: Option<Condition>) -> AuthzResult<()> {
        validate_permission_name(name)?;
        if !self.permissions.contains_key(name) {
            self.insert(Permission::new(name, name, None))?;
        }
        if let Some(permission) = self.permissions.get_mut(name) {
            permission.condition = condition;
        }
        Ok(())
    }

    /// Check if the permission's condition holds for `context`.
    /// Unconditional permissions grant nothing here.
    pub(crate) fn condition_grants(&self, name: &str, context: Option<&PermissionContext>) -> bool {
        self.permissions
            .get(name)
            .and_then(|p| p.condition.as_ref())
            .map(|condition| condition.evaluate(context, self))
            .unwrap_or(false)
    }

    pub(crate) fn expand(&self, pattern: &PermissionPattern) -> BTreeSet<String> {
        match pattern {
            PermissionPattern::Exact(name) if self.contains(name) => BTreeSet::from([name.clone()]),
            PermissionPattern::Exact(_) => BTreeSet::new(),
            _ => self
                .permissions
                .keys()
                .filter(|name| pattern.matches(name))
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn all(&self) -> Vec<Permission> {
        let mut all: Vec<Permission> = self.permissions.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub(crate) fn replace_all(&mut self, permissions: Vec<Permission>) -> AuthzResult<()> {
        self.permissions.clear();
        self.by_category.clear();
        for permission in permissions {
            self.insert(permission)?;
        }
        Ok(())
    }
}

impl ConditionResolver for CatalogState {
    fn resolve(&self, name: &str) -> Option<&ConditionFn> {
        self.condition_fns.get(name)
    }
}

/// Registry of known permissions, indexed by category.
///
/// # Example
///
/// ```
/// use platform_authz::PermissionCatalog;
///
/// let catalog = PermissionCatalog::new();
/// catalog.register("feature.beta", "Beta features", None).unwrap();
///
/// assert!(catalog.exists("feature.beta"));
/// assert_eq!(catalog.get("feature.beta").unwrap().category, "feature");
/// assert!(catalog.register("feature.beta", "Again", None).is_err());
/// ```
#[derive(Default)]
pub struct PermissionCatalog {
    state: RwLock<CatalogState>,
}

impl fmt::Debug for PermissionCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("PermissionCatalog")
            .field("permissions", &state.permissions.len())
            .field("categories", &state.by_category.len())
            .finish()
    }
}

impl PermissionCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write()
    }

    /// Register a new permission.
    ///
    /// # Errors
    ///
    /// - `Validation` if the name is malformed
    /// - `Conflict` if the name is already registered
    pub fn register(&self, name: &str, display_name: &str, category: Option<&str>) -> AuthzResult<()> {
        self.state
            .write()
            .insert(Permission::new(name, display_name, category))?;
        tracing::debug!(permission = %name, "Registered permission");
        Ok(())
    }

    /// Attach or replace the condition of a permission.
    ///
    /// The permission is registered (with its name as display name) if it
    /// is not in the catalog yet.
    pub fn register_conditional(&self, name: &str, condition: Condition) -> AuthzResult<()> {
        self.state.write().set_condition(name, Some(condition))?;
        tracing::debug!(permission = %name, "Registered conditional permission");
        Ok(())
    }

    /// Remove the condition from a permission.
    pub fn clear_condition(&self, name: &str) -> AuthzResult<()> {
        let mut state = self.state.write();
        if !state.contains(name) {
            return Err(AuthzError::not_found("permission", name));
        }
        state.set_condition(name, None)
    }

    /// Register a named predicate for [`Condition::Custom`].
    ///
    /// Registering the same name again replaces the predicate.
    pub fn register_condition_fn<F>(&self, name: &str, predicate: F)
    where
        F: Fn(&PermissionContext) -> bool + Send + Sync + 'static,
    {
        self.state
            .write()
            .condition_fns
            .insert(name.to_string(), std::sync::Arc::new(predicate));
    }

    /// Remove a permission and its category index entry.
    ///
    /// Grants held in a [`crate::GrantOverlay`] are not touched here; use
    /// [`crate::AccessEngine::unregister_permission`] to drop them too.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the permission is not registered
    pub fn unregister(&self, name: &str) -> AuthzResult<Permission> {
        let removed = self.state.write().remove(name)?;
        tracing::debug!(permission = %name, "Unregistered permission");
        Ok(removed)
    }

    /// Check if a permission is registered.
    pub fn exists(&self, name: &str) -> bool {
        self.state.read().contains(name)
    }

    /// Get a registered permission.
    pub fn get(&self, name: &str) -> AuthzResult<Permission> {
        self.state
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AuthzError::not_found("permission", name))
    }

    /// List the permissions of a category, sorted by name.
    pub fn list_by_category(&self, category: &str) -> Vec<Permission> {
        let state = self.state.read();
        state
            .by_category
            .get(category)
            .map(|names| names.iter().filter_map(|n| state.get(n).cloned()).collect())
            .unwrap_or_default()
    }

    /// List every registered permission, sorted by name.
    pub fn list(&self) -> Vec<Permission> {
        self.state.read().all()
    }

    /// List every category that has at least one permission.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.state.read().by_category.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Expand a pattern against the permissions registered right now.
    pub fn expand_pattern(&self, pattern: &str) -> AuthzResult<Vec<String>> {
        let pattern = PermissionPattern::parse(pattern)?;
        Ok(self.state.read().expand(&pattern).into_iter().collect())
    }

    /// Number of registered permissions.
    pub fn len(&self) -> usize {
        self.state.read().permissions.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().permissions.is_empty()
    }
}
