//! Engine configuration.
//!
//! The seed role set, the default permission vocabulary and the static
//! permission matrix are plain data handed to
//! [`AccessEngine::new`](crate::AccessEngine::new), so several engines (per
//! test, per tenant) never share mutable state. Audit and sweep knobs can be
//! overridden from environment variables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{validate_permission_name, PermissionPattern};
use crate::condition::Condition;
use crate::error::AuthzError;
use crate::role::validate_role_name;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl ToString) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

impl From<ConfigError> for AuthzError {
    fn from(err: ConfigError) -> Self {
        AuthzError::Validation(err.to_string())
    }
}

/// A role created when the engine starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleSeed {
    /// Role name.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Priority for "highest role" queries.
    pub priority: i32,
    /// Seeded roles are system roles unless stated otherwise.
    #[serde(default = "default_true")]
    pub system: bool,
}

impl RoleSeed {
    fn system(name: &str, display_name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            priority,
            system: true,
        }
    }
}

/// A permission registered when the engine starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionSeed {
    /// Permission name.
    pub name: String,
    /// Display name; defaults to the name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Category; defaults to the first name segment.
    #[serde(default)]
    pub category: Option<String>,
    /// Condition evaluated at check time.
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl PermissionSeed {
    fn named(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: Some(display_name.to_string()),
            category: None,
            condition: None,
        }
    }
}

/// Audit log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// Record role and grant changes made through the engine.
    pub enabled: bool,
    /// Also record every permission check.
    pub log_checks: bool,
    /// Maximum entries kept in memory.
    pub capacity: usize,
    /// Entries older than this are removed by the sweeper.
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_checks: true,
            capacity: 10_000,
            retention_days: 90,
        }
    }
}

impl AuditConfig {
    /// Retention window as a Duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86_400)
    }
}

/// Everything the engine needs at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Seed roles.
    pub roles: Vec<RoleSeed>,
    /// Seed permissions.
    pub permissions: Vec<PermissionSeed>,
    /// Static matrix: role name to permission names or patterns.
    pub matrix: BTreeMap<String, Vec<String>>,
    /// Audit settings.
    pub audit: AuditConfig,
    /// Interval of the maintenance sweep, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    /// Four system roles (admin, user, viewer, guest) and a small vocabulary.
    fn default() -> Self {
        let roles = vec![
            RoleSeed::system("admin", "Administrator", 100),
            RoleSeed::system("user", "User", 50),
            RoleSeed::system("viewer", "Viewer", 20),
            RoleSeed::system("guest", "Guest", 10),
        ];

        let permissions = [
            ("user.read", "Read users"),
            ("user.write", "Modify users"),
            ("user.delete", "Delete users"),
            ("storage.read", "Read storage"),
            ("storage.write", "Write storage"),
            ("storage.delete", "Delete storage"),
            ("role.read", "Read roles"),
            ("role.manage", "Manage roles"),
            ("audit.read", "Read audit log"),
            ("public.read", "Read public content"),
        ]
        .into_iter()
        .map(|(name, display)| PermissionSeed::named(name, display))
        .collect();

        let mut matrix = BTreeMap::new();
        matrix.insert("admin".to_string(), vec!["*".to_string()]);
        matrix.insert(
            "user".to_string(),
            ["user.read", "user.write", "storage.read", "storage.write"]
                .map(String::from)
                .to_vec(),
        );
        matrix.insert(
            "viewer".to_string(),
            ["user.read", "storage.read"].map(String::from).to_vec(),
        );
        matrix.insert("guest".to_string(), vec!["public.read".to_string()]);

        Self {
            roles,
            permissions,
            matrix,
            audit: AuditConfig::default(),
            sweep_interval_secs: 60,
        }
    }
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// An engine with no roles, permissions or matrix entries.
    pub fn empty() -> Self {
        Self {
            roles: Vec::new(),
            permissions: Vec::new(),
            matrix: BTreeMap::new(),
            ..Self::default()
        }
    }

    /// Load the default configuration with overrides from the environment.
    ///
    /// Environment variables:
    /// - `AUTHZ_AUDIT_ENABLED`: Record role and grant changes (default: true)
    /// - `AUTHZ_AUDIT_LOG_CHECKS`: Record every permission check (default: true)
    /// - `AUTHZ_AUDIT_CAPACITY`: Maximum audit entries in memory (default: 10000)
    /// - `AUTHZ_AUDIT_RETENTION_DAYS`: Audit retention in days (default: 90)
    /// - `AUTHZ_SWEEP_INTERVAL_SECS`: Maintenance sweep interval (default: 60)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let flag = |key: &str, fallback: bool| {
            lookup(key)
                .map(|s| s != "false" && s != "0")
                .unwrap_or(fallback)
        };

        let audit = AuditConfig {
            enabled: flag("AUTHZ_AUDIT_ENABLED", default.audit.enabled),
            log_checks: flag("AUTHZ_AUDIT_LOG_CHECKS", default.audit.log_checks),
            capacity: lookup("AUTHZ_AUDIT_CAPACITY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.audit.capacity),
            retention_days: lookup("AUTHZ_AUDIT_RETENTION_DAYS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.audit.retention_days),
        };

        Self {
            audit,
            sweep_interval_secs: lookup("AUTHZ_SWEEP_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.sweep_interval_secs),
            ..default
        }
    }

    /// Parse a JSON configuration table and validate it.
    ///
    /// Missing top-level keys take their default values.
    ///
    /// # Example
    ///
    /// ```
    /// use platform_authz::EngineConfig;
    ///
    /// let config = EngineConfig::from_json(r#"{
    ///     "roles": [{ "name": "owner", "display_name": "Owner", "priority": 90 }],
    ///     "permissions": [{ "name": "billing.read" }],
    ///     "matrix": { "owner": ["billing.*"] }
    /// }"#).unwrap();
    ///
    /// assert_eq!(config.roles[0].name, "owner");
    /// assert!(config.roles[0].system);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject malformed or inconsistent seeds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut role_names = HashSet::new();
        for seed in &self.roles {
            validate_role_name(&seed.name).map_err(|e| ConfigError::invalid("roles", e))?;
            if !role_names.insert(seed.name.as_str()) {
                return Err(ConfigError::invalid(
                    "roles",
                    format!("duplicate role '{}'", seed.name),
                ));
            }
        }

        let mut permission_names = HashSet::new();
        for seed in &self.permissions {
            validate_permission_name(&seed.name)
                .map_err(|e| ConfigError::invalid("permissions", e))?;
            if !permission_names.insert(seed.name.as_str()) {
                return Err(ConfigError::invalid(
                    "permissions",
                    format!("duplicate permission '{}'", seed.name),
                ));
            }
        }

        for (role, patterns) in &self.matrix {
            if !role_names.contains(role.as_str()) {
                return Err(ConfigError::invalid(
                    "matrix",
                    format!("unknown role '{role}'"),
                ));
            }
            for pattern in patterns {
                PermissionPattern::parse(pattern).map_err(|e| ConfigError::invalid("matrix", e))?;
            }
        }

        if self.audit.capacity == 0 {
            return Err(ConfigError::invalid("audit.capacity", "must be positive"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("sweep_interval_secs", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());

        let priorities: Vec<i32> = config.roles.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![100, 50, 20, 10]);
        assert!(config.roles.iter().all(|r| r.system));
        assert_eq!(config.matrix["admin"], vec!["*"]);
        assert_eq!(config.audit.retention(), Duration::from_secs(90 * 86_400));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("AUTHZ_AUDIT_LOG_CHECKS", "false"),
            ("AUTHZ_AUDIT_CAPACITY", "500"),
            ("AUTHZ_SWEEP_INTERVAL_SECS", "5"),
            ("AUTHZ_AUDIT_RETENTION_DAYS", "not-a-number"),
        ]);
        let config = EngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert!(config.audit.enabled);
        assert!(!config.audit.log_checks);
        assert_eq!(config.audit.capacity, 500);
        assert_eq!(config.audit.retention_days, 90);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.roles.len(), 4);
    }

    #[test]
    fn test_from_json_defaults_missing_keys() {
        let config = EngineConfig::from_json(r#"{ "sweep_interval_secs": 30 }"#).unwrap();
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.roles.len(), 4);
        assert_eq!(config.audit, AuditConfig::default());
    }

    #[test]
    fn test_from_json_with_condition() {
        let config = EngineConfig::from_json(
            r#"{
                "roles": [{ "name": "member", "display_name": "Member", "priority": 5, "system": false }],
                "permissions": [{
                    "name": "reports.export",
                    "condition": { "type": "attribute_at_least", "key": "tier", "threshold": 2 }
                }],
                "matrix": { "member": ["reports.export"] }
            }"#,
        )
        .unwrap();

        assert!(!config.roles[0].system);
        assert_eq!(
            config.permissions[0].condition,
            Some(Condition::attribute_at_least("tier", 2))
        );
    }

    #[test]
    fn test_validate_rejects_bad_seeds() {
        let mut config = EngineConfig::default();
        config.matrix.insert("ghost".to_string(), vec!["user.read".to_string()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "matrix"
        ));

        let mut config = EngineConfig::default();
        config.permissions.push(PermissionSeed::named("user.read", "Again"));
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.roles.push(RoleSeed::system("X", "Bad", 1));
        assert!(config.validate().is_err());

        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_error_into_authz_error() {
        let err: AuthzError = ConfigError::invalid("audit.capacity", "must be positive").into();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
