//! # Audit Log
//!
//! Append-only record of permission checks and of role and grant changes.
//! Entries are never mutated; they leave the log only through a retention
//! [`AuditLog::prune`] or, when the configured capacity is reached, by
//! evicting the oldest entry.
//!
//! Recording never fails and never changes the outcome of the operation
//! being recorded.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::condition::PermissionContext;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A permission check.
    Check,
    /// A role was assigned to a user.
    RoleAssigned,
    /// A role was revoked from a user.
    RoleRevoked,
    /// A permission was granted.
    PermissionGranted,
    /// A permission was revoked.
    PermissionRevoked,
}

impl AuditAction {
    /// Get the string representation of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Check => "check",
            AuditAction::RoleAssigned => "role_assigned",
            AuditAction::RoleRevoked => "role_revoked",
            AuditAction::PermissionGranted => "permission_granted",
            AuditAction::PermissionRevoked => "permission_revoked",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "check" => Some(AuditAction::Check),
            "role_assigned" => Some(AuditAction::RoleAssigned),
            "role_revoked" => Some(AuditAction::RoleRevoked),
            "permission_granted" => Some(AuditAction::PermissionGranted),
            "permission_revoked" => Some(AuditAction::PermissionRevoked),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Unique, time-ordered id.
    pub id: Uuid,
    /// User the entry is about.
    pub subject_user_id: String,
    /// Who performed the change, for mutations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performed_by: Option<String>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub action: AuditAction,
    /// Permission involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    /// Role involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Check outcome, or `true` for grants/assignments and `false` for
    /// revocations.
    pub granted: bool,
    /// Request context of a check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<PermissionContext>,
}

impl AuditEntry {
    fn new(subject_user_id: &str, action: AuditAction, granted: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            subject_user_id: subject_user_id.to_string(),
            performed_by: None,
            timestamp: Utc::now(),
            action,
            permission: None,
            role: None,
            granted,
            context: None,
        }
    }
}

/// Filters for [`AuditLog::query`]. Every set filter must match.
///
/// # Example
///
/// ```
/// use platform_authz::{AuditAction, AuditQuery};
///
/// let query = AuditQuery::new()
///     .user("u1")
///     .action(AuditAction::Check)
///     .limit(20);
/// assert_eq!(query.limit, Some(20));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Subject user.
    pub user_id: Option<String>,
    /// Actor.
    pub performed_by: Option<String>,
    /// Action kind.
    pub action: Option<AuditAction>,
    /// Permission.
    pub permission: Option<String>,
    /// Role.
    pub role: Option<String>,
    /// Inclusive lower time bound.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper time bound.
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of entries returned.
    pub limit: Option<usize>,
}

impl AuditQuery {
    /// Create a query with no filters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by subject user.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Filter by actor.
    pub fn performed_by(mut self, actor: impl Into<String>) -> Self {
        self.performed_by = Some(actor.into());
        self
    }

    /// Filter by action.
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Filter by permission.
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    /// Filter by role.
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Only entries at or after `start`.
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Only entries at or before `end`.
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        fn eq(filter: &Option<String>, value: Option<&str>) -> bool {
            filter.as_deref().map(|f| Some(f) == value).unwrap_or(true)
        }

        eq(&self.user_id, Some(&entry.subject_user_id))
            && eq(&self.performed_by, entry.performed_by.as_deref())
            && self.action.map(|a| a == entry.action).unwrap_or(true)
            && eq(&self.permission, entry.permission.as_deref())
            && eq(&self.role, entry.role.as_deref())
            && self.start_time.map(|t| entry.timestamp >= t).unwrap_or(true)
            && self.end_time.map(|t| entry.timestamp <= t).unwrap_or(true)
    }
}

/// Check statistics for one permission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditStats {
    /// Checks recorded.
    pub total_checks: usize,
    /// Checks that were allowed.
    pub granted: usize,
    /// Checks that were denied.
    pub denied: usize,
    /// Distinct users checked.
    pub unique_users: usize,
}

/// Lock-protected entries, oldest first.
pub(crate) struct AuditState {
    entries: VecDeque<AuditEntry>,
}

impl AuditState {
    pub(crate) fn entries(&self) -> Vec<AuditEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Swap in `entries` (oldest first), keeping only the newest `capacity`.
    /// Returns how many were dropped.
    pub(crate) fn replace_all(&mut self, entries: Vec<AuditEntry>, capacity: usize) -> usize {
        let dropped = entries.len().saturating_sub(capacity);
        self.entries = entries.into_iter().skip(dropped).collect();
        dropped
    }
}

/// Bounded, append-only audit log.
pub struct AuditLog {
    state: RwLock<AuditState>,
    capacity: usize,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.state.read().entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl AuditLog {
    /// Create a log with the default capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log holding at most `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(AuditState {
                entries: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of entries kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, AuditState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, AuditState> {
        self.state.write()
    }

    fn append(&self, entry: AuditEntry) {
        let mut state = self.state.write();
        let mut evicted = 0usize;
        while state.entries.len() >= self.capacity {
            state.entries.pop_front();
            evicted += 1;
        }
        state.entries.push_back(entry);
        drop(state);
        if evicted > 0 {
            tracing::warn!(evicted, capacity = self.capacity, "Audit log full, evicted oldest entries");
        }
    }

    /// Record a permission check.
    pub fn log_check(
        &self,
        user: &str,
        permission: &str,
        granted: bool,
        context: Option<&PermissionContext>,
    ) {
        let mut entry = AuditEntry::new(user, AuditAction::Check, granted);
        entry.permission = Some(permission.to_string());
        entry.context = context.cloned();
        self.append(entry);
    }

    /// Record a role assignment (`assigned = true`) or revocation.
    pub fn log_role_change(&self, user: &str, performed_by: Option<&str>, role: &str, assigned: bool) {
        let action = if assigned {
            AuditAction::RoleAssigned
        } else {
            AuditAction::RoleRevoked
        };
        let mut entry = AuditEntry::new(user, action, assigned);
        entry.performed_by = performed_by.map(str::to_string);
        entry.role = Some(role.to_string());
        self.append(entry);
    }

    /// Record a grant (`granted = true`) or revocation of a permission.
    ///
    /// `subject` is the user the change is about; for role-level grants it
    /// is the actor (or `"system"`), and `role` carries the role.
    pub fn log_grant_change(
        &self,
        subject: &str,
        performed_by: Option<&str>,
        role: Option<&str>,
        permission: &str,
        granted: bool,
    ) {
        let action = if granted {
            AuditAction::PermissionGranted
        } else {
            AuditAction::PermissionRevoked
        };
        let mut entry = AuditEntry::new(subject, action, granted);
        entry.performed_by = performed_by.map(str::to_string);
        entry.role = role.map(str::to_string);
        entry.permission = Some(permission.to_string());
        self.append(entry);
    }

    /// Entries matching every filter, newest first.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let limit = query.limit.unwrap_or(usize::MAX);
        self.state
            .read()
            .entries
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Check statistics for a permission.
    pub fn stats(&self, permission: &str) -> AuditStats {
        let state = self.state.read();
        let mut stats = AuditStats::default();
        let mut users = HashSet::new();
        for entry in state.entries.iter().filter(|e| {
            e.action == AuditAction::Check && e.permission.as_deref() == Some(permission)
        }) {
            stats.total_checks += 1;
            if entry.granted {
                stats.granted += 1;
            } else {
                stats.denied += 1;
            }
            users.insert(entry.subject_user_id.as_str());
        }
        stats.unique_users = users.len();
        stats
    }

    /// Remove entries older than `now - retention`. Returns the count.
    pub fn prune(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut state = self.state.write();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.timestamp >= cutoff);
        let pruned = before - state.entries.len();
        drop(state);
        if pruned > 0 {
            tracing::info!(pruned, "Pruned audit log");
        }
        pruned
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.read().entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_newest_first_with_filters() {
        let log = AuditLog::new();
        log.log_check("u1", "user.read", true, None);
        log.log_role_change("u1", Some("admin-1"), "developer", true);
        log.log_check("u2", "user.read", false, None);
        log.log_check("u1", "storage.write", false, None);

        let all = log.query(&AuditQuery::new());
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].permission.as_deref(), Some("storage.write"));

        let u1_checks = log.query(&AuditQuery::new().user("u1").action(AuditAction::Check));
        assert_eq!(u1_checks.len(), 2);
        assert_eq!(u1_checks[1].permission.as_deref(), Some("user.read"));

        let by_admin = log.query(&AuditQuery::new().performed_by("admin-1"));
        assert_eq!(by_admin.len(), 1);
        assert_eq!(by_admin[0].role.as_deref(), Some("developer"));

        assert_eq!(log.query(&AuditQuery::new().limit(1)).len(), 1);
    }

    #[test]
    fn test_time_window_filters() {
        let log = AuditLog::new();
        let before = Utc::now() - chrono::Duration::seconds(1);
        log.log_check("u1", "user.read", true, None);
        let after = Utc::now() + chrono::Duration::seconds(1);

        assert_eq!(log.query(&AuditQuery::new().since(before).until(after)).len(), 1);
        assert!(log.query(&AuditQuery::new().since(after)).is_empty());
        assert!(log.query(&AuditQuery::new().until(before)).is_empty());
    }

    #[test]
    fn test_stats() {
        let log = AuditLog::new();
        log.log_check("u1", "user.read", true, None);
        log.log_check("u1", "user.read", true, None);
        log.log_check("u2", "user.read", false, None);
        log.log_check("u3", "user.write", true, None);
        log.log_grant_change("admin", None, Some("user"), "user.read", true);

        let stats = log.stats("user.read");
        assert_eq!(
            stats,
            AuditStats {
                total_checks: 3,
                granted: 2,
                denied: 1,
                unique_users: 2,
            }
        );
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = AuditLog::with_capacity(2);
        log.log_check("u1", "a.read", true, None);
        log.log_check("u2", "b.read", true, None);
        log.log_check("u3", "c.read", true, None);

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].subject_user_id, "u2");
    }

    #[test]
    fn test_prune_by_retention() {
        let log = AuditLog::new();
        log.log_check("u1", "user.read", true, None);
        {
            let mut state = log.write();
            let mut old = state.entries[0].clone();
            old.timestamp = Utc::now() - chrono::Duration::days(10);
            state.entries.push_front(old);
        }

        assert_eq!(log.prune(Duration::from_secs(86_400)), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.prune(Duration::from_secs(86_400)), 0);
    }

    #[test]
    fn test_grant_change_entry() {
        let log = AuditLog::new();
        log.log_grant_change("ops-bot", Some("ops-bot"), Some("developer"), "code.deploy", false);

        let entry = &log.entries()[0];
        assert_eq!(entry.action, AuditAction::PermissionRevoked);
        assert!(!entry.granted);
        assert_eq!(entry.role.as_deref(), Some("developer"));
        assert_eq!(AuditAction::parse("permission_revoked"), Some(entry.action));
    }
}
