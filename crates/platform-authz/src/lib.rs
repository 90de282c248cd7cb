//! # Platform Authz (Access-Control Decision Engine)
//!
//! This crate decides, for a user and a permission (and an optional request
//! context), whether an action is allowed on the Relay platform.
//!
//! ## Overview
//!
//! The platform-authz crate handles:
//! - **Permission Catalog**: registered permissions, with optional conditions
//! - **Role Registry**: system and custom roles with priorities
//! - **Inheritance Graph**: acyclic `child -> parent` role inheritance
//! - **Assignments**: which users hold which roles directly
//! - **Grant Overlay**: static, temporary and grouped grants, and denials
//! - **Resolver**: the single yes/no decision function
//! - **Templates**: versioned role blueprints
//! - **Audit Log**: append-only record of checks and changes
//!
//! ## Architecture
//!
//! ```text
//!                      AccessEngine
//!                           |
//!   +-----------+-----------+-----------+-----------+----------+
//!   |           |           |           |           |          |
//! Catalog  RoleRegistry  Inheritance  Assignment  Grant      Templates
//!   ^           ^         Graph        Store      Overlay    AuditLog
//!   |           |           ^           ^           ^
//!   +-----------+-----------+-----------+-----------+
//!                           |
//!                        Resolver (read-only)
//! ```
//!
//! ## Decision order
//!
//! 1. Unregistered permission: deny.
//! 2. Expand the user's roles through inheritance.
//! 3. Any denial on any of those roles: deny.
//! 4. Allow if some role holds the permission through the static matrix, a
//!    static grant or an unexpired temporary grant.
//! 5. Otherwise allow if the permission's condition holds for the context
//!    and the user holds at least one role.
//!
//! ## Usage
//!
//! ```rust
//! use platform_authz::{AccessEngine, Condition, EngineConfig, PermissionContext};
//!
//! let engine = AccessEngine::new(EngineConfig::default()).unwrap();
//!
//! engine.create_role("architect", "Architect", 70).unwrap();
//! engine.create_role("team_lead", "Team Lead", 60).unwrap();
//! engine.add_inheritance("architect", "team_lead").unwrap();
//! engine.add_inheritance("team_lead", "user").unwrap();
//! engine.assign_role("alice", "architect", Some("admin")).unwrap();
//!
//! // Inherited from the built-in `user` role
//! assert!(engine.has_permission("alice", "user.read", None));
//!
//! // A satisfied condition grants on its own
//! engine
//!     .grants()
//!     .register_conditional("reports.export", Condition::attribute_at_least("tier", 2))
//!     .unwrap();
//!
//! let ctx = PermissionContext::new("alice").with_attribute("tier", 3);
//! assert!(engine.has_permission("alice", "reports.export", Some(&ctx)));
//! assert!(!engine.has_permission("alice", "reports.export", None));
//!
//! // Deny wins over everything, including inheritance
//! engine.deny_permission("architect", "user.read", Some("admin")).unwrap();
//! assert!(!engine.has_permission("alice", "user.read", None));
//! ```
//!
//! ## Concurrency
//!
//! Every component is guarded by its own `parking_lot::RwLock`.
//! [`Resolver`] checks take read locks only. [`AccessEngine::has_permission`]
//! additionally appends to the audit log when `audit.log_checks` is on. Operations spanning components take locks in one fixed
//! order (catalog, roles, graph, assignments, grants, templates, audit).
//!
//! ## Features
//!
//! - `sweeper` (default): [`maintenance::spawn_sweeper`], a tokio task that
//!   purges expired temporary grants and prunes the audit log.

pub mod assignment;
pub mod audit;
pub mod catalog;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod grants;
pub mod hierarchy;
#[cfg(feature = "sweeper")]
pub mod maintenance;
pub mod resolver;
pub mod role;
pub mod snapshot;
pub mod template;

// Re-export main types for convenience
pub use assignment::{AssignmentStore, RoleAssignment};
pub use audit::{AuditAction, AuditEntry, AuditLog, AuditQuery, AuditStats};
pub use catalog::{Permission, PermissionCatalog, PermissionPattern};
pub use condition::{Condition, ConditionFn, ConditionResolver, PermissionContext};
pub use config::{AuditConfig, ConfigError, EngineConfig, PermissionSeed, RoleSeed};
pub use engine::AccessEngine;
pub use error::{AuthzError, AuthzResult};
pub use grants::{Denial, GrantOverlay, PermissionGroup, StaticGrant, TemporaryGrant};
pub use hierarchy::{InheritanceEdge, InheritanceGraph};
#[cfg(feature = "sweeper")]
pub use maintenance::{spawn_sweeper, SweepReport, SweeperHandle};
pub use resolver::Resolver;
pub use role::{Role, RoleRegistry};
pub use snapshot::EngineSnapshot;
pub use template::{BulkAssignResult, RoleTemplate, RoleWithPermissions, TemplateDefinition, TemplateStore};
