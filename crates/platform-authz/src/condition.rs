//! # Conditions
//!
//! A condition grants its permission to any user holding a role whenever
//! the request context satisfies a predicate. It never takes away a grant
//! made through the matrix or the overlay.
//!
//! Conditions are plain data, interpreted by [`Condition::evaluate`], so
//! they can be inspected, audited and persisted alongside the catalog.
//!
//! Arbitrary Rust predicates are still available through
//! [`Condition::Custom`], which names a function registered on the catalog
//! with [`crate::PermissionCatalog::register_condition_fn`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Request-time context a condition is evaluated against.
///
/// # Example
///
/// ```
/// use platform_authz::PermissionContext;
///
/// let ctx = PermissionContext::new("user-1")
///     .with_attribute("tier", 3)
///     .with_resource("doc-42")
///     .with_action("read");
/// assert_eq!(ctx.resource_id.as_deref(), Some("doc-42"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionContext {
    /// The user the check is performed for.
    pub user_id: String,
    /// Caller-supplied attribute bag (tier, plan, region, ...).
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// Target resource, if the check is resource-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Action being performed on the resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Free-form request metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PermissionContext {
    /// Create an empty context for a user.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the target resource.
    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set the action.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn numeric_attribute(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// A named predicate that [`Condition::Custom`] resolves to.
pub type ConditionFn = Arc<dyn Fn(&PermissionContext) -> bool + Send + Sync>;

/// Lookup used while interpreting [`Condition::Custom`].
pub trait ConditionResolver {
    /// Get the predicate registered under `name`.
    fn resolve(&self, name: &str) -> Option<&ConditionFn>;
}

impl ConditionResolver for HashMap<String, ConditionFn> {
    fn resolve(&self, name: &str) -> Option<&ConditionFn> {
        self.get(name)
    }
}

/// A condition attached to a catalog permission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Always satisfied once a context is present.
    AlwaysTrue,

    /// Numeric attribute `key` is at least `threshold`.
    AttributeAtLeast {
        /// Attribute name.
        key: String,
        /// Inclusive lower bound.
        threshold: i64,
    },

    /// Attribute `key` equals `value` exactly.
    AttributeEquals {
        /// Attribute name.
        key: String,
        /// Expected value.
        value: Value,
    },

    /// The context targets this resource.
    ResourceIs {
        /// Expected resource id.
        resource_id: String,
    },

    /// The context performs this action.
    ActionIs {
        /// Expected action.
        action: String,
    },

    /// Every inner condition holds. An empty list holds.
    All {
        /// Inner conditions.
        conditions: Vec<Condition>,
    },

    /// At least one inner condition holds. An empty list does not.
    Any {
        /// Inner conditions.
        conditions: Vec<Condition>,
    },

    /// A predicate registered by name.
    Custom {
        /// Registered predicate name.
        name: String,
    },
}

impl Condition {
    /// Shorthand for [`Condition::AttributeAtLeast`].
    pub fn attribute_at_least(key: impl Into<String>, threshold: i64) -> Self {
        Condition::AttributeAtLeast {
            key: key.into(),
            threshold,
        }
    }

    /// Shorthand for [`Condition::All`].
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { conditions }
    }

    /// Shorthand for [`Condition::Any`].
    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Any { conditions }
    }

    /// Shorthand for [`Condition::Custom`].
    pub fn custom(name: impl Into<String>) -> Self {
        Condition::Custom { name: name.into() }
    }

    /// Evaluate the condition.
    ///
    /// A missing context is `false`, never an error. A `Custom` name with no
    /// registered predicate is also `false`.
    ///
    /// # Example
    ///
    /// ```
    /// use platform_authz::{Condition, ConditionFn, PermissionContext};
    /// use std::collections::HashMap;
    ///
    /// let cond = Condition::attribute_at_least("tier", 2);
    /// let fns: HashMap<String, ConditionFn> = HashMap::new();
    /// let ctx = PermissionContext::new("u1").with_attribute("tier", 3);
    /// assert!(cond.evaluate(Some(&ctx), &fns));
    /// assert!(!cond.evaluate(None, &fns));
    /// ```
    pub fn evaluate<R: ConditionResolver + ?Sized>(
        &self,
        context: Option<&PermissionContext>,
        resolver: &R,
    ) -> bool {
        let Some(ctx) = context else {
            return false;
        };
        self.eval(ctx, resolver)
    }

    fn eval<R: ConditionResolver + ?Sized>(&self, ctx: &PermissionContext, resolver: &R) -> bool {
        match self {
            Condition::AlwaysTrue => true,
            Condition::AttributeAtLeast { key, threshold } => ctx
                .numeric_attribute(key)
                .map(|v| v >= *threshold as f64)
                .unwrap_or(false),
            Condition::AttributeEquals { key, value } => ctx.attributes.get(key) == Some(value),
            Condition::ResourceIs { resource_id } => {
                ctx.resource_id.as_deref() == Some(resource_id.as_str())
            }
            Condition::ActionIs { action } => ctx.action.as_deref() == Some(action.as_str()),
            Condition::All { conditions } => conditions.iter().all(|c| c.eval(ctx, resolver)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.eval(ctx, resolver)),
            Condition::Custom { name } => match resolver.resolve(name) {
                Some(f) => f(ctx),
                None => {
                    tracing::warn!(condition = %name, "Unknown custom condition, denying");
                    false
                }
            },
        }
    }

    /// Names of every custom predicate this condition references.
    pub fn custom_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_custom(&mut names);
        names
    }

    fn collect_custom<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Custom { name } => out.push(name),
            Condition::All { conditions } | Condition::Any { conditions } => {
                for c in conditions {
                    c.collect_custom(out);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::AlwaysTrue => write!(f, "true"),
            Condition::AttributeAtLeast { key, threshold } => write!(f, "{key} >= {threshold}"),
            Condition::AttributeEquals { key, value } => write!(f, "{key} == {value}"),
            Condition::ResourceIs { resource_id } => write!(f, "resource == {resource_id}"),
            Condition::ActionIs { action } => write!(f, "action == {action}"),
            Condition::All { conditions } => write_joined(f, conditions, " && "),
            Condition::Any { conditions } => write_joined(f, conditions, " || "),
            Condition::Custom { name } => write!(f, "{name}()"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, inner: &[Condition], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, c) in inner.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{c}")?;
    }
    write!(f, ")")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_fns() -> HashMap<String, ConditionFn> {
        HashMap::new()
    }

    #[test]
    fn test_missing_context_is_false() {
        assert!(!Condition::AlwaysTrue.evaluate(None, &no_fns()));
    }

    #[test]
    fn test_attribute_at_least() {
        let cond = Condition::attribute_at_least("tier", 2);
        let fns = no_fns();

        let low = PermissionContext::new("u").with_attribute("tier", 1);
        let high = PermissionContext::new("u").with_attribute("tier", 2);
        let text = PermissionContext::new("u").with_attribute("tier", "5");
        let missing = PermissionContext::new("u");

        assert!(!cond.evaluate(Some(&low), &fns));
        assert!(cond.evaluate(Some(&high), &fns));
        assert!(cond.evaluate(Some(&text), &fns));
        assert!(!cond.evaluate(Some(&missing), &fns));
    }

    #[test]
    fn test_combinators() {
        let fns = no_fns();
        let ctx = PermissionContext::new("u")
            .with_resource("doc-1")
            .with_action("read");

        let all = Condition::all(vec![
            Condition::ResourceIs {
                resource_id: "doc-1".to_string(),
            },
            Condition::ActionIs {
                action: "read".to_string(),
            },
        ]);
        assert!(all.evaluate(Some(&ctx), &fns));

        let any = Condition::any(vec![
            Condition::ActionIs {
                action: "write".to_string(),
            },
            Condition::AttributeEquals {
                key: "region".to_string(),
                value: Value::from("eu"),
            },
        ]);
        assert!(!any.evaluate(Some(&ctx), &fns));
        assert!(Condition::all(vec![]).evaluate(Some(&ctx), &fns));
        assert!(!Condition::any(vec![]).evaluate(Some(&ctx), &fns));
    }

    #[test]
    fn test_custom_condition() {
        let mut fns: HashMap<String, ConditionFn> = HashMap::new();
        fns.insert(
            "business_hours".to_string(),
            Arc::new(|ctx: &PermissionContext| ctx.metadata.get("hour").map(|h| h == "10").unwrap_or(false)),
        );

        let ctx = PermissionContext::new("u").with_metadata("hour", "10");
        assert!(Condition::custom("business_hours").evaluate(Some(&ctx), &fns));
        assert!(!Condition::custom("unregistered").evaluate(Some(&ctx), &fns));
    }

    #[test]
    fn test_condition_serializes_as_tagged_data() {
        let cond = Condition::attribute_at_least("tier", 3);
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "attribute_at_least");
        assert_eq!(json["threshold"], 3);
    }

    #[test]
    fn test_custom_names_and_display() {
        let cond = Condition::all(vec![
            Condition::custom("a"),
            Condition::any(vec![Condition::custom("b"), Condition::AlwaysTrue]),
        ]);
        assert_eq!(cond.custom_names(), vec!["a", "b"]);
        assert_eq!(cond.to_string(), "(a() && (b() || true))");
    }
}
