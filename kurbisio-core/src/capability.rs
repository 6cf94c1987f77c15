//! Capabilities, permits and the permit-evaluation algorithm.
//!
//! A [`Capability`] is the authorization context middleware attaches to every
//! request: the set of roles the caller holds plus a map of selectors scoping
//! those roles to particular rows (`user_id`, `device_id`, …). A [`Permit`]
//! is a declarative rule in the backend configuration tying a role to a set
//! of operations under a set of required selectors.
//!
//! [`is_authorized`] is a pure function of its inputs; replaying the same
//! capability, operation, path parameters and permits always yields the same
//! outcome.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The built-in role that passes every check unless the resource opted out.
pub const ROLE_ADMIN: &str = "admin";

/// Pseudo-role matching any authenticated caller (at least one role).
pub const ROLE_EVERYBODY: &str = "everybody";

/// Pseudo-role matching every caller, authenticated or not.
pub const ROLE_PUBLIC: &str = "public";

/// The operations a permit can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    List,
    Clear,
    CompanionUploaded,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::List => "list",
            Operation::Clear => "clear",
            Operation::CompanionUploaded => "companion_uploaded",
        };
        f.write_str(s)
    }
}

/// A declarative authorization rule from the backend configuration.
///
/// `selectors` name resources, not columns: a selector `"user"` requires the
/// capability to carry `user_id` equal to the `user_id` path parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permit {
    pub role: String,
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub selectors: Vec<String>,
}

/// The authorization context of a request: roles plus selectors.
///
/// Selector keys end in `_id` by convention; [`Capability::selector`] accepts
/// both the suffixed and the unsuffixed form. Constructed once per request by
/// the middleware chain and treated as read-only by handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,
}

/// Normalize a selector name to its `_id`-suffixed form.
fn suffixed(name: &str) -> String {
    if name.ends_with("_id") {
        name.to_owned()
    } else {
        format!("{name}_id")
    }
}

impl Capability {
    /// A capability holding a single role and no selectors.
    pub fn with_role(role: impl Into<String>) -> Self {
        Self {
            roles: vec![role.into()],
            selectors: BTreeMap::new(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }

    /// Add a role unless it is already present. Never removes roles.
    pub fn add_role(&mut self, role: &str) {
        if !self.has_role(role) {
            self.roles.push(role.to_owned());
        }
    }

    /// Look up a selector by name, trying the exact key first and the
    /// `_id`-suffixed form second.
    pub fn selector(&self, name: &str) -> Option<&str> {
        self.selectors
            .get(name)
            .or_else(|| self.selectors.get(&suffixed(name)))
            .map(String::as_str)
    }

    /// Record a selector under its `_id`-suffixed key.
    ///
    /// Refuses to overwrite an existing selector with a different value and
    /// returns `false` in that case; setting the same value again is a no-op
    /// that returns `true`.
    pub fn put_selector(&mut self, name: &str, value: &str) -> bool {
        let key = suffixed(name);
        match self.selectors.get(&key) {
            Some(existing) => existing == value,
            None => {
                self.selectors.insert(key, value.to_owned());
                true
            }
        }
    }

    /// Record a selector under its literal key (used for non-resource
    /// selectors such as `thing`). Same overwrite rule as [`put_selector`].
    ///
    /// [`put_selector`]: Capability::put_selector
    pub fn put_raw_selector(&mut self, key: &str, value: &str) -> bool {
        match self.selectors.get(key) {
            Some(existing) => existing == value,
            None => {
                self.selectors.insert(key.to_owned(), value.to_owned());
                true
            }
        }
    }
}

/// Look up a path parameter by selector name, accepting the suffixed form.
fn path_param<'a>(params: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .or_else(|| params.get(&suffixed(name)))
        .map(String::as_str)
}

/// Evaluate the permits of a resource against a capability.
///
/// The algorithm, with fixed precedence:
///
/// 1. `admin` allows everything, unless the resource opted out of the
///    default (`restrict_admin`), in which case `admin` is an ordinary role.
/// 2. Permits are scanned in declared order. A permit passes iff
///    a. its role applies: the capability holds the role, or the role is
///       `everybody` and the capability holds at least one role, or the role
///       is `public`;
///    b. the operation is in the permit's operation set;
///    c. every required selector exists in the capability and equals the
///       corresponding path parameter.
/// 3. Any passing permit allows; otherwise the request is denied.
pub fn is_authorized(
    cap: &Capability,
    op: Operation,
    path_params: &BTreeMap<String, String>,
    permits: &[Permit],
    restrict_admin: bool,
) -> bool {
    if !restrict_admin && cap.is_admin() {
        return true;
    }

    permits.iter().any(|permit| {
        let role_applies = cap.has_role(&permit.role)
            || (permit.role == ROLE_EVERYBODY && !cap.roles.is_empty())
            || permit.role == ROLE_PUBLIC;
        if !role_applies {
            return false;
        }
        if !permit.operations.contains(&op) {
            return false;
        }
        permit.selectors.iter().all(|sel| {
            match (cap.selector(sel), path_param(path_params, sel)) {
                (Some(have), Some(want)) => have == want,
                _ => false,
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permits() -> Vec<Permit> {
        vec![Permit {
            role: "userrole".into(),
            operations: vec![Operation::Read],
            selectors: vec!["user".into()],
        }]
    }

    fn cap(user_id: &str) -> Capability {
        let mut c = Capability::with_role("userrole");
        c.put_selector("user", user_id);
        c
    }

    fn params(user_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("user_id".to_owned(), user_id.to_owned())])
    }

    #[test]
    fn matching_selector_allows_read() {
        assert!(is_authorized(
            &cap("u-1"),
            Operation::Read,
            &params("u-1"),
            &permits(),
            false,
        ));
    }

    #[test]
    fn operation_not_granted_denies() {
        assert!(!is_authorized(
            &cap("u-1"),
            Operation::Update,
            &params("u-1"),
            &permits(),
            false,
        ));
    }

    #[test]
    fn selector_mismatch_denies() {
        assert!(!is_authorized(
            &cap("u-1"),
            Operation::Read,
            &params("u-2"),
            &permits(),
            false,
        ));
    }

    #[test]
    fn missing_selector_denies() {
        let c = Capability::with_role("userrole");
        assert!(!is_authorized(
            &c,
            Operation::Read,
            &params("u-1"),
            &permits(),
            false,
        ));
    }

    #[test]
    fn admin_bypasses_permits() {
        let c = Capability::with_role("admin");
        assert!(is_authorized(
            &c,
            Operation::Delete,
            &params("u-1"),
            &permits(),
            false,
        ));
    }

    #[test]
    fn restricted_admin_is_an_ordinary_role() {
        let c = Capability::with_role("admin");
        assert!(!is_authorized(
            &c,
            Operation::Delete,
            &params("u-1"),
            &permits(),
            true,
        ));

        // An explicit admin permit still applies.
        let explicit = vec![Permit {
            role: "admin".into(),
            operations: vec![Operation::Delete],
            selectors: vec![],
        }];
        assert!(is_authorized(
            &c,
            Operation::Delete,
            &params("u-1"),
            &explicit,
            true,
        ));
    }

    #[test]
    fn everybody_requires_some_role() {
        let permits = vec![Permit {
            role: "everybody".into(),
            operations: vec![Operation::List],
            selectors: vec![],
        }];
        let anonymous = Capability::default();
        assert!(!is_authorized(
            &anonymous,
            Operation::List,
            &BTreeMap::new(),
            &permits,
            false,
        ));
        let somebody = Capability::with_role("whatever");
        assert!(is_authorized(
            &somebody,
            Operation::List,
            &BTreeMap::new(),
            &permits,
            false,
        ));
    }

    #[test]
    fn public_matches_anonymous_callers() {
        let permits = vec![Permit {
            role: "public".into(),
            operations: vec![Operation::Read],
            selectors: vec![],
        }];
        assert!(is_authorized(
            &Capability::default(),
            Operation::Read,
            &BTreeMap::new(),
            &permits,
            false,
        ));
    }

    #[test]
    fn evaluation_is_replayable() {
        // Property: same inputs, same outcome.
        let c = cap("u-1");
        let p = params("u-1");
        let permits = permits();
        let first = is_authorized(&c, Operation::Read, &p, &permits, false);
        for _ in 0..10 {
            assert_eq!(is_authorized(&c, Operation::Read, &p, &permits, false), first);
        }
    }

    #[test]
    fn selector_names_normalize_to_id_suffix() {
        let mut c = Capability::default();
        assert!(c.put_selector("user", "u-1"));
        assert_eq!(c.selector("user"), Some("u-1"));
        assert_eq!(c.selector("user_id"), Some("u-1"));

        // Conflicting overwrite is refused, idempotent re-set is fine.
        assert!(!c.put_selector("user_id", "u-2"));
        assert!(c.put_selector("user_id", "u-1"));
        assert_eq!(c.selector("user"), Some("u-1"));
    }
}
