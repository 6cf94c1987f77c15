//! Declarative access configuration.

use serde::{Deserialize, Serialize};

/// JWT bearer authentication against an external issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// URL of the issuer's JWKS document.
    pub jwks_url: String,
    pub issuer: String,
    pub audience: String,
}

/// Shared-secret thing authentication (`Kurbisio-Thing-Key` header).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThingAuthConfig {
    /// The shared secret things present to identify themselves.
    pub key: String,
}

/// One configured application token and the roles it admits.
///
/// A role list of `["*"]` disables filtering for this token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationToken {
    pub token: String,
    pub roles: Vec<String>,
}

/// The `X-Application-Token` extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationTokenConfig {
    /// Reject requests without a known application token.
    #[serde(default)]
    pub require_token: bool,
    #[serde(default)]
    pub tokens: Vec<ApplicationToken>,
}

impl ApplicationTokenConfig {
    pub fn lookup(&self, token: &str) -> Option<&ApplicationToken> {
        self.tokens.iter().find(|t| t.token == token)
    }
}

/// Dynamic authorization: enrich the capability from a companion roles
/// collection when the request targets a configured resource.
///
/// For a request under `/plural(target)/{id}/…` the middleware reads the
/// `roles_collection` rows with `{target}_id = id` and
/// `{selector}_id = capability.{selector}_id`; every row whose `roles`
/// property intersects `roles` contributes those roles, and `{target}_id`
/// is recorded as a selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicAuthConfig {
    /// The target collection, e.g. `"organization"`.
    pub target: String,
    /// The companion roles collection, e.g. `"organization/member"`.
    pub roles_collection: String,
    /// The capability selector used to filter the companion rows,
    /// e.g. `"user"`.
    pub selector: String,
    /// Allow-list of roles the enrichment may append.
    pub roles: Vec<String>,
}

/// The full access configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    /// When false, permits are not evaluated and every capability passes.
    /// Meant for tests and local development.
    #[serde(default = "default_enforce")]
    pub enforce: bool,
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
    #[serde(default)]
    pub thing: Option<ThingAuthConfig>,
    #[serde(default)]
    pub application_tokens: Option<ApplicationTokenConfig>,
    #[serde(default)]
    pub dynamic: Vec<DynamicAuthConfig>,
    /// Collection with a `token` external index used for
    /// `Authorization: AuthToken: <token>` callers, e.g. `"account"`.
    #[serde(default)]
    pub auth_token_collection: Option<String>,
}

fn default_enforce() -> bool {
    true
}
