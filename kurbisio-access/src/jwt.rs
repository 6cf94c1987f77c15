//! JWT validation with registry-backed key material.
//!
//! Signing keys are fetched from the issuer's JWKS endpoint and persisted
//! through the [`Registry`] so that the fetched document and its timestamp
//! are shared between replicas. A refresh happens on startup and afterwards
//! only when the registry timestamp is older than six hours at the moment of
//! the check, or when a token presents an unknown key id. The refresh is
//! not guarded by a distributed lock; concurrent refreshes write the same
//! document and are idempotent.

use std::collections::HashMap;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use kurbisio_core::Capability;
use kurbisio_db::Registry;

use crate::config::JwtConfig;
use crate::error::AccessError;

/// Key material older than this is refreshed at the next check.
const REFRESH_AFTER_SECS: i64 = 6 * 60 * 60;

/// Registry key the JWKS document is stored under (prefix-scoped).
const REGISTRY_KEY: &str = "keys";

/// Raw JWK structure as returned by a JWKS endpoint. Only the components
/// needed for RSA verification are captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// Stored components of one key; a `DecodingKey` is rebuilt on demand since
/// it does not implement `Clone`.
#[derive(Debug, Clone)]
struct CachedJwk {
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

impl CachedJwk {
    fn to_decoding_key(&self) -> Result<DecodingKey, AccessError> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self
                    .n
                    .as_deref()
                    .ok_or_else(|| AccessError::KeysFetch("RSA key missing 'n'".into()))?;
                let e = self
                    .e
                    .as_deref()
                    .ok_or_else(|| AccessError::KeysFetch("RSA key missing 'e'".into()))?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|err| AccessError::KeysFetch(format!("bad RSA components: {err}")))
            }
            other => Err(AccessError::KeysFetch(format!("unsupported key type: {other}"))),
        }
    }
}

/// Validates bearer JWTs against the configured issuer.
pub struct JwtValidator {
    config: JwtConfig,
    registry: Registry,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, CachedJwk>>,
    refresh_lock: Mutex<()>,
}

impl JwtValidator {
    /// Create a validator and load key material (from the registry when
    /// fresh, from the JWKS endpoint otherwise).
    pub async fn new(config: JwtConfig, registry: Registry) -> Result<Self, AccessError> {
        let validator = Self {
            config,
            registry,
            client: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        };
        validator.refresh(false).await?;
        Ok(validator)
    }

    fn age_secs(updated_at: chrono::NaiveDateTime) -> i64 {
        (chrono::Utc::now().naive_utc() - updated_at).num_seconds()
    }

    /// Reload the in-memory key map. Uses the registry copy when it is
    /// younger than the staleness bound (and `force` is not set); fetches
    /// and persists otherwise.
    async fn refresh(&self, force: bool) -> Result<(), AccessError> {
        let _guard = self.refresh_lock.lock().await;

        let stored = self.registry.read(REGISTRY_KEY).await?;
        let document = match stored {
            Some((value, updated_at)) if !force && Self::age_secs(updated_at) < REFRESH_AFTER_SECS => {
                debug!(age_secs = Self::age_secs(updated_at), "using registry key material");
                serde_json::from_value::<JwksDocument>(value)
                    .map_err(|e| AccessError::KeysFetch(format!("stored JWKS unreadable: {e}")))?
            }
            _ => {
                let document = self.fetch().await?;
                let value = serde_json::to_value(&document)
                    .map_err(|e| AccessError::KeysFetch(e.to_string()))?;
                self.registry.write(REGISTRY_KEY, &value).await?;
                debug!(keys = document.keys.len(), "refreshed key material");
                document
            }
        };

        let mut keys = HashMap::new();
        for jwk in document.keys {
            if let Some(kid) = &jwk.kid {
                keys.insert(
                    kid.clone(),
                    CachedJwk {
                        kty: jwk.kty.clone(),
                        n: jwk.n.clone(),
                        e: jwk.e.clone(),
                    },
                );
            }
        }
        *self.keys.write().await = keys;
        Ok(())
    }

    async fn fetch(&self) -> Result<JwksDocument, AccessError> {
        let response = self
            .client
            .get(&self.config.jwks_url)
            .send()
            .await
            .map_err(|e| AccessError::KeysFetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| AccessError::KeysFetch(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| AccessError::KeysFetch(format!("failed to parse JWKS: {e}")))
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, AccessError> {
        if let Some(jwk) = self.keys.read().await.get(kid) {
            return jwk.to_decoding_key();
        }
        // Unknown kid: the issuer may have rotated. One forced refresh.
        self.refresh(true).await?;
        self.keys
            .read()
            .await
            .get(kid)
            .ok_or_else(|| AccessError::UnknownKeyId(kid.to_owned()))?
            .to_decoding_key()
    }

    /// Validate a token and return the raw claims.
    pub async fn validate(&self, token: &str) -> Result<serde_json::Value, AccessError> {
        // Opportunistic staleness check; errors here must not fail a request
        // that can still be validated with the current key set.
        if let Ok(Some((_, updated_at))) = self.registry.read(REGISTRY_KEY).await {
            if Self::age_secs(updated_at) >= REFRESH_AFTER_SECS {
                if let Err(err) = self.refresh(false).await {
                    warn!(error = %err, "key refresh failed, keeping current key set");
                }
            }
        }

        let header = decode_header(token)
            .map_err(|e| AccessError::InvalidToken(format!("bad header: {e}")))?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(AccessError::InvalidToken(format!(
                "disallowed algorithm: {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AccessError::InvalidToken("missing kid".into()))?;
        let key = self.key_for(kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.validate_exp = true;

        let data = decode::<serde_json::Value>(token, &key, &validation).map_err(|e| {
            let err = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AccessError::TokenExpired,
                _ => AccessError::InvalidToken(e.to_string()),
            };
            warn!(error = %err, "JWT validation failed");
            err
        })?;
        debug!(sub = data.claims.get("sub").and_then(|v| v.as_str()).unwrap_or("unknown"),
               "JWT validated");
        Ok(data.claims)
    }
}

/// Build a capability from validated claims: the `roles` claim becomes the
/// role set, every string claim ending in `_id` becomes a selector.
pub fn capability_from_claims(claims: &serde_json::Value) -> Capability {
    let mut capability = Capability::default();
    if let Some(roles) = claims.get("roles").and_then(|v| v.as_array()) {
        for role in roles.iter().filter_map(|r| r.as_str()) {
            capability.add_role(role);
        }
    }
    if let Some(object) = claims.as_object() {
        for (key, value) in object {
            if key.ends_with("_id") {
                if let Some(value) = value.as_str() {
                    capability.put_raw_selector(key, value);
                }
            }
        }
    }
    capability
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_map_to_roles_and_selectors() {
        let claims = serde_json::json!({
            "sub": "u-1",
            "roles": ["userrole", "auditor"],
            "user_id": "11111111-1111-1111-1111-111111111111",
            "exp": 2_000_000_000u64,
        });
        let capability = capability_from_claims(&claims);
        assert!(capability.has_role("userrole"));
        assert!(capability.has_role("auditor"));
        assert_eq!(
            capability.selector("user"),
            Some("11111111-1111-1111-1111-111111111111")
        );
        // "sub" is not a selector.
        assert!(capability.selector("sub").is_none());
    }

    #[test]
    fn duplicate_roles_collapse() {
        let claims = serde_json::json!({"roles": ["a", "a", "b"]});
        let capability = capability_from_claims(&claims);
        assert_eq!(capability.roles, vec!["a", "b"]);
    }
}
