//! The authentication middleware chain.
//!
//! One middleware resolves whatever credential the request carries into a
//! [`Capability`], applies the application-token filter and the dynamic
//! enrichment, and attaches the result as a request extension. Handlers
//! pull it back out with the [`Auth`] extractor and evaluate permits; the
//! middleware itself rejects only requests whose credentials are present
//! but invalid (and `require_token` violations).
//!
//! Credential precedence, first match wins: admin backdoor (feature-gated),
//! JWT bearer/cookie, `Authorization: AuthToken:`, `Kurbisio-Device-Token`,
//! thing headers. A request without credentials proceeds with an empty
//! capability so `public` permits still apply.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{HeaderMap, AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};
use uuid::Uuid;

use kurbisio_core::ident;
use kurbisio_core::{ApiError, Capability};
use kurbisio_db::{Driver, SqlValue};
use sqlx::Row;

use crate::cache::CapabilityCache;
use crate::config::AccessConfig;
use crate::error::AccessError;
use crate::jwt::{capability_from_claims, JwtValidator};

/// Shared state of the authentication middleware.
pub struct AccessState {
    pub config: AccessConfig,
    pub cache: CapabilityCache,
    pub jwt: Option<JwtValidator>,
    pub driver: Arc<Driver>,
}

/// Extract the bearer token from `Authorization: Bearer …` or from the
/// `Kurbisio-JWT` cookie.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let mut parts = value.splitn(2, ' ');
        if let (Some(scheme), Some(token)) = (parts.next(), parts.next()) {
            if scheme.eq_ignore_ascii_case("bearer") {
                return Some(token.trim().to_owned());
            }
        }
    }
    cookie_value(headers, "Kurbisio-JWT")
}

/// Extract a long-lived token from `Authorization: AuthToken: …`.
pub fn auth_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("AuthToken:")?;
    Some(token.trim().to_owned())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    for cookie in cookies.split(';') {
        let mut parts = cookie.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(str::to_owned);
        }
    }
    None
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

impl AccessState {
    /// Resolve the request's credential to a capability.
    async fn resolve(&self, headers: &HeaderMap) -> Result<Capability, ApiError> {
        if let Some(token) = bearer_token(headers) {
            #[cfg(feature = "admin-backdoor")]
            if token == "please" {
                warn!("admin backdoor used");
                return Ok(Capability::with_role("admin"));
            }
            return self.resolve_jwt(&token).await.map_err(ApiError::from);
        }

        if let Some(token) = auth_token(headers) {
            return self.resolve_auth_token(&token).await.map_err(ApiError::from);
        }

        if let Some(token) = header(headers, "Kurbisio-Device-Token") {
            return self.resolve_device_token(&token).await.map_err(ApiError::from);
        }

        if let (Some(thing_config), Some(key), Some(identifier)) = (
            self.config.thing.as_ref(),
            header(headers, "Kurbisio-Thing-Key"),
            header(headers, "Kurbisio-Thing-Identifier"),
        ) {
            if key != thing_config.key {
                return Err(ApiError::Unauthorized("unauthorized".into()));
            }
            let mut capability = Capability::with_role("thing");
            capability.put_raw_selector("thing", &identifier);
            return Ok(capability);
        }

        Ok(Capability::default())
    }

    async fn resolve_jwt(&self, token: &str) -> Result<Capability, AccessError> {
        let cache_key = format!("jwt:{token}");
        if let Some(capability) = self.cache.get(&cache_key).await {
            return Ok(capability);
        }
        let validator = self
            .jwt
            .as_ref()
            .ok_or_else(|| AccessError::InvalidToken("JWT authentication not configured".into()))?;
        let claims = validator.validate(token).await?;
        let capability = capability_from_claims(&claims);
        self.cache.put(&cache_key, capability.clone()).await;
        Ok(capability)
    }

    async fn resolve_device_token(&self, token: &str) -> Result<Capability, AccessError> {
        if token.is_empty() {
            return Err(AccessError::InvalidToken("empty device token".into()));
        }
        let cache_key = format!("device:{token}");
        if let Some(capability) = self.cache.get(&cache_key).await {
            return Ok(capability);
        }
        let sql = format!(
            "SELECT device_id FROM {} WHERE token = $1",
            self.driver.qualify("device")
        );
        let row = self
            .driver
            .query_row_opt(&sql, &[SqlValue::Text(token.to_owned())])
            .await?
            .ok_or_else(|| AccessError::InvalidToken("unknown device token".into()))?;
        let device_id: Uuid = row
            .try_get("device_id")
            .map_err(kurbisio_db::SqlxErrorExt::into_db_error)?;
        let mut capability = Capability::with_role("device");
        capability.put_raw_selector("device_id", &device_id.to_string());
        self.cache.put(&cache_key, capability.clone()).await;
        debug!(%device_id, "device token resolved");
        Ok(capability)
    }

    async fn resolve_auth_token(&self, token: &str) -> Result<Capability, AccessError> {
        if token.is_empty() {
            return Err(AccessError::InvalidToken("empty auth token".into()));
        }
        let resource = self
            .config
            .auth_token_collection
            .as_deref()
            .ok_or_else(|| AccessError::InvalidToken("token authentication not configured".into()))?;
        let cache_key = format!("authtoken:{token}");
        if let Some(capability) = self.cache.get(&cache_key).await {
            return Ok(capability);
        }
        let path = ident::split(resource);
        let leaf = path.last().expect("validated resource path").clone();
        let table = ident::table_name(&path);
        let sql = format!(
            "SELECT {}, properties FROM {} WHERE token = $1",
            ident::id_column(&leaf),
            self.driver.qualify(&table)
        );
        let row = self
            .driver
            .query_row_opt(&sql, &[SqlValue::Text(token.to_owned())])
            .await?
            .ok_or_else(|| AccessError::InvalidToken("unknown auth token".into()))?;
        let id: Uuid = row
            .try_get(ident::id_column(&leaf).as_str())
            .map_err(kurbisio_db::SqlxErrorExt::into_db_error)?;
        let properties: serde_json::Value = row
            .try_get("properties")
            .map_err(kurbisio_db::SqlxErrorExt::into_db_error)?;

        let mut capability = Capability::default();
        if let Some(roles) = properties.get("roles").and_then(|v| v.as_array()) {
            for role in roles.iter().filter_map(|r| r.as_str()) {
                capability.add_role(role);
            }
        }
        capability.put_selector(&leaf, &id.to_string());
        self.cache.put(&cache_key, capability.clone()).await;
        Ok(capability)
    }

    /// Apply the `X-Application-Token` filter. Returns an error response for
    /// `require_token` violations.
    fn filter_application_token(
        &self,
        headers: &HeaderMap,
        capability: &mut Capability,
    ) -> Result<(), ApiError> {
        let Some(config) = self.config.application_tokens.as_ref() else {
            return Ok(());
        };
        let presented = header(headers, "X-Application-Token");
        let entry = presented.as_deref().and_then(|t| config.lookup(t));
        match entry {
            Some(entry) => {
                if !entry.roles.iter().any(|r| r == "*") {
                    capability.roles.retain(|r| entry.roles.contains(r));
                }
                Ok(())
            }
            None if config.require_token => {
                Err(ApiError::Unauthorized("application token required".into()))
            }
            None => Ok(()),
        }
    }

    /// Dynamic authorization: enrich the capability from companion roles
    /// collections. Idempotent, additive only; a pre-existing conflicting
    /// selector disables the enrichment for that target.
    async fn enrich(&self, path: &str, capability: &mut Capability) -> Result<(), AccessError> {
        for dynamic in &self.config.dynamic {
            let prefix = format!("/{}/", ident::plural(&dynamic.target));
            let Some(rest) = path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let id = rest.split('/').next().unwrap_or_default();
            let Ok(target_id) = Uuid::parse_str(id) else {
                continue;
            };
            if let Some(existing) = capability.selector(&dynamic.target) {
                if existing != id {
                    warn!(target = dynamic.target, "conflicting selector, enrichment skipped");
                    continue;
                }
            }
            let Some(selector_value) = capability.selector(&dynamic.selector).map(str::to_owned)
            else {
                continue;
            };

            let segments = ident::split(&dynamic.roles_collection);
            let table = ident::table_name(&segments);
            let sql = format!(
                "SELECT properties FROM {} WHERE {} = $1 AND {} = $2",
                self.driver.qualify(&table),
                ident::id_column(&dynamic.target),
                ident::id_column(&dynamic.selector),
            );
            let rows = self
                .driver
                .query(
                    &sql,
                    &[SqlValue::Uuid(target_id), SqlValue::Text(selector_value)],
                )
                .await?;

            let mut granted = false;
            for row in &rows {
                let properties: serde_json::Value = row
                    .try_get("properties")
                    .map_err(kurbisio_db::SqlxErrorExt::into_db_error)?;
                if let Some(roles) = properties.get("roles").and_then(|v| v.as_array()) {
                    for role in roles.iter().filter_map(|r| r.as_str()) {
                        if dynamic.roles.iter().any(|allowed| allowed == role) {
                            capability.add_role(role);
                            granted = true;
                        }
                    }
                }
            }
            if granted {
                capability.put_selector(&dynamic.target, id);
                debug!(target = dynamic.target, %target_id, "capability enriched");
            }
        }
        Ok(())
    }
}

/// The authentication middleware. Attach with
/// `axum::middleware::from_fn_with_state(state, authenticate)`.
pub async fn authenticate(
    State(state): State<Arc<AccessState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut capability = match state.resolve(request.headers()).await {
        Ok(capability) => capability,
        Err(err) => return err.into_response(),
    };

    if let Err(err) = state.filter_application_token(request.headers(), &mut capability) {
        return err.into_response();
    }

    let path = request.uri().path().to_owned();
    if let Err(err) = state.enrich(&path, &mut capability).await {
        return ApiError::from(err).into_response();
    }

    request.extensions_mut().insert(capability);
    next.run(request).await
}

/// Extractor handing handlers the capability the middleware attached.
/// Requests that never went through the middleware get an empty capability.
#[derive(Debug, Clone, Default)]
pub struct Auth(pub Capability);

impl<S: Send + Sync> FromRequestParts<S> for Auth {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Auth(
            parts.extensions.get::<Capability>().cloned().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_from_authorization_header() {
        let h = headers(&[("authorization", "Bearer abc.def.ghi")]);
        assert_eq!(bearer_token(&h).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn bearer_from_cookie() {
        let h = headers(&[("cookie", "foo=1; Kurbisio-JWT=tok; bar=2")]);
        assert_eq!(bearer_token(&h).as_deref(), Some("tok"));
    }

    #[test]
    fn header_beats_cookie() {
        let h = headers(&[
            ("authorization", "Bearer from-header"),
            ("cookie", "Kurbisio-JWT=from-cookie"),
        ]);
        assert_eq!(bearer_token(&h).as_deref(), Some("from-header"));
    }

    #[test]
    fn auth_token_scheme() {
        let h = headers(&[("authorization", "AuthToken: long-lived")]);
        assert_eq!(auth_token(&h).as_deref(), Some("long-lived"));
        // Bearer is not an auth token.
        let h = headers(&[("authorization", "Bearer x")]);
        assert!(auth_token(&h).is_none());
    }

    #[test]
    fn missing_credentials_yield_nothing() {
        let h = HeaderMap::new();
        assert!(bearer_token(&h).is_none());
        assert!(auth_token(&h).is_none());
    }
}
