//! The request pipeline around the generated router.
//!
//! Order, outermost first: panic trap → request logging → request-id →
//! authentication → shortcut rewriting → routing. The shortcut rewrite has
//! to run before routing (it changes the URI), which is why the resource
//! router is mounted as a fallback service behind the middleware stack
//! instead of being layered directly.

use std::any::Any;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use kurbisio_access::{authenticate, AccessState};
use kurbisio_core::config::ShortcutConfig;
use kurbisio_core::error::json_response;
use kurbisio_core::{ident, ApiError, Capability};

static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// A request identifier: propagated from the incoming `X-Request-Id`
/// header or generated as a UUID v4. Extractable in handlers, echoed on
/// the response.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestId {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(|| RequestId(uuid::Uuid::new_v4().to_string())))
    }
}

/// Middleware injecting the request id.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let request_id = RequestId(id);
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}

/// The configured URL shortcuts.
pub struct ShortcutTable {
    pub entries: Vec<ShortcutConfig>,
}

/// Middleware rewriting shortcut prefixes using the caller's selectors:
/// `/user/…` becomes `/users/{user_id}/…` when the capability carries
/// `user_id`. Runs after authentication and before routing; requests whose
/// capability lacks the selector pass through unchanged.
pub async fn rewrite_shortcuts(
    State(shortcuts): State<Arc<ShortcutTable>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    for shortcut in &shortcuts.entries {
        let prefix = format!("/{}", shortcut.shortcut);
        let rest = if path == prefix {
            ""
        } else if let Some(rest) = path.strip_prefix(&format!("{prefix}/")) {
            rest
        } else {
            continue;
        };
        let Some(capability) = request.extensions().get::<Capability>() else {
            break;
        };
        let Some(id) = capability.selector(&shortcut.resource) else {
            break;
        };
        let mut rewritten = format!("/{}/{}", ident::plural(&shortcut.resource), id);
        if !rest.is_empty() {
            rewritten.push('/');
            rewritten.push_str(rest);
        }
        if let Some(query) = request.uri().query() {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        match rewritten.parse() {
            Ok(uri) => {
                debug!(from = path, to = rewritten, "shortcut rewritten");
                *request.uri_mut() = uri;
            }
            Err(_) => break,
        }
        break;
    }
    next.run(request).await
}

/// Panics inside handlers become coded internal errors; they never
/// terminate the process.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("panic");
    error!(detail, "handler panicked");
    ApiError::internal(format!("handler panicked: {detail}")).into_response()
}

/// `GET /version`.
pub async fn version() -> Response {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "service": "kurbisio",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Wrap the resource router with the full middleware stack.
pub fn apply(
    resources: Router,
    access: Arc<AccessState>,
    shortcuts: Arc<ShortcutTable>,
) -> Router {
    Router::new().fallback_service(resources).layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(request_id))
            .layer(axum::middleware::from_fn_with_state(access, authenticate))
            .layer(axum::middleware::from_fn_with_state(
                shortcuts,
                rewrite_shortcuts,
            )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn echo_path(request: Request) -> String {
        request.uri().path().to_owned()
    }

    fn shortcut_router(entries: Vec<ShortcutConfig>, capability: Option<Capability>) -> Router {
        let table = Arc::new(ShortcutTable { entries });
        // Layers run outermost-last-added: the capability injector must sit
        // outside the rewrite, like the real authentication middleware does.
        Router::new()
            .fallback_service(Router::new().route("/{*rest}", get(echo_path)))
            .layer(axum::middleware::from_fn_with_state(table, rewrite_shortcuts))
            .layer(axum::middleware::from_fn(
                move |mut request: Request, next: Next| {
                    let capability = capability.clone();
                    async move {
                        if let Some(capability) = capability {
                            request.extensions_mut().insert(capability);
                        }
                        next.run(request).await
                    }
                },
            ))
    }

    async fn body_of(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn shortcut_rewrites_with_selector() {
        let mut capability = Capability::with_role("userrole");
        capability.put_selector("user", "11111111-1111-1111-1111-111111111111");
        let router = shortcut_router(
            vec![ShortcutConfig {
                shortcut: "user".into(),
                resource: "user".into(),
            }],
            Some(capability),
        );
        let response = router
            .oneshot(Request::builder().uri("/user/profile").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            body_of(response).await,
            "/users/11111111-1111-1111-1111-111111111111/profile"
        );
    }

    #[tokio::test]
    async fn shortcut_without_selector_passes_through() {
        let router = shortcut_router(
            vec![ShortcutConfig {
                shortcut: "user".into(),
                resource: "user".into(),
            }],
            Some(Capability::with_role("userrole")),
        );
        let response = router
            .oneshot(Request::builder().uri("/user/profile").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "/user/profile");
    }

    #[tokio::test]
    async fn plural_prefix_is_not_a_shortcut() {
        let mut capability = Capability::default();
        capability.put_selector("user", "u");
        let router = shortcut_router(
            vec![ShortcutConfig {
                shortcut: "user".into(),
                resource: "user".into(),
            }],
            Some(capability),
        );
        let response = router
            .oneshot(Request::builder().uri("/users/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "/users/x");
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let router: Router = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn(request_id));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("x-request-id", "fixed-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "fixed-id");
    }
}
