//! Engine-level tests that exercise compilation and the generated route
//! graph without a live database: the pool is created lazily and no
//! request in here is allowed to reach a statement; authorization and
//! routing decide first.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

use kurbisio_backend::{Backend, BackendState, ResourceKind};
use kurbisio_core::{BackendConfig, Capability, NoopPublisher};
use kurbisio_db::{Driver, TwinStore};

fn test_driver() -> Arc<Driver> {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://postgres@localhost/kurbisio_test")
        .unwrap();
    Arc::new(Driver::from_pool(pool, "backend"))
}

fn test_config() -> BackendConfig {
    let mut config = BackendConfig::from_json(
        r#"{
            "collections": [
                {"resource": "a", "external_unique_indices": ["external_id"], "extra_properties": ["extra_prop"]},
                {"resource": "b"},
                {"resource": "b/c"},
                {"resource": "b/c/d"},
                {"resource": "user"}
            ],
            "singletons": [
                {"resource": "user/profile"}
            ],
            "relations": [
                {"resource": "user", "origin": "a"}
            ]
        }"#,
    )
    .unwrap();
    config.ensure_device_collection();
    config
}

fn test_backend() -> (Backend, BackendState) {
    let driver = test_driver();
    let backend = Backend::new(driver.clone(), &test_config()).unwrap();
    let state = BackendState {
        driver: driver.clone(),
        twin: TwinStore::new(driver),
        publisher: Arc::new(NoopPublisher),
        enforce: true,
        credentials: None,
    };
    (backend, state)
}

/// Router with the capability of choice injected, bypassing the real
/// authentication middleware.
fn router_with_capability(capability: Option<Capability>) -> axum::Router {
    let (backend, state) = test_backend();
    let router = backend.router(state);
    match capability {
        None => router,
        Some(capability) => router.layer(axum::middleware::from_fn(
            move |mut request: axum::extract::Request, next: axum::middleware::Next| {
                let capability = capability.clone();
                async move {
                    request.extensions_mut().insert(capability);
                    next.run(request).await
                }
            },
        )),
    }
}

#[tokio::test]
async fn resources_are_ordered_for_ddl() {
    let (backend, _) = test_backend();
    let paths: Vec<usize> = backend.resources().iter().map(|s| s.path.len()).collect();
    let mut sorted = paths.clone();
    sorted.sort_unstable();
    assert_eq!(paths, sorted, "parents must come before children");
}

#[tokio::test]
async fn singleton_and_collection_kinds() {
    let (backend, _) = test_backend();
    let kinds: HashMap<&str, ResourceKind> = backend
        .resources()
        .iter()
        .map(|s| (s.resource.as_str(), s.kind))
        .collect();
    assert_eq!(kinds["user/profile"], ResourceKind::Singleton);
    assert_eq!(kinds["b/c/d"], ResourceKind::Collection);
}

#[tokio::test]
async fn relation_routes_nest_under_the_resource() {
    let (backend, _) = test_backend();
    let relation = &backend.relations()[0];
    assert_eq!(relation.list_route, "/users/{user_id}/as");
    assert_eq!(relation.item_route, "/users/{user_id}/as/{a_id}");
}

#[tokio::test]
async fn version_endpoint_answers() {
    let router = router_with_capability(None);
    let response = router
        .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let router = router_with_capability(None);
    let response = router
        .oneshot(Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unrecognized_method_on_an_existing_route() {
    let router = router_with_capability(None);
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn anonymous_callers_are_denied_without_permits() {
    let router = router_with_capability(None);
    let response = router
        .oneshot(Request::builder().uri("/as").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn twin_routes_require_admin() {
    let device_id = uuid::Uuid::new_v4();
    let router = router_with_capability(Some(Capability::with_role("userrole")));
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/devices/{device_id}/twin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bad_leaf_ids_are_rejected_before_storage() {
    let router = router_with_capability(Some(Capability::with_role("admin")));
    let response = router
        .oneshot(
            Request::builder()
                .uri("/as/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_rejects_malformed_json_before_storage() {
    let router = router_with_capability(Some(Capability::with_role("admin")));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/as")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_rejects_missing_required_property_before_storage() {
    let router = router_with_capability(Some(Capability::with_role("admin")));
    let body = serde_json::json!({"external_id": "e1"});
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/as")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn put_on_collection_requires_the_leaf_id() {
    let router = router_with_capability(Some(Capability::with_role("admin")));
    let body = serde_json::json!({"external_id": "e1", "extra_prop": "x"});
    let response = router
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/as")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn parent_id_mismatch_is_a_bad_request() {
    let b_in_url = uuid::Uuid::new_v4();
    let b_in_body = uuid::Uuid::new_v4();
    let router = router_with_capability(Some(Capability::with_role("admin")));
    let body = serde_json::json!({"b_id": b_in_body.to_string()});
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/bs/{b_in_url}/cs"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn singleton_route_is_registered() {
    let user_id = uuid::Uuid::new_v4();
    let router = router_with_capability(None);
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/users/{user_id}/profile"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // Authorization runs before storage: the route exists, the anonymous
    // caller is denied.
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn compact_property_routes_are_registered() {
    let a_id = uuid::Uuid::new_v4();
    let router = router_with_capability(None);
    let response = router
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/as/{a_id}/extra_prop/x2"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn relation_routes_are_registered() {
    let user_id = uuid::Uuid::new_v4();
    let a_id = uuid::Uuid::new_v4();
    let router = router_with_capability(None);
    let response = router
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/users/{user_id}/as/{a_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn credentials_route_is_absent_without_a_certificate_authority() {
    let router = router_with_capability(Some(Capability::with_role("thing")));
    let response = router
        .oneshot(Request::builder().uri("/credentials").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
