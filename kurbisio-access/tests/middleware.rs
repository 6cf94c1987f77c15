//! Middleware-chain tests over an in-process router. No request in here is
//! allowed to reach the database; the pool is created lazily and every case
//! resolves from headers and configuration alone.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

use kurbisio_access::{
    authenticate, AccessConfig, AccessState, ApplicationToken, ApplicationTokenConfig, Auth,
    CapabilityCache, ThingAuthConfig,
};
use kurbisio_db::Driver;

async fn whoami(Auth(capability): Auth) -> String {
    serde_json::json!({
        "roles": capability.roles,
        "selectors": capability.selectors,
    })
    .to_string()
}

fn router(config: AccessConfig) -> Router {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://postgres@localhost/kurbisio_test")
        .unwrap();
    let state = Arc::new(AccessState {
        config,
        cache: CapabilityCache::default(),
        jwt: None,
        driver: Arc::new(Driver::from_pool(pool, "backend")),
    });
    Router::new()
        .route("/whoami", get(whoami))
        .layer(axum::middleware::from_fn_with_state(state, authenticate))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn thing_config() -> AccessConfig {
    AccessConfig {
        thing: Some(ThingAuthConfig {
            key: "secret".into(),
        }),
        ..AccessConfig::default()
    }
}

#[tokio::test]
async fn anonymous_requests_carry_an_empty_capability() {
    let response = router(AccessConfig::default())
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["roles"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn thing_headers_resolve_to_the_thing_role() {
    let response = router(thing_config())
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("Kurbisio-Thing-Key", "secret")
                .header("Kurbisio-Thing-Identifier", "T1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["roles"], serde_json::json!(["thing"]));
    assert_eq!(json["selectors"]["thing"], "T1");
}

#[tokio::test]
async fn a_wrong_thing_key_is_unauthenticated() {
    let response = router(thing_config())
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("Kurbisio-Thing-Key", "wrong")
                .header("Kurbisio-Thing-Identifier", "T1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn a_bearer_token_without_jwt_configuration_is_unauthenticated() {
    let response = router(AccessConfig::default())
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("authorization", "Bearer not.a.jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn require_token_rejects_requests_without_an_application_token() {
    let mut config = AccessConfig::default();
    config.application_tokens = Some(ApplicationTokenConfig {
        require_token: true,
        tokens: vec![ApplicationToken {
            token: "app-1".into(),
            roles: vec!["*".into()],
        }],
    });
    let response = router(config)
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn application_tokens_intersect_the_role_set() {
    let mut config = thing_config();
    config.application_tokens = Some(ApplicationTokenConfig {
        require_token: false,
        tokens: vec![
            ApplicationToken {
                token: "narrow".into(),
                roles: vec!["somethingelse".into()],
            },
            ApplicationToken {
                token: "wide".into(),
                roles: vec!["*".into()],
            },
        ],
    });

    // The narrow token removes roles outside its allow-list.
    let response = router(config.clone())
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("Kurbisio-Thing-Key", "secret")
                .header("Kurbisio-Thing-Identifier", "T1")
                .header("X-Application-Token", "narrow")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["roles"].as_array().unwrap().len(), 0);

    // The wildcard token filters nothing.
    let response = router(config)
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("Kurbisio-Thing-Key", "secret")
                .header("Kurbisio-Thing-Identifier", "T1")
                .header("X-Application-Token", "wide")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["roles"], serde_json::json!(["thing"]));
}
