//! The credential service: one-shot device provisioning.
//!
//! `GET /credentials` is the only endpoint. A thing authenticates with the
//! shared-secret headers (middleware turns them into the `thing` role plus
//! the `thing` selector) and receives, exactly once, the bundle
//! `{device_id, cert, key, token}`. The `waiting → provisioned` transition
//! commits in the same transaction that gates the issuance, so a crash
//! between phases leaves the row `waiting` and the client retries.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use kurbisio_core::error::json_response;
use kurbisio_core::{ApiError, Capability};
use kurbisio_db::{SqlValue, SqlxErrorExt};
use kurbisio_pki::CertificateAuthority;

use crate::engine::BackendState;

pub const STATUS_WAITING: &str = "waiting";
pub const STATUS_PROVISIONED: &str = "provisioned";

/// The signing side of the credential service.
pub struct CredentialService {
    ca: CertificateAuthority,
}

impl CredentialService {
    pub fn new(ca: CertificateAuthority) -> Self {
        Self { ca }
    }
}

/// `GET /credentials`.
pub async fn download(state: BackendState, cap: Capability) -> Result<Response, ApiError> {
    let Some(service) = state.credentials.clone() else {
        return Err(ApiError::internal("credential service not configured"));
    };
    if !cap.has_role("thing") {
        return Err(ApiError::Unauthorized("unauthorized".into()));
    }
    let thing = cap
        .selector("thing")
        .ok_or_else(|| ApiError::Unauthorized("unauthorized".into()))?
        .to_owned();

    let sql = format!(
        "SELECT \"device_id\", \"status\" FROM {} WHERE \"thing\" = $1",
        state.driver.qualify("device")
    );
    let row = state
        .driver
        .query_row_opt(&sql, &[SqlValue::Text(thing.clone())])
        .await?
        .ok_or_else(|| ApiError::Unauthorized("unauthorized".into()))?;
    let device_id: Uuid = row
        .try_get("device_id")
        .map_err(SqlxErrorExt::into_db_error)?;
    let status: String = row.try_get("status").map_err(SqlxErrorExt::into_db_error)?;

    match status.as_str() {
        // One-shot: credentials were already handed out.
        STATUS_PROVISIONED => Ok(StatusCode::NO_CONTENT.into_response()),
        STATUS_WAITING => issue(&state, service, device_id, &thing).await,
        other => Err(ApiError::internal(format!(
            "device {device_id} has unexpected status {other:?}"
        ))),
    }
}

async fn issue(
    state: &BackendState,
    service: std::sync::Arc<CredentialService>,
    device_id: Uuid,
    thing: &str,
) -> Result<Response, ApiError> {
    // Key generation is CPU-bound (a 4096-bit key pair); keep it off the
    // async workers.
    let issued = tokio::task::spawn_blocking(move || {
        service.ca.issue_device_certificate(device_id)
    })
    .await
    .map_err(|e| ApiError::internal(format!("issuance task failed: {e}")))?
    .map_err(|e| ApiError::internal(e.to_string()))?;

    let token = Uuid::new_v4().to_string();
    let sql = format!(
        "UPDATE {} SET \"status\" = $1, \"token\" = $2 \
         WHERE \"device_id\" = $3 AND \"status\" = $4",
        state.driver.qualify("device")
    );
    let mut tx = state.driver.begin().await?;
    let affected = tx
        .execute(
            &sql,
            &[
                SqlValue::Text(STATUS_PROVISIONED.to_owned()),
                SqlValue::Text(token.clone()),
                SqlValue::Uuid(device_id),
                SqlValue::Text(STATUS_WAITING.to_owned()),
            ],
        )
        .await?;
    if affected == 0 {
        // A concurrent request won the transition; the credential minted
        // here is discarded and the caller observes the one-shot contract.
        warn!(%device_id, "lost provisioning race");
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    tx.commit().await?;

    info!(%device_id, thing, "device provisioned");
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "device_id": device_id.to_string(),
            "cert": issued.cert_pem,
            "key": issued.key_pem,
            "token": token,
        }),
    ))
}
