//! The device-twin REST surface.
//!
//! Five operations under the device item route, all requiring the `admin`
//! role when authorization is enforced. Request writes are bridged to the
//! MQTT side through the [`Publisher`](kurbisio_core::Publisher) seam at
//! quality-of-service 1; report writes obey the idempotence rule enforced
//! by the twin store.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::debug;
use uuid::Uuid;

use kurbisio_core::error::json_response;
use kurbisio_core::publish::twin_request_topic;
use kurbisio_core::{ApiError, Capability};
use kurbisio_db::SqlValue;

use crate::engine::BackendState;
use crate::row::parse_id;

/// Which side of the twin a fragment route addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinSide {
    Request,
    Report,
}

fn require_admin(state: &BackendState, cap: &Capability) -> Result<(), ApiError> {
    if state.enforce && !cap.is_admin() {
        return Err(ApiError::Unauthorized("unauthorized".into()));
    }
    Ok(())
}

/// The referenced device row must exist; twin writes against unknown
/// devices are input errors, not not-found.
async fn ensure_device(state: &BackendState, device_id: Uuid) -> Result<(), ApiError> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE \"device_id\" = $1",
        state.driver.qualify("device")
    );
    if state
        .driver
        .query_row_opt(&sql, &[SqlValue::Uuid(device_id)])
        .await?
        .is_none()
    {
        return Err(ApiError::BadRequest("no such device".into()));
    }
    Ok(())
}

fn parse_body(body: &Bytes) -> Result<serde_json::Value, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest("invalid JSON".into()))
}

/// `GET /devices/{device_id}/twin`: all twin entries of the device.
pub async fn list(
    state: BackendState,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    require_admin(&state, &cap)?;
    let device_id = parse_id(&params, "device_id")?;
    ensure_device(&state, device_id).await?;
    let entries = state.twin.list(device_id).await?;
    let items: Vec<serde_json::Value> = entries.iter().map(|e| e.to_json()).collect();
    Ok(json_response(StatusCode::OK, &serde_json::Value::Array(items)))
}

/// `GET /devices/{device_id}/twin/{key}`: one entry.
pub async fn get(
    state: BackendState,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    require_admin(&state, &cap)?;
    let device_id = parse_id(&params, "device_id")?;
    let key = params
        .get("key")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("missing key".into()))?;
    let entry = state
        .twin
        .get(device_id, &key)
        .await?
        .ok_or_else(|| ApiError::NotFound("no such twin entry".into()))?;
    Ok(json_response(StatusCode::OK, &entry.to_json()))
}

/// `GET /devices/{device_id}/twin/{key}/request|report`: the respective
/// JSON fragment.
pub async fn get_fragment(
    state: BackendState,
    params: HashMap<String, String>,
    cap: Capability,
    side: TwinSide,
) -> Result<Response, ApiError> {
    require_admin(&state, &cap)?;
    let device_id = parse_id(&params, "device_id")?;
    let key = params
        .get("key")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("missing key".into()))?;
    let entry = state
        .twin
        .get(device_id, &key)
        .await?
        .ok_or_else(|| ApiError::NotFound("no such twin entry".into()))?;
    let fragment = match side {
        TwinSide::Request => entry.request,
        TwinSide::Report => entry.report,
    };
    let fragment = fragment.ok_or_else(|| ApiError::NotFound("no such twin entry".into()))?;
    Ok(json_response(StatusCode::OK, &fragment))
}

/// `PUT /devices/{device_id}/twin/{key}/request`: upsert the request side
/// and forward it to the device.
pub async fn put_request(
    state: BackendState,
    params: HashMap<String, String>,
    cap: Capability,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_admin(&state, &cap)?;
    let device_id = parse_id(&params, "device_id")?;
    let key = params
        .get("key")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("missing key".into()))?;
    let request = parse_body(&body)?;
    ensure_device(&state, device_id).await?;

    state.twin.put_request(device_id, &key, &request).await?;

    let payload = serde_json::to_vec(&request)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state
        .publisher
        .publish_qos1(&twin_request_topic(device_id, &key), payload);
    debug!(%device_id, key, "twin request stored and published");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `PUT /devices/{device_id}/twin/{key}/report`: upsert the report side;
/// an unchanged report does not advance `reported_at`.
pub async fn put_report(
    state: BackendState,
    params: HashMap<String, String>,
    cap: Capability,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_admin(&state, &cap)?;
    let device_id = parse_id(&params, "device_id")?;
    let key = params
        .get("key")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("missing key".into()))?;
    let report = parse_body(&body)?;
    ensure_device(&state, device_id).await?;

    let written = state.twin.put_report(device_id, &key, &report).await?;
    debug!(%device_id, key, written, "twin report handled");
    Ok(StatusCode::NO_CONTENT.into_response())
}
