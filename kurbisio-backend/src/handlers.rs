//! The generated resource handlers.
//!
//! One function per operation; the engine wraps each in a closure that
//! captures the `Arc<ResourceSpec>` and registers it on the router. All of
//! them follow the same shape: authorize against the resource's permits,
//! validate ids and body, run the statement family, translate storage
//! sentinels (`NotFound`, unique and foreign-key violations) into their
//! HTTP meanings.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use sqlx::Row;
use tracing::debug;

use kurbisio_core::error::json_response;
use kurbisio_core::{is_authorized, ApiError, Capability, Operation, Permit};
use kurbisio_db::{row_to_json, DbError, SqlValue};
use uuid::Uuid;

use crate::engine::BackendState;
use crate::pagination::{Cursor, LIMIT_PARAM, NEXT_TOKEN_HEADER, NEXT_TOKEN_PARAM};
use crate::row::{key_binds, parent_binds, parse_id, IdPolicy, ResourceRow};
use crate::spec::{RelationSpec, ResourceKind, ResourceSpec};

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Evaluate the resource's permits; denials render as unauthorized, exactly
/// like authentication failures.
pub(crate) fn authorize(
    state: &BackendState,
    cap: &Capability,
    op: Operation,
    params: &HashMap<String, String>,
    permits: &[Permit],
    restrict_admin: bool,
) -> Result<(), ApiError> {
    if !state.enforce {
        return Ok(());
    }
    let path_params: BTreeMap<String, String> =
        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    if is_authorized(cap, op, &path_params, permits, restrict_admin) {
        Ok(())
    } else {
        debug!(%op, "permit evaluation denied");
        Err(ApiError::Unauthorized("unauthorized".into()))
    }
}

/// The full URL-bound ancestor chain must exist.
async fn ensure_parent(
    state: &BackendState,
    spec: &ResourceSpec,
    parents: &[SqlValue],
) -> Result<(), ApiError> {
    if let Some(sql) = &spec.statements.parent_check {
        if state.driver.query_row_opt(sql, parents).await?.is_none() {
            return Err(ApiError::NotFound("parent not found".into()));
        }
    }
    Ok(())
}

/// The leaf id of a row the statement family already fetched. Singleton
/// update statements never reference it, so the nil fallback is inert.
fn current_leaf_id(spec: &ResourceSpec, row: &serde_json::Value) -> Uuid {
    row.get(spec.id_col().as_str())
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or(Uuid::nil())
}

async fn read_row(
    state: &BackendState,
    spec: &ResourceSpec,
    key: &[SqlValue],
) -> Result<Option<serde_json::Value>, ApiError> {
    match state.driver.query_row_opt(&spec.statements.read_one, key).await? {
        None => Ok(None),
        Some(row) => Ok(Some(row_to_json(&row)?)),
    }
}

/// On a unique violation, find and return the current conflicting row.
async fn conflict_response(
    state: &BackendState,
    spec: &ResourceSpec,
    row: &ResourceRow,
) -> ApiError {
    let string_cols = spec.string_cols();
    for index in spec.indices.iter().filter(|i| i.unique) {
        let Some(position) = string_cols.iter().position(|c| *c == index.name) else {
            continue;
        };
        let sql = format!(
            "{} WHERE {} = $1",
            spec.statements.select_from,
            quote(&index.name)
        );
        if let Ok(Some(existing)) = state
            .driver
            .query_row_opt(&sql, &[SqlValue::Text(row.strings[position].clone())])
            .await
        {
            if let Ok(json) = row_to_json(&existing) {
                return ApiError::Conflict(json);
            }
        }
    }
    // Not an external index: the primary key itself collided.
    match read_row(state, spec, &row.key_binds(spec)).await {
        Ok(Some(existing)) => ApiError::Conflict(existing),
        _ => ApiError::internal("conflicting row disappeared"),
    }
}

/// `GET` on the collection route.
pub async fn list(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::List, &params, &spec.permits, spec.restrict_admin)?;
    let parents = parent_binds(&spec, &params)?;
    ensure_parent(&state, &spec, &parents).await?;

    // An empty cursor echoed back means the stream was already drained.
    if query.get(NEXT_TOKEN_PARAM).is_some_and(|token| token.is_empty()) {
        return Ok(json_response(StatusCode::OK, &serde_json::Value::Array(Vec::new())));
    }

    let mut conditions: Vec<String> = spec
        .parent_cols()
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote(c), i + 1))
        .collect();
    let mut binds = parents;
    let mut next_param = binds.len() + 1;

    for col in spec.filterable_cols() {
        if let Some(value) = query.get(&col) {
            conditions.push(format!("{} = ${next_param}", quote(&col)));
            binds.push(SqlValue::Text(value.clone()));
            next_param += 1;
        }
    }

    if let Some(token) = query.get(NEXT_TOKEN_PARAM) {
        let cursor = Cursor::decode(token)
            .ok_or_else(|| ApiError::BadRequest("invalid next_token".into()))?;
        conditions.push(format!(
            "(\"created_at\", {}) > (${next_param}, ${})",
            quote(&spec.id_col()),
            next_param + 1
        ));
        binds.push(SqlValue::Timestamp(cursor.created_at));
        binds.push(SqlValue::Uuid(cursor.id));
    }

    let limit = match query.get(LIMIT_PARAM) {
        None => None,
        Some(raw) => Some(
            raw.parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ApiError::BadRequest("invalid limit".into()))?,
        ),
    };

    let mut sql = spec.statements.select_from.clone();
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY \"created_at\", {}", quote(&spec.id_col())));
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit + 1));
    }

    let rows = state.driver.query(&sql, &binds).await?;

    let mut next_token: Option<String> = None;
    let mut kept = rows.len();
    if let Some(limit) = limit {
        if rows.len() as i64 > limit {
            kept = limit as usize;
            let last = &rows[kept - 1];
            let created_at = last
                .try_get("created_at")
                .map_err(kurbisio_db::SqlxErrorExt::into_db_error)?;
            let id = last
                .try_get(spec.id_col().as_str())
                .map_err(kurbisio_db::SqlxErrorExt::into_db_error)?;
            next_token = Some(Cursor { created_at, id }.encode());
        }
    }

    let items = rows[..kept]
        .iter()
        .map(row_to_json)
        .collect::<Result<Vec<_>, _>>()?;
    let mut response = json_response(StatusCode::OK, &serde_json::Value::Array(items));
    if let Some(token) = next_token {
        if let Ok(value) = HeaderValue::from_str(&token) {
            response.headers_mut().insert(NEXT_TOKEN_HEADER, value);
        }
    }
    Ok(response)
}

/// `GET` on the item or singleton route.
pub async fn read(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Read, &params, &spec.permits, spec.restrict_admin)?;
    let key = key_binds(&spec, &params)?;
    let row = read_row(&state, &spec, &key)
        .await?
        .ok_or_else(|| ApiError::NotFound("no such resource".into()))?;
    Ok(json_response(StatusCode::OK, &row))
}

/// `POST` on the collection route.
pub async fn create(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    cap: Capability,
    body: Bytes,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Create, &params, &spec.permits, spec.restrict_admin)?;
    let row = ResourceRow::from_body(&spec, &body, &params, IdPolicy::Generate)?;
    let parents = parent_binds(&spec, &params)?;
    ensure_parent(&state, &spec, &parents).await?;

    match state
        .driver
        .query_row(&spec.statements.insert, &row.insert_binds())
        .await
    {
        Ok(_) => {}
        Err(DbError::Conflict(_)) => return Err(conflict_response(&state, &spec, &row).await),
        Err(DbError::ForeignKey(_)) => {
            return Err(ApiError::NotFound("parent not found".into()))
        }
        Err(err) => return Err(err.into()),
    }

    let stored = read_row(&state, &spec, &row.key_binds(&spec))
        .await?
        .ok_or_else(|| ApiError::internal("row not readable after insert"))?;
    debug!(resource = spec.resource, id = %row.id, "created");
    Ok(json_response(StatusCode::CREATED, &stored))
}

/// `PUT` on the collection, item or singleton route: insert-or-update.
pub async fn put(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    cap: Capability,
    body: Bytes,
    id_policy: IdPolicy,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Update, &params, &spec.permits, spec.restrict_admin)?;
    let row = ResourceRow::from_body(&spec, &body, &params, id_policy)?;
    let parents = parent_binds(&spec, &params)?;
    ensure_parent(&state, &spec, &parents).await?;

    match state
        .driver
        .query_row(&spec.statements.upsert, &row.insert_binds())
        .await
    {
        Ok(_) => {}
        Err(DbError::Conflict(_)) => return Err(conflict_response(&state, &spec, &row).await),
        Err(DbError::ForeignKey(_)) => {
            return Err(ApiError::NotFound("parent not found".into()))
        }
        Err(err) => return Err(err.into()),
    }

    // Singletons re-read by the parent key: on conflict the stored row keeps
    // its original leaf id, not the one minted for this request.
    let key = match spec.kind {
        ResourceKind::Collection => row.key_binds(&spec),
        ResourceKind::Singleton => parents,
    };
    let stored = read_row(&state, &spec, &key)
        .await?
        .ok_or_else(|| ApiError::internal("row not readable after upsert"))?;
    Ok(json_response(StatusCode::OK, &stored))
}

/// `PATCH` on the item or singleton route: merge `properties`, overwrite
/// any string columns present in the body.
pub async fn patch(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    cap: Capability,
    body: Bytes,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Update, &params, &spec.permits, spec.restrict_admin)?;
    let key = key_binds(&spec, &params)?;
    let current = read_row(&state, &spec, &key)
        .await?
        .ok_or_else(|| ApiError::NotFound("no such resource".into()))?;

    let body: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid JSON".into()))?;
    let object = body
        .as_object()
        .ok_or_else(|| ApiError::BadRequest("body must be a JSON object".into()))?;

    let mut properties = match current.get("properties") {
        Some(value) if value.is_object() => value.clone(),
        _ => serde_json::json!({}),
    };
    if let Some(patch) = object.get("properties") {
        let patch = patch
            .as_object()
            .ok_or_else(|| ApiError::BadRequest("properties must be a JSON object".into()))?;
        if let Some(merged) = properties.as_object_mut() {
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
        }
    }

    let mut strings = Vec::new();
    for col in spec.string_cols() {
        let value = match object.get(&col) {
            Some(v) => v
                .as_str()
                .ok_or_else(|| ApiError::BadRequest(format!("property {col} must be a string")))?
                .to_owned(),
            None => current
                .get(&col)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned(),
        };
        strings.push(value);
    }

    // The merged state as a ResourceRow; update_binds owns the ordering.
    let merged = ResourceRow {
        id: current_leaf_id(&spec, &current),
        parent_ids: spec
            .parent_cols()
            .iter()
            .map(|col| parse_id(&params, col))
            .collect::<Result<Vec<_>, _>>()?,
        properties,
        strings,
    };
    state
        .driver
        .execute(&spec.statements.update, &merged.update_binds(&spec))
        .await?;

    let stored = read_row(&state, &spec, &key)
        .await?
        .ok_or_else(|| ApiError::internal("row not readable after update"))?;
    Ok(json_response(StatusCode::OK, &stored))
}

/// `PUT /…/{id}/{property}/{value}`: compact single-column update,
/// behaving like a full update of that column.
pub async fn put_property(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    cap: Capability,
    column: String,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Update, &params, &spec.permits, spec.restrict_admin)?;
    let key = key_binds(&spec, &params)?;
    let value = params
        .get("value")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("missing value".into()))?;

    let sql = format!(
        "UPDATE {} SET {} = ${} WHERE {}",
        spec.table,
        quote(&column),
        key.len() + 1,
        spec.key_where()
    );
    let mut binds = key.clone();
    binds.push(SqlValue::Text(value));
    let affected = state.driver.execute(&sql, &binds).await?;
    if affected == 0 {
        return Err(ApiError::NotFound("no such resource".into()));
    }
    let stored = read_row(&state, &spec, &key)
        .await?
        .ok_or_else(|| ApiError::internal("row not readable after update"))?;
    Ok(json_response(StatusCode::OK, &stored))
}

/// `DELETE` on the item or singleton route.
pub async fn delete(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Delete, &params, &spec.permits, spec.restrict_admin)?;
    let key = key_binds(&spec, &params)?;
    let affected = state.driver.execute(&spec.statements.delete, &key).await?;
    if affected == 0 {
        return Err(ApiError::NotFound("no such resource".into()));
    }
    debug!(resource = spec.resource, "deleted");
    Ok(no_content())
}

/// `DELETE` on the collection route: the `clear` operation.
pub async fn clear(
    state: BackendState,
    spec: Arc<ResourceSpec>,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Clear, &params, &spec.permits, spec.restrict_admin)?;
    let parents = parent_binds(&spec, &params)?;
    ensure_parent(&state, &spec, &parents).await?;
    let affected = state.driver.execute(&spec.statements.clear, &parents).await?;
    debug!(resource = spec.resource, affected, "cleared");
    Ok(no_content())
}

// ── Relations ──

/// `GET` on the relation list route: the associated origin rows.
pub async fn relation_list(
    state: BackendState,
    relation: Arc<RelationSpec>,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::List, &params, &relation.permits, false)?;
    let resource_id = parse_id(&params, &relation.resource_col())?;
    let rows = state
        .driver
        .query(&relation.list, &[SqlValue::Uuid(resource_id)])
        .await?;
    let items = rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>()?;
    Ok(json_response(StatusCode::OK, &serde_json::Value::Array(items)))
}

/// `GET` on the relation item route: the origin row, if associated.
pub async fn relation_read(
    state: BackendState,
    relation: Arc<RelationSpec>,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Read, &params, &relation.permits, false)?;
    let resource_id = parse_id(&params, &relation.resource_col())?;
    let origin_id = parse_id(&params, &relation.origin_col())?;
    let row = state
        .driver
        .query_row_opt(
            &relation.read_one,
            &[SqlValue::Uuid(resource_id), SqlValue::Uuid(origin_id)],
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("no such relation".into()))?;
    Ok(json_response(StatusCode::OK, &row_to_json(&row)?))
}

/// `PUT` on the relation item route: create the association. Empty body,
/// idempotent, no content.
pub async fn relation_attach(
    state: BackendState,
    relation: Arc<RelationSpec>,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Create, &params, &relation.permits, false)?;
    let resource_id = parse_id(&params, &relation.resource_col())?;
    let origin_id = parse_id(&params, &relation.origin_col())?;
    match state
        .driver
        .execute(
            &relation.attach,
            &[SqlValue::Uuid(resource_id), SqlValue::Uuid(origin_id)],
        )
        .await
    {
        Ok(_) => Ok(no_content()),
        Err(DbError::ForeignKey(_)) => Err(ApiError::NotFound("no such resource".into())),
        Err(err) => Err(err.into()),
    }
}

/// `DELETE` on the relation item route: remove the association only.
pub async fn relation_detach(
    state: BackendState,
    relation: Arc<RelationSpec>,
    params: HashMap<String, String>,
    cap: Capability,
) -> Result<Response, ApiError> {
    authorize(&state, &cap, Operation::Delete, &params, &relation.permits, false)?;
    let resource_id = parse_id(&params, &relation.resource_col())?;
    let origin_id = parse_id(&params, &relation.origin_col())?;
    let affected = state
        .driver
        .execute(
            &relation.detach,
            &[SqlValue::Uuid(resource_id), SqlValue::Uuid(origin_id)],
        )
        .await?;
    if affected == 0 {
        return Err(ApiError::NotFound("no such relation".into()));
    }
    Ok(no_content())
}
