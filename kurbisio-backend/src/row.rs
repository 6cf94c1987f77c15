//! The typed row boundary.
//!
//! Request bodies are decoded from JSON exactly once, into a [`ResourceRow`]
//! that has validated ids, required string columns and a `properties`
//! object. Everything downstream (binds, conflict probing) works with the
//! typed form; untyped `serde_json::Value` rows only appear on the way out,
//! produced by the storage layer's `row_to_json` fast path.

use std::collections::HashMap;

use kurbisio_core::ApiError;
use kurbisio_db::SqlValue;
use uuid::Uuid;

use crate::spec::{ResourceKind, ResourceSpec};

/// How the leaf id of a write is determined.
#[derive(Debug, Clone, Copy)]
pub enum IdPolicy {
    /// Take the id from the body when present, mint one otherwise (POST,
    /// singleton PUT).
    Generate,
    /// The body must carry the id (PUT bound to the collection).
    RequireBody,
    /// The id comes from the URL; a body id must agree (PUT bound to the
    /// item).
    FromPath(Uuid),
}

/// A validated write body.
#[derive(Debug, Clone)]
pub struct ResourceRow {
    pub id: Uuid,
    /// Parent ids in path order.
    pub parent_ids: Vec<Uuid>,
    /// The `properties` object (always a JSON object).
    pub properties: serde_json::Value,
    /// String column values in `spec.string_cols()` order.
    pub strings: Vec<String>,
}

/// Parse one URL path parameter as a UUID.
pub fn parse_id(params: &HashMap<String, String>, column: &str) -> Result<Uuid, ApiError> {
    let raw = params
        .get(column)
        .ok_or_else(|| ApiError::BadRequest(format!("missing path parameter {column}")))?;
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid {column}")))
}

/// The parent id binds of a request, in path order.
pub fn parent_binds(
    spec: &ResourceSpec,
    params: &HashMap<String, String>,
) -> Result<Vec<SqlValue>, ApiError> {
    spec.parent_cols()
        .iter()
        .map(|col| parse_id(params, col).map(SqlValue::Uuid))
        .collect()
}

/// The full key-tuple binds of a request: parents, then the leaf id for
/// collections.
pub fn key_binds(
    spec: &ResourceSpec,
    params: &HashMap<String, String>,
) -> Result<Vec<SqlValue>, ApiError> {
    let mut binds = parent_binds(spec, params)?;
    if spec.kind == ResourceKind::Collection {
        binds.push(SqlValue::Uuid(parse_id(params, &spec.id_col())?));
    }
    Ok(binds)
}

impl ResourceRow {
    /// Decode and validate a write body against the resource specification
    /// and the URL-bound ids.
    ///
    /// Rejections (all bad-request): body is not a JSON object; a parent id
    /// in the body disagrees with the URL; the leaf id is missing (when the
    /// policy requires it), malformed, or disagrees with the URL; a
    /// required extra property is missing; a string column holds a
    /// non-string; `properties` is present but not an object.
    pub fn from_body(
        spec: &ResourceSpec,
        body: &[u8],
        params: &HashMap<String, String>,
        id_policy: IdPolicy,
    ) -> Result<Self, ApiError> {
        let body: serde_json::Value = if body.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_slice(body)
                .map_err(|_| ApiError::BadRequest("invalid JSON".into()))?
        };
        let object = body
            .as_object()
            .ok_or_else(|| ApiError::BadRequest("body must be a JSON object".into()))?;

        let mut parent_ids = Vec::new();
        for col in spec.parent_cols() {
            let url_id = parse_id(params, &col)?;
            if let Some(value) = object.get(&col) {
                let body_id = value
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid {col}")))?;
                if body_id != url_id {
                    return Err(ApiError::BadRequest(format!(
                        "{col} in body does not match the URL"
                    )));
                }
            }
            parent_ids.push(url_id);
        }

        let id_col = spec.id_col();
        let body_id = match object.get(&id_col) {
            None => None,
            Some(value) => Some(
                value
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid {id_col}")))?,
            ),
        };
        let id = match id_policy {
            IdPolicy::Generate => body_id.unwrap_or_else(Uuid::new_v4),
            IdPolicy::RequireBody => body_id
                .ok_or_else(|| ApiError::BadRequest(format!("missing {id_col}")))?,
            IdPolicy::FromPath(url_id) => {
                if let Some(body_id) = body_id {
                    if body_id != url_id {
                        return Err(ApiError::BadRequest(format!(
                            "{id_col} in body does not match the URL"
                        )));
                    }
                }
                url_id
            }
        };

        // Extra static properties are required; index columns default to
        // empty when absent.
        let mut strings = Vec::new();
        for col in spec.string_cols() {
            let value = match object.get(&col) {
                Some(value) => value
                    .as_str()
                    .ok_or_else(|| {
                        ApiError::BadRequest(format!("property {col} must be a string"))
                    })?
                    .to_owned(),
                None if spec.static_props.contains(&col) => {
                    return Err(ApiError::BadRequest(format!("missing property {col}")))
                }
                None => String::new(),
            };
            strings.push(value);
        }

        let properties = match object.get("properties") {
            None => serde_json::json!({}),
            Some(value) if value.is_object() => value.clone(),
            Some(_) => {
                return Err(ApiError::BadRequest("properties must be a JSON object".into()))
            }
        };

        Ok(Self {
            id,
            parent_ids,
            properties,
            strings,
        })
    }

    /// Binds in statement-family insert/upsert order:
    /// leaf id, parents, properties, string columns.
    pub fn insert_binds(&self) -> Vec<SqlValue> {
        let mut binds = vec![SqlValue::Uuid(self.id)];
        binds.extend(self.parent_ids.iter().map(|id| SqlValue::Uuid(*id)));
        binds.push(SqlValue::Json(self.properties.clone()));
        binds.extend(self.strings.iter().map(|s| SqlValue::Text(s.clone())));
        binds
    }

    /// Binds for the update statement: key tuple first, then values.
    pub fn update_binds(&self, spec: &ResourceSpec) -> Vec<SqlValue> {
        let mut binds: Vec<SqlValue> =
            self.parent_ids.iter().map(|id| SqlValue::Uuid(*id)).collect();
        if spec.kind == ResourceKind::Collection {
            binds.push(SqlValue::Uuid(self.id));
        }
        binds.push(SqlValue::Json(self.properties.clone()));
        binds.extend(self.strings.iter().map(|s| SqlValue::Text(s.clone())));
        binds
    }

    /// The key tuple identifying this row (parents, then the leaf for
    /// collections).
    pub fn key_binds(&self, spec: &ResourceSpec) -> Vec<SqlValue> {
        let mut binds: Vec<SqlValue> =
            self.parent_ids.iter().map(|id| SqlValue::Uuid(*id)).collect();
        if spec.kind == ResourceKind::Collection {
            binds.push(SqlValue::Uuid(self.id));
        }
        binds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbisio_core::config::CollectionConfig;

    fn spec() -> ResourceSpec {
        ResourceSpec::from_collection(
            "backend",
            &CollectionConfig {
                resource: "b/c".to_owned(),
                external_unique_indices: vec!["external_id".to_owned()],
                extra_properties: vec!["extra_prop".to_owned()],
                ..CollectionConfig::default()
            },
        )
        .unwrap()
    }

    fn params(b: Uuid) -> HashMap<String, String> {
        HashMap::from([("b_id".to_owned(), b.to_string())])
    }

    #[test]
    fn accepts_a_valid_body() {
        let b = Uuid::new_v4();
        let body = serde_json::json!({
            "properties": {"foo": "bar"},
            "external_id": "e1",
            "extra_prop": "x",
        });
        let row = ResourceRow::from_body(
            &spec(),
            body.to_string().as_bytes(),
            &params(b),
            IdPolicy::Generate,
        )
        .unwrap();
        assert_eq!(row.parent_ids, vec![b]);
        assert_eq!(row.strings, vec!["e1", "x"]);
        assert_eq!(row.properties["foo"], "bar");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = ResourceRow::from_body(
            &spec(),
            b"{not json",
            &params(Uuid::new_v4()),
            IdPolicy::Generate,
        );
        assert!(matches!(err, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn rejects_parent_mismatch() {
        let body = serde_json::json!({
            "b_id": Uuid::new_v4().to_string(),
            "external_id": "e1",
            "extra_prop": "x",
        });
        let err = ResourceRow::from_body(
            &spec(),
            body.to_string().as_bytes(),
            &params(Uuid::new_v4()),
            IdPolicy::Generate,
        );
        assert!(matches!(err, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn rejects_missing_required_property() {
        let body = serde_json::json!({"external_id": "e1"});
        let err = ResourceRow::from_body(
            &spec(),
            body.to_string().as_bytes(),
            &params(Uuid::new_v4()),
            IdPolicy::Generate,
        );
        match err {
            Err(ApiError::BadRequest(msg)) => assert!(msg.contains("extra_prop")),
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[test]
    fn requires_the_leaf_id_when_asked_to() {
        let body = serde_json::json!({"external_id": "e1", "extra_prop": "x"});
        let err = ResourceRow::from_body(
            &spec(),
            body.to_string().as_bytes(),
            &params(Uuid::new_v4()),
            IdPolicy::RequireBody,
        );
        match err {
            Err(ApiError::BadRequest(msg)) => assert!(msg.contains("c_id")),
            other => panic!("expected BadRequest, got {other:?}"),
        }
    }

    #[test]
    fn path_id_wins_and_must_agree() {
        let url_id = Uuid::new_v4();
        let body = serde_json::json!({
            "c_id": url_id.to_string(),
            "external_id": "e1",
            "extra_prop": "x",
        });
        let row = ResourceRow::from_body(
            &spec(),
            body.to_string().as_bytes(),
            &params(Uuid::new_v4()),
            IdPolicy::FromPath(url_id),
        )
        .unwrap();
        assert_eq!(row.id, url_id);

        let mismatched = serde_json::json!({
            "c_id": Uuid::new_v4().to_string(),
            "external_id": "e1",
            "extra_prop": "x",
        });
        let err = ResourceRow::from_body(
            &spec(),
            mismatched.to_string().as_bytes(),
            &params(Uuid::new_v4()),
            IdPolicy::FromPath(url_id),
        );
        assert!(matches!(err, Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn update_binds_put_the_key_tuple_first() {
        let b = Uuid::new_v4();
        let body = serde_json::json!({"external_id": "e1", "extra_prop": "x"});
        let spec = spec();
        let row = ResourceRow::from_body(
            &spec,
            body.to_string().as_bytes(),
            &params(b),
            IdPolicy::Generate,
        )
        .unwrap();
        let binds = row.update_binds(&spec);
        // b_id, c_id, properties, external_id, extra_prop
        assert_eq!(binds.len(), 5);
        assert!(matches!(binds[0], SqlValue::Uuid(id) if id == b));
        assert!(matches!(binds[1], SqlValue::Uuid(id) if id == row.id));
        assert!(matches!(&binds[2], SqlValue::Json(v) if v.is_object()));
        assert!(matches!(&binds[3], SqlValue::Text(s) if s == "e1"));
        assert!(matches!(&binds[4], SqlValue::Text(s) if s == "x"));
    }

    #[test]
    fn insert_binds_follow_statement_order() {
        let b = Uuid::new_v4();
        let body = serde_json::json!({"external_id": "e1", "extra_prop": "x"});
        let row = ResourceRow::from_body(
            &spec(),
            body.to_string().as_bytes(),
            &params(b),
            IdPolicy::Generate,
        )
        .unwrap();
        let binds = row.insert_binds();
        assert_eq!(binds.len(), 5); // c_id, b_id, properties, external_id, extra_prop
        assert!(matches!(binds[0], SqlValue::Uuid(id) if id == row.id));
        assert!(matches!(binds[1], SqlValue::Uuid(id) if id == b));
        assert!(matches!(&binds[2], SqlValue::Json(v) if v.is_object()));
        assert!(matches!(&binds[3], SqlValue::Text(s) if s == "e1"));
    }
}
