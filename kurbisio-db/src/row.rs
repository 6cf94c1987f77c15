//! Untyped row decoding.
//!
//! Resource tables have configuration-determined columns, so listings decode
//! rows into `serde_json::Value` objects by inspecting the Postgres type of
//! each column. Typed decoding (where a fixed shape exists) lives next to
//! its table: [`crate::twin::TwinEntry`], the engine's `ResourceRow`.

use chrono::NaiveDateTime;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};
use uuid::Uuid;

use crate::error::{DbError, SqlxErrorExt};

/// Render a naive UTC timestamp the way the API serializes all timestamps:
/// RFC3339 with microsecond precision and a `Z` suffix.
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    format!("{}Z", ts.format("%Y-%m-%dT%H:%M:%S%.6f"))
}

/// Decode one row into a flat JSON object, column by column.
///
/// Unknown column types decode as strings when possible and `null`
/// otherwise; they do not fail the request.
pub fn row_to_json(row: &PgRow) -> Result<serde_json::Value, DbError> {
    let mut object = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let value = match column.type_info().name() {
            "UUID" => row
                .try_get::<Option<Uuid>, _>(i)
                .map_err(SqlxErrorExt::into_db_error)?
                .map(|v| serde_json::Value::String(v.to_string())),
            "VARCHAR" | "TEXT" => row
                .try_get::<Option<String>, _>(i)
                .map_err(SqlxErrorExt::into_db_error)?
                .map(serde_json::Value::String),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(i)
                .map_err(SqlxErrorExt::into_db_error)?
                .map(|v| serde_json::Value::String(format_timestamp(v))),
            "JSON" | "JSONB" => row
                .try_get::<Option<serde_json::Value>, _>(i)
                .map_err(SqlxErrorExt::into_db_error)?,
            "INT4" => row
                .try_get::<Option<i32>, _>(i)
                .map_err(SqlxErrorExt::into_db_error)?
                .map(serde_json::Value::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(i)
                .map_err(SqlxErrorExt::into_db_error)?
                .map(serde_json::Value::from),
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .map_err(SqlxErrorExt::into_db_error)?
                .map(serde_json::Value::Bool),
            _ => row.try_get::<Option<String>, _>(i).ok().flatten().map(serde_json::Value::String),
        };
        object.insert(name.to_owned(), value.unwrap_or(serde_json::Value::Null));
    }
    Ok(serde_json::Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_render_rfc3339_utc() {
        let ts = chrono::DateTime::from_timestamp(1_700_000_000, 123_456_000)
            .unwrap()
            .naive_utc();
        let s = format_timestamp(ts);
        assert!(s.ends_with('Z'));
        assert!(s.starts_with("2023-11-14T"));
        assert!(s.contains(".123456"));
    }
}
