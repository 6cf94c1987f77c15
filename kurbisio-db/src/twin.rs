//! Device-twin persistence.
//!
//! One row per `(device_id, key)` pair holding the requested and the
//! reported state side by side. The two sides advance independently:
//! writing a request refreshes only `requested_at`, writing a report only
//! `reported_at`, and a report that is semantically equal to the stored
//! one (structural JSON equality, map order insensitive) must not advance
//! the timestamp at all.
//!
//! Rows are created lazily by the first write from either side; the side
//! that has never been written carries the epoch sentinel timestamp.

use chrono::NaiveDateTime;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::driver::{Driver, SqlValue};
use crate::error::{DbError, SqlxErrorExt};

/// Timestamp of a twin side that has never been written.
pub fn never() -> NaiveDateTime {
    chrono::DateTime::UNIX_EPOCH.naive_utc()
}

/// One twin row.
#[derive(Debug, Clone, PartialEq)]
pub struct TwinEntry {
    pub device_id: Uuid,
    pub key: String,
    pub request: Option<serde_json::Value>,
    pub report: Option<serde_json::Value>,
    pub requested_at: NaiveDateTime,
    pub reported_at: NaiveDateTime,
}

impl TwinEntry {
    fn from_row(row: &PgRow) -> Result<Self, DbError> {
        Ok(Self {
            device_id: row.try_get("device_id").map_err(SqlxErrorExt::into_db_error)?,
            key: row.try_get("key").map_err(SqlxErrorExt::into_db_error)?,
            request: row.try_get("request").map_err(SqlxErrorExt::into_db_error)?,
            report: row.try_get("report").map_err(SqlxErrorExt::into_db_error)?,
            requested_at: row
                .try_get("requested_at")
                .map_err(SqlxErrorExt::into_db_error)?,
            reported_at: row
                .try_get("reported_at")
                .map_err(SqlxErrorExt::into_db_error)?,
        })
    }

    /// The JSON shape the twin REST surface returns.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "device_id": self.device_id.to_string(),
            "key": self.key,
            "request": self.request.clone().unwrap_or(serde_json::Value::Null),
            "report": self.report.clone().unwrap_or(serde_json::Value::Null),
            "requested_at": crate::row::format_timestamp(self.requested_at),
            "reported_at": crate::row::format_timestamp(self.reported_at),
        })
    }
}

/// The `_twin_` table.
#[derive(Clone)]
pub struct TwinStore {
    driver: std::sync::Arc<Driver>,
}

impl TwinStore {
    pub fn new(driver: std::sync::Arc<Driver>) -> Self {
        Self { driver }
    }

    fn table(&self) -> String {
        self.driver.qualify("_twin_")
    }

    /// All twin entries of a device, ordered by key.
    pub async fn list(&self, device_id: Uuid) -> Result<Vec<TwinEntry>, DbError> {
        let sql = format!(
            "SELECT device_id, key, request, report, requested_at, reported_at \
             FROM {} WHERE device_id = $1 ORDER BY key",
            self.table()
        );
        let rows = self.driver.query(&sql, &[SqlValue::Uuid(device_id)]).await?;
        rows.iter().map(TwinEntry::from_row).collect()
    }

    /// One twin entry, or `None`.
    pub async fn get(&self, device_id: Uuid, key: &str) -> Result<Option<TwinEntry>, DbError> {
        let sql = format!(
            "SELECT device_id, key, request, report, requested_at, reported_at \
             FROM {} WHERE device_id = $1 AND key = $2",
            self.table()
        );
        let row = self
            .driver
            .query_row_opt(
                &sql,
                &[SqlValue::Uuid(device_id), SqlValue::Text(key.to_owned())],
            )
            .await?;
        row.as_ref().map(TwinEntry::from_row).transpose()
    }

    /// Upsert the request side, refreshing `requested_at` and never touching
    /// the report side.
    pub async fn put_request(
        &self,
        device_id: Uuid,
        key: &str,
        request: &serde_json::Value,
    ) -> Result<(), DbError> {
        let sql = format!(
            "INSERT INTO {} (device_id, key, request, report, requested_at, reported_at) \
             VALUES ($1, $2, $3, NULL, now(), $4) \
             ON CONFLICT (device_id, key) \
             DO UPDATE SET request = EXCLUDED.request, requested_at = now()",
            self.table()
        );
        self.driver
            .execute(
                &sql,
                &[
                    SqlValue::Uuid(device_id),
                    SqlValue::Text(key.to_owned()),
                    SqlValue::Json(request.clone()),
                    SqlValue::Timestamp(never()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Upsert the report side, refreshing `reported_at` only when the stored
    /// report differs from the incoming one.
    ///
    /// Returns whether a write happened. The compare-then-write runs in a
    /// transaction with the row locked, so concurrent reports observe atomic
    /// outcomes.
    pub async fn put_report(
        &self,
        device_id: Uuid,
        key: &str,
        report: &serde_json::Value,
    ) -> Result<bool, DbError> {
        let mut tx = self.driver.begin().await?;
        let select = format!(
            "SELECT report FROM {} WHERE device_id = $1 AND key = $2 FOR UPDATE",
            self.table()
        );
        let binds = [SqlValue::Uuid(device_id), SqlValue::Text(key.to_owned())];
        let existing = tx.query_row_opt(&select, &binds).await?;

        if let Some(row) = &existing {
            let stored: Option<serde_json::Value> =
                row.try_get("report").map_err(SqlxErrorExt::into_db_error)?;
            if stored.as_ref() == Some(report) {
                debug!(%device_id, key, "unchanged report, timestamp untouched");
                tx.commit().await?;
                return Ok(false);
            }
        }

        let upsert = format!(
            "INSERT INTO {} (device_id, key, request, report, requested_at, reported_at) \
             VALUES ($1, $2, NULL, $3, $4, now()) \
             ON CONFLICT (device_id, key) \
             DO UPDATE SET report = EXCLUDED.report, reported_at = now()",
            self.table()
        );
        tx.execute(
            &upsert,
            &[
                SqlValue::Uuid(device_id),
                SqlValue::Text(key.to_owned()),
                SqlValue::Json(report.clone()),
                SqlValue::Timestamp(never()),
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_is_the_epoch() {
        assert_eq!(never().and_utc().timestamp(), 0);
    }

    #[test]
    fn report_equality_is_structural() {
        // The comparison put_report relies on: map order must not matter.
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(a, b);
        let c: serde_json::Value = serde_json::from_str(r#"{"y": [2, 1], "x": 1}"#).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn entry_json_shape() {
        let entry = TwinEntry {
            device_id: Uuid::nil(),
            key: "k".into(),
            request: Some(serde_json::json!({"v": 1})),
            report: None,
            requested_at: never(),
            reported_at: never(),
        };
        let json = entry.to_json();
        assert_eq!(json["key"], "k");
        assert_eq!(json["request"]["v"], 1);
        assert!(json["report"].is_null());
        assert_eq!(json["reported_at"], "1970-01-01T00:00:00.000000Z");
    }
}
