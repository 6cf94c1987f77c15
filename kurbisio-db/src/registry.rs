//! The registry: prefix-scoped JSON key/value persistence with timestamps.
//!
//! Backed by the `_registry_` auxiliary table. Writes are atomic upserts, so
//! a registry key is a safe serialization point for metadata shared between
//! replicas (the JWT key cache uses the timestamp to apply its staleness
//! rule without a distributed lock; concurrent refreshes are idempotent).

use chrono::NaiveDateTime;
use sqlx::Row;

use crate::driver::{Driver, SqlValue};
use crate::error::{DbError, SqlxErrorExt};

/// A prefix-scoped view of the `_registry_` table.
#[derive(Clone)]
pub struct Registry {
    driver: std::sync::Arc<Driver>,
    prefix: String,
}

impl Registry {
    /// Create a view over all keys starting with `prefix`.
    pub fn new(driver: std::sync::Arc<Driver>, prefix: impl Into<String>) -> Self {
        Self {
            driver,
            prefix: prefix.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read a value and the time it was last written.
    pub async fn read(
        &self,
        key: &str,
    ) -> Result<Option<(serde_json::Value, NaiveDateTime)>, DbError> {
        let sql = format!(
            "SELECT value, updated_at FROM {} WHERE key = $1",
            self.driver.qualify("_registry_")
        );
        let row = self
            .driver
            .query_row_opt(&sql, &[SqlValue::Text(self.full_key(key))])
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let value: serde_json::Value =
                    row.try_get("value").map_err(SqlxErrorExt::into_db_error)?;
                let updated_at: NaiveDateTime = row
                    .try_get("updated_at")
                    .map_err(SqlxErrorExt::into_db_error)?;
                Ok(Some((value, updated_at)))
            }
        }
    }

    /// Upsert a value, refreshing the timestamp.
    pub async fn write(&self, key: &str, value: &serde_json::Value) -> Result<(), DbError> {
        let sql = format!(
            "INSERT INTO {} (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
            self.driver.qualify("_registry_")
        );
        self.driver
            .execute(
                &sql,
                &[
                    SqlValue::Text(self.full_key(key)),
                    SqlValue::Json(value.clone()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Delete a key. Missing keys are not an error.
    pub async fn delete(&self, key: &str) -> Result<(), DbError> {
        let sql = format!(
            "DELETE FROM {} WHERE key = $1",
            self.driver.qualify("_registry_")
        );
        self.driver
            .execute(&sql, &[SqlValue::Text(self.full_key(key))])
            .await?;
        Ok(())
    }
}
