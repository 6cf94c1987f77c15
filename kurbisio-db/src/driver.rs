//! The schema-scoped Postgres driver.
//!
//! [`Driver`] wraps an `sqlx::PgPool` together with the schema name all
//! Kurbisio tables live in. Statements are plain SQL strings with `$n`
//! placeholders; arguments travel as [`SqlValue`]s so callers can assemble
//! bind lists of runtime-determined arity (the resource engine's statement
//! family is built from configuration, not at compile time).

use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::Postgres;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, SqlxErrorExt};

/// A dynamically-typed SQL argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Uuid(Uuid),
    Text(String),
    Json(serde_json::Value),
    Timestamp(chrono::NaiveDateTime),
    Int(i64),
}

/// Chain-bind a slice of [`SqlValue`]s onto a query.
fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &[SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for value in binds {
        query = match value {
            SqlValue::Uuid(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Json(v) => query.bind(v.clone()),
            SqlValue::Timestamp(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
        };
    }
    query
}

/// A transaction handle. Commit explicitly; dropping without commit rolls
/// back, so early returns never leak partial writes.
pub struct Tx<'a>(sqlx::Transaction<'a, Postgres>);

impl<'a> Tx<'a> {
    pub async fn commit(self) -> Result<(), DbError> {
        self.0.commit().await.map_err(SqlxErrorExt::into_db_error)
    }

    pub async fn execute(&mut self, sql: &str, binds: &[SqlValue]) -> Result<u64, DbError> {
        let result = bind_all(sqlx::query(sql), binds)
            .execute(&mut *self.0)
            .await
            .map_err(SqlxErrorExt::into_db_error)?;
        Ok(result.rows_affected())
    }

    pub async fn query_row(&mut self, sql: &str, binds: &[SqlValue]) -> Result<PgRow, DbError> {
        bind_all(sqlx::query(sql), binds)
            .fetch_one(&mut *self.0)
            .await
            .map_err(SqlxErrorExt::into_db_error)
    }

    pub async fn query_row_opt(
        &mut self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Option<PgRow>, DbError> {
        bind_all(sqlx::query(sql), binds)
            .fetch_optional(&mut *self.0)
            .await
            .map_err(SqlxErrorExt::into_db_error)
    }
}

/// Parameterized execution against the relational store, scoped to one
/// schema.
#[derive(Clone)]
pub struct Driver {
    pool: PgPool,
    schema: String,
}

impl Driver {
    /// Connect a pool and remember the schema name. Does not create the
    /// schema; call [`Driver::bootstrap`] once at startup for that.
    pub async fn connect(url: &str, schema: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(SqlxErrorExt::into_db_error)?;
        Ok(Self {
            pool,
            schema: schema.to_owned(),
        })
    }

    /// Wrap an existing pool (used by tests and embedded setups).
    pub fn from_pool(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_owned(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Quote and schema-qualify a table name: `"schema"."table"`.
    pub fn qualify(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.schema, table)
    }

    /// Create the schema, the UUID generator extension and the auxiliary
    /// tables (`_registry_`, `_twin_`). Idempotent; additive only.
    pub async fn bootstrap(&self) -> Result<(), DbError> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema),
            "CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\"".to_owned(),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 key VARCHAR NOT NULL PRIMARY KEY, \
                 value JSONB NOT NULL, \
                 updated_at TIMESTAMP NOT NULL DEFAULT now())",
                self.qualify("_registry_")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 device_id UUID NOT NULL, \
                 key VARCHAR NOT NULL, \
                 request JSONB, \
                 report JSONB, \
                 requested_at TIMESTAMP NOT NULL, \
                 reported_at TIMESTAMP NOT NULL, \
                 PRIMARY KEY (device_id, key))",
                self.qualify("_twin_")
            ),
        ];
        for sql in &statements {
            debug!(%sql, "bootstrap");
            self.execute(sql, &[]).await?;
        }
        Ok(())
    }

    pub async fn execute(&self, sql: &str, binds: &[SqlValue]) -> Result<u64, DbError> {
        let result = bind_all(sqlx::query(sql), binds)
            .execute(&self.pool)
            .await
            .map_err(SqlxErrorExt::into_db_error)?;
        Ok(result.rows_affected())
    }

    pub async fn query(&self, sql: &str, binds: &[SqlValue]) -> Result<Vec<PgRow>, DbError> {
        bind_all(sqlx::query(sql), binds)
            .fetch_all(&self.pool)
            .await
            .map_err(SqlxErrorExt::into_db_error)
    }

    /// Fetch exactly one row; `RowNotFound` becomes [`DbError::NotFound`].
    pub async fn query_row(&self, sql: &str, binds: &[SqlValue]) -> Result<PgRow, DbError> {
        bind_all(sqlx::query(sql), binds)
            .fetch_one(&self.pool)
            .await
            .map_err(SqlxErrorExt::into_db_error)
    }

    pub async fn query_row_opt(
        &self,
        sql: &str,
        binds: &[SqlValue],
    ) -> Result<Option<PgRow>, DbError> {
        bind_all(sqlx::query(sql), binds)
            .fetch_optional(&self.pool)
            .await
            .map_err(SqlxErrorExt::into_db_error)
    }

    pub async fn begin(&self) -> Result<Tx<'static>, DbError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(SqlxErrorExt::into_db_error)?;
        Ok(Tx(tx))
    }
}
