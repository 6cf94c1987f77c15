//! # kurbisio-db — the storage driver
//!
//! This crate provides everything that touches Postgres directly:
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Driver`] | Schema-scoped pool wrapper: `execute` / `query` / `query_row` / `begin` with a [`SqlValue`] bind enum |
//! | [`Tx`] | Transaction wrapper: explicit commit, rollback on drop |
//! | [`Registry`] | Prefix-scoped JSON key/value store (`_registry_`) with timestamps |
//! | [`TwinStore`] | Device-twin persistence (`_twin_`) with the report-idempotence rule |
//! | [`SqlxErrorExt`] | `sqlx::Error` → [`DbError`] translation (`.into_db_error()`) |
//!
//! All SQL is parameterized. The driver is the only component that owns a
//! pool; the resource engine, the twin REST routes and the MQTT broker all
//! share one `Arc<Driver>`.

pub mod driver;
pub mod error;
pub mod registry;
pub mod row;
pub mod twin;

pub use driver::{Driver, SqlValue, Tx};
pub use error::{DbError, SqlxErrorExt};
pub use registry::Registry;
pub use row::row_to_json;
pub use twin::{TwinEntry, TwinStore};
