//! # kurbisio-core — shared types for the Kurbisio backend engine
//!
//! This crate holds everything the other Kurbisio crates agree on:
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`ident`] | Identifier algebra: pluralization, resource-path splitting, route templates |
//! | [`config`] | The declarative backend configuration (collections, singletons, relations, shortcuts) |
//! | [`capability`] | Capabilities, permits and the permit-evaluation algorithm |
//! | [`error`] | The shared HTTP error taxonomy ([`ApiError`]) |
//! | [`publish`] | The outbound MQTT [`Publisher`] seam between REST handlers and the broker |
//!
//! Nothing in here talks to the network or the database; the crate is pure
//! types and pure functions so that the evaluation rules stay trivially
//! testable.

pub mod capability;
pub mod config;
pub mod error;
pub mod ident;
pub mod publish;

pub use capability::{is_authorized, Capability, Operation, Permit};
pub use config::{
    BackendConfig, CollectionConfig, ConfigError, RelationConfig, ShortcutConfig, SingletonConfig,
};
pub use error::ApiError;
pub use publish::{NoopPublisher, Publisher};
