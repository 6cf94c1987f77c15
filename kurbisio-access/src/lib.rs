//! # kurbisio-access — the authorization engine
//!
//! Turns request credentials into a [`Capability`](kurbisio_core::Capability)
//! and attaches it to the request context. Handlers never authenticate;
//! they evaluate permits against the capability this crate produced.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Declarative access configuration (JWT, thing secret, application tokens, dynamic enrichment) |
//! | [`cache`] | The process-wide token → capability cache (bounded LRU behind a reader-writer lock) |
//! | [`jwt`] | JWT validation with JWKS key material cached through the registry (6-hour staleness rule) |
//! | [`middleware`] | The authentication middleware chain and the [`Auth`] extractor |
//!
//! # Admin backdoor
//!
//! With the `admin-backdoor` cargo feature enabled, the literal bearer token
//! `please` grants the `admin` role. The feature exists for development and
//! tests only and is off by default.

pub mod cache;
pub mod config;
pub mod error;
pub mod jwt;
pub mod middleware;

pub use cache::CapabilityCache;
pub use config::{
    AccessConfig, ApplicationToken, ApplicationTokenConfig, DynamicAuthConfig, JwtConfig,
    ThingAuthConfig,
};
pub use error::AccessError;
pub use jwt::{capability_from_claims, JwtValidator};
pub use middleware::{authenticate, Auth, AccessState};
