//! Environment-variable configuration: the sole runtime configuration
//! surface of the service binary. No command-line flags.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use kurbisio_access::AccessConfig;
use kurbisio_core::BackendConfig;

/// A missing or malformed environment variable. Fatal at startup.
#[derive(Debug)]
pub struct EnvError(pub String);

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for EnvError {}

fn required(name: &str) -> Result<String, EnvError> {
    std::env::var(name).map_err(|_| EnvError(format!("{name} must be set")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_addr(name: &str, default: &str) -> Result<SocketAddr, EnvError> {
    let raw = optional(name).unwrap_or_else(|| default.to_owned());
    raw.parse()
        .map_err(|_| EnvError(format!("{name} is not a socket address: {raw}")))
}

fn parse_port(name: &str, default: u16) -> Result<u16, EnvError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| EnvError(format!("{name} is not a port: {raw}"))),
    }
}

/// The document loaded from `KURBISIO_CONFIG_FILE`: the backend resource
/// configuration plus an optional `access` section (application tokens,
/// dynamic authorization, token collection).
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub access: Option<AccessConfig>,
}

/// Everything the binary needs, resolved from the environment.
#[derive(Debug)]
pub struct ServerConfig {
    /// Postgres connection string (`KURBISIO_POSTGRES`).
    pub postgres: String,
    /// Password injected into the connection (`KURBISIO_POSTGRES_PASSWORD`).
    pub postgres_password: Option<String>,
    /// Schema namespace all tables live in (`KURBISIO_SCHEMA`).
    pub schema: String,
    /// Path of the configuration document (`KURBISIO_CONFIG_FILE`).
    pub config_file: PathBuf,
    /// HTTP bind address (`KURBISIO_HTTP_BIND`).
    pub http_bind: SocketAddr,
    /// MQTT bind address (`KURBISIO_MQTT_BIND`).
    pub mqtt_bind: SocketAddr,
    /// CA material (`KURBISIO_CA_CERT_FILE` / `KURBISIO_CA_KEY_FILE`);
    /// enables the credential service and the broker.
    pub ca_cert_file: Option<PathBuf>,
    pub ca_key_file: Option<PathBuf>,
    /// Broker server certificate (`KURBISIO_SERVER_CERT_FILE` /
    /// `KURBISIO_SERVER_KEY_FILE`).
    pub server_cert_file: Option<PathBuf>,
    pub server_key_file: Option<PathBuf>,
    /// Remote broker for outbound twin requests
    /// (`KURBISIO_MQTT_BROKER_HOST` / `KURBISIO_MQTT_BROKER_PORT`). When
    /// set, the REST surface publishes over an MQTT client connection
    /// instead of the embedded broker's in-process fan-out — the split
    /// deployment where broker and REST run as separate processes.
    pub mqtt_broker_host: Option<String>,
    pub mqtt_broker_port: u16,
    /// Client certificate for the publisher connection
    /// (`KURBISIO_CLIENT_CERT_FILE` / `KURBISIO_CLIENT_KEY_FILE`); combined
    /// with the CA file this turns the publisher connection into mTLS.
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    /// Shared thing secret (`KURBISIO_THING_KEY`).
    pub thing_key: Option<String>,
    /// JWT issuer configuration (`KURBISIO_JWKS_URL`,
    /// `KURBISIO_JWT_ISSUER`, `KURBISIO_JWT_AUDIENCE`).
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    /// `KURBISIO_AUTHORIZATION=disabled` turns permit evaluation off.
    pub enforce_authorization: bool,
    /// `KURBISIO_DEVICE_TOPICS=allowed` lets devices publish outside the
    /// reserved namespace.
    pub allow_device_topics: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, EnvError> {
        Ok(Self {
            postgres: required("KURBISIO_POSTGRES")?,
            postgres_password: optional("KURBISIO_POSTGRES_PASSWORD"),
            schema: optional("KURBISIO_SCHEMA").unwrap_or_else(|| "kurbisio".to_owned()),
            config_file: required("KURBISIO_CONFIG_FILE")?.into(),
            http_bind: parse_addr("KURBISIO_HTTP_BIND", "0.0.0.0:3000")?,
            mqtt_bind: parse_addr("KURBISIO_MQTT_BIND", "0.0.0.0:8883")?,
            ca_cert_file: optional("KURBISIO_CA_CERT_FILE").map(Into::into),
            ca_key_file: optional("KURBISIO_CA_KEY_FILE").map(Into::into),
            server_cert_file: optional("KURBISIO_SERVER_CERT_FILE").map(Into::into),
            server_key_file: optional("KURBISIO_SERVER_KEY_FILE").map(Into::into),
            mqtt_broker_host: optional("KURBISIO_MQTT_BROKER_HOST"),
            mqtt_broker_port: parse_port("KURBISIO_MQTT_BROKER_PORT", 8883)?,
            client_cert_file: optional("KURBISIO_CLIENT_CERT_FILE").map(Into::into),
            client_key_file: optional("KURBISIO_CLIENT_KEY_FILE").map(Into::into),
            thing_key: optional("KURBISIO_THING_KEY"),
            jwks_url: optional("KURBISIO_JWKS_URL"),
            jwt_issuer: optional("KURBISIO_JWT_ISSUER"),
            jwt_audience: optional("KURBISIO_JWT_AUDIENCE"),
            enforce_authorization: optional("KURBISIO_AUTHORIZATION").as_deref()
                != Some("disabled"),
            allow_device_topics: optional("KURBISIO_DEVICE_TOPICS").as_deref() == Some("allowed"),
        })
    }

    pub fn load_file(&self) -> Result<FileConfig, EnvError> {
        let raw = std::fs::read_to_string(&self.config_file).map_err(|e| {
            EnvError(format!("cannot read {}: {e}", self.config_file.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EnvError(format!("cannot parse {}: {e}", self.config_file.display()))
        })
    }

    /// The broker runs when all TLS material is present.
    pub fn broker_enabled(&self) -> bool {
        self.ca_cert_file.is_some()
            && self.server_cert_file.is_some()
            && self.server_key_file.is_some()
    }

    /// The credential service runs when the CA key pair and the thing
    /// secret are present.
    pub fn credentials_enabled(&self) -> bool {
        self.ca_cert_file.is_some() && self.ca_key_file.is_some() && self.thing_key.is_some()
    }
}
