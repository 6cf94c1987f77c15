//! The Kurbisio service binary.
//!
//! Startup: environment → configuration document → pool + additive DDL →
//! REST and broker supervisors. The two supervisors are independent
//! concurrent programs sharing the storage driver; a cancellation token
//! fans the termination signal out to both and the process exits 0 once
//! they have drained.

mod config;

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kurbisio_access::{AccessState, CapabilityCache, JwtConfig, JwtValidator, ThingAuthConfig};
use kurbisio_backend::{apply_pipeline, Backend, BackendState, CredentialService, ShortcutTable};
use kurbisio_broker::{Broker, BrokerConfig, ClientTls, MqttClientPublisher};
use kurbisio_core::{NoopPublisher, Publisher};
use kurbisio_db::{Driver, Registry, TwinStore};
use kurbisio_pki::CertificateAuthority;

use crate::config::ServerConfig;

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(
                std::env::var("KURBISIO_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            )
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "cannot start runtime");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run()) {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env()?;
    let file = config.load_file()?;

    // Pool + driver.
    let mut connect = PgConnectOptions::from_str(&config.postgres)?;
    if let Some(password) = &config.postgres_password {
        connect = connect.password(password);
    }
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect_with(connect)
        .await?;
    let driver = Arc::new(Driver::from_pool(pool, &config.schema));
    let twin = TwinStore::new(driver.clone());

    // Compile the engine; the device collection is built in.
    let mut backend_config = file.backend.clone();
    backend_config.ensure_device_collection();
    let backend = Backend::new(driver.clone(), &backend_config)?;
    backend.create_schema().await?;
    info!(schema = config.schema, "schema ready");

    let cancel = CancellationToken::new();

    // Broker supervisor (when TLS material is configured).
    let mut publisher: Arc<dyn Publisher> = Arc::new(NoopPublisher);
    let mut broker_task = None;
    if config.broker_enabled() {
        let broker = Broker::new(
            BrokerConfig {
                bind: config.mqtt_bind,
                ca_cert: config.ca_cert_file.clone().expect("checked by broker_enabled"),
                server_cert: config
                    .server_cert_file
                    .clone()
                    .expect("checked by broker_enabled"),
                server_key: config
                    .server_key_file
                    .clone()
                    .expect("checked by broker_enabled"),
                allow_device_topics: config.allow_device_topics,
            },
            twin.clone(),
        )?;
        publisher = broker.publisher();
        let broker_cancel = cancel.clone();
        broker_task = Some(tokio::spawn(async move { broker.run(broker_cancel).await }));
    }

    // Split deployment: a configured remote broker takes the outbound twin
    // requests instead of the in-process fan-out.
    if let Some(host) = &config.mqtt_broker_host {
        publisher = Arc::new(MqttClientPublisher::connect(
            "kurbisio-server",
            host,
            config.mqtt_broker_port,
            publisher_tls(&config)?,
        )?);
        info!(host, port = config.mqtt_broker_port, "publishing to remote broker");
    }

    // Credential service (when the CA key pair and thing secret are
    // configured).
    let mut credentials = None;
    if config.credentials_enabled() {
        let ca_cert = std::fs::read_to_string(
            config.ca_cert_file.as_ref().expect("checked by credentials_enabled"),
        )?;
        let ca_key = std::fs::read_to_string(
            config.ca_key_file.as_ref().expect("checked by credentials_enabled"),
        )?;
        let ca = CertificateAuthority::from_pem(&ca_cert, &ca_key)?;
        credentials = Some(Arc::new(CredentialService::new(ca)));
        info!("credential service enabled");
    }

    // Access state: JWT validator, capability cache, middleware config.
    let mut access_config = file.access.clone().unwrap_or_default();
    access_config.enforce = config.enforce_authorization;
    if let Some(key) = &config.thing_key {
        access_config.thing = Some(ThingAuthConfig { key: key.clone() });
    }
    let jwt = match (&config.jwks_url, &config.jwt_issuer, &config.jwt_audience) {
        (Some(jwks_url), Some(issuer), Some(audience)) => {
            let registry = Registry::new(driver.clone(), "jwks:");
            let jwt_config = JwtConfig {
                jwks_url: jwks_url.clone(),
                issuer: issuer.clone(),
                audience: audience.clone(),
            };
            access_config.jwt = Some(jwt_config.clone());
            Some(JwtValidator::new(jwt_config, registry).await?)
        }
        _ => None,
    };
    let access = Arc::new(AccessState {
        config: access_config,
        cache: CapabilityCache::default(),
        jwt,
        driver: driver.clone(),
    });
    let shortcuts = Arc::new(ShortcutTable {
        entries: backend_config.shortcuts.clone(),
    });

    // REST supervisor.
    let state = BackendState {
        driver: driver.clone(),
        twin,
        publisher,
        enforce: config.enforce_authorization,
        credentials,
    };
    let app = apply_pipeline(backend.router(state), access, shortcuts);
    let listener = tokio::net::TcpListener::bind(config.http_bind).await?;
    info!(bind = %config.http_bind, "rest listening");

    let http_cancel = cancel.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { http_cancel.cancelled().await });

    tokio::spawn(shutdown_signal(cancel.clone()));
    server.await?;

    if let Some(task) = broker_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "broker failed"),
            Err(err) => error!(error = %err, "broker task panicked"),
        }
    }
    Ok(())
}

/// Client TLS material for the remote-broker publisher connection: mTLS
/// when the CA and the client key pair are all configured, plain TCP
/// otherwise.
fn publisher_tls(config: &ServerConfig) -> Result<Option<ClientTls>, Box<dyn std::error::Error>> {
    let (Some(ca), Some(cert), Some(key)) = (
        &config.ca_cert_file,
        &config.client_cert_file,
        &config.client_key_file,
    ) else {
        return Ok(None);
    };
    Ok(Some(ClientTls {
        ca: std::fs::read(ca)?,
        client_cert: std::fs::read(cert)?,
        client_key: std::fs::read(key)?,
    }))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("termination signal received");
    cancel.cancel();
}
