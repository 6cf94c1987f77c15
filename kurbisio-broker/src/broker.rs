//! The broker: listener, connection registry and in-process fan-out.
//!
//! Connection state lives in [`BrokerState`]: the `device id → sessions`
//! map behind a shared-mutex (reads take the shared lock, writes the
//! exclusive lock) and each session's granted subscription filters. The
//! [`BrokerPublisher`] implements the engine's
//! [`Publisher`](kurbisio_core::Publisher) seam by fanning a publish out to
//! the matching sessions' outbound queues; the broker side owns delivery
//! from there.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rumqttc::mqttbytes::QoS;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kurbisio_core::Publisher;
use kurbisio_db::TwinStore;

use crate::error::BrokerError;
use crate::session::Session;
use crate::tls;
use crate::topic;

/// Broker configuration. TLS material is mandatory; there is no plaintext
/// listener.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bind address, conventionally `0.0.0.0:8883`.
    pub bind: SocketAddr,
    /// CA used to verify client certificates (and to sign device leaves).
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    /// Permit publishes outside the `kurbisio/` namespace (device-owned
    /// topics). Reserved-namespace rules always apply.
    pub allow_device_topics: bool,
}

/// A queued outbound delivery.
#[derive(Debug, Clone)]
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// One connected session, as seen from the registry.
pub struct SessionHandle {
    pub conn_id: u64,
    pub tx: mpsc::Sender<OutboundPublish>,
    /// Granted subscription filters.
    pub filters: RwLock<Vec<String>>,
}

/// The shared connection registry.
#[derive(Default)]
pub struct BrokerState {
    sessions: RwLock<HashMap<Uuid, Vec<Arc<SessionHandle>>>>,
    next_conn: AtomicU64,
}

impl BrokerState {
    pub fn register(&self, device_id: Uuid, tx: mpsc::Sender<OutboundPublish>) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle {
            conn_id: self.next_conn.fetch_add(1, Ordering::Relaxed),
            tx,
            filters: RwLock::new(Vec::new()),
        });
        let mut sessions = self.sessions.write().expect("sessions lock poisoned");
        sessions.entry(device_id).or_default().push(handle.clone());
        handle
    }

    pub fn deregister(&self, device_id: Uuid, conn_id: u64) {
        let mut sessions = self.sessions.write().expect("sessions lock poisoned");
        if let Some(list) = sessions.get_mut(&device_id) {
            list.retain(|h| h.conn_id != conn_id);
            if list.is_empty() {
                sessions.remove(&device_id);
            }
        }
    }

    pub fn connected_devices(&self) -> usize {
        self.sessions.read().expect("sessions lock poisoned").len()
    }

    /// Fan a publish out to every session of `device_id` whose granted
    /// filters match the topic. Queue-full sessions are skipped; delivery
    /// is best-effort from the publisher's perspective.
    pub fn fan_out(&self, device_id: Uuid, publish: &OutboundPublish) {
        let sessions = self.sessions.read().expect("sessions lock poisoned");
        let Some(list) = sessions.get(&device_id) else {
            return;
        };
        for handle in list {
            let matched = handle
                .filters
                .read()
                .expect("filters lock poisoned")
                .iter()
                .any(|filter| topic::matches(filter, &publish.topic));
            if !matched {
                continue;
            }
            if handle.tx.try_send(publish.clone()).is_err() {
                warn!(%device_id, conn = handle.conn_id, "outbound queue full, dropping publish");
            }
        }
    }
}

/// In-process implementation of the engine's publisher seam.
pub struct BrokerPublisher {
    state: Arc<BrokerState>,
}

impl BrokerPublisher {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state }
    }
}

impl Publisher for BrokerPublisher {
    fn publish_qos1(&self, topic_str: &str, payload: Vec<u8>) {
        // Only twin-request topics are ever published from the REST side.
        let Some(topic::TwinTopic::Requests { device_id, .. }) = topic::parse(topic_str) else {
            warn!(topic = topic_str, "refusing to publish outside twin requests");
            return;
        };
        self.state.fan_out(
            device_id,
            &OutboundPublish {
                topic: topic_str.to_owned(),
                payload,
                qos: QoS::AtLeastOnce,
            },
        );
    }
}

/// The long-lived broker.
pub struct Broker {
    config: BrokerConfig,
    twin: TwinStore,
    state: Arc<BrokerState>,
    acceptor: TlsAcceptor,
}

impl Broker {
    pub fn new(config: BrokerConfig, twin: TwinStore) -> Result<Self, BrokerError> {
        let tls_config =
            tls::server_config(&config.ca_cert, &config.server_cert, &config.server_key)?;
        Ok(Self {
            config,
            twin,
            state: Arc::new(BrokerState::default()),
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        })
    }

    pub fn state(&self) -> Arc<BrokerState> {
        self.state.clone()
    }

    /// The in-process publisher handed to the REST twin handlers.
    pub fn publisher(&self) -> Arc<BrokerPublisher> {
        Arc::new(BrokerPublisher {
            state: self.state.clone(),
        })
    }

    /// Accept loop. Runs until the cancellation token fires, then stops
    /// accepting and signals every session to drain.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        info!(bind = %self.config.bind, "mqtt broker listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let acceptor = self.acceptor.clone();
                    let state = self.state.clone();
                    let twin = self.twin.clone();
                    let allow_device_topics = self.config.allow_device_topics;
                    let session_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                debug!(%peer, error = %err, "tls handshake failed");
                                return;
                            }
                        };
                        let device_id = {
                            let (_, connection) = tls_stream.get_ref();
                            match tls::device_id_from_certs(
                                connection.peer_certificates().unwrap_or_default(),
                            ) {
                                Ok(id) => id,
                                Err(err) => {
                                    warn!(%peer, error = %err, "connection rejected");
                                    return;
                                }
                            }
                        };
                        debug!(%peer, %device_id, "device connected");
                        let session = Session::new(
                            device_id,
                            tls_stream,
                            state,
                            twin,
                            allow_device_topics,
                        );
                        if let Err(err) = session.run(session_cancel).await {
                            debug!(%device_id, error = %err, "session ended with error");
                        }
                    });
                }
            }
        }
        info!("mqtt broker shutting down");
        Ok(())
    }
}
