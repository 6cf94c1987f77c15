//! The per-connection protocol loop.
//!
//! A session begins after the TLS handshake has already bound the
//! connection to a device id (the certificate's common name). The MQTT
//! CONNECT must present exactly that id as client identifier; everything
//! afterwards is gated by the topic ACL. QoS 2 is not supported: inbound
//! QoS 2 publishes are protocol violations, QoS 2 subscriptions are granted
//! at QoS 1.

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4::{
    ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, Publish, SubAck, SubscribeReasonCode,
    UnsubAck,
};
use rumqttc::mqttbytes::{self, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use kurbisio_core::publish::twin_request_topic;
use kurbisio_db::TwinStore;

use crate::broker::{BrokerState, OutboundPublish, SessionHandle};
use crate::error::BrokerError;
use crate::topic::{self, TwinTopic};

const MAX_PACKET_SIZE: usize = 256 * 1024;
const OUTBOUND_QUEUE: usize = 64;

pub struct Session {
    device_id: Uuid,
    stream: TlsStream<TcpStream>,
    state: std::sync::Arc<BrokerState>,
    twin: TwinStore,
    allow_device_topics: bool,
    next_pkid: u16,
}

impl Session {
    pub fn new(
        device_id: Uuid,
        stream: TlsStream<TcpStream>,
        state: std::sync::Arc<BrokerState>,
        twin: TwinStore,
        allow_device_topics: bool,
    ) -> Self {
        Self {
            device_id,
            stream,
            state,
            twin,
            allow_device_topics,
            next_pkid: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let mut buf = BytesMut::with_capacity(4096);

        // CONNECT phase: the first packet must be a CONNECT whose client id
        // equals the certificate-bound device id.
        let connect = loop {
            match mqttbytes::v4::read(&mut buf, MAX_PACKET_SIZE) {
                Ok(Packet::Connect(connect)) => break connect,
                Ok(_) => return Err(BrokerError::Protocol("expected CONNECT".into())),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {
                    if self.stream.read_buf(&mut buf).await? == 0 {
                        return Err(BrokerError::Protocol("closed before CONNECT".into()));
                    }
                }
                Err(err) => return Err(BrokerError::Protocol(format!("bad CONNECT: {err}"))),
            }
        };
        if connect.client_id != self.device_id.to_string() {
            warn!(device_id = %self.device_id, client_id = connect.client_id,
                  "client id does not match certificate");
            self.write_connack(ConnectReturnCode::NotAuthorized).await?;
            return Err(BrokerError::Protocol(
                "client id does not match certificate".into(),
            ));
        }
        self.write_connack(ConnectReturnCode::Success).await?;
        debug!(device_id = %self.device_id, "mqtt session established");

        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = self.state.register(self.device_id, tx);
        let conn_id = handle.conn_id;
        let state = self.state.clone();
        let result = self.serve(&mut buf, &handle, &mut rx, cancel).await;
        state.deregister(self.device_id, conn_id);
        debug!(device_id = %self.device_id, "mqtt session closed");
        result
    }

    async fn serve(
        &mut self,
        buf: &mut BytesMut,
        handle: &SessionHandle,
        rx: &mut mpsc::Receiver<OutboundPublish>,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        loop {
            // Drain every complete packet before blocking again.
            loop {
                match mqttbytes::v4::read(buf, MAX_PACKET_SIZE) {
                    Ok(packet) => {
                        if !self.handle_packet(packet, handle).await? {
                            return Ok(());
                        }
                    }
                    Err(mqttbytes::Error::InsufficientBytes(_)) => break,
                    Err(err) => {
                        return Err(BrokerError::Protocol(format!("bad packet: {err}")))
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                outbound = rx.recv() => {
                    if let Some(publish) = outbound {
                        self.send_publish(publish).await?;
                    }
                }
                read = self.stream.read_buf(buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `false` when the session should end normally.
    async fn handle_packet(
        &mut self,
        packet: Packet,
        handle: &SessionHandle,
    ) -> Result<bool, BrokerError> {
        match packet {
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.filters.len());
                for filter in &subscribe.filters {
                    if topic::subscription_allowed(self.device_id, &filter.path) {
                        let granted = match filter.qos {
                            QoS::ExactlyOnce => QoS::AtLeastOnce,
                            qos => qos,
                        };
                        handle
                            .filters
                            .write()
                            .expect("filters lock poisoned")
                            .push(filter.path.clone());
                        return_codes.push(SubscribeReasonCode::Success(granted));
                    } else {
                        warn!(device_id = %self.device_id, filter = filter.path,
                              "subscription refused");
                        return_codes.push(SubscribeReasonCode::Failure);
                    }
                }
                let ack = SubAck {
                    pkid: subscribe.pkid,
                    return_codes,
                };
                self.write_packet(|buf| ack.write(buf)).await?;
                Ok(true)
            }
            Packet::Unsubscribe(unsubscribe) => {
                {
                    let mut filters = handle.filters.write().expect("filters lock poisoned");
                    filters.retain(|f| !unsubscribe.topics.contains(f));
                }
                let ack = UnsubAck {
                    pkid: unsubscribe.pkid,
                };
                self.write_packet(|buf| ack.write(buf)).await?;
                Ok(true)
            }
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PingReq => {
                self.write_packet(|buf| PingResp.write(buf)).await?;
                Ok(true)
            }
            Packet::PubAck(_) => Ok(true),
            Packet::Disconnect => Ok(false),
            other => Err(BrokerError::Protocol(format!(
                "unexpected packet: {other:?}"
            ))),
        }
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<bool, BrokerError> {
        if publish.qos == QoS::ExactlyOnce {
            return Err(BrokerError::Protocol("qos 2 is not supported".into()));
        }

        match topic::parse(&publish.topic) {
            Some(TwinTopic::Reports { device_id, key }) => {
                if device_id != self.device_id {
                    return Err(BrokerError::Protocol(
                        "certificate does not own this topic".into(),
                    ));
                }
                let report: serde_json::Value = serde_json::from_slice(&publish.payload)
                    .map_err(|_| {
                        BrokerError::Protocol("report payload must be valid JSON".into())
                    })?;
                let written = self.twin.put_report(device_id, &key, &report).await?;
                debug!(%device_id, key, written, "twin report received");
            }
            Some(TwinTopic::Get { device_id }) => {
                if device_id != self.device_id {
                    return Err(BrokerError::Protocol(
                        "certificate does not own this topic".into(),
                    ));
                }
                let keys: Vec<String> = serde_json::from_slice(&publish.payload)
                    .map_err(|_| {
                        BrokerError::Protocol(
                            "twin get payload must be a JSON array of keys".into(),
                        )
                    })?;
                for key in keys {
                    let Some(entry) = self.twin.get(device_id, &key).await? else {
                        continue;
                    };
                    let Some(request) = entry.request else {
                        continue;
                    };
                    let payload = serde_json::to_vec(&request)
                        .map_err(|e| BrokerError::Protocol(e.to_string()))?;
                    self.send_publish(OutboundPublish {
                        topic: twin_request_topic(device_id, &key),
                        payload,
                        qos: QoS::AtMostOnce,
                    })
                    .await?;
                }
            }
            Some(TwinTopic::Requests { .. }) => {
                return Err(BrokerError::Protocol(
                    "devices may not publish twin requests".into(),
                ));
            }
            None => {
                if topic::is_reserved(&publish.topic) || !self.allow_device_topics {
                    return Err(BrokerError::Protocol(format!(
                        "topic {:?} refused",
                        publish.topic
                    )));
                }
                // Device-owned topic: accepted, but nothing can have
                // subscribed to it under the ACL, so it is dropped.
                debug!(device_id = %self.device_id, topic = publish.topic,
                       "device topic accepted and dropped");
            }
        }

        if publish.qos == QoS::AtLeastOnce {
            let ack = PubAck {
                pkid: publish.pkid,
            };
            self.write_packet(|buf| ack.write(buf)).await?;
        }
        Ok(true)
    }

    async fn send_publish(&mut self, outbound: OutboundPublish) -> Result<(), BrokerError> {
        let pkid = match outbound.qos {
            QoS::AtMostOnce => 0,
            _ => {
                self.next_pkid = self.next_pkid.wrapping_add(1).max(1);
                self.next_pkid
            }
        };
        let publish = Publish {
            dup: false,
            qos: outbound.qos,
            retain: false,
            topic: outbound.topic,
            pkid,
            payload: Bytes::from(outbound.payload),
        };
        self.write_packet(|buf| publish.write(buf)).await
    }

    async fn write_connack(&mut self, code: ConnectReturnCode) -> Result<(), BrokerError> {
        let ack = ConnAck {
            session_present: false,
            code,
        };
        self.write_packet(|buf| ack.write(buf)).await
    }

    async fn write_packet(
        &mut self,
        encode: impl FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    ) -> Result<(), BrokerError> {
        let mut buf = BytesMut::new();
        encode(&mut buf).map_err(|e| BrokerError::Protocol(format!("encode failed: {e}")))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
