//! Outbound publisher over a `rumqttc` client connection.
//!
//! Used when the REST surface and the broker run as separate processes:
//! the engine publishes twin requests to the remote broker over the same
//! mTLS listener devices use. The embedded deployment uses the in-process
//! [`BrokerPublisher`](crate::broker::BrokerPublisher) instead.

use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions, QoS, TlsConfiguration, Transport};
use tracing::{debug, warn};

use kurbisio_core::Publisher;

use crate::error::BrokerError;

/// Client-certificate material for the publisher connection, PEM-encoded.
pub struct ClientTls {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

/// A fire-and-forget publisher backed by an MQTT client connection.
pub struct MqttClientPublisher {
    client: AsyncClient,
}

impl MqttClientPublisher {
    /// Connect to a broker and keep the event loop alive in a background
    /// task. Connection losses are retried by the loop; publishes issued
    /// while disconnected are queued by the client up to its capacity.
    pub fn connect(
        client_id: &str,
        host: &str,
        port: u16,
        tls: Option<ClientTls>,
    ) -> Result<Self, BrokerError> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(tls) = tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: tls.ca,
                alpn: None,
                client_auth: Some((tls.client_cert, tls.client_key)),
            }));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => debug!(?event, "mqtt publisher event"),
                    Err(err) => {
                        warn!(error = %err, "mqtt publisher connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(Self { client })
    }
}

impl Publisher for MqttClientPublisher {
    fn publish_qos1(&self, topic: &str, payload: Vec<u8>) {
        if let Err(err) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
        {
            warn!(topic, error = %err, "publish dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_queue_while_the_connection_is_down() {
        // Nothing listens on this port; the event loop keeps retrying in
        // the background while publishes land in the client queue.
        let publisher =
            MqttClientPublisher::connect("kurbisio-test", "127.0.0.1", 18883, None).unwrap();
        let device = uuid::Uuid::new_v4();
        publisher.publish_qos1(
            &kurbisio_core::publish::twin_request_topic(device, "config"),
            br#"{"v":1}"#.to_vec(),
        );
    }
}
