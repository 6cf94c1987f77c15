//! The outbound MQTT publisher seam.
//!
//! REST twin handlers publish request payloads towards devices through this
//! trait; the broker crate provides the real implementations (in-process
//! fan-out when the broker runs embedded, a client connection otherwise).
//! Delivery is fire-and-forget from the engine's perspective; redelivery is
//! the broker's concern.

use uuid::Uuid;

/// Fire-and-forget publisher at MQTT quality-of-service level 1.
pub trait Publisher: Send + Sync {
    fn publish_qos1(&self, topic: &str, payload: Vec<u8>);
}

/// Topic a device receives twin requests on.
pub fn twin_request_topic(device_id: Uuid, key: &str) -> String {
    format!("kurbisio/{device_id}/twin/requests/{key}")
}

/// Publisher that drops everything; used when no broker is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn publish_qos1(&self, _topic: &str, _payload: Vec<u8>) {}
}
