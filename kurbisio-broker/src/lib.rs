//! # kurbisio-broker — the embedded MQTT broker
//!
//! A TLS listener (port 8883 by convention) with mandatory client
//! certificates. The leaf certificate's common name must be a device UUID;
//! the MQTT client id must equal that UUID; subscriptions are limited to
//! the device's own twin-request topics; publishes are limited to the
//! device's own twin-report and twin-get topics. Twin reports persist
//! through the shared [`TwinStore`](kurbisio_db::TwinStore) with the same
//! idempotence rule the REST surface has.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`topic`] | Topic parsing, the subscribe ACL and wildcard matching (pure) |
//! | [`tls`] | Server TLS configuration and CN → device-id extraction |
//! | [`session`] | The per-connection protocol loop |
//! | [`broker`] | The listener, the connection registry, the in-process publisher |
//! | [`publisher`] | Outbound publisher over a `rumqttc` client (split deployments) |

pub mod broker;
pub mod error;
pub mod publisher;
pub mod session;
pub mod tls;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerPublisher, BrokerState};
pub use error::BrokerError;
pub use publisher::{ClientTls, MqttClientPublisher};
