//! Fan-out behavior of the connection registry and the in-process
//! publisher, exercised without sockets.

use std::sync::Arc;

use rumqttc::mqttbytes::QoS;
use tokio::sync::mpsc;
use uuid::Uuid;

use kurbisio_broker::broker::{BrokerPublisher, BrokerState, OutboundPublish};
use kurbisio_core::publish::twin_request_topic;
use kurbisio_core::Publisher;

fn subscribed(state: &BrokerState, device: Uuid, filter: &str) -> mpsc::Receiver<OutboundPublish> {
    let (tx, rx) = mpsc::channel(8);
    let handle = state.register(device, tx);
    handle
        .filters
        .write()
        .expect("filters lock poisoned")
        .push(filter.to_owned());
    rx
}

#[tokio::test]
async fn publishes_reach_matching_subscriptions() {
    let state = Arc::new(BrokerState::default());
    let device = Uuid::new_v4();
    let mut rx = subscribed(
        &state,
        device,
        &format!("kurbisio/{device}/twin/requests/#"),
    );

    state.fan_out(
        device,
        &OutboundPublish {
            topic: twin_request_topic(device, "config"),
            payload: br#"{"v":1}"#.to_vec(),
            qos: QoS::AtLeastOnce,
        },
    );
    let delivered = rx.try_recv().unwrap();
    assert_eq!(delivered.topic, twin_request_topic(device, "config"));
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn other_devices_receive_nothing() {
    let state = Arc::new(BrokerState::default());
    let subscriber = Uuid::new_v4();
    let publisher_target = Uuid::new_v4();
    let mut rx = subscribed(
        &state,
        subscriber,
        &format!("kurbisio/{subscriber}/twin/requests/#"),
    );

    state.fan_out(
        publisher_target,
        &OutboundPublish {
            topic: twin_request_topic(publisher_target, "config"),
            payload: b"{}".to_vec(),
            qos: QoS::AtLeastOnce,
        },
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unmatched_filters_receive_nothing() {
    let state = Arc::new(BrokerState::default());
    let device = Uuid::new_v4();
    let mut rx = subscribed(
        &state,
        device,
        &format!("kurbisio/{device}/twin/requests/other"),
    );

    state.fan_out(
        device,
        &OutboundPublish {
            topic: twin_request_topic(device, "config"),
            payload: b"{}".to_vec(),
            qos: QoS::AtLeastOnce,
        },
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn deregistered_sessions_drop_out() {
    let state = Arc::new(BrokerState::default());
    let device = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    let handle = state.register(device, tx);
    handle
        .filters
        .write()
        .expect("filters lock poisoned")
        .push(format!("kurbisio/{device}/twin/requests/#"));
    assert_eq!(state.connected_devices(), 1);

    state.deregister(device, handle.conn_id);
    assert_eq!(state.connected_devices(), 0);
    state.fan_out(
        device,
        &OutboundPublish {
            topic: twin_request_topic(device, "config"),
            payload: b"{}".to_vec(),
            qos: QoS::AtLeastOnce,
        },
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn the_publisher_seam_only_accepts_twin_requests() {
    let state = Arc::new(BrokerState::default());
    let device = Uuid::new_v4();
    let mut rx = subscribed(
        &state,
        device,
        &format!("kurbisio/{device}/twin/requests/#"),
    );
    let publisher = BrokerPublisher::new(state.clone());

    // A twin request goes through.
    publisher.publish_qos1(&twin_request_topic(device, "config"), b"{}".to_vec());
    assert!(rx.try_recv().is_ok());

    // Reports and foreign topics are refused at the seam.
    publisher.publish_qos1(
        &format!("kurbisio/{device}/twin/reports/config"),
        b"{}".to_vec(),
    );
    publisher.publish_qos1("sensors/temperature", b"{}".to_vec());
    assert!(rx.try_recv().is_err());
}
