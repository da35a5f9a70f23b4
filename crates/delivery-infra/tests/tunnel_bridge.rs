//! Remote peers reaching local participants through the memory tunnel endpoint.

use std::sync::Arc;
use std::time::Duration;

use delivery_core::stats::counter;
use delivery_core::tunnel::{decode_message, encode_message};
use delivery_core::{DeliveryService, Participant};
use delivery_infra::tunnel::{MemoryTunnelEndpoint, SessionReceiver};
use delivery_types::config::{DeliveryConfig, TunnelConfig};
use delivery_types::message::{BROADCAST, header, now_epoch_ms};
use delivery_types::transport::TransportType;
use delivery_types::{Message, MimeType};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(2);
const PEER: &str = "192.168.1.20";

fn server_config() -> DeliveryConfig {
    DeliveryConfig {
        tunnel: Some(TunnelConfig::server(
            "/tmp/delivery-test",
            "127.0.0.1",
            44000,
            44001,
            55000,
            4,
        )),
        ..DeliveryConfig::default()
    }
}

fn start_with_endpoint() -> (Arc<DeliveryService>, Arc<MemoryTunnelEndpoint>) {
    let endpoint = MemoryTunnelEndpoint::new();
    let service = DeliveryService::builder(server_config())
        .tunnel_endpoint(endpoint.clone())
        .start()
        .unwrap();
    (service, endpoint)
}

async fn next_payload(peer: &mut SessionReceiver) -> Message {
    let payload = tokio::time::timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for a tunnel payload")
        .expect("session closed");
    decode_message(&payload).unwrap()
}

async fn next(participant: &mut Participant) -> Message {
    tokio::time::timeout(WAIT, participant.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("mailbox closed")
}

#[tokio::test]
async fn service_starts_endpoint_and_tunnel_transport() {
    let (service, endpoint) = start_with_endpoint();
    assert!(endpoint.is_started());
    let tunnel = service.transport("tunnel@server").unwrap();
    assert_eq!(tunnel.transport_type(), TransportType::RemoteTunnel);

    service.shutdown().await;
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn remote_request_is_answered_on_the_same_session() {
    let (service, endpoint) = start_with_endpoint();
    let mut client = Participant::with_uri("client_1");
    client.connect(&service, TransportType::Local).unwrap();
    let mut peer = endpoint.connect_session("17", PEER).unwrap();
    let mut other_peer = endpoint.connect_session("18", PEER).unwrap();

    let request = Message::request(
        "remote_0",
        "client_1",
        json!({"q": 1}),
        Some(now_epoch_ms() + 5_000),
    );
    endpoint
        .inject("17", &encode_message(&request).unwrap())
        .unwrap();

    let received = next(&mut client).await;
    assert_eq!(received.header_str(header::SUBSCRIBER_AERON_SESSION_ID), Some("17"));
    assert_eq!(
        received.header_str(header::SUBSCRIBER_TRANSPORT_URI),
        Some("tunnel@server")
    );
    let transaction_id = received.transaction_id().unwrap().to_string();
    client.respond(&received, json!({"a": 1})).unwrap();

    let response = next_payload(&mut peer).await;
    assert_eq!(response.mime_type(), Some(MimeType::Response));
    assert_eq!(response.transaction_id(), Some(transaction_id.as_str()));
    assert_eq!(response.to(), Some("remote_0"));
    assert_eq!(response.body, json!({"a": 1}));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(other_peer.try_recv().is_err());
    service.shutdown().await;
}

#[tokio::test]
async fn session_headers_cannot_be_spoofed() {
    let (service, endpoint) = start_with_endpoint();
    let mut client = Participant::with_uri("client_1");
    client.connect(&service, TransportType::Local).unwrap();
    let _peer = endpoint.connect_session("17", PEER).unwrap();

    let mut publish = Message::publish("remote_0", "client_1", "hi");
    publish.set_header(header::SUBSCRIBER_AERON_SESSION_ID, "99");
    endpoint
        .inject("17", &encode_message(&publish).unwrap())
        .unwrap();

    let received = next(&mut client).await;
    assert_eq!(received.header_str(header::SUBSCRIBER_AERON_SESSION_ID), Some("17"));
    service.shutdown().await;
}

#[tokio::test]
async fn local_broadcast_reaches_every_remote_session() {
    let (service, endpoint) = start_with_endpoint();
    let mut client = Participant::with_uri("client_0");
    client.connect(&service, TransportType::Local).unwrap();
    let mut a = endpoint.connect_session("1", PEER).unwrap();
    let mut b = endpoint.connect_session("2", PEER).unwrap();

    client
        .publish(Message::publish("client_0", BROADCAST, "hello all"))
        .unwrap();

    for peer in [&mut a, &mut b] {
        let message = next_payload(peer).await;
        assert_eq!(message.from(), Some("client_0"));
        assert_eq!(message.body, json!("hello all"));
    }
    // The sender is subscribed to /broadcast too.
    assert_eq!(next(&mut client).await.body, json!("hello all"));
    service.shutdown().await;
}

#[tokio::test]
async fn remote_peer_can_query_service_stats() {
    let (service, endpoint) = start_with_endpoint();
    let mut peer = endpoint.connect_session("5", PEER).unwrap();

    let request = Message::request(
        "remote_admin",
        service.uri(),
        "stats",
        Some(now_epoch_ms() + 5_000),
    );
    endpoint
        .inject("5", &encode_message(&request).unwrap())
        .unwrap();

    let response = next_payload(&mut peer).await;
    assert_eq!(response.mime_type(), Some(MimeType::Response));
    assert_eq!(response.body["service_uri"], "delivery_service");
    assert!(response.body["transports"].as_array().unwrap().len() >= 2);
    service.shutdown().await;
}

#[tokio::test]
async fn undecodable_payload_is_counted_and_dropped() {
    let (service, endpoint) = start_with_endpoint();
    let _peer = endpoint.connect_session("3", PEER).unwrap();

    endpoint.inject("3", "definitely not json").unwrap();

    let tunnel = service.transport("tunnel@server").unwrap();
    assert_eq!(tunnel.stats().get(counter::TUNNEL_INBOUND_COUNT), 1);
    assert_eq!(tunnel.stats().get(counter::ERRORS_COUNT), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn tunnel_config_without_endpoint_stays_local() {
    let service = DeliveryService::start(server_config()).unwrap();
    assert!(service.transport("tunnel@server").is_none());
    assert_eq!(service.transport_count(), 1);
    service.shutdown().await;
}
