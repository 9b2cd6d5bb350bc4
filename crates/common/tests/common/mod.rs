//! Shared test utilities for client and sync integration tests
#![allow(dead_code)]

use std::time::Duration;

use common::prelude::*;
use common::testkit::{MemoryServer, MockConnector, MockListener, ServerLink};
use common::wire::{EventPayload, RequestFrame, ResponseFrame};
use tokio::sync::broadcast;

pub fn endpoint() -> EndpointConfig {
    EndpointConfig::parse("etcd://test:2379").unwrap()
}

/// Short timeouts so reconnect tests stay quick on a paused clock
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        call_timeout_ms: 500,
        reconnect_delay_ms: 50,
        ..ClientConfig::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client whose server side is driven by hand
pub async fn manual_client(
    config: ClientConfig,
) -> (
    Client,
    broadcast::Receiver<SessionEvent>,
    MockConnector,
    MockListener,
    ServerLink,
) {
    init_tracing();
    let (connector, mut listener) = MockConnector::new();
    let (client, mut events) = Client::connect(endpoint(), config, connector.clone());
    let link = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Open);
    client.wait_connected().await.unwrap();
    (client, events, connector, listener, link)
}

/// Client talking to an in-memory store
pub async fn served_client(
    config: ClientConfig,
) -> (Client, broadcast::Receiver<SessionEvent>, MemoryServer) {
    init_tracing();
    let (connector, listener) = MockConnector::new();
    let server = MemoryServer::spawn(listener);
    let (client, events) = Client::connect(endpoint(), config, connector);
    client.wait_connected().await.unwrap();
    (client, events, server)
}

/// Next lifecycle event, skipping watch data
pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("no session event within a minute")
            .expect("event stream ended");
        if !matches!(event, SessionEvent::Data(_)) {
            return event;
        }
    }
}

/// Next watch event
pub async fn next_change(events: &mut broadcast::Receiver<SessionEvent>) -> ChangeEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("no session event within a minute")
            .expect("event stream ended");
        if let SessionEvent::Data(change) = event {
            return change;
        }
    }
}

/// Answer a query with a single record whose value echoes its key
pub fn echo_reply(request: &RequestFrame, revision: i64) -> ResponseFrame {
    let key = request.request.key.clone().unwrap_or_default();
    let payload = EventPayload {
        header: ResponseHeader::new(revision),
        kvs: vec![Record::key_only(key.clone()).with_value(key)],
        ..Default::default()
    };
    ResponseFrame::success(request.id.clone(), request.action, &payload)
}
