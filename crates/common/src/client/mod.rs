use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, oneshot, watch};

use crate::config::{ClientConfig, EndpointConfig};
use crate::wire::{encoding, Action, CallRequest, EventPayload, Record, ResponseHeader};

mod actor;
mod connection;
mod pending;
mod range;

pub use actor::{ConnectionState, SessionEvent};
pub use connection::{
    Connector, FrameSink, FrameStream, Transport, TransportError, WebSocketConnector,
};
pub use range::{end_key, RangeScan, ScanAborted};

use actor::{Command, ConnectionActor};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection not ready")]
    NotReady,
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection lost while the call was in flight")]
    Disconnected,
    #[error("client is closed")]
    Closed,
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("key not found: {0}")]
    NotFound(String),
}

/// Successful call response
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub action: Action,
    pub key: Option<String>,
    pub event: Option<serde_json::Value>,
}

impl Reply {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        let event = self
            .event
            .clone()
            .ok_or_else(|| CallError::Decode("response carries no event".to_string()))?;
        serde_json::from_value(event).map_err(|err| CallError::Decode(err.to_string()))
    }

    pub fn payload(&self) -> Result<EventPayload, CallError> {
        self.decode()
    }
}

/// Handle to a gateway session.
///
/// Cheap to clone; every clone talks to the same connection actor. The
///  actor shuts down on [`Client::close`] or once every handle is dropped.
#[derive(Clone)]
pub struct Client {
    commands: flume::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<ConnectionState>,
    in_flight: Arc<AtomicUsize>,
    endpoint: Arc<EndpointConfig>,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint.to_string())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Client {
    /// Spawn the connection actor and start connecting.
    ///
    /// The returned receiver is subscribed before the first attempt, so it
    ///  observes the initial `Open`. Must be called within a tokio runtime.
    pub fn connect(
        endpoint: EndpointConfig,
        config: ClientConfig,
        connector: impl Connector,
    ) -> (Self, broadcast::Receiver<SessionEvent>) {
        let endpoint = Arc::new(endpoint);
        let config = Arc::new(config);
        let (commands_tx, commands_rx) = flume::unbounded();
        let (events, events_rx) = broadcast::channel(config.event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let actor = ConnectionActor::new(
            endpoint.clone(),
            config.clone(),
            Arc::new(connector),
            commands_rx,
            events.clone(),
            state_tx,
            in_flight.clone(),
        );
        tokio::spawn(actor.run());

        let client = Self {
            commands: commands_tx,
            events,
            state: state_rx,
            in_flight,
            endpoint,
            config,
        };
        (client, events_rx)
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Calls sent and not yet resolved
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until the transport is up. Fails with [`CallError::Closed`] if
    ///  the client shuts down first.
    pub async fn wait_connected(&self) -> Result<(), CallError> {
        let mut state = self.state.clone();
        let state = state
            .wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Closed)
            })
            .await
            .map_err(|_| CallError::Closed)?;
        match *state {
            ConnectionState::Connected => Ok(()),
            _ => Err(CallError::Closed),
        }
    }

    pub async fn call(&self, action: Action, request: CallRequest) -> Result<Reply, CallError> {
        self.call_with_timeout(action, request, self.config.call_timeout())
            .await
    }

    pub async fn call_with_timeout(
        &self,
        action: Action,
        request: CallRequest,
        timeout: Duration,
    ) -> Result<Reply, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send_async(Command::Call {
                action,
                request,
                timeout,
                reply,
            })
            .await
            .map_err(|_| CallError::Closed)?;
        response.await.map_err(|_| CallError::Closed)?
    }

    /// Store `value` under `key`. A positive `lease` attaches the key to
    ///  that lease.
    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        lease: i64,
    ) -> Result<ResponseHeader, CallError> {
        let request = CallRequest::key(key).value(value).lease(lease);
        let reply = self.call(Action::Create, request).await?;
        Ok(reply.payload()?.header)
    }

    /// Single-key lookup, value included
    pub async fn get(&self, key: impl Into<Vec<u8>>) -> Result<(Record, ResponseHeader), CallError> {
        let key = key.into();
        let request = CallRequest::key(key.clone()).prefix(false);
        let payload = self.call(Action::Query, request).await?.payload()?;
        let record = payload
            .kvs
            .into_iter()
            .next()
            .ok_or_else(|| CallError::NotFound(encoding::display(&key).into_owned()))?;
        Ok((record, payload.header))
    }

    /// Delete `key`, or every key beginning with it when `prefix` is set
    pub async fn del(&self, key: impl Into<Vec<u8>>, prefix: bool) -> Result<ResponseHeader, CallError> {
        let request = CallRequest::key(key).prefix(prefix);
        let reply = self.call(Action::Delete, request).await?;
        Ok(reply.payload()?.header)
    }

    /// One page of a range query starting at `cursor`
    pub async fn query_page(
        &self,
        cursor: impl Into<Vec<u8>>,
        endkey: impl Into<Vec<u8>>,
        limit: u32,
    ) -> Result<EventPayload, CallError> {
        let request = CallRequest::key(cursor)
            .endkey(endkey)
            .prefix(true)
            .limit(i64::from(limit));
        self.call(Action::Query, request).await?.payload()
    }

    /// Paginated scan of every key beginning with `prefix`
    pub fn get_prefix(&self, prefix: &str) -> RangeScan {
        range::spawn_scan(self.clone(), prefix)
    }

    /// Scan of everything under the session's base prefix
    pub fn scan_endpoint(&self) -> RangeScan {
        self.get_prefix(self.endpoint.scan_prefix())
    }

    /// Shut the session down and wait for the actor to finish. Later calls
    ///  fail with [`CallError::Closed`].
    pub async fn close(&self) {
        let (done, finished) = oneshot::channel();
        if self
            .commands
            .send_async(Command::Shutdown { done })
            .await
            .is_ok()
        {
            let _ = finished.await;
        }
    }
}
