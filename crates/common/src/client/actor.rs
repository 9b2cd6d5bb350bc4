//! Connection actor
//!
//! A single task owns the transport, the pending-call table and the id
//! generator. Callers reach it through a command queue; lifecycle and
//! watch events leave it through a broadcast channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, EndpointConfig, InFlightPolicy};
use crate::wire::{Action, CallRequest, ChangeEvent, RequestFrame, ResponseFrame};

use super::connection::{Connector, Transport, TransportError};
use super::pending::{CorrelationKey, PendingCalls, ReplySender};
use super::{CallError, Reply};

/// Lifecycle and data signals of a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// First successful connection
    Open,
    /// Any later successful connection
    Reconnect,
    /// The transport went away; a reconnect is scheduled
    Close,
    /// A connection attempt or the transport failed
    Error(String),
    /// Change pushed by the store's watch stream
    Data(ChangeEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Waiting out the reconnect delay
    Disconnected,
    /// Shut down by the client; terminal
    Closed,
}

pub(crate) enum Command {
    Call {
        action: Action,
        request: CallRequest,
        timeout: Duration,
        reply: ReplySender,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum Link {
    Connecting(BoxFuture<'static, Result<Transport, TransportError>>),
    Up(Transport),
    Waiting(std::pin::Pin<Box<Sleep>>),
    Down,
}

enum LinkStep {
    Connected(Transport),
    ConnectFailed(TransportError),
    RetryDue,
    Frame(String),
    Failed(TransportError),
    Closed,
}

impl Link {
    fn is_up(&self) -> bool {
        matches!(self, Link::Up(_))
    }

    /// Wait for whatever the link is doing next. Cancel safe.
    async fn next_step(&mut self) -> LinkStep {
        match self {
            Link::Connecting(connect) => match connect.await {
                Ok(transport) => LinkStep::Connected(transport),
                Err(err) => LinkStep::ConnectFailed(err),
            },
            Link::Waiting(delay) => {
                delay.await;
                LinkStep::RetryDue
            }
            Link::Up(transport) => match transport.stream.next().await {
                Some(Ok(text)) => LinkStep::Frame(text),
                Some(Err(err)) => LinkStep::Failed(err),
                None => LinkStep::Closed,
            },
            Link::Down => futures::future::pending().await,
        }
    }
}

pub(crate) struct ConnectionActor {
    endpoint: Arc<EndpointConfig>,
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    commands: flume::Receiver<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    in_flight: Arc<AtomicUsize>,
    pending: PendingCalls,
    deadlines: FuturesUnordered<BoxFuture<'static, CorrelationKey>>,
    link: Link,
    opened: bool,
}

impl ConnectionActor {
    pub fn new(
        endpoint: Arc<EndpointConfig>,
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
        commands: flume::Receiver<Command>,
        events: broadcast::Sender<SessionEvent>,
        state: watch::Sender<ConnectionState>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            endpoint,
            config,
            connector,
            commands,
            events,
            state,
            in_flight,
            pending: PendingCalls::default(),
            deadlines: FuturesUnordered::new(),
            link: Link::Down,
            opened: false,
        }
    }

    pub async fn run(mut self) {
        self.start_connect();
        let interval = self.config.keepalive_interval();
        let mut keepalive = keepalive_timer(interval);

        let done = loop {
            tokio::select! {
                command = self.commands.recv_async() => match command {
                    Ok(Command::Call { action, request, timeout, reply }) => {
                        self.handle_call(action, request, timeout, reply).await;
                    }
                    Ok(Command::Shutdown { done }) => break Some(done),
                    // every client handle is gone
                    Err(_) => break None,
                },
                step = self.link.next_step() => {
                    if self.handle_step(step).await {
                        keepalive = keepalive_timer(interval);
                    }
                }
                Some(key) = self.deadlines.next(), if !self.deadlines.is_empty() => {
                    self.expire(key);
                }
                _ = keepalive.tick(), if self.link.is_up() => {
                    self.send_ping().await;
                }
            }
        };

        self.shutdown().await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn sync_in_flight(&self) {
        self.in_flight.store(self.pending.len(), Ordering::Release);
    }

    fn start_connect(&mut self) {
        let connector = self.connector.clone();
        let endpoint = self.endpoint.clone();
        let timeout = self.config.connect_timeout();
        debug!(endpoint = %endpoint, "connecting");
        self.set_state(ConnectionState::Connecting);
        self.link = Link::Connecting(Box::pin(async move {
            match tokio::time::timeout(timeout, connector.connect(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout),
            }
        }));
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.reconnect_delay();
        debug!(?delay, "reconnect scheduled");
        self.set_state(ConnectionState::Disconnected);
        self.link = Link::Waiting(Box::pin(tokio::time::sleep(delay)));
    }

    /// Returns `true` when a new transport came up
    async fn handle_step(&mut self, step: LinkStep) -> bool {
        match step {
            LinkStep::Connected(transport) => {
                self.link = Link::Up(transport);
                self.set_state(ConnectionState::Connected);
                if self.opened {
                    info!(endpoint = %self.endpoint, "reconnected");
                    self.emit(SessionEvent::Reconnect);
                } else {
                    info!(endpoint = %self.endpoint, "connected");
                    self.opened = true;
                    self.emit(SessionEvent::Open);
                }
                return true;
            }
            LinkStep::ConnectFailed(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "connection attempt failed");
                self.schedule_reconnect();
                self.emit(SessionEvent::Error(err.to_string()));
            }
            LinkStep::RetryDue => self.start_connect(),
            LinkStep::Frame(text) => self.dispatch(&text).await,
            LinkStep::Failed(err) => {
                warn!(error = %err, "transport error");
                self.emit(SessionEvent::Error(err.to_string()));
            }
            LinkStep::Closed => {
                info!(endpoint = %self.endpoint, "connection closed");
                if self.config.in_flight_policy == InFlightPolicy::FailFast {
                    self.fail_pending(|| CallError::Disconnected);
                }
                self.schedule_reconnect();
                self.emit(SessionEvent::Close);
            }
        }
        false
    }

    async fn handle_call(
        &mut self,
        action: Action,
        request: CallRequest,
        timeout: Duration,
        reply: ReplySender,
    ) {
        if !self.link.is_up() {
            let _ = reply.send(Err(CallError::NotReady));
            return;
        }

        let key = self.pending.allocate(action);
        let text = match RequestFrame::new(key.id.clone(), action, request).to_text() {
            Ok(text) => text,
            Err(err) => {
                let _ = reply.send(Err(CallError::Encode(err.to_string())));
                return;
            }
        };

        let deadline = self.pending.register(key.clone(), reply, timeout);
        let expiry = key.clone();
        self.deadlines.push(Box::pin(async move {
            tokio::time::sleep_until(deadline).await;
            expiry
        }));
        self.sync_in_flight();

        trace!(call = %key, "sending call");
        // a stalled write must not outlive the call it carries
        let failure = match tokio::time::timeout_at(deadline, self.send_text(text)).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => CallError::Transport(err.to_string()),
            Err(_) => {
                warn!(call = %key, "transport write stalled past the call deadline");
                CallError::Timeout(timeout)
            }
        };
        if let Some(call) = self.pending.take(&key) {
            call.resolve(Err(failure));
        }
        self.sync_in_flight();
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        match &mut self.link {
            Link::Up(transport) => transport.sink.send(text).await,
            _ => Err(TransportError::Closed),
        }
    }

    async fn send_keepalive(&mut self, action: Action) {
        let id = self.pending.next_id().to_string();
        let frame = RequestFrame::new(id, action, CallRequest::default());
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode {action}");
                return;
            }
        };
        let bound = self.config.call_timeout();
        match tokio::time::timeout(bound, self.send_text(text)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to send {action}"),
            Err(_) => warn!("{action} not written within {bound:?}, skipped"),
        }
    }

    async fn send_ping(&mut self) {
        trace!("keepalive ping");
        self.send_keepalive(Action::Ping).await;
    }

    async fn dispatch(&mut self, text: &str) {
        let frame = match ResponseFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                return;
            }
        };

        match frame.action {
            Action::Create | Action::Delete | Action::Query => self.resolve(frame),
            Action::Watch => {
                if !frame.success {
                    warn!(err = ?frame.err, "watch failure pushed by server");
                    return;
                }
                match frame.decode_event::<ChangeEvent>() {
                    Ok(event) => self.emit(SessionEvent::Data(event)),
                    Err(err) => warn!(error = %err, "dropping undecodable watch event"),
                }
            }
            Action::Ping => self.send_keepalive(Action::Pong).await,
            Action::Pong | Action::Handshake => trace!(action = %frame.action, "ignored"),
        }
    }

    fn resolve(&mut self, frame: ResponseFrame) {
        let Some(id) = frame.id.clone() else {
            debug!(action = %frame.action, "dropping response without id");
            return;
        };
        let key = CorrelationKey::new(frame.action, id);
        let Some(call) = self.pending.take(&key) else {
            debug!(call = %key, "dropping response for unknown call");
            return;
        };
        self.sync_in_flight();

        let result = if frame.success {
            Ok(Reply {
                action: frame.action,
                key: frame.key,
                event: frame.event,
            })
        } else {
            Err(CallError::Rejected(frame.err.unwrap_or_default()))
        };
        call.resolve(result);
    }

    fn expire(&mut self, key: CorrelationKey) {
        if let Some(call) = self.pending.take_expired(&key, Instant::now()) {
            debug!(call = %key, "call timed out");
            let timeout = call.timeout();
            call.resolve(Err(CallError::Timeout(timeout)));
            self.sync_in_flight();
        }
    }

    fn fail_pending(&mut self, error: impl Fn() -> CallError) {
        for (key, call) in self.pending.drain() {
            debug!(call = %key, "failing in-flight call");
            call.resolve(Err(error()));
        }
        self.deadlines.clear();
        self.sync_in_flight();
    }

    async fn shutdown(&mut self) {
        info!(endpoint = %self.endpoint, "closing client");
        let link = std::mem::replace(&mut self.link, Link::Down);
        if let Link::Up(mut transport) = link {
            if let Err(err) = transport.sink.close().await {
                debug!(error = %err, "error closing transport");
            }
        }
        self.fail_pending(|| CallError::Closed);
        self.set_state(ConnectionState::Closed);
        self.emit(SessionEvent::Close);
    }
}

fn keepalive_timer(interval: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
