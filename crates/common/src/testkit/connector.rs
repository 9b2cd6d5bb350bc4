use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;

use crate::client::{Connector, Transport, TransportError};
use crate::config::EndpointConfig;
use crate::wire::{Action, RequestFrame, ResponseFrame};

/// In-memory [`Connector`]. Every successful connect hands the server half
///  of the new link to the paired [`MockListener`].
#[derive(Clone)]
pub struct MockConnector {
    links: mpsc::UnboundedSender<ServerLink>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    writable: Arc<watch::Sender<bool>>,
}

pub struct MockListener {
    links: mpsc::UnboundedReceiver<ServerLink>,
}

impl MockConnector {
    pub fn new() -> (Self, MockListener) {
        let (tx, rx) = mpsc::unbounded();
        let connector = Self {
            links: tx,
            refuse: Arc::new(AtomicBool::new(false)),
            attempts: Arc::new(AtomicUsize::new(0)),
            writable: Arc::new(watch::channel(true).0),
        };
        (connector, MockListener { links: rx })
    }

    /// Make subsequent connection attempts fail
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Hold every client write until released, like a socket whose send
    ///  buffer is full
    pub fn stall_writes(&self, stalled: bool) {
        self.writable.send_replace(!stalled);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Transport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{endpoint}: connection refused")));
        }

        let (client_tx, server_rx) = mpsc::unbounded::<String>();
        let (server_tx, client_rx) = mpsc::unbounded::<Result<String, TransportError>>();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let link = ServerLink {
            from_client: server_rx,
            to_client: server_tx,
            accepted: Some(accepted_tx),
        };
        self.links
            .unbounded_send(link)
            .map_err(|_| TransportError::Connect("listener is gone".to_string()))?;
        // like a handshake: the connection is up once the server took it
        accepted_rx
            .await
            .map_err(|_| TransportError::Connect("connection was not accepted".to_string()))?;

        let writable = self.writable.subscribe();
        let sink = client_tx
            .sink_map_err(|_| TransportError::Closed)
            .with(move |text: String| {
                let mut writable = writable.clone();
                async move {
                    let _ = writable.wait_for(|open| *open).await;
                    Ok::<_, TransportError>(text)
                }
            });
        Ok(Transport::new(sink, client_rx))
    }
}

impl MockListener {
    /// Next connection made through the paired connector. The client's
    ///  connect completes once this returns.
    pub async fn accept(&mut self) -> Option<ServerLink> {
        let mut link = self.links.next().await?;
        if let Some(accepted) = link.accepted.take() {
            let _ = accepted.send(());
        }
        Some(link)
    }
}

/// Server half of one in-memory connection. Dropping it, or calling
///  [`ServerLink::close`], closes the connection for the client.
pub struct ServerLink {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    accepted: Option<oneshot::Sender<()>>,
}

impl ServerLink {
    /// Next raw frame from the client; `None` once the client closed
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    pub async fn recv_request(&mut self) -> Result<RequestFrame> {
        let text = self
            .recv_text()
            .await
            .ok_or_else(|| anyhow!("client closed the connection"))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Next request that expects a correlated response, skipping keepalives
    pub async fn recv_call(&mut self) -> Result<RequestFrame> {
        loop {
            let request = self.recv_request().await?;
            if request.action.is_call() {
                return Ok(request);
            }
        }
    }

    /// Next request of `action`, skipping everything else
    pub async fn recv_action(&mut self, action: Action) -> Result<RequestFrame> {
        loop {
            let request = self.recv_request().await?;
            if request.action == action {
                return Ok(request);
            }
        }
    }

    pub fn send(&self, frame: &ResponseFrame) -> Result<()> {
        self.send_text(frame.to_text()?)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.to_client
            .unbounded_send(Ok(text.into()))
            .map_err(|_| anyhow!("client is gone"))
    }

    /// Surface a transport error on the client without closing the link
    pub fn send_error(&self) -> Result<()> {
        self.to_client
            .unbounded_send(Err(TransportError::Connect("injected failure".to_string())))
            .map_err(|_| anyhow!("client is gone"))
    }

    pub fn close(self) {}
}
