//! Wire transport seam.
//!
//! The runtime is generic over [`TransportFactory`]; production uses the
//! websocket implementation, tests script traffic through the channel-backed
//! implementation.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};
use tracing::debug;

use sync_core::{Namespace, WireFrame};

/// Errors surfaced by transport implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport connect failure: {0}")]
    Connect(String),
    #[error("transport closed")]
    Closed,
    #[error("transport protocol failure: {0}")]
    Protocol(String),
}

/// One established connection speaking JSON event frames.
pub trait Transport: Send {
    fn send(&mut self, frame: WireFrame)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound frame; `None` means the connection is gone.
    fn recv(&mut self) -> impl Future<Output = Option<Result<WireFrame, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Connects one transport per namespace, injecting the auth token.
pub trait TransportFactory: Send + Sync {
    type Transport: Transport + 'static;

    fn connect(
        &self,
        namespace: Namespace,
        auth_token: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Websocket transport over `tokio-tungstenite`.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WsTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let encoded = serde_json::to_string(&frame)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.inner
            .send(WsMessage::Text(encoded.into()))
            .await
            .map_err(|err| TransportError::Protocol(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Text(text)) => {
                    return Some(
                        serde_json::from_str::<WireFrame>(text.as_str())
                            .map_err(|err| TransportError::Protocol(err.to_string())),
                    );
                }
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(TransportError::Protocol(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Factory building websocket connections against one server base URL.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    base_url: String,
}

impl WsTransportFactory {
    /// `base_url` is the websocket origin, for example `wss://example.org/rt`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn url_for(&self, namespace: Namespace, auth_token: &str) -> String {
        format!(
            "{}/{}?token={auth_token}",
            self.base_url.trim_end_matches('/'),
            namespace.as_path()
        )
    }
}

impl TransportFactory for WsTransportFactory {
    type Transport = WsTransport;

    async fn connect(
        &self,
        namespace: Namespace,
        auth_token: &str,
    ) -> Result<WsTransport, TransportError> {
        let url = self.url_for(namespace, auth_token);
        debug!(?namespace, "connecting websocket transport");
        let (inner, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(WsTransport { inner })
    }
}

/// Channel-backed transport for tests.
#[derive(Debug)]
pub struct ChannelTransport {
    inbound: mpsc::Receiver<WireFrame>,
    outbound: mpsc::Sender<WireFrame>,
}

/// Test-side handle driving a [`ChannelTransport`].
///
/// Dropping `to_client` disconnects the transport (its `recv` returns
/// `None`), which is how tests simulate a lost connection.
pub struct TransportHarness {
    pub to_client: mpsc::Sender<WireFrame>,
    pub from_client: mpsc::Receiver<WireFrame>,
}

/// Build a connected transport/harness pair.
pub fn channel_transport(buffer: usize) -> (ChannelTransport, TransportHarness) {
    let (to_client, inbound) = mpsc::channel(buffer.max(1));
    let (outbound, from_client) = mpsc::channel(buffer.max(1));
    (
        ChannelTransport { inbound, outbound },
        TransportHarness {
            to_client,
            from_client,
        },
    )
}

impl Transport for ChannelTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Factory handing out pre-scripted channel transports per namespace.
#[derive(Clone, Default)]
pub struct ChannelTransportFactory {
    scripted: Arc<Mutex<HashMap<Namespace, VecDeque<ChannelTransport>>>>,
}

impl ChannelTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport to hand out on the next connect for `namespace`.
    pub fn push(&self, namespace: Namespace, transport: ChannelTransport) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace)
            .or_default()
            .push_back(transport);
    }
}

impl TransportFactory for ChannelTransportFactory {
    type Transport = ChannelTransport;

    async fn connect(
        &self,
        namespace: Namespace,
        _auth_token: &str,
    ) -> Result<ChannelTransport, TransportError> {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&namespace)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                TransportError::Connect(format!("no scripted transport for {namespace:?}"))
            })
    }
}
