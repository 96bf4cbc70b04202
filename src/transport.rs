//! WebSocket transport: owns a single socket and exposes it as bounded
//! channels. The session core decides when to reconnect; this
//! module only dials, pumps, and surfaces errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::TransportError;

pub const INBOUND_CAPACITY: usize = 100;
pub const OUTBOUND_CAPACITY: usize = 100;
pub const ERROR_CAPACITY: usize = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

/// Capability the session core needs from a transport. Abstracted as a
/// trait so tests can inject a mock instead of dialing a real socket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn reconnect(&self, url: Option<String>) -> Result<(), TransportError>;
    async fn close(&self);
    async fn send(&self, msg: Vec<u8>);
    fn is_connected(&self) -> bool;
    fn receive(&self) -> Receiver<Vec<u8>>;
    fn errors(&self) -> Receiver<TransportError>;
}

struct Inner {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Real transport, backed by `tokio-tungstenite`.
pub struct WsTransport {
    original_url: String,
    current_url: Mutex<String>,
    connected: Arc<AtomicBool>,
    inner: Arc<Mutex<Inner>>,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
    error_tx: Sender<TransportError>,
    error_rx: Receiver<TransportError>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let (inbound_tx, inbound_rx) = async_channel::bounded(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = async_channel::bounded(OUTBOUND_CAPACITY);
        let (error_tx, error_rx) = async_channel::bounded(ERROR_CAPACITY);
        Self {
            current_url: Mutex::new(url.clone()),
            original_url: url,
            connected: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Mutex::new(Inner { tasks: Vec::new() })),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            error_tx,
            error_rx,
        }
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
    }

    async fn dial(&self, url: &str) -> Result<(), TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Dial {
                url: url.to_string(),
                source: e.to_string(),
            })?;
        let (sink, source) = stream.split();

        self.connected.store(true, Ordering::SeqCst);

        let write_task = tokio::spawn(write_pump(
            sink,
            self.outbound_rx.clone(),
            self.connected.clone(),
            self.error_tx.clone(),
        ));
        let read_task = tokio::spawn(read_pump(
            source,
            self.inbound_tx.clone(),
            self.connected.clone(),
            self.error_tx.clone(),
        ));

        let mut inner = self.inner.lock().await;
        inner.tasks.push(write_task);
        inner.tasks.push(read_task);
        Ok(())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let url = self.current_url.lock().await.clone();
        self.dial(&url).await
    }

    async fn reconnect(&self, url: Option<String>) -> Result<(), TransportError> {
        self.teardown().await;
        let target = {
            let mut current = self.current_url.lock().await;
            if let Some(url) = url.filter(|u| !u.is_empty()) {
                *current = url;
            } else if current.is_empty() {
                *current = self.original_url.clone();
            }
            current.clone()
        };
        self.dial(&target).await
    }

    async fn close(&self) {
        self.teardown().await;
    }

    async fn send(&self, msg: Vec<u8>) {
        if !self.connected.load(Ordering::SeqCst) {
            let _ = self.error_tx.try_send(TransportError::NotConnected);
            return;
        }
        if self.outbound_tx.try_send(msg).is_err() {
            warn!("outbound queue full, dropping frame");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn receive(&self) -> Receiver<Vec<u8>> {
        self.inbound_rx.clone()
    }

    fn errors(&self) -> Receiver<TransportError> {
        self.error_rx.clone()
    }
}

async fn write_pump(
    mut sink: WsSink,
    outbound_rx: Receiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
    error_tx: Sender<TransportError>,
) {
    while let Ok(bytes) = outbound_rx.recv().await {
        let text = match String::from_utf8(bytes) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "dropping non-utf8 outbound frame");
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text)).await {
            connected.store(false, Ordering::SeqCst);
            let _ = error_tx.try_send(TransportError::Write(e.to_string()));
            return;
        }
    }
}

async fn read_pump(
    mut source: WsSource,
    inbound_tx: Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    error_tx: Sender<TransportError>,
) {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                if inbound_tx.try_send(text.into_bytes()).is_err() {
                    warn!("inbound queue full, dropping frame");
                }
            }
            Ok(WsMessage::Close(frame)) => {
                debug!(?frame, "gateway closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = error_tx.try_send(TransportError::Read(e.to_string()));
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_connect_emits_not_connected() {
        let t = WsTransport::new("wss://example.invalid");
        t.send(b"hi".to_vec()).await;
        let err = t.errors().recv().await.unwrap();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn not_connected_until_dialed() {
        let t = WsTransport::new("wss://example.invalid");
        assert!(!t.is_connected());
    }
}
