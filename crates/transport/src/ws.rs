//! Direct WebSocket transport.
//!
//! The listening side binds a TCP port; its identity is the `host:port` a
//! peer dials as `ws://host:port/`. Each binary frame carries exactly one
//! protocol message.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use peerpipe_protocol::MAX_MESSAGE_SIZE;

use crate::connection::Connection;
use crate::pumps::{read_pump, write_pump};
use crate::{PeerId, Transport, TransportError, TransportFuture};

/// Pending accepted connections not yet handed to [`Transport::accept`].
const ACCEPT_BACKLOG: usize = 16;

/// WebSocket transport, either listening or dial-only.
pub struct WsTransport {
    id: PeerId,
    incoming: Option<tokio::sync::Mutex<mpsc::Receiver<Connection>>>,
    cancel: CancellationToken,
    released: AtomicBool,
}

impl WsTransport {
    /// Binds a listener on `addr` and starts accepting connections.
    ///
    /// `advertise_host` replaces the host part of the identity; without it an
    /// unspecified bind address (`0.0.0.0`) is advertised as loopback.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        advertise_host: Option<&str>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let id = advertised_identity(local_addr, advertise_host);
        info!(%local_addr, %id, "WebSocket transport listening");

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, tx, cancel.clone()));

        Ok(Self {
            id,
            incoming: Some(tokio::sync::Mutex::new(rx)),
            cancel,
            released: AtomicBool::new(false),
        })
    }

    /// Creates a transport that can only dial out.
    pub fn dialer() -> Self {
        Self {
            id: PeerId::new(format!("dialer-{}", uuid::Uuid::new_v4())),
            incoming: None,
            cancel: CancellationToken::new(),
            released: AtomicBool::new(false),
        }
    }

    async fn dial_inner(&self, remote: &PeerId) -> Result<Connection, TransportError> {
        if self.released.load(Ordering::Acquire) {
            return Err(TransportError::Dial {
                peer: remote.clone(),
                reason: "local transport released".into(),
            });
        }

        let url = format!("ws://{remote}/");
        let (ws, _) =
            tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config()), false)
                .await
                .map_err(|e| TransportError::Dial {
                    peer: remote.clone(),
                    reason: e.to_string(),
                })?;

        info!(%remote, "WebSocket connection established");
        Ok(spawn_connection(ws, remote.clone()))
    }

    async fn accept_inner(&self) -> Result<Connection, TransportError> {
        let incoming = self.incoming.as_ref().ok_or(TransportError::Closed)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            conn = async { incoming.lock().await.recv().await } => {
                conn.ok_or(TransportError::Closed)
            }
        }
    }
}

impl Transport for WsTransport {
    fn local_identity(&self) -> PeerId {
        self.id.clone()
    }

    fn dial<'a>(&'a self, remote: &'a PeerId) -> TransportFuture<'a, Connection> {
        Box::pin(self.dial_inner(remote))
    }

    fn accept(&self) -> TransportFuture<'_, Connection> {
        Box::pin(self.accept_inner())
    }

    fn release(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if !self.released.swap(true, Ordering::AcqRel) {
                self.cancel.cancel();
                debug!(id = %self.id, "WebSocket transport released");
            }
            Ok(())
        })
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    config
}

fn advertised_identity(local_addr: SocketAddr, advertise_host: Option<&str>) -> PeerId {
    let port = local_addr.port();
    match advertise_host {
        Some(host) => PeerId::new(format!("{host}:{port}")),
        None if local_addr.ip().is_unspecified() => {
            let loopback = match local_addr.ip() {
                IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), port),
                IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            };
            PeerId::new(loopback.to_string())
        }
        None => PeerId::new(local_addr.to_string()),
    }
}

/// Splits an upgraded stream into pumps and returns the application side.
fn spawn_connection<S>(ws: WebSocketStream<S>, peer: PeerId) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (conn, driver) = Connection::new(peer);
    let (outbound, events, cancel) = driver.into_parts();
    let (write, read) = ws.split();

    tokio::spawn(write_pump(write, outbound, events.clone(), cancel.clone()));
    tokio::spawn(read_pump(read, events, cancel));
    conn
}

async fn accept_loop(
    listener: TcpListener,
    incoming: mpsc::Sender<Connection>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("accept loop stopped");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(handshake(stream, peer_addr, incoming.clone()));
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
        }
    }
}

async fn handshake(stream: TcpStream, peer_addr: SocketAddr, incoming: mpsc::Sender<Connection>) {
    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer_addr, "WebSocket handshake failed: {e}");
            return;
        }
    };
    info!(%peer_addr, "WebSocket connection accepted");

    let conn = spawn_connection(ws, PeerId::new(peer_addr.to_string()));
    if incoming.send(conn).await.is_err() {
        debug!(%peer_addr, "transport released, dropping connection");
    }
}
