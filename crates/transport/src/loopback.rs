//! In-process transport.
//!
//! Every [`LoopbackTransport`] created from the same [`LoopbackNetwork`] can
//! dial the others by identity. Used by tests and by anything that wants a
//! transfer between two tasks of one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionDriver, ConnectionEvent, Outbound};
use crate::{PeerId, Transport, TransportError, TransportFuture};

/// Pending inbound connections per listener.
const ACCEPT_BACKLOG: usize = 16;

/// Registry of loopback listeners, shared by all transports created from it.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    listeners: Arc<Mutex<HashMap<PeerId, mpsc::Sender<Connection>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport with a fresh random identity on this network.
    pub fn transport(&self) -> LoopbackTransport {
        let id = PeerId::random();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id.clone(), tx);
        }
        debug!(%id, "loopback identity registered");
        LoopbackTransport {
            id,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            released: AtomicBool::new(false),
        }
    }

    fn listener(&self, id: &PeerId) -> Option<mpsc::Sender<Connection>> {
        self.listeners.lock().ok()?.get(id).cloned()
    }

    fn unregister(&self, id: &PeerId) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(id);
        }
    }
}

/// One peer on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    id: PeerId,
    network: LoopbackNetwork,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    released: AtomicBool,
}

impl LoopbackTransport {
    async fn dial_inner(&self, remote: &PeerId) -> Result<Connection, TransportError> {
        let dial_err = |reason: &str| TransportError::Dial {
            peer: remote.clone(),
            reason: reason.into(),
        };

        if self.released.load(Ordering::Acquire) {
            return Err(dial_err("local transport released"));
        }
        let listener = self
            .network
            .listener(remote)
            .ok_or_else(|| dial_err("unknown peer"))?;

        let (local, local_driver) = Connection::new(remote.clone());
        let (inbound, inbound_driver) = Connection::new(self.id.clone());

        listener
            .send(inbound)
            .await
            .map_err(|_| dial_err("peer stopped accepting"))?;

        tokio::spawn(link(local_driver, inbound_driver));
        info!(local = %self.id, %remote, "loopback connection established");
        Ok(local)
    }

    async fn accept_inner(&self) -> Result<Connection, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

impl Transport for LoopbackTransport {
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
            // Dropping the registered sender ends any pending `accept`.
            if !self.released.swap(true, Ordering::AcqRel) {
                self.network.unregister(&self.id);
                debug!(id = %self.id, "loopback identity released");
            }
            Ok(())
        })
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.unregister(&self.id);
    }
}

/// Wires two drivers back to back: each side's outbound frames become the
/// other side's inbound events.
async fn link(a: ConnectionDriver, b: ConnectionDriver) {
    let (a_out, a_events, a_cancel) = a.into_parts();
    let (b_out, b_events, b_cancel) = b.into_parts();

    let _ = a_events.send(ConnectionEvent::Open).await;
    let _ = b_events.send(ConnectionEvent::Open).await;

    tokio::join!(
        forward(a_out, a_cancel, b_events),
        forward(b_out, b_cancel, a_events),
    );
}

async fn forward(
    mut outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    to: mpsc::Sender<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("loopback side aborted");
                break;
            }
            frame = outbound.recv() => match frame {
                Some(Outbound::Data(data)) => {
                    if to.send(ConnectionEvent::Message(data)).await.is_err() {
                        return;
                    }
                }
                Some(Outbound::Close) | None => break,
            }
        }
    }
    let _ = to.send(ConnectionEvent::Closed).await;
}
