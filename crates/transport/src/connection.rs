//! A single open channel between two peers.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{CLOSE_FLUSH_TIMEOUT, EVENT_BUFFER, OUTBOUND_BUFFER, PeerId, TransportError};

/// Lifecycle and data events delivered on a [`Connection`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is ready for messages.
    Open,
    /// One discrete message from the peer.
    Message(Vec<u8>),
    /// The peer (or the transport) closed the connection.
    Closed,
    /// The transport failed; no further events follow.
    Error(String),
}

/// What a [`Connection`] hands to its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Vec<u8>),
    /// Flush everything queued before this marker, then close.
    Close,
}

/// Application side of a connection.
///
/// Messages passed to [`send`](Self::send) are delivered in order. Events
/// are read one at a time with [`next_event`](Self::next_event).
pub struct Connection {
    peer: PeerId,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Receiver<ConnectionEvent>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Transport side of a connection, owned by the transport's pump tasks.
pub struct ConnectionDriver {
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl Connection {
    /// Creates a connection to `peer` together with the driver that feeds it.
    pub fn new(peer: PeerId) -> (Self, ConnectionDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let conn = Self {
            peer,
            outbound: outbound_tx,
            events: events_rx,
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
        };
        let driver = ConnectionDriver {
            outbound: outbound_rx,
            events: events_tx,
            cancel,
        };
        (conn, driver)
    }

    /// Identity of the remote peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Returns `true` until [`close`](Self::close) is called or the
    /// connection is aborted.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Queues one message for the peer.
    ///
    /// Waits while the outbound queue is full, which is how transport flow
    /// control reaches the caller.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Send("connection is not open".into()));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(TransportError::Send("connection aborted".into()))
            }
            result = self.outbound.send(Outbound::Data(data)) => {
                result.map_err(|_| TransportError::Send("connection closed by transport".into()))
            }
        }
    }

    /// Waits for the next event. Returns `None` once the transport side is gone.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    /// Returns an event that has already arrived, without waiting.
    pub fn try_next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }

    /// Closes the connection after flushing queued messages.
    ///
    /// Idempotent and infallible: closing a connection whose transport is
    /// already gone is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.outbound.send(Outbound::Close)).await {
            Ok(Ok(())) => debug!(peer = %self.peer, "connection close queued"),
            Ok(Err(_)) => {
                debug!(peer = %self.peer, "connection already closed by transport");
                self.cancel.cancel();
            }
            Err(_) => {
                warn!(peer = %self.peer, "close flush timed out, aborting connection");
                self.cancel.cancel();
            }
        }
    }

    /// Drops the connection immediately without flushing.
    pub fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A closed connection still has its close marker in flight.
        if !self.closed.load(Ordering::Acquire) {
            self.cancel.cancel();
        }
    }
}

impl ConnectionDriver {
    /// Delivers an event to the application side.
    ///
    /// Returns `false` if the [`Connection`] has been dropped.
    pub async fn emit(&self, event: ConnectionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Waits for the next outbound frame.
    ///
    /// Returns `None` if the connection was aborted or dropped.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            frame = self.outbound.recv() => frame,
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Returns `true` once the application side has aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Splits the driver for pump tasks that read and write independently.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<Outbound>,
        mpsc::Sender<ConnectionEvent>,
        CancellationToken,
    ) {
        (self.outbound, self.events, self.cancel)
    }
}
