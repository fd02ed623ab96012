//! Point-to-point, message-oriented connections.
//!
//! The transfer core only needs a handful of operations from the network:
//! learn its own identity, dial a remote identity, accept an inbound
//! connection, and exchange discrete ordered messages on it. [`Transport`]
//! is that contract; [`LoopbackTransport`] and [`WsTransport`] implement it.
//!
//! Every [`Connection`] is backed by a [`ConnectionDriver`] owned by the
//! transport's pump tasks. Tests can hold the driver directly to script an
//! exact event sequence.

mod connection;
mod identity;
mod loopback;
mod pumps;
mod ws;

pub use connection::{Connection, ConnectionDriver, ConnectionEvent, Outbound};
pub use identity::{InvalidPeerId, PeerId};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use ws::WsTransport;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Outbound queue depth per connection, in messages.
///
/// Small on purpose: with 1 MiB chunks this bounds buffered data per
/// connection and makes `send` wait on the peer.
pub const OUTBOUND_BUFFER: usize = 8;

/// Inbound event queue depth per connection.
pub const EVENT_BUFFER: usize = 64;

/// How long [`Connection::close`] waits to queue its close marker behind
/// pending messages before aborting the connection outright.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Errors produced by transports and connections.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("dial {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection establishment collaborator.
///
/// Implementations decide how peers find each other; the transfer core only
/// sees identities and connections.
pub trait Transport: Send + Sync {
    /// Identity a remote peer can pass to [`dial`](Self::dial) to reach us.
    fn local_identity(&self) -> PeerId;

    /// Opens a connection to `remote`.
    ///
    /// The returned connection delivers [`ConnectionEvent::Open`] once it is
    /// usable.
    fn dial<'a>(&'a self, remote: &'a PeerId) -> TransportFuture<'a, Connection>;

    /// Waits for the next inbound connection.
    fn accept(&self) -> TransportFuture<'_, Connection>;

    /// Stops accepting connections and gives up the local identity.
    ///
    /// Idempotent. Existing connections are not affected.
    fn release(&self) -> TransportFuture<'_, ()>;
}
