//! Chunked transfer sessions.
//!
//! A session moves one payload over one connection as
//! `Metadata`, `Chunk(0..N)`, `Complete`. The protocol logic lives in two
//! pure state machines ([`sender`] and [`receiver`]); [`run_sender`] and
//! [`run_receiver`] drive them against a live [`Transport`] and own the
//! connection timeout, cancellation and cleanup.
//!
//! [`Transport`]: peerpipe_transport::Transport

mod buffer;
mod progress;
pub mod receiver;
pub mod sender;
mod sink;
mod source;
mod supervisor;
mod validation;

pub use buffer::ReceiverBuffer;
pub use progress::{Direction, ProgressThrottle, SpeedCalculator, TransferProgress, percent};
pub use sink::{DirectorySink, SinkFuture, TransferSink, WriterSink};
pub use source::ByteSource;
pub use supervisor::{Confirmation, ReceivedFile, TransferOptions, run_receiver, run_sender};
pub use validation::validate_file_name;

use std::time::Duration;

use peerpipe_protocol::CodecError;

/// Errors that end a transfer session.
///
/// Every variant is terminal: the session is not retried internally.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no connection within {0:?}")]
    ConnectTimeout(Duration),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("send failed after chunk {last_sent:?}: {reason}")]
    Send {
        last_sent: Option<u32>,
        reason: String,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] CodecError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("incomplete transfer: {missing} of {total} chunks missing")]
    IncompleteTransfer { missing: u32, total: u32 },

    #[error("transfer aborted after chunk {last_index:?}: {reason}")]
    TransferAborted {
        last_index: Option<u32>,
        reason: String,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid transfer parameters: {0}")]
    InvalidParameters(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
