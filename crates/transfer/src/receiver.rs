//! Receiving side of a session as a pure state machine.
//!
//! Messages are decoded by the caller and fed in as
//! [`ReceiverEvent::Message`]; a frame that fails to decode arrives as
//! [`ReceiverEvent::Malformed`]. The reassembled payload leaves the machine
//! as a single [`ReceiverEffect::Deliver`].

use std::fmt;
use std::time::Duration;

use peerpipe_protocol::{ChunkLayout, CodecError, TransferMessage};
use sha2::{Digest as _, Sha256};

use crate::{ProgressThrottle, ReceiverBuffer, TransferError, percent, validate_file_name};

#[derive(Debug)]
pub enum ReceiverState {
    Idle,
    AwaitingConnection,
    AwaitingMetadata,
    ReceivingChunks {
        buffer: ReceiverBuffer,
        throttle: ProgressThrottle,
    },
    Done,
    Failed(TransferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    Start,
    ConnectionOpened,
    ConnectTimedOut(Duration),
    /// Dialing the remote peer failed.
    ConnectFailed(String),
    Message(TransferMessage),
    Malformed(CodecError),
    ConnectionClosed,
    ConnectionError(String),
    Cancelled,
}

/// The reassembled payload of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEffect {
    Progress {
        percent: u8,
        bytes_received: u64,
        total_bytes: u64,
    },
    Deliver(Assembled),
}

impl ReceiverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Layout announced by the peer, once `Metadata` has arrived.
    pub fn layout(&self) -> Option<&ChunkLayout> {
        match self {
            Self::ReceivingChunks { buffer, .. } => Some(buffer.layout()),
            _ => None,
        }
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::AwaitingConnection => f.write_str("awaiting connection"),
            Self::AwaitingMetadata => f.write_str("awaiting metadata"),
            Self::ReceivingChunks { buffer, .. } => write!(
                f,
                "receiving chunks ({}/{})",
                buffer.filled(),
                buffer.layout().total_chunks()
            ),
            Self::Done => f.write_str("done"),
            Self::Failed(_) => f.write_str("failed"),
        }
    }
}

/// Advances the receiver by one event.
///
/// `progress_step` is the throttle granularity in percent. Terminal states
/// absorb every event.
pub fn transition(
    state: ReceiverState,
    event: ReceiverEvent,
    progress_step: u8,
) -> (ReceiverState, Vec<ReceiverEffect>) {
    use ReceiverEvent as Ev;
    use ReceiverState as St;

    if state.is_terminal() {
        return (state, Vec::new());
    }

    let last_index = match &state {
        St::ReceivingChunks { buffer, .. } => buffer.highest_index(),
        _ => None,
    };
    let fail = |err: TransferError| -> (ReceiverState, Vec<ReceiverEffect>) {
        (St::Failed(err), Vec::new())
    };

    match (state, event) {
        (_, Ev::Cancelled) => fail(TransferError::Cancelled),

        (St::Idle, Ev::Start) => (St::AwaitingConnection, Vec::new()),

        (St::AwaitingConnection, Ev::ConnectionOpened) => (St::AwaitingMetadata, Vec::new()),
        (St::AwaitingConnection, Ev::ConnectTimedOut(waited)) => {
            fail(TransferError::ConnectTimeout(waited))
        }
        (St::AwaitingConnection, Ev::ConnectFailed(reason)) => fail(TransferError::Dial(reason)),

        (St::AwaitingMetadata, Ev::Message(TransferMessage::Metadata(meta))) => {
            if let Err(e) = validate_file_name(&meta.file_name) {
                return fail(e);
            }
            match ReceiverBuffer::new(&meta) {
                Ok(buffer) => (
                    St::ReceivingChunks {
                        buffer,
                        throttle: ProgressThrottle::new(progress_step),
                    },
                    Vec::new(),
                ),
                Err(e) => fail(TransferError::MalformedMessage(e)),
            }
        }
        (St::AwaitingMetadata, Ev::Message(_)) => fail(TransferError::ProtocolViolation(
            "chunk or complete before metadata".into(),
        )),

        (
            St::ReceivingChunks {
                mut buffer,
                mut throttle,
            },
            Ev::Message(TransferMessage::Chunk { index, payload }),
        ) => {
            if !buffer.layout().contains(index) {
                return fail(TransferError::ProtocolViolation(
                    "chunk index out of range".into(),
                ));
            }
            if let Err(e) = buffer.insert(index, payload) {
                return fail(TransferError::MalformedMessage(e));
            }

            let layout = *buffer.layout();
            let pct = percent(
                u64::from(buffer.filled()),
                u64::from(layout.total_chunks()),
            );
            let effects = throttle
                .observe(pct)
                .map(|percent| ReceiverEffect::Progress {
                    percent,
                    bytes_received: buffer.received_bytes(),
                    total_bytes: layout.total_size(),
                })
                .into_iter()
                .collect();
            (St::ReceivingChunks { buffer, throttle }, effects)
        }

        (
            St::ReceivingChunks {
                buffer,
                mut throttle,
            },
            Ev::Message(TransferMessage::Complete { digest }),
        ) => {
            let file_name = buffer.file_name().to_owned();
            let layout = *buffer.layout();
            let bytes = match buffer.assemble() {
                Ok(bytes) => bytes,
                Err(missing) => {
                    return fail(TransferError::IncompleteTransfer {
                        missing,
                        total: layout.total_chunks(),
                    });
                }
            };

            if let Some(expected) = digest {
                let actual: [u8; 32] = Sha256::digest(&bytes).into();
                if actual != expected {
                    return fail(TransferError::ChecksumMismatch {
                        expected: hex::encode(expected),
                        actual: hex::encode(actual),
                    });
                }
            }

            let mut effects = Vec::with_capacity(2);
            if let Some(percent) = throttle.finish() {
                effects.push(ReceiverEffect::Progress {
                    percent,
                    bytes_received: layout.total_size(),
                    total_bytes: layout.total_size(),
                });
            }
            effects.push(ReceiverEffect::Deliver(Assembled { file_name, bytes }));
            (St::Done, effects)
        }

        (St::ReceivingChunks { .. }, Ev::Message(TransferMessage::Metadata(_))) => fail(
            TransferError::ProtocolViolation("metadata received twice".into()),
        ),

        (_, Ev::Malformed(e)) => fail(TransferError::MalformedMessage(e)),

        (_, Ev::ConnectionClosed) => fail(TransferError::TransferAborted {
            last_index,
            reason: "connection closed by peer".into(),
        }),
        (_, Ev::ConnectionError(reason)) => {
            fail(TransferError::TransferAborted { last_index, reason })
        }

        (state, event) => fail(TransferError::ProtocolViolation(format!(
            "unexpected {event:?} while {state}"
        ))),
    }
}
