//! Sending side of a session as a pure state machine.
//!
//! [`transition`] never touches the network. It returns the messages to
//! emit as [`SenderEffect`]s; whoever performs an emission reports back
//! with [`SenderEvent::Sent`] or [`SenderEvent::SendFailed`].

use std::fmt;
use std::time::Duration;

use peerpipe_protocol::ChunkLayout;

use crate::{TransferError, percent};

#[derive(Debug)]
pub enum SenderState {
    Idle,
    AwaitingConnection,
    /// `Metadata` has been handed to the transport.
    SendingMetadata,
    /// Chunk `next` has been handed to the transport.
    SendingChunks { next: u32 },
    /// `Complete` has been handed to the transport.
    SendingComplete,
    Done,
    Failed(TransferError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    Start,
    ConnectionOpened,
    ConnectTimedOut(Duration),
    /// The transport could not produce a connection at all.
    ConnectFailed(String),
    /// The last emission was accepted by the transport.
    Sent,
    SendFailed(String),
    ConnectionClosed,
    ConnectionError(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEffect {
    SendMetadata,
    SendChunk(u32),
    SendComplete,
    Progress { percent: u8, bytes_sent: u64 },
}

impl SenderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Index of the last chunk the transport accepted.
    pub fn last_sent(&self, layout: &ChunkLayout) -> Option<u32> {
        match self {
            Self::SendingChunks { next } => next.checked_sub(1),
            Self::SendingComplete | Self::Done => layout.total_chunks().checked_sub(1),
            _ => None,
        }
    }
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::AwaitingConnection => f.write_str("awaiting connection"),
            Self::SendingMetadata => f.write_str("sending metadata"),
            Self::SendingChunks { next } => write!(f, "sending chunk {next}"),
            Self::SendingComplete => f.write_str("sending complete"),
            Self::Done => f.write_str("done"),
            Self::Failed(_) => f.write_str("failed"),
        }
    }
}

/// Advances the sender by one event.
///
/// Terminal states absorb every event.
pub fn transition(
    state: SenderState,
    event: SenderEvent,
    layout: &ChunkLayout,
) -> (SenderState, Vec<SenderEffect>) {
    use SenderEffect as Fx;
    use SenderEvent as Ev;
    use SenderState as St;

    if state.is_terminal() {
        return (state, Vec::new());
    }

    let total = layout.total_chunks();
    let last_sent = state.last_sent(layout);
    let fail = |err: TransferError| -> (SenderState, Vec<SenderEffect>) {
        (St::Failed(err), Vec::new())
    };

    match (state, event) {
        (_, Ev::Cancelled) => fail(TransferError::Cancelled),

        (St::Idle, Ev::Start) => (St::AwaitingConnection, Vec::new()),

        (St::AwaitingConnection, Ev::ConnectionOpened) => {
            (St::SendingMetadata, vec![Fx::SendMetadata])
        }
        (St::AwaitingConnection, Ev::ConnectTimedOut(waited)) => {
            fail(TransferError::ConnectTimeout(waited))
        }
        (St::AwaitingConnection, Ev::ConnectFailed(reason)) => {
            fail(TransferError::TransferAborted {
                last_index: None,
                reason,
            })
        }

        (St::SendingMetadata, Ev::Sent) if total == 0 => {
            (St::SendingComplete, vec![Fx::SendComplete])
        }
        (St::SendingMetadata, Ev::Sent) => (St::SendingChunks { next: 0 }, vec![Fx::SendChunk(0)]),

        (St::SendingChunks { next }, Ev::Sent) => {
            let progress = Fx::Progress {
                percent: percent(u64::from(next) + 1, u64::from(total)),
                bytes_sent: layout.chunk_range(next).map_or(0, |r| r.end),
            };
            if next + 1 < total {
                (
                    St::SendingChunks { next: next + 1 },
                    vec![progress, Fx::SendChunk(next + 1)],
                )
            } else {
                (St::SendingComplete, vec![progress, Fx::SendComplete])
            }
        }

        (St::SendingComplete, Ev::Sent) => {
            // An empty payload has no chunk to report progress on.
            let effects = if total == 0 {
                vec![Fx::Progress {
                    percent: 100,
                    bytes_sent: 0,
                }]
            } else {
                Vec::new()
            };
            (St::Done, effects)
        }

        (
            St::SendingMetadata | St::SendingChunks { .. } | St::SendingComplete,
            Ev::SendFailed(reason),
        ) => fail(TransferError::Send { last_sent, reason }),

        (_, Ev::ConnectionClosed) => fail(TransferError::TransferAborted {
            last_index: last_sent,
            reason: "connection closed by peer".into(),
        }),
        (_, Ev::ConnectionError(reason)) => fail(TransferError::TransferAborted {
            last_index: last_sent,
            reason,
        }),

        (state, event) => fail(TransferError::ProtocolViolation(format!(
            "unexpected {event:?} while {state}"
        ))),
    }
}
