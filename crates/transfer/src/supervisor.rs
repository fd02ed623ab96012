//! Session lifecycle around the two state machines.
//!
//! The supervisor is the only place that talks to the network. It bounds
//! connection establishment by [`TransferOptions::connect_timeout`] (there
//! is no per-chunk timeout), feeds connection events into the machine one
//! at a time, performs the effects it returns, and on every exit path
//! closes the connection and releases the transport.

use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use peerpipe_protocol::{
    CONNECT_TIMEOUT, ChunkLayout, DEFAULT_CHUNK_SIZE, Digest, Metadata, PROGRESS_STEP,
    TransferMessage,
};
use peerpipe_transport::{Connection, ConnectionEvent, PeerId, Transport, TransportFuture};

use crate::progress::report;
use crate::receiver::{self, Assembled, ReceiverEffect, ReceiverEvent, ReceiverState};
use crate::sender::{self, SenderEffect, SenderEvent, SenderState};
use crate::source::ChunkSource;
use crate::{ByteSource, Direction, TransferError, TransferProgress, TransferSink};

/// How long a finished sender waits for the receiver to hang up.
const LINGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Payload bytes per chunk (sender only).
    pub chunk_size: u32,
    /// Bound on dial/accept until the connection reports open.
    pub connect_timeout: Duration,
    /// Receiver progress granularity, in percent.
    pub progress_step: u8,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: CONNECT_TIMEOUT,
            progress_step: PROGRESS_STEP,
        }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub peer: PeerId,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    /// SHA-256 of the payload, as announced in `Complete`.
    pub digest: Digest,
}

/// Result of a successful receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub peer: PeerId,
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Where the sink stored the payload, if it writes to the filesystem.
    pub saved_to: Option<PathBuf>,
}

/// Waits for one receiver to connect and sends `source` to it as `file_name`.
///
/// The source is sized before the wait starts; a stream source is drained
/// into memory at that point.
pub async fn run_sender<T>(
    transport: &T,
    source: ByteSource,
    file_name: &str,
    options: &TransferOptions,
    cancel: &CancellationToken,
    progress: Option<mpsc::Sender<TransferProgress>>,
) -> Result<Confirmation, TransferError>
where
    T: Transport + ?Sized,
{
    let mut conn = None;
    let result = send_session(
        transport,
        source,
        file_name,
        options,
        cancel,
        progress.as_ref(),
        &mut conn,
    )
    .await;

    if let Some(conn) = conn {
        finish_connection(conn, result.is_ok(), true, cancel).await;
    }
    release(transport).await;

    match &result {
        Ok(c) => info!(
            peer = %c.peer,
            file_name = %c.file_name,
            bytes = c.total_size,
            "transfer sent"
        ),
        Err(e) => warn!(file_name, "send failed: {e}"),
    }
    result
}

/// Dials `remote`, receives one payload and hands it to `sink`.
pub async fn run_receiver<T, S>(
    transport: &T,
    remote: &PeerId,
    sink: &mut S,
    options: &TransferOptions,
    cancel: &CancellationToken,
    progress: Option<mpsc::Sender<TransferProgress>>,
) -> Result<ReceivedFile, TransferError>
where
    T: Transport + ?Sized,
    S: TransferSink + ?Sized,
{
    let mut conn = None;
    let result =
        receive_session(transport, remote, options, cancel, progress.as_ref(), &mut conn).await;

    // Hang up before persisting so the sender can finish.
    if let Some(conn) = conn {
        finish_connection(conn, result.is_ok(), false, cancel).await;
    }
    release(transport).await;

    let assembled = match result {
        Ok(assembled) => assembled,
        Err(e) => {
            warn!(%remote, "receive failed: {e}");
            return Err(e);
        }
    };
    let saved_to = sink.persist(&assembled.file_name, &assembled.bytes).await?;
    info!(
        %remote,
        file_name = %assembled.file_name,
        bytes = assembled.bytes.len(),
        "transfer received"
    );

    Ok(ReceivedFile {
        peer: remote.clone(),
        file_name: assembled.file_name,
        bytes: assembled.bytes,
        saved_to,
    })
}

async fn send_session<T>(
    transport: &T,
    source: ByteSource,
    file_name: &str,
    options: &TransferOptions,
    cancel: &CancellationToken,
    progress: Option<&mpsc::Sender<TransferProgress>>,
    conn: &mut Option<Connection>,
) -> Result<Confirmation, TransferError>
where
    T: Transport + ?Sized,
{
    let source = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        opened = source.open(options.chunk_size) => opened?,
    };
    let layout = *source.layout();
    // Encoded up front so an unusable name fails before anyone connects.
    let metadata_frame = TransferMessage::Metadata(Metadata::new(file_name, layout))
        .encode()
        .map_err(|e| TransferError::InvalidParameters(e.to_string()))?;

    info!(
        local = %transport.local_identity(),
        file_name,
        total_size = layout.total_size(),
        total_chunks = layout.total_chunks(),
        "waiting for receiver"
    );

    let mut out = Outgoing {
        conn,
        source,
        layout,
        metadata_frame,
        hasher: Sha256::new(),
        digest: None,
        progress,
        cancel,
    };

    let mut state = SenderState::Idle;
    let mut event = SenderEvent::Start;
    loop {
        let (next, effects) = sender::transition(state, event, &layout);
        state = next;

        let mut follow_up = None;
        for effect in effects {
            if let Some(ev) = out.perform(effect).await? {
                follow_up = Some(ev);
            }
        }
        if state.is_terminal() {
            break;
        }

        event = match follow_up {
            Some(ev) => ev,
            None => out.wait(transport, options.connect_timeout).await,
        };
    }

    match state {
        SenderState::Failed(e) => Err(e),
        _ => Ok(Confirmation {
            peer: out.peer(),
            file_name: file_name.to_owned(),
            total_size: layout.total_size(),
            total_chunks: layout.total_chunks(),
            digest: out.digest.unwrap_or_default(),
        }),
    }
}

/// Sender-side resources for the effects of one session.
struct Outgoing<'a> {
    conn: &'a mut Option<Connection>,
    source: ChunkSource,
    layout: ChunkLayout,
    metadata_frame: Vec<u8>,
    hasher: Sha256,
    digest: Option<Digest>,
    progress: Option<&'a mpsc::Sender<TransferProgress>>,
    cancel: &'a CancellationToken,
}

impl Outgoing<'_> {
    fn peer(&self) -> PeerId {
        self.conn
            .as_ref()
            .map(|c| c.peer().clone())
            .unwrap_or_else(|| PeerId::new("unknown"))
    }

    /// Performs one effect. Emissions report back with the next event.
    async fn perform(&mut self, effect: SenderEffect) -> Result<Option<SenderEvent>, TransferError> {
        let frame = match effect {
            SenderEffect::Progress {
                percent,
                bytes_sent,
            } => {
                report(
                    self.progress,
                    TransferProgress {
                        direction: Direction::Sending,
                        percent,
                        bytes: bytes_sent,
                        total_bytes: self.layout.total_size(),
                    },
                );
                return Ok(None);
            }
            SenderEffect::SendMetadata => {
                debug!(bytes = self.metadata_frame.len(), "sending metadata");
                self.metadata_frame.clone()
            }
            SenderEffect::SendChunk(index) => {
                let payload = self.source.read_chunk(index).await?;
                self.hasher.update(&payload);
                debug!(index, len = payload.len(), "sending chunk");
                encode(TransferMessage::Chunk { index, payload })?
            }
            SenderEffect::SendComplete => {
                let digest: Digest = std::mem::take(&mut self.hasher).finalize().into();
                self.digest = Some(digest);
                debug!(digest = %hex::encode(digest), "sending complete");
                encode(TransferMessage::Complete {
                    digest: Some(digest),
                })?
            }
        };

        let Some(conn) = self.conn.as_mut() else {
            return Ok(Some(SenderEvent::SendFailed("no connection".into())));
        };

        // A hang-up that already arrived takes precedence over the next send.
        while let Some(event) = conn.try_next_event() {
            match event {
                ConnectionEvent::Closed => return Ok(Some(SenderEvent::ConnectionClosed)),
                ConnectionEvent::Error(e) => return Ok(Some(SenderEvent::ConnectionError(e))),
                ConnectionEvent::Message(_) => debug!("ignoring message from receiver"),
                ConnectionEvent::Open => {}
            }
        }

        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => SenderEvent::Cancelled,
            result = conn.send(frame) => match result {
                Ok(()) => SenderEvent::Sent,
                Err(e) => SenderEvent::SendFailed(e.to_string()),
            },
        };
        Ok(Some(event))
    }

    /// Waits for the next event when no emission is in flight.
    async fn wait<T: Transport + ?Sized>(&mut self, transport: &T, timeout: Duration) -> SenderEvent {
        if let Some(conn) = self.conn.as_mut() {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return SenderEvent::Cancelled,
                    event = conn.next_event() => event,
                };
                match event {
                    Some(ConnectionEvent::Closed) | None => return SenderEvent::ConnectionClosed,
                    Some(ConnectionEvent::Error(e)) => return SenderEvent::ConnectionError(e),
                    Some(_) => continue,
                }
            }
        }

        match establish(transport.accept(), timeout, self.cancel).await {
            Established::Open(conn) => {
                info!(peer = %conn.peer(), "receiver connected");
                *self.conn = Some(conn);
                SenderEvent::ConnectionOpened
            }
            Established::TimedOut => SenderEvent::ConnectTimedOut(timeout),
            Established::Failed(reason) => SenderEvent::ConnectFailed(reason),
            Established::Cancelled => SenderEvent::Cancelled,
        }
    }
}

async fn receive_session<T>(
    transport: &T,
    remote: &PeerId,
    options: &TransferOptions,
    cancel: &CancellationToken,
    progress: Option<&mpsc::Sender<TransferProgress>>,
    conn: &mut Option<Connection>,
) -> Result<Assembled, TransferError>
where
    T: Transport + ?Sized,
{
    info!(%remote, "connecting to sender");

    let mut state = ReceiverState::Idle;
    let mut event = ReceiverEvent::Start;
    let mut delivered = None;
    loop {
        let (next, effects) = receiver::transition(state, event, options.progress_step);
        state = next;

        for effect in effects {
            match effect {
                ReceiverEffect::Progress {
                    percent,
                    bytes_received,
                    total_bytes,
                } => report(
                    progress,
                    TransferProgress {
                        direction: Direction::Receiving,
                        percent,
                        bytes: bytes_received,
                        total_bytes,
                    },
                ),
                ReceiverEffect::Deliver(assembled) => delivered = Some(assembled),
            }
        }
        if state.is_terminal() {
            break;
        }

        let layout = state.layout().copied();
        event = match conn.as_mut() {
            Some(c) => next_message(c, layout.as_ref(), cancel).await,
            None => match establish(transport.dial(remote), options.connect_timeout, cancel).await {
                Established::Open(c) => {
                    info!(%remote, "connected to sender");
                    *conn = Some(c);
                    ReceiverEvent::ConnectionOpened
                }
                Established::TimedOut => ReceiverEvent::ConnectTimedOut(options.connect_timeout),
                Established::Failed(reason) => ReceiverEvent::ConnectFailed(reason),
                Established::Cancelled => ReceiverEvent::Cancelled,
            },
        };
    }

    match (state, delivered) {
        (ReceiverState::Failed(e), _) => Err(e),
        (_, Some(assembled)) => Ok(assembled),
        (state, None) => Err(TransferError::ProtocolViolation(format!(
            "session ended in {state} without a payload"
        ))),
    }
}

/// Waits for the next protocol message and decodes it against `layout`.
async fn next_message(
    conn: &mut Connection,
    layout: Option<&ChunkLayout>,
    cancel: &CancellationToken,
) -> ReceiverEvent {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReceiverEvent::Cancelled,
            event = conn.next_event() => event,
        };
        return match event {
            Some(ConnectionEvent::Message(raw)) => match TransferMessage::decode(&raw, layout) {
                Ok(msg) => {
                    debug!(kind = msg.kind(), len = raw.len(), "received");
                    ReceiverEvent::Message(msg)
                }
                Err(e) => ReceiverEvent::Malformed(e),
            },
            Some(ConnectionEvent::Open) => continue,
            Some(ConnectionEvent::Closed) | None => ReceiverEvent::ConnectionClosed,
            Some(ConnectionEvent::Error(e)) => ReceiverEvent::ConnectionError(e),
        };
    }
}

enum Established {
    Open(Connection),
    TimedOut,
    Failed(String),
    Cancelled,
}

/// Resolves a dial or accept and waits for the connection to report open,
/// all within `timeout`.
async fn establish(
    pending: TransportFuture<'_, Connection>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Established {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Established::Cancelled,
        result = tokio::time::timeout(timeout, open_connection(pending)) => match result {
            Err(_) => Established::TimedOut,
            Ok(Ok(conn)) => Established::Open(conn),
            Ok(Err(reason)) => Established::Failed(reason),
        },
    }
}

async fn open_connection(pending: TransportFuture<'_, Connection>) -> Result<Connection, String> {
    let mut conn = pending.await.map_err(|e| e.to_string())?;
    match conn.next_event().await {
        Some(ConnectionEvent::Open) => Ok(conn),
        Some(ConnectionEvent::Error(e)) => Err(e),
        Some(ConnectionEvent::Message(_)) => Err("message before open".into()),
        Some(ConnectionEvent::Closed) | None => Err("connection closed before open".into()),
    }
}

/// Closes the connection on success, aborts it otherwise. A successful
/// sender also lingers until the receiver hangs up, so the last frames are
/// delivered before the transport goes away.
async fn finish_connection(
    mut conn: Connection,
    succeeded: bool,
    linger: bool,
    cancel: &CancellationToken,
) {
    if !succeeded {
        debug!(peer = %conn.peer(), "aborting connection");
        conn.abort();
        return;
    }
    conn.close().await;
    if !linger {
        return;
    }

    let peer = conn.peer().clone();
    let hang_up = async {
        loop {
            match conn.next_event().await {
                Some(ConnectionEvent::Closed | ConnectionEvent::Error(_)) | None => break,
                Some(_) => {}
            }
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        result = tokio::time::timeout(LINGER_TIMEOUT, hang_up) => {
            if result.is_err() {
                warn!(%peer, "receiver did not hang up within {LINGER_TIMEOUT:?}");
            }
        }
    }
}

async fn release<T: Transport + ?Sized>(transport: &T) {
    if let Err(e) = transport.release().await {
        warn!("failed to release transport: {e}");
    }
}

fn encode(msg: TransferMessage) -> Result<Vec<u8>, TransferError> {
    msg.encode()
        .map_err(|e| TransferError::InvalidParameters(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use peerpipe_transport::{ConnectionDriver, Outbound};

    use crate::WriterSink;

    /// Hands out one prepared connection; a second dial or accept never
    /// resolves.
    struct ScriptedTransport {
        pending: Mutex<Option<Connection>>,
        releases: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(conn: Option<Connection>) -> Self {
            Self {
                pending: Mutex::new(conn),
                releases: AtomicUsize::new(0),
            }
        }

        fn releases(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }

        async fn next(&self) -> Result<Connection, peerpipe_transport::TransportError> {
            let conn = self.pending.lock().unwrap().take();
            match conn {
                Some(conn) => Ok(conn),
                None => std::future::pending().await,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn local_identity(&self) -> PeerId {
            PeerId::new("scripted")
        }

        fn dial<'a>(&'a self, _remote: &'a PeerId) -> TransportFuture<'a, Connection> {
            Box::pin(self.next())
        }

        fn accept(&self) -> TransportFuture<'_, Connection> {
            Box::pin(self.next())
        }

        fn release(&self) -> TransportFuture<'_, ()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn frame(msg: TransferMessage) -> ConnectionEvent {
        ConnectionEvent::Message(msg.encode().unwrap())
    }

    fn metadata(name: &str, total: u64, chunk: u32) -> ConnectionEvent {
        let layout = ChunkLayout::new(total, chunk).unwrap();
        frame(TransferMessage::Metadata(Metadata::new(name, layout)))
    }

    fn chunk(index: u32, payload: &[u8]) -> ConnectionEvent {
        frame(TransferMessage::Chunk {
            index,
            payload: payload.to_vec(),
        })
    }

    async fn script(driver: &ConnectionDriver, events: Vec<ConnectionEvent>) {
        for event in events {
            assert!(driver.emit(event).await);
        }
    }

    fn small_chunks() -> TransferOptions {
        TransferOptions {
            chunk_size: 4,
            ..TransferOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sender_times_out_when_nobody_connects() {
        let transport = ScriptedTransport::new(None);
        let result = run_sender(
            &transport,
            ByteSource::Bytes(b"payload".to_vec()),
            "p.bin",
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(TransferError::ConnectTimeout(d)) if d == CONNECT_TIMEOUT));
        assert_eq!(transport.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_that_never_opens_times_out_without_sending() {
        let (conn, mut driver) = Connection::new(PeerId::new("receiver"));
        let transport = ScriptedTransport::new(Some(conn));

        let result = run_sender(
            &transport,
            ByteSource::Bytes(b"payload".to_vec()),
            "p.bin",
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(TransferError::ConnectTimeout(_))));
        assert_eq!(transport.releases(), 1);
        // The connection was dropped unopened; nothing was queued on it.
        assert_eq!(driver.next_outbound().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_times_out_when_dial_never_opens() {
        let (conn, _driver) = Connection::new(PeerId::new("sender"));
        let transport = ScriptedTransport::new(Some(conn));
        let mut sink = WriterSink::new(Vec::new());

        let result = run_receiver(
            &transport,
            &PeerId::new("sender"),
            &mut sink,
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(TransferError::ConnectTimeout(_))));
        assert_eq!(transport.releases(), 1);
        assert!(sink.into_inner().is_empty());
    }

    #[tokio::test]
    async fn sender_emits_metadata_chunks_complete_in_order() {
        let (conn, mut driver) = Connection::new(PeerId::new("receiver"));
        let transport = ScriptedTransport::new(Some(conn));
        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let options = small_chunks();

        let peer = async {
            driver.emit(ConnectionEvent::Open).await;
            let mut frames = Vec::new();
            while let Some(Outbound::Data(data)) = driver.next_outbound().await {
                frames.push(TransferMessage::decode(&data, None).unwrap());
            }
            driver.emit(ConnectionEvent::Closed).await;
            frames
        };
        let sending = run_sender(
            &transport,
            ByteSource::Bytes(b"abcdefghij".to_vec()),
            "letters.txt",
            &options,
            &cancel,
            Some(progress_tx),
        );
        let (frames, result) = tokio::join!(peer, sending);

        let confirmation = result.unwrap();
        assert_eq!(confirmation.total_size, 10);
        assert_eq!(confirmation.total_chunks, 3);
        assert_eq!(confirmation.peer.as_str(), "receiver");

        let expected_digest: Digest = Sha256::digest(b"abcdefghij").into();
        assert_eq!(confirmation.digest, expected_digest);
        assert_eq!(
            frames,
            vec![
                TransferMessage::Metadata(Metadata::new(
                    "letters.txt",
                    ChunkLayout::new(10, 4).unwrap()
                )),
                TransferMessage::Chunk { index: 0, payload: b"abcd".to_vec() },
                TransferMessage::Chunk { index: 1, payload: b"efgh".to_vec() },
                TransferMessage::Chunk { index: 2, payload: b"ij".to_vec() },
                TransferMessage::Complete { digest: Some(expected_digest) },
            ]
        );

        let mut percents = Vec::new();
        while let Ok(p) = progress_rx.try_recv() {
            assert_eq!(p.direction, Direction::Sending);
            percents.push(p.percent);
        }
        assert_eq!(percents, vec![33, 67, 100]);
        assert_eq!(transport.releases(), 1);
    }

    #[tokio::test]
    async fn sender_aborts_when_receiver_hangs_up() {
        let (conn, mut driver) = Connection::new(PeerId::new("receiver"));
        let transport = ScriptedTransport::new(Some(conn));
        let options = small_chunks();
        let cancel = CancellationToken::new();

        let peer = async {
            driver.emit(ConnectionEvent::Open).await;
            // Take the metadata, then hang up.
            driver.next_outbound().await;
            driver.emit(ConnectionEvent::Closed).await;
            drop(driver);
        };
        let data = vec![7u8; 4 * 64];
        let sending = run_sender(
            &transport,
            ByteSource::Bytes(data),
            "x",
            &options,
            &cancel,
            None,
        );
        let ((), result) = tokio::join!(peer, sending);

        assert!(matches!(
            result,
            Err(TransferError::TransferAborted { .. } | TransferError::Send { .. })
        ));
        assert_eq!(transport.releases(), 1);
    }

    #[tokio::test]
    async fn sender_cancel_mid_transfer() {
        let (conn, mut driver) = Connection::new(PeerId::new("receiver"));
        let transport = ScriptedTransport::new(Some(conn));
        let cancel = CancellationToken::new();
        let options = small_chunks();

        let peer = async {
            driver.emit(ConnectionEvent::Open).await;
            driver.next_outbound().await;
            // Stop reading so sends back up, then cancel.
            cancel.cancel();
            driver
        };
        let sending = run_sender(
            &transport,
            ByteSource::Bytes(vec![1u8; 4 * 64]),
            "x",
            &options,
            &cancel,
            None,
        );
        let (driver, result) = tokio::join!(peer, sending);

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(transport.releases(), 1);
        assert!(driver.is_cancelled());
    }

    #[tokio::test]
    async fn receiver_follows_scripted_sender() {
        let (conn, mut driver) = Connection::new(PeerId::new("sender"));
        let digest: Digest = Sha256::digest(b"abcdefghij").into();
        script(
            &driver,
            vec![
                ConnectionEvent::Open,
                metadata("letters.txt", 10, 4),
                chunk(0, b"abcd"),
                chunk(2, b"ij"),
                chunk(1, b"efgh"),
                chunk(1, b"efgh"),
                frame(TransferMessage::Complete { digest: Some(digest) }),
            ],
        )
        .await;
        let transport = ScriptedTransport::new(Some(conn));
        let mut sink = WriterSink::new(Vec::new());
        let (progress_tx, mut progress_rx) = mpsc::channel(16);

        let received = run_receiver(
            &transport,
            &PeerId::new("sender"),
            &mut sink,
            &TransferOptions::default(),
            &CancellationToken::new(),
            Some(progress_tx),
        )
        .await
        .unwrap();

        assert_eq!(received.file_name, "letters.txt");
        assert_eq!(received.bytes, b"abcdefghij");
        assert_eq!(received.saved_to, None);
        assert_eq!(sink.into_inner(), b"abcdefghij");
        assert_eq!(transport.releases(), 1);

        let mut last = None;
        while let Ok(p) = progress_rx.try_recv() {
            assert_eq!(p.direction, Direction::Receiving);
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!((last.percent, last.bytes, last.total_bytes), (100, 10, 10));

        // The receiver hung up cleanly.
        assert_eq!(driver.next_outbound().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn receiver_rejects_chunk_before_metadata() {
        let (conn, driver) = Connection::new(PeerId::new("sender"));
        script(&driver, vec![ConnectionEvent::Open, chunk(0, b"abcd")]).await;
        let transport = ScriptedTransport::new(Some(conn));
        let mut sink = WriterSink::new(Vec::new());

        let result = run_receiver(
            &transport,
            &PeerId::new("sender"),
            &mut sink,
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(TransferError::ProtocolViolation(_))));
        assert_eq!(transport.releases(), 1);
        assert!(driver.is_cancelled());
        assert!(sink.into_inner().is_empty());
    }

    #[tokio::test]
    async fn receiver_reports_incomplete_transfer() {
        let (conn, driver) = Connection::new(PeerId::new("sender"));
        script(
            &driver,
            vec![
                ConnectionEvent::Open,
                metadata("gap.bin", 12, 4),
                chunk(0, b"aaaa"),
                chunk(2, b"cccc"),
                frame(TransferMessage::Complete { digest: None }),
            ],
        )
        .await;
        let transport = ScriptedTransport::new(Some(conn));
        let mut sink = WriterSink::new(Vec::new());

        let result = run_receiver(
            &transport,
            &PeerId::new("sender"),
            &mut sink,
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        assert!(matches!(
            result,
            Err(TransferError::IncompleteTransfer { missing: 1, total: 3 })
        ));
        assert_eq!(transport.releases(), 1);
    }

    #[tokio::test]
    async fn receiver_rejects_wrong_chunk_length() {
        let (conn, driver) = Connection::new(PeerId::new("sender"));
        script(
            &driver,
            vec![
                ConnectionEvent::Open,
                metadata("short.bin", 8, 4),
                chunk(0, b"aa"),
            ],
        )
        .await;
        let transport = ScriptedTransport::new(Some(conn));
        let mut sink = WriterSink::new(Vec::new());

        let result = run_receiver(
            &transport,
            &PeerId::new("sender"),
            &mut sink,
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(TransferError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn receiver_aborted_by_close_mid_transfer() {
        let (conn, driver) = Connection::new(PeerId::new("sender"));
        script(
            &driver,
            vec![
                ConnectionEvent::Open,
                metadata("cut.bin", 12, 4),
                chunk(0, b"aaaa"),
                ConnectionEvent::Closed,
            ],
        )
        .await;
        let transport = ScriptedTransport::new(Some(conn));
        let mut sink = WriterSink::new(Vec::new());

        let result = run_receiver(
            &transport,
            &PeerId::new("sender"),
            &mut sink,
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        assert!(matches!(
            result,
            Err(TransferError::TransferAborted { last_index: Some(0), .. })
        ));
        assert_eq!(transport.releases(), 1);
    }

    #[tokio::test]
    async fn receiver_cancelled_while_waiting() {
        let (conn, driver) = Connection::new(PeerId::new("sender"));
        script(&driver, vec![ConnectionEvent::Open, metadata("slow.bin", 8, 4)]).await;
        let transport = ScriptedTransport::new(Some(conn));
        let mut sink = WriterSink::new(Vec::new());
        let remote = PeerId::new("sender");
        let options = TransferOptions::default();
        let cancel = CancellationToken::new();

        let canceller = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };
        let receiving = run_receiver(
            &transport,
            &remote,
            &mut sink,
            &options,
            &cancel,
            None,
        );
        let ((), result) = tokio::join!(canceller, receiving);

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(transport.releases(), 1);
        assert!(driver.is_cancelled());
    }

    #[tokio::test]
    async fn dial_failure_is_dial_error() {
        struct Unreachable;
        impl Transport for Unreachable {
            fn local_identity(&self) -> PeerId {
                PeerId::new("me")
            }
            fn dial<'a>(&'a self, remote: &'a PeerId) -> TransportFuture<'a, Connection> {
                Box::pin(async move {
                    Err(peerpipe_transport::TransportError::Dial {
                        peer: remote.clone(),
                        reason: "unknown peer".into(),
                    })
                })
            }
            fn accept(&self) -> TransportFuture<'_, Connection> {
                Box::pin(std::future::pending())
            }
            fn release(&self) -> TransportFuture<'_, ()> {
                Box::pin(async { Ok(()) })
            }
        }

        let mut sink = WriterSink::new(Vec::new());
        let result = run_receiver(
            &Unreachable,
            &PeerId::new("ghost"),
            &mut sink,
            &TransferOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await;

        match result {
            Err(TransferError::Dial(reason)) => assert!(reason.contains("ghost")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
