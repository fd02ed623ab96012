//! WebSocket read and write pumps.
//!
//! One pump pair per connection. The write pump drains the connection's
//! outbound queue into binary frames; the read pump turns frames into
//! [`ConnectionEvent`]s.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::connection::{ConnectionEvent, Outbound};

/// Writes queued messages to the WebSocket until a close marker, an abort,
/// or a write error.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => {
                match frame {
                    Some(Outbound::Data(data)) => {
                        trace!(len = data.len(), "writing frame");
                        if let Err(e) = write.send(tungstenite::Message::Binary(data.into())).await {
                            error!("WebSocket write error: {e}");
                            let _ = events.try_send(ConnectionEvent::Error(e.to_string()));
                            return;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

/// Reads frames from the WebSocket and delivers them as events.
///
/// Emits [`ConnectionEvent::Open`] first, then one event per binary frame,
/// and finally `Closed` or `Error`. A text frame is reported as `Error`.
/// Exits silently on local abort.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    if events.send(ConnectionEvent::Open).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            msg = read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        if events.send(ConnectionEvent::Message(data.to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        debug!("received close frame");
                        break;
                    }
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        // Every protocol message is binary; a text frame ends the connection.
                        warn!(len = text.len(), "unexpected text frame");
                        let reason = "unexpected text frame".to_string();
                        let _ = events.send(ConnectionEvent::Error(reason)).await;
                        return;
                    }
                    Some(Ok(_)) => {} // Ping/Pong are answered by tungstenite.
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        let _ = events.send(ConnectionEvent::Error(e.to_string())).await;
                        return;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(ConnectionEvent::Closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{sink, stream};

    fn collecting_sink(
        tx: mpsc::Sender<tungstenite::Message>,
    ) -> impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    #[tokio::test]
    async fn write_pump_flushes_before_close() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (events_tx, _events_rx) = mpsc::channel(16);

        out_tx.send(Outbound::Data(b"a".to_vec())).await.unwrap();
        out_tx.send(Outbound::Data(b"b".to_vec())).await.unwrap();
        out_tx.send(Outbound::Close).await.unwrap();

        write_pump(collecting_sink(sink_tx), out_rx, events_tx, CancellationToken::new()).await;

        let mut frames = Vec::new();
        while let Ok(m) = sink_rx.try_recv() {
            frames.push(m);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], tungstenite::Message::Binary(b"a".to_vec().into()));
        assert_eq!(frames[1], tungstenite::Message::Binary(b"b".to_vec().into()));
        assert!(matches!(frames[2], tungstenite::Message::Close(_)));
    }

    #[tokio::test]
    async fn write_pump_stops_on_cancel() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (_out_tx, out_rx) = mpsc::channel(16);
        let (events_tx, _events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            write_pump(collecting_sink(sink_tx), out_rx, events_tx, c).await;
        });

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Close(_))));
    }

    #[tokio::test]
    async fn read_pump_emits_open_messages_closed() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let frames = stream::iter(vec![
            Ok(tungstenite::Message::Binary(b"x".to_vec().into())),
            Ok(tungstenite::Message::Ping(Vec::new().into())),
            Ok(tungstenite::Message::Binary(b"y".to_vec().into())),
            Ok(tungstenite::Message::Close(None)),
        ]);

        read_pump(frames, events_tx, CancellationToken::new()).await;

        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Open));
        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Message(b"x".to_vec())));
        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Message(b"y".to_vec())));
        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Closed));
    }

    #[tokio::test]
    async fn read_pump_reports_stream_error() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let frames = stream::iter(vec![Err(tungstenite::Error::ConnectionClosed)]);

        read_pump(frames, events_tx, CancellationToken::new()).await;

        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Open));
        assert!(matches!(events_rx.recv().await, Some(ConnectionEvent::Error(_))));
        assert_eq!(events_rx.recv().await, None);
    }

    #[tokio::test]
    async fn read_pump_rejects_text_frame() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let frames = stream::iter(vec![
            Ok(tungstenite::Message::Binary(b"x".to_vec().into())),
            Ok(tungstenite::Message::Text("hello".into())),
            Ok(tungstenite::Message::Binary(b"y".to_vec().into())),
        ]);
        read_pump(frames, events_tx, CancellationToken::new()).await;

        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Open));
        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Message(b"x".to_vec())));
        assert_eq!(
            events_rx.recv().await,
            Some(ConnectionEvent::Error("unexpected text frame".into()))
        );
        // Nothing after the text frame is delivered.
        assert_eq!(events_rx.recv().await, None);
    }

    #[tokio::test]
    async fn read_pump_end_of_stream_is_close() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(empty, events_tx, CancellationToken::new()).await;

        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Open));
        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Closed));
    }
}
