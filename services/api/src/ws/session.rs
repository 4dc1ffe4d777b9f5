//! Manages the WebSocket connection lifecycle of a voice session.
//!
//! The socket is split in two: a reader task turns client frames into
//! `ClientFrame`s for the bridge, and a writer task serializes everything the
//! bridge emits. The bridge itself runs on the upgrade task.

use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use oriel_core::{ClientFrame, VoiceBridge, protocol::Outbound};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, field, info, info_span, warn};

const INBOUND_BUFFER: usize = 64;
const OUTBOUND_BUFFER: usize = 256;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Serves one voice connection from upgrade to teardown.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

    let bridge = VoiceBridge::new(state.bridge_deps(), outbound_tx);
    let connection_id = bridge.connection_id();
    let span = info_span!(
        "voice_session",
        %connection_id,
        chat_session_id = field::Empty
    );

    let (socket_tx, socket_rx) = socket.split();
    let writer = tokio::spawn(write_outbound(socket_tx, outbound_rx).instrument(span.clone()));
    let reader = tokio::spawn(read_frames(socket_rx, inbound_tx).instrument(span.clone()));

    bridge.run(inbound_rx).instrument(span.clone()).await;

    // The bridge held the only outbound sender, so the writer drains and ends.
    reader.abort();
    if let Err(e) = writer.await {
        if !e.is_cancelled() {
            error!(parent: &span, error = %e, "Client writer task failed");
        }
    }
    info!(parent: &span, "WebSocket connection closed.");
}

/// Forwards client frames to the bridge until the client closes or errors.
async fn read_frames<S, E>(mut socket_rx: S, inbound: mpsc::Sender<ClientFrame>)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(msg_result) = socket_rx.next().await {
        let frame = match msg_result {
            Ok(Message::Text(text)) => ClientFrame::Text(text.as_str().to_owned()),
            Ok(Message::Binary(data)) => ClientFrame::Binary(data.to_vec()),
            Ok(Message::Close(_)) => {
                info!("Client sent close frame.");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(e) => {
                warn!(error = %e, "Error receiving from client WebSocket");
                break;
            }
        };
        if inbound.send(frame).await.is_err() {
            debug!("Bridge is gone; stopping client reader.");
            break;
        }
    }
}

/// Writes bridge output to the client until the bridge drops its sender.
async fn write_outbound<W>(mut socket_tx: W, mut outbound: mpsc::Receiver<Outbound>)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, &message).await {
            warn!(error = %e, "Failed to write to client WebSocket; dropping writer.");
            return;
        }
    }
    let _ = socket_tx.close().await;
}

/// A helper function to serialize and send an `Outbound` message to the client.
pub(crate) async fn send_msg<W>(socket_tx: &mut W, msg: &Outbound) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let serialized = serde_json::to_string(msg)?;
    socket_tx
        .send(Message::Text(serialized.into()))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::{sink, stream};
    use oriel_core::protocol::{Reply, ServerPush};

    #[tokio::test]
    async fn test_reader_forwards_until_close() {
        let frames = stream::iter(vec![
            Ok::<_, axum::Error>(Message::Text(r#"{"type":"stop"}"#.into())),
            Ok(Message::Ping(Bytes::new())),
            Ok(Message::Binary(Bytes::from_static(&[1, 2, 3]))),
            Ok(Message::Close(None)),
            Ok(Message::Text("after close".into())),
        ]);
        let (tx, mut rx) = mpsc::channel(8);

        read_frames(frames, tx).await;

        assert_eq!(
            rx.recv().await,
            Some(ClientFrame::Text(r#"{"type":"stop"}"#.to_string()))
        );
        assert_eq!(rx.recv().await, Some(ClientFrame::Binary(vec![1, 2, 3])));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_writer_serializes_replies_and_pushes() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Reply::ok().into()).await.unwrap();
        tx.send(ServerPush::GenerationComplete.into()).await.unwrap();
        drop(tx);

        let sent: Arc<std::sync::Mutex<Vec<Message>>> = Arc::default();
        let recorder = sent.clone();
        let sink = Box::pin(sink::unfold((), move |(), msg: Message| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(msg);
                Ok::<_, std::convert::Infallible>(())
            }
        }));
        write_outbound(sink, rx).await;

        let texts: Vec<String> = sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| match m {
                Message::Text(t) => t.as_str().to_owned(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                r#"{"ok":true}"#.to_string(),
                r#"{"type":"generation_complete"}"#.to_string()
            ]
        );
    }
}
