use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use super::{CLOSE_BAD_DOCUMENT, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_LAGGING, CLOSE_NOT_FOUND};
use crate::auth::User;
use crate::collab::{ClientFrame, CollabError, Outbound, ServerFrame, SessionHandle, SessionManager};

/// Server sends a WebSocket ping this often.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connection is closed if the pong does not arrive within this window.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one document connection until either side closes it.
///
/// The socket is split: a writer task owns the sink and drains two channels,
/// one for session output and one for socket control frames, while this
/// task reads and dispatches incoming frames in arrival order. The session
/// holds the only sender of the output channel, so the writer sees it close
/// when the session drops this participant.
pub async fn run_connection(
    socket: WebSocket,
    sessions: SessionManager,
    document: String,
    user: User,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, out_rx) = sessions.outbound_channel();

    let handle = match sessions.join(&document, user.participant(), out_tx).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(document = %document, user_id = %user.id, error = %e, "Join failed");
            let (code, reason) = match e {
                CollabError::NotFound(_) => (CLOSE_NOT_FOUND, "Document not found"),
                CollabError::StoreUnavailable(_) => (CLOSE_INTERNAL_ERROR, "Document unavailable"),
                _ => (CLOSE_BAD_DOCUMENT, "Document unavailable"),
            };
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel::<Message>();
    let mut writer_handle = tokio::spawn(writer_task(ws_sender, out_rx, ctl_rx));

    tracing::info!(document = %document, user_id = %user.id, "WebSocket actor started");

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_tx = ctl_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut writer_handle => {
                tracing::info!(document = %document, user_id = %user.id, "Writer finished");
                break;
            }
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Binary(data) => handle_frame(&handle, &data),
                Message::Text(text) => handle_frame(&handle, text.as_str().as_bytes()),
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = ctl_tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        document = %document,
                        user_id = %user.id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    document = %document,
                    user_id = %user.id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(document = %document, user_id = %user.id, "WebSocket stream ended");
                break;
            }
        }
    }

    ping_handle.abort();
    writer_handle.abort();
    handle.leave().await;

    tracing::info!(document = %document, user_id = %user.id, "WebSocket actor stopped");
}

/// Decodes one client frame and dispatches it to the session.
fn handle_frame(handle: &SessionHandle, data: &[u8]) {
    let frame = match ClientFrame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(
                user_id = %handle.participant().user_id,
                error = %e,
                "Malformed frame"
            );
            handle.send(ServerFrame::Rejected {
                reason: format!("malformed frame: {}", e),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Update(update) => {
            // Rejections are reported to the client by the session itself.
            let _ = handle.apply(&update);
        }
        ClientFrame::Ping => handle.send(ServerFrame::Pong),
    }
}

/// Owns the sink. Session frames go out as tagged binary messages; a
/// session close, a dropped session queue or a control close ends the task.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
    mut ctl_rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let msg = tokio::select! {
            out = out_rx.recv() => match out {
                Some(Outbound::Frame(frame)) => match frame.encode() {
                    Ok(bytes) => Message::Binary(bytes.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode frame");
                        continue;
                    }
                },
                Some(Outbound::Close { code, reason }) => Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                None => Message::Close(Some(CloseFrame {
                    code: CLOSE_LAGGING,
                    reason: "Connection fell behind".into(),
                })),
            },
            Some(ctl) = ctl_rx.recv() => ctl,
        };

        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
