use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;

use super::{actor, CLOSE_BAD_DOCUMENT, CLOSE_FORBIDDEN, CLOSE_UNAUTHORIZED};
use crate::api::AppState;
use crate::auth::token_from_headers;
use crate::collab::document_key;

/// Query parameters for the socket. Browsers cannot set headers on a
/// WebSocket, so the token may come in the query string.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws/{*document}
///
/// Auth and access failures still upgrade, then close immediately with an
/// application close code so the client can tell them apart.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(document): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| token_from_headers(&headers));

    let user = match state.auth.authenticate(token.as_deref()) {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(document = %document, error = %e, "WebSocket auth failed");
            return reject(ws, CLOSE_UNAUTHORIZED, "Unauthorized");
        }
    };

    if document_key(&document).is_none() {
        tracing::warn!(document = %document, "WebSocket for invalid document name");
        return reject(ws, CLOSE_BAD_DOCUMENT, "Invalid document");
    }

    if !user.can_access_document(&document) {
        tracing::warn!(
            document = %document,
            user_id = %user.id,
            "WebSocket community access denied"
        );
        return reject(ws, CLOSE_FORBIDDEN, "Forbidden");
    }

    tracing::info!(document = %document, user_id = %user.id, "WebSocket connection authenticated");
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| actor::run_connection(socket, sessions, document, user))
}

/// Upgrades, then closes with `code` before anything else is sent.
fn reject(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    })
}
