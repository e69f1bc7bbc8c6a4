use crate::{
    engine::{handle_socket, Admission, RaceEngine},
    identity::resolve_client_ip,
    messages::{ErrorCode, ServerEvent, CLOSE_POLICY},
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Extension,
    },
    response::{IntoResponse, Response},
};
use http::HeaderMap;
use std::{net::SocketAddr, sync::Arc};
use tracing::debug;

/// WebSocket upgrade at `/ws/race`. Admission (IP limits, bans, overload
/// shedding) is decided before the socket joins the engine; rejected sockets
/// still complete the upgrade so they receive a proper close code.
pub async fn race_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Extension(engine): Extension<Arc<RaceEngine>>,
) -> Response {
    let ip = match resolve_client_ip(peer, &headers, &engine.trusted_proxies) {
        Ok(ip) => ip,
        Err(_) => {
            debug!(%peer, "rejecting socket with unresolvable client address");
            return ws
                .on_upgrade(|socket| {
                    reject_socket(socket, None, CLOSE_POLICY, "client address unresolvable")
                })
                .into_response();
        }
    };

    match engine.admit_socket(ip).await {
        Admission::Allow { conn_id } => ws
            .on_upgrade(move |socket| handle_socket(engine, socket, ip, conn_id))
            .into_response(),
        Admission::Reject {
            error,
            close_code,
            reason,
        } => {
            debug!(%ip, close_code, reason, "socket rejected at admission");
            ws.on_upgrade(move |socket| reject_socket(socket, error, close_code, reason))
                .into_response()
        }
    }
}

async fn reject_socket(
    mut socket: WebSocket,
    error: Option<ErrorCode>,
    close_code: u16,
    reason: &'static str,
) {
    if let Some(code) = error {
        let event = ServerEvent::error(code, reason);
        if let Ok(text) = serde_json::to_string(&event) {
            let _ = socket.send(Message::Text(text)).await;
        }
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code,
            reason: reason.into(),
        })))
        .await;
}
