use super::{RaceEngine, IDLE_TIMEOUT};
use crate::{
    messages::{
        parse_client_frame, ClientMessage, ErrorCode, FrameError, ServerEvent, CLOSE_IDLE,
        CLOSE_POLICY, MAX_STANDARD_FRAME_BYTES,
    },
    rate_limit::{distributed_window, ConnectionLimiter},
    registry::{AuthBinding, AuthCell, OutboundFrame, OutboundHandle},
};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::{
    net::IpAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// Per-socket state owned by the read loop.
pub struct SocketContext {
    pub conn_id: u64,
    pub ip: IpAddr,
    pub out: OutboundHandle,
    pub auth: AuthCell,
    pub limiter: ConnectionLimiter,
    pub spectating: Option<i64>,
    /// Opaque key identifying this socket in spectator rows.
    pub session_key: String,
}

impl SocketContext {
    #[must_use]
    pub fn binding(&self) -> Option<AuthBinding> {
        self.auth.lock().unwrap().clone()
    }

    pub fn bind(&self, binding: AuthBinding) {
        *self.auth.lock().unwrap() = Some(binding);
    }

    pub fn unbind(&self) {
        *self.auth.lock().unwrap() = None;
    }

    pub fn send(&self, event: &ServerEvent) {
        self.out.send_event(event);
    }

    pub fn send_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.send(&ServerEvent::error(code, message));
    }
}

/// Runs one admitted socket to completion: writer task, read loop with the
/// idle deadline, then the disconnect path.
pub async fn handle_socket(engine: Arc<RaceEngine>, socket: WebSocket, ip: IpAddr, conn_id: u64) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let out = OutboundHandle::new(conn_id, tx);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if sink.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut ctx = SocketContext {
        conn_id,
        ip,
        out,
        auth: Arc::new(Mutex::new(None)),
        limiter: ConnectionLimiter::default(),
        spectating: None,
        session_key: Uuid::new_v4().to_string(),
    };
    debug!(conn_id, %ip, "socket connected");

    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Err(_) => {
                ctx.out.close(CLOSE_IDLE, "idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => {
                    process_frame(&engine, &mut ctx, &text).await;
                }
                Message::Binary(_) => {
                    ctx.send_error(ErrorCode::InvalidPayload, "binary frames are not supported");
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => break,
            },
        }
        if ctx.out.is_closed() {
            break;
        }
    }

    engine.handle_disconnect(&mut ctx).await;
    engine.release_socket(ip, conn_id);
    debug!(conn_id, %ip, "socket disconnected");

    // Give the writer a moment to flush any queued close frame.
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
}

async fn process_frame(engine: &Arc<RaceEngine>, ctx: &mut SocketContext, text: &str) {
    let message = match parse_client_frame(text) {
        Ok(message) => message,
        Err(FrameError::TooLarge) => {
            ctx.send_error(ErrorCode::InvalidPayload, "frame too large");
            return;
        }
        Err(error) => {
            trace!(conn_id = ctx.conn_id, %error, "rejecting malformed frame");
            ctx.send_error(ErrorCode::InvalidPayload, "invalid payload");
            return;
        }
    };
    let message_type = message.message_type();
    if message_type != "submit_keystrokes" && text.len() > MAX_STANDARD_FRAME_BYTES {
        ctx.send_error(ErrorCode::InvalidPayload, "frame too large");
        return;
    }

    let decision = ctx.limiter.check(message_type, Instant::now());
    if !decision.allowed {
        if decision.violation_flagged {
            engine.record_ip_violation(ctx.ip).await;
            if engine.ip_tracker.is_banned(ctx.ip, Instant::now()) {
                ctx.out.close(CLOSE_POLICY, "address banned");
                return;
            }
        }
        let retry_after = decision.retry_after_ms.unwrap_or(1000);
        ctx.send(&ServerEvent::error_with_retry(
            ErrorCode::RateLimited,
            format!("too many {message_type} messages"),
            retry_after,
        ));
        return;
    }

    if let Some(binding) = ctx.binding() {
        let (limit, window_ms) = distributed_window(message_type);
        let allowed = engine
            .store
            .rate_limit_check(
                &binding.connection_key,
                message_type,
                limit,
                window_ms,
                Utc::now().timestamp_millis(),
            )
            .await;
        if allowed == Some(false) {
            ctx.send(&ServerEvent::error_with_retry(
                ErrorCode::RateLimited,
                format!("too many {message_type} messages"),
                1000,
            ));
            return;
        }
        engine.registry.touch(&binding.connection_key, ctx.conn_id).await;
    }

    engine.dispatch(ctx, message).await;
}

impl RaceEngine {
    pub(crate) async fn dispatch(self: &Arc<Self>, ctx: &mut SocketContext, message: ClientMessage) {
        match message {
            ClientMessage::Join {
                race_id,
                participant_id,
                username,
                join_token,
            } => {
                self.handle_join(ctx, race_id, participant_id, username, join_token)
                    .await;
            }
            ClientMessage::Ready {
                race_id,
                participant_id,
            } => self.handle_ready(ctx, race_id, participant_id).await,
            ClientMessage::ReadyToggle {
                race_id,
                participant_id,
                is_ready,
            } => {
                self.handle_ready_toggle(ctx, race_id, participant_id, is_ready)
                    .await;
            }
            ClientMessage::Progress {
                participant_id,
                progress,
                errors,
            } => self.handle_progress(ctx, participant_id, &progress, &errors).await,
            ClientMessage::Finish {
                race_id,
                participant_id,
            } => self.handle_finish(ctx, race_id, participant_id).await,
            ClientMessage::TimedFinish {
                race_id,
                participant_id,
                progress,
                errors,
            } => {
                self.handle_timed_finish(ctx, race_id, participant_id, &progress, &errors)
                    .await;
            }
            ClientMessage::Leave {
                race_id,
                participant_id,
                is_racing,
                progress,
                errors,
            } => {
                self.handle_leave(ctx, race_id, participant_id, is_racing, progress, errors)
                    .await;
            }
            ClientMessage::SubmitKeystrokes {
                race_id,
                participant_id,
                keystrokes,
                client_wpm,
            } => {
                self.handle_submit_keystrokes(ctx, race_id, participant_id, keystrokes, client_wpm)
                    .await;
            }
            ClientMessage::ChatMessage {
                race_id,
                participant_id,
                content,
            } => self.handle_chat(ctx, race_id, participant_id, content).await,
            ClientMessage::KickPlayer {
                race_id,
                participant_id,
                target_participant_id,
            } => {
                self.handle_kick(ctx, race_id, participant_id, target_participant_id)
                    .await;
            }
            ClientMessage::LockRoom {
                race_id,
                participant_id,
                locked,
            } => self.handle_lock_room(ctx, race_id, participant_id, locked).await,
            ClientMessage::RejoinDecision {
                race_id,
                participant_id,
                target_participant_id,
                approved,
            } => {
                self.handle_rejoin_decision(ctx, race_id, participant_id, target_participant_id, approved)
                    .await;
            }
            ClientMessage::ExtendParagraph {
                race_id,
                participant_id,
            } => self.handle_extend_paragraph(ctx, race_id, participant_id).await,
            ClientMessage::Rematch {
                race_id,
                participant_id,
            } => self.handle_rematch(ctx, race_id, participant_id).await,
            ClientMessage::Spectate { race_id } => self.handle_spectate(ctx, race_id).await,
            ClientMessage::StopSpectate { race_id } => {
                self.handle_stop_spectate(ctx, race_id).await;
            }
            ClientMessage::GetReplay { race_id } => self.handle_get_replay(ctx, race_id).await,
            ClientMessage::GetRating { user_id } => self.handle_get_rating(ctx, user_id).await,
        }
    }

    /// Frames after `join` must match the socket's binding on both ids.
    pub(crate) fn authorize(
        &self,
        ctx: &SocketContext,
        race_id: i64,
        participant_id: i64,
    ) -> Result<AuthBinding, ErrorCode> {
        match ctx.binding() {
            Some(binding)
                if binding.race_id == race_id && binding.participant_id == participant_id =>
            {
                Ok(binding)
            }
            Some(_) | None => Err(ErrorCode::NotAuthorized),
        }
    }

    /// `progress` frames carry no race id; the binding supplies it.
    pub(crate) fn authorize_participant(
        &self,
        ctx: &SocketContext,
        participant_id: i64,
    ) -> Result<AuthBinding, ErrorCode> {
        match ctx.binding() {
            Some(binding) if binding.participant_id == participant_id => Ok(binding),
            Some(_) | None => Err(ErrorCode::NotAuthorized),
        }
    }
}
