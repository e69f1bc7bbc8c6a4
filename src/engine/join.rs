use super::{RaceEngine, SocketContext};
use crate::{
    messages::{ErrorCode, ServerEvent},
    race::{ParticipantView, RaceStatus, RaceView},
    registry::AuthBinding,
    room::{
        PendingRejoin, RaceRoom, RoomClient, GLOBAL_SPECTATOR_LIMIT, REJOIN_TIMEOUT,
        SPECTATOR_LIMIT_PER_RACE,
    },
};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

impl RaceEngine {
    pub(crate) async fn handle_join(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        username: String,
        join_token: String,
    ) {
        if ctx.binding().is_some() {
            ctx.send_error(ErrorCode::DuplicateConnection, "socket already joined a race");
            return;
        }
        if join_token.is_empty() {
            ctx.send_error(ErrorCode::TokenRequired, "join token required");
            return;
        }

        let participant = match self
            .storage
            .get_participant_including_deleted(participant_id)
            .await
        {
            Ok(Some(participant)) => participant,
            Ok(None) => {
                ctx.send_error(ErrorCode::PlayerNotFound, "unknown participant");
                return;
            }
            Err(error) => {
                warn!(%error, participant_id, "participant lookup failed");
                ctx.send_error(ErrorCode::RaceUnavailable, "race unavailable");
                return;
            }
        };
        if participant.race_id != race_id {
            ctx.send_error(ErrorCode::PlayerNotFound, "participant not in this race");
            return;
        }
        if participant.username != username {
            ctx.send_error(ErrorCode::NotAuthorized, "username mismatch");
            return;
        }
        if !participant.join_token.matches(&join_token) {
            ctx.send_error(ErrorCode::InvalidToken, "invalid join token");
            return;
        }

        let room = match self.load_room(race_id).await {
            Ok(room) => room,
            Err(code) => {
                ctx.send_error(code, "race unavailable");
                return;
            }
        };
        let mut room = room.lock().await;

        match room.race.status {
            RaceStatus::Finished => {
                ctx.send_error(ErrorCode::RaceFinished, "race already finished");
                return;
            }
            RaceStatus::Abandoned => {
                ctx.send_error(ErrorCode::RaceUnavailable, "race abandoned");
                return;
            }
            _ => {}
        }

        if room.kicked_players.contains(&participant_id) {
            if room.race.status == RaceStatus::Waiting {
                self.queue_rejoin_request(ctx, &mut room, participant_id, &participant.username);
            } else {
                ctx.send_error(ErrorCode::Kicked, "kicked from this race");
            }
            return;
        }
        if participant.deleted {
            ctx.send_error(ErrorCode::PlayerNotFound, "participant left this race");
            return;
        }
        if room.is_locked && !room.participants.contains_key(&participant_id) {
            ctx.send_error(ErrorCode::RoomLocked, "room is locked");
            return;
        }

        // Supersession first: any older session for this identity must see
        // its notice and close before this join produces broadcasts.
        let connection_key = participant.identity_key().to_string();
        let superseded = self
            .registry
            .register(&connection_key, ctx.out.clone(), Some(race_id), Some(participant_id))
            .await;
        for handle in &superseded {
            handle.supersede();
        }
        let had_client = match room.clients.remove(&participant_id) {
            Some(old) if old.conn_id != ctx.conn_id => {
                old.out.supersede();
                true
            }
            Some(_) => true,
            None => false,
        };

        let is_reconnect = self.untrack_disconnected(race_id, participant_id)
            || had_client
            || !matches!(room.race.status, RaceStatus::Waiting);

        room.participants.insert(participant_id, participant.clone());
        if !participant.is_bot {
            room.assign_initial_host(participant_id);
        }
        // A racing room restored on this instance may not have a local start
        // instant yet; derive it from the persisted start time.
        if room.race.status == RaceStatus::Racing && room.race_start.is_none() {
            if let Some(started_at) = room.race.started_at {
                let elapsed_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                room.race_start =
                    Some(Instant::now() - std::time::Duration::from_millis(elapsed_ms));
            }
        }

        room.clients.insert(participant_id, RoomClient {
            participant_id,
            conn_id: ctx.conn_id,
            out: ctx.out.clone(),
            username: participant.username.clone(),
            connection_key: connection_key.clone(),
            is_bot: participant.is_bot,
            is_ready: false,
            last_activity: Instant::now(),
        });
        ctx.bind(AuthBinding {
            race_id,
            participant_id,
            connection_key,
            username: participant.username.clone(),
        });

        let server_timestamp = if room.race.status == RaceStatus::Racing {
            room.race.started_at.map(|at| at.timestamp_millis())
        } else {
            None
        };
        ctx.send(&ServerEvent::Joined {
            race: RaceView::from(&room.race),
            participants: room.participant_views(),
            participant_id,
            host_participant_id: room.host_participant_id,
            is_reconnect,
            server_timestamp,
        });
        ctx.send(&ServerEvent::ChatHistory {
            messages: room.chat_snapshot(),
        });
        for client in room.clients.values() {
            if client.is_ready {
                ctx.send(&ServerEvent::ReadyStateUpdate {
                    participant_id: client.participant_id,
                    is_ready: true,
                });
            }
        }

        let announcement = if is_reconnect {
            ServerEvent::ParticipantReconnected {
                participant_id,
                username: participant.username.clone(),
            }
        } else {
            ServerEvent::ParticipantJoined {
                participant: ParticipantView::from(&participant),
            }
        };
        room.broadcast_except(participant_id, &announcement);
        self.publish_remote(race_id, &announcement);
        info!(race_id, participant_id, is_reconnect, "participant joined");
        drop(room);

        self.store.add_race_connection(race_id, participant_id).await;
    }

    fn queue_rejoin_request(
        self: &Arc<Self>,
        ctx: &SocketContext,
        room: &mut RaceRoom,
        participant_id: i64,
        username: &str,
    ) {
        let queued = room.queue_rejoin(participant_id, PendingRejoin {
            conn_id: ctx.conn_id,
            out: ctx.out.clone(),
            auth: ctx.auth.clone(),
            username: username.to_owned(),
            requested_at: Instant::now(),
        });
        if !queued {
            ctx.send(&ServerEvent::RejoinRejected {
                reason: "rejoin queue full".to_owned(),
            });
            return;
        }
        ctx.send(&ServerEvent::RejoinRequestPending);
        if let Some(host_id) = room.host_participant_id {
            room.send_to(host_id, &ServerEvent::RejoinRequest {
                participant_id,
                username: username.to_owned(),
            });
        }

        let engine = Arc::clone(self);
        let race_id = room.race_id();
        tokio::spawn(async move {
            tokio::time::sleep(REJOIN_TIMEOUT).await;
            engine.expire_rejoin(race_id, participant_id).await;
        });
    }

    pub(crate) async fn expire_rejoin(&self, race_id: i64, participant_id: i64) {
        let Some(room) = self.room_if_loaded(race_id) else { return };
        let mut room = room.lock().await;
        let timed_out = room
            .pending_rejoins
            .get(&participant_id)
            .map_or(false, |pending| pending.requested_at.elapsed() >= REJOIN_TIMEOUT);
        if timed_out {
            if let Some(pending) = room.pending_rejoins.remove(&participant_id) {
                pending.out.send_event(&ServerEvent::error(
                    ErrorCode::RequestTimeout,
                    "rejoin request timed out",
                ));
                pending.out.send_event(&ServerEvent::RejoinRejected {
                    reason: "timeout".to_owned(),
                });
            }
        }
    }

    pub(crate) async fn handle_rejoin_decision(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        target_participant_id: i64,
        approved: bool,
    ) {
        if let Err(code) = self.authorize(ctx, race_id, participant_id) {
            ctx.send_error(code, "not authorized");
            return;
        }
        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };
        let mut room = room.lock().await;
        if let Err(code) = room.require_host(participant_id) {
            ctx.send_error(code, "only the host decides rejoins");
            return;
        }
        let Some(pending) = room.pending_rejoins.remove(&target_participant_id) else {
            ctx.send_error(ErrorCode::PlayerNotFound, "no pending rejoin for that player");
            return;
        };

        if !approved {
            pending.out.send_event(&ServerEvent::RejoinRejected {
                reason: "rejected by host".to_owned(),
            });
            return;
        }

        room.kicked_players.remove(&target_participant_id);
        if let Err(error) = self
            .storage
            .restore_race_participant(target_participant_id)
            .await
        {
            warn!(%error, target_participant_id, "rejoin restore failed");
            pending.out.send_event(&ServerEvent::RejoinRejected {
                reason: "restore failed".to_owned(),
            });
            return;
        }
        let restored = match self.storage.get_participant(target_participant_id).await {
            Ok(Some(participant)) => participant,
            _ => {
                pending.out.send_event(&ServerEvent::RejoinRejected {
                    reason: "restore failed".to_owned(),
                });
                return;
            }
        };

        let connection_key = restored.identity_key().to_string();
        let superseded = self
            .registry
            .register(
                &connection_key,
                pending.out.clone(),
                Some(race_id),
                Some(target_participant_id),
            )
            .await;
        for handle in &superseded {
            handle.supersede();
        }

        *pending.auth.lock().unwrap() = Some(AuthBinding {
            race_id,
            participant_id: target_participant_id,
            connection_key: connection_key.clone(),
            username: restored.username.clone(),
        });
        room.participants.insert(target_participant_id, restored.clone());
        room.clients.insert(target_participant_id, RoomClient {
            participant_id: target_participant_id,
            conn_id: pending.conn_id,
            out: pending.out.clone(),
            username: restored.username.clone(),
            connection_key,
            is_bot: false,
            is_ready: false,
            last_activity: Instant::now(),
        });

        pending.out.send_event(&ServerEvent::RejoinApproved {
            race: RaceView::from(&room.race),
            participants: room.participant_views(),
            chat_history: room.chat_snapshot(),
        });
        let announcement = ServerEvent::ParticipantJoined {
            participant: ParticipantView::from(&restored),
        };
        room.broadcast_except(target_participant_id, &announcement);
        self.publish_remote(race_id, &announcement);
        info!(race_id, target_participant_id, "rejoin approved");
        drop(room);
        self.store
            .add_race_connection(race_id, target_participant_id)
            .await;
    }

    pub(crate) async fn handle_ready(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
    ) {
        if let Err(code) = self.authorize(ctx, race_id, participant_id) {
            ctx.send_error(code, "not authorized");
            return;
        }
        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };
        let mut room = room.lock().await;
        if let Err(code) = room.require_host(participant_id) {
            ctx.send_error(code, "only the host can start the race");
            return;
        }
        match room.race.status {
            RaceStatus::Waiting => {}
            RaceStatus::Countdown | RaceStatus::Racing => {
                ctx.send_error(ErrorCode::RaceInProgress, "race already started");
                return;
            }
            RaceStatus::Finished | RaceStatus::Abandoned => {
                ctx.send_error(ErrorCode::RaceFinished, "race is over");
                return;
            }
        }
        if room.is_starting {
            ctx.send_error(ErrorCode::RaceStarting, "countdown already starting");
            return;
        }
        if room.connected_humans() < room.required_humans() {
            ctx.send_error(ErrorCode::NotEnoughPlayers, "not enough players to start");
            return;
        }

        room.is_starting = true;
        if let Err(code) = self.start_countdown(&mut room).await {
            room.is_starting = false;
            ctx.send_error(code, "could not start countdown");
        }
    }

    pub(crate) async fn handle_ready_toggle(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        is_ready: Option<bool>,
    ) {
        if let Err(code) = self.authorize(ctx, race_id, participant_id) {
            ctx.send_error(code, "not authorized");
            return;
        }
        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };
        let mut room = room.lock().await;
        let new_state = {
            let Some(client) = room.clients.get_mut(&participant_id) else {
                ctx.send_error(ErrorCode::NotAuthorized, "not in this room");
                return;
            };
            client.is_ready = is_ready.unwrap_or(!client.is_ready);
            client.last_activity = Instant::now();
            client.is_ready
        };
        self.fanout(&room, &ServerEvent::ReadyStateUpdate {
            participant_id,
            is_ready: new_state,
        });
    }

    pub(crate) async fn handle_spectate(self: &Arc<Self>, ctx: &mut SocketContext, race_id: i64) {
        if ctx.spectating == Some(race_id) {
            return;
        }
        if ctx.spectating.is_some() {
            ctx.send_error(ErrorCode::NotAuthorized, "already spectating another race");
            return;
        }
        let per_race = self
            .storage
            .get_active_spectator_count(race_id)
            .await
            .unwrap_or(0);
        if per_race >= SPECTATOR_LIMIT_PER_RACE {
            ctx.send_error(ErrorCode::SpectatorLimitReached, "spectator limit reached");
            return;
        }
        let global = self.storage.get_global_spectator_count().await.unwrap_or(0);
        if global >= GLOBAL_SPECTATOR_LIMIT {
            ctx.send_error(ErrorCode::GlobalSpectatorLimit, "global spectator limit reached");
            return;
        }

        let room = match self.load_room(race_id).await {
            Ok(room) => room,
            Err(code) => {
                ctx.send_error(code, "race unavailable");
                return;
            }
        };
        if let Err(error) = self
            .storage
            .add_race_spectator(race_id, &ctx.session_key)
            .await
        {
            warn!(%error, race_id, "spectator registration failed");
        }
        let mut room = room.lock().await;
        room.spectators.insert(ctx.conn_id, ctx.out.clone());
        ctx.spectating = Some(race_id);
        ctx.send(&ServerEvent::ParticipantsSync {
            participants: room.participant_views(),
        });
        ctx.send(&ServerEvent::ChatHistory {
            messages: room.chat_snapshot(),
        });
    }

    pub(crate) async fn handle_stop_spectate(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
    ) {
        if ctx.spectating != Some(race_id) {
            return;
        }
        ctx.spectating = None;
        if let Some(room) = self.room_if_loaded(race_id) {
            room.lock().await.spectators.remove(&ctx.conn_id);
        }
        let _ = self
            .storage
            .remove_race_spectator(race_id, &ctx.session_key)
            .await;
    }

    /// Socket closed without a graceful `leave`: the participant stays in the
    /// race for possible reconnection; the heartbeat DNFs long absences.
    pub(crate) async fn handle_disconnect(self: &Arc<Self>, ctx: &mut SocketContext) {
        if let Some(race_id) = ctx.spectating.take() {
            if let Some(room) = self.room_if_loaded(race_id) {
                room.lock().await.spectators.remove(&ctx.conn_id);
            }
            let _ = self
                .storage
                .remove_race_spectator(race_id, &ctx.session_key)
                .await;
        }

        let Some(binding) = ctx.binding() else { return };
        ctx.unbind();
        let race_id = binding.race_id;
        let participant_id = binding.participant_id;
        self.registry
            .unregister(&binding.connection_key, ctx.conn_id)
            .await;

        let Some(room) = self.room_if_loaded(race_id) else {
            self.store.remove_race_connection(race_id, participant_id).await;
            return;
        };

        let mut destroy_with: Option<Vec<i64>> = None;
        {
            let mut room = room.lock().await;
            let owned = room
                .clients
                .get(&participant_id)
                .map_or(false, |client| client.conn_id == ctx.conn_id);
            room.pending_rejoins.retain(|_, pending| pending.conn_id != ctx.conn_id);
            if !owned {
                return;
            }
            room.clients.remove(&participant_id);

            let finished = room
                .participants
                .get(&participant_id)
                .map_or(true, |p| p.is_finished);
            if !matches!(room.race.status, RaceStatus::Finished | RaceStatus::Abandoned)
                && !finished
            {
                self.track_disconnected(race_id, participant_id);
            }
            let event = ServerEvent::ParticipantDisconnected { participant_id };
            self.fanout(&room, &event);

            self.after_participant_vacated(&mut room, participant_id).await;

            if room.is_idle()
                && room.race.status == RaceStatus::Waiting
                && !room.is_starting
            {
                let _ = self
                    .storage
                    .update_race_status_atomic(
                        race_id,
                        RaceStatus::Abandoned,
                        RaceStatus::Waiting,
                        None,
                    )
                    .await;
                destroy_with = Some(room.participants.keys().copied().collect());
            }
        }
        if let Some(participant_ids) = destroy_with {
            self.destroy_room(race_id, &participant_ids);
        }
        self.store.remove_race_connection(race_id, participant_id).await;
    }

    /// Host transfer and countdown-quorum upkeep after a participant's
    /// socket left the room, for any reason.
    pub(crate) async fn after_participant_vacated(
        self: &Arc<Self>,
        room: &mut RaceRoom,
        vacated_participant_id: i64,
    ) {
        if room.is_host(vacated_participant_id) {
            if let Some((new_host, username)) = room.transfer_host() {
                let event = ServerEvent::HostChanged {
                    host_participant_id: new_host,
                    host_version: room.host_version,
                    username,
                };
                self.fanout(room, &event);
                let pending: Vec<(i64, String)> = room
                    .pending_rejoins
                    .iter()
                    .map(|(id, pending)| (*id, pending.username.clone()))
                    .collect();
                for (participant_id, username) in pending {
                    room.send_to(new_host, &ServerEvent::RejoinRequest {
                        participant_id,
                        username,
                    });
                }
            }
        }

        if room.race.status == RaceStatus::Countdown
            && room.connected_humans() < room.required_humans()
        {
            self.cancel_countdown(room, "not enough players").await;
        }
    }
}
