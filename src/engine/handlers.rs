use super::{RaceEngine, SocketContext, CHAT_COOLDOWN};
use crate::{
    anticheat::{self, ProgressOutcome},
    messages::{
        numeric_field, sanitize_chat, ChatBroadcast, ErrorCode, KeystrokeEvent, ReplayEntry,
        ServerEvent, MAX_KEYSTROKE_EVENTS,
    },
    race::{RaceStatus, RaceType, DNF_POSITION},
    storage::{CreateParticipant, CreateRace, ProgressSnapshot},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{info, warn};

/// Paragraph extensions: minimum spacing, per-race cap.
const EXTENSION_COOLDOWN: Duration = Duration::from_secs(5);
const MAX_EXTENSIONS: u32 = 5;
/// Timed-race progress claims are clamped to this many chars per second.
const TIMED_MAX_CHARS_PER_SEC: i64 = 15;

impl RaceEngine {
    pub(crate) async fn handle_progress(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        participant_id: i64,
        progress: &serde_json::Value,
        errors: &serde_json::Value,
    ) {
        let Ok(binding) = self.authorize_participant(ctx, participant_id) else {
            ctx.send_error(ErrorCode::NotAuthorized, "not authorized");
            return;
        };
        // Non-numeric and negative values are dropped without a reply.
        let (Some(progress), Some(errors)) = (numeric_field(progress), numeric_field(errors))
        else {
            return;
        };

        let Some(room) = self.room_if_loaded(binding.race_id) else { return };
        let race_id = binding.race_id;
        let mut completion_due = false;
        {
            let mut room = room.lock().await;
            if room.race.status != RaceStatus::Racing || room.is_finishing {
                return;
            }
            if room.disqualified.contains(&participant_id) {
                return;
            }
            if room
                .participants
                .get(&participant_id)
                .map_or(true, |p| p.is_finished)
            {
                return;
            }

            let now = Instant::now();
            let previous = self
                .cache
                .get(participant_id)
                .map(|entry| (entry.progress, entry.last_update));
            let paragraph_len = room.race.paragraph_len();
            let tracker = room.speed.entry(participant_id).or_default();
            match anticheat::validate_progress(previous, progress, errors, paragraph_len, tracker, now)
            {
                ProgressOutcome::Drop => return,
                ProgressOutcome::SpeedViolation { disqualify } => {
                    if disqualify {
                        self.disqualify_participant(&mut room, participant_id).await;
                        completion_due = true;
                    }
                }
                ProgressOutcome::Accept { progress, errors } => {
                    let elapsed = room
                        .race_start
                        .map_or(Duration::from_secs(1), |start| start.elapsed());
                    let (wpm, accuracy) = anticheat::server_metrics(progress, errors, elapsed);
                    let snapshot = ProgressSnapshot { progress, wpm, accuracy, errors };
                    self.cache.upsert(participant_id, snapshot, now);
                    if let Some(participant) = room.participants.get_mut(&participant_id) {
                        participant.progress = progress;
                        participant.wpm = wpm;
                        participant.accuracy = accuracy;
                        participant.errors = errors;
                    }
                    if let Some(client) = room.clients.get_mut(&participant_id) {
                        client.last_activity = now;
                    }
                    self.fanout(&room, &ServerEvent::ProgressUpdate {
                        participant_id,
                        progress,
                        wpm,
                        accuracy,
                        errors,
                    });
                }
            }
        }
        if completion_due {
            self.complete_race_with_lock(race_id, "disqualification").await;
        }
    }

    pub(crate) async fn handle_finish(
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
        let mut completion_due = false;
        {
            let mut room = room.lock().await;
            if room.race.race_type != RaceType::Standard {
                ctx.send_error(ErrorCode::InvalidRaceStatus, "timed races finish on the timer");
                return;
            }
            if room.race.status != RaceStatus::Racing {
                ctx.send_error(ErrorCode::InvalidRaceStatus, "race is not running");
                return;
            }
            if room
                .participants
                .get(&participant_id)
                .map_or(true, |p| p.is_finished)
            {
                return;
            }

            let paragraph_len = room.race.paragraph_len();
            let observed = self
                .cache
                .get(participant_id)
                .map(|entry| entry.progress)
                .or_else(|| room.participants.get(&participant_id).map(|p| p.progress))
                .unwrap_or(0);
            if observed < paragraph_len {
                ctx.send_error(ErrorCode::InvalidPayload, "paragraph not complete");
                return;
            }

            let errors = self
                .cache
                .get(participant_id)
                .map_or(0, |entry| entry.errors);
            let elapsed = room
                .race_start
                .map_or(Duration::from_secs(1), |start| start.elapsed());
            let (wpm, accuracy) = anticheat::server_metrics(paragraph_len, errors, elapsed);
            if wpm > anticheat::MAX_FINISH_WPM {
                self.disqualify_participant(&mut room, participant_id).await;
                completion_due = true;
            } else {
                let snapshot = ProgressSnapshot {
                    progress: paragraph_len,
                    wpm,
                    accuracy,
                    errors,
                };
                if let Err(error) = self
                    .storage
                    .update_participant_progress(participant_id, snapshot)
                    .await
                {
                    warn!(%error, participant_id, "final snapshot persist failed");
                }
                match self.storage.finish_participant(participant_id, race_id).await {
                    Ok((position, is_new_finish)) => {
                        if let Some(participant) = room.participants.get_mut(&participant_id) {
                            participant.progress = paragraph_len;
                            participant.wpm = wpm;
                            participant.accuracy = accuracy;
                            participant.errors = errors;
                            participant.is_finished = true;
                            participant.finish_position = Some(position);
                        }
                        if is_new_finish {
                            info!(race_id, participant_id, position, "participant finished");
                            self.fanout(&room, &ServerEvent::ParticipantFinished {
                                participant_id,
                                position,
                            });
                        }
                        completion_due = true;
                    }
                    Err(error) => {
                        warn!(%error, participant_id, "finish persist failed");
                        ctx.send_error(ErrorCode::RaceUnavailable, "could not record finish");
                        return;
                    }
                }
            }
        }
        if completion_due {
            self.complete_race_with_lock(race_id, "finish").await;
        }
    }

    pub(crate) async fn handle_timed_finish(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        progress: &serde_json::Value,
        errors: &serde_json::Value,
    ) {
        if let Err(code) = self.authorize(ctx, race_id, participant_id) {
            ctx.send_error(code, "not authorized");
            return;
        }
        let (Some(progress), Some(errors)) = (numeric_field(progress), numeric_field(errors))
        else {
            ctx.send_error(ErrorCode::InvalidPayload, "invalid progress values");
            return;
        };
        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };
        let mut all_finished = false;
        {
            let mut room = room.lock().await;
            if room.race.race_type != RaceType::Timed
                || room.race.status != RaceStatus::Racing
            {
                ctx.send_error(ErrorCode::InvalidRaceStatus, "race is not running");
                return;
            }
            if room
                .participants
                .get(&participant_id)
                .map_or(true, |p| p.is_finished)
            {
                return;
            }

            let elapsed = room
                .race_start
                .map_or(Duration::from_secs(1), |start| start.elapsed());
            // Clients report at their own clock edge; clamp the claim to a
            // plausible ceiling for the elapsed wall time.
            let ceiling = (elapsed.as_secs_f64() * TIMED_MAX_CHARS_PER_SEC as f64).ceil() as i64;
            let progress = progress
                .min(ceiling)
                .min(room.race.paragraph_len());
            let errors = errors.min(progress);
            let (wpm, accuracy) = anticheat::server_metrics(progress, errors, elapsed);

            let snapshot = ProgressSnapshot { progress, wpm, accuracy, errors };
            if let Err(error) = self
                .storage
                .update_participant_progress(participant_id, snapshot)
                .await
            {
                warn!(%error, participant_id, "timed finish persist failed");
            }
            if let Err(error) = self.storage.mark_participant_finished(participant_id).await {
                warn!(%error, participant_id, "timed finish mark failed");
                ctx.send_error(ErrorCode::RaceUnavailable, "could not record finish");
                return;
            }
            if let Some(participant) = room.participants.get_mut(&participant_id) {
                participant.progress = progress;
                participant.wpm = wpm;
                participant.accuracy = accuracy;
                participant.errors = errors;
                participant.is_finished = true;
            }
            all_finished = room.participants.values().all(|p| p.is_finished);
        }
        if all_finished {
            self.finalize_timed_race(race_id, "timed_finish").await;
        }
    }

    pub(crate) async fn handle_leave(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        _is_racing: Option<bool>,
        progress: Option<serde_json::Value>,
        errors: Option<serde_json::Value>,
    ) {
        if let Err(code) = self.authorize(ctx, race_id, participant_id) {
            ctx.send_error(code, "not authorized");
            return;
        }
        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };

        let mut completion_due = false;
        let mut destroy_with: Option<Vec<i64>> = None;
        {
            let mut room = room.lock().await;
            room.clients.remove(&participant_id);

            let status = room.race.status;
            let finished = room
                .participants
                .get(&participant_id)
                .map_or(true, |p| p.is_finished);
            let username = room
                .participants
                .get(&participant_id)
                .map_or_else(String::new, |p| p.username.clone());

            if matches!(status, RaceStatus::Racing | RaceStatus::Countdown) && !finished {
                // Mid-race exit is a DNF at last-known progress.
                let last = self.cache.get(participant_id);
                let claimed_progress = progress.as_ref().and_then(numeric_field);
                let claimed_errors = errors.as_ref().and_then(numeric_field);
                let final_progress = claimed_progress
                    .or(last.map(|entry| entry.progress))
                    .unwrap_or(0)
                    .min(room.race.paragraph_len());
                let final_errors = claimed_errors
                    .or(last.map(|entry| entry.errors))
                    .unwrap_or(0)
                    .min(final_progress);
                let elapsed = room
                    .race_start
                    .map_or(Duration::from_secs(1), |start| start.elapsed());
                let (wpm, accuracy) =
                    anticheat::server_metrics(final_progress, final_errors, elapsed);
                let snapshot = ProgressSnapshot {
                    progress: final_progress,
                    wpm,
                    accuracy,
                    errors: final_errors,
                };
                if let Err(error) = self
                    .storage
                    .update_participant_progress(participant_id, snapshot)
                    .await
                {
                    warn!(%error, participant_id, "leave snapshot persist failed");
                }
                if let Err(error) = self
                    .storage
                    .update_participant_finish_position(participant_id, DNF_POSITION)
                    .await
                {
                    warn!(%error, participant_id, "leave DNF persist failed");
                }
                if let Some(participant) = room.participants.get_mut(&participant_id) {
                    participant.is_finished = true;
                    participant.finish_position = Some(DNF_POSITION);
                }
                self.fanout(&room, &ServerEvent::ParticipantDnf { participant_id });
                completion_due = status == RaceStatus::Racing;
            } else if !finished || status == RaceStatus::Waiting {
                if let Err(error) = self.storage.delete_race_participant(participant_id).await {
                    warn!(%error, participant_id, "leave soft delete failed");
                }
                room.participants.remove(&participant_id);
                self.fanout(&room, &ServerEvent::ParticipantLeft {
                    participant_id,
                    username,
                });
            } else {
                self.fanout(&room, &ServerEvent::ParticipantLeft {
                    participant_id,
                    username,
                });
            }

            self.after_participant_vacated(&mut room, participant_id).await;

            if room.is_idle() && room.race.status == RaceStatus::Waiting && !room.is_starting {
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

        if let Some(binding) = ctx.binding() {
            self.registry
                .unregister(&binding.connection_key, ctx.conn_id)
                .await;
        }
        ctx.unbind();
        self.cache.remove(participant_id);
        self.store.remove_race_connection(race_id, participant_id).await;

        if completion_due {
            self.complete_race_with_lock(race_id, "leave").await;
        }
        if let Some(participant_ids) = destroy_with {
            self.destroy_room(race_id, &participant_ids);
        }
    }

    pub(crate) async fn handle_submit_keystrokes(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        keystrokes: Vec<KeystrokeEvent>,
        client_wpm: Option<f64>,
    ) {
        if let Err(code) = self.authorize(ctx, race_id, participant_id) {
            ctx.send_error(code, "not authorized");
            return;
        }
        if keystrokes.is_empty() || keystrokes.len() > MAX_KEYSTROKE_EVENTS {
            ctx.send_error(ErrorCode::InvalidPayload, "invalid keystroke batch");
            return;
        }
        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };
        let mut completion_due = false;
        {
            let mut room = room.lock().await;
            if !matches!(room.race.status, RaceStatus::Racing | RaceStatus::Finished) {
                ctx.send_error(ErrorCode::InvalidRaceStatus, "race is not running");
                return;
            }
            let Some(verdict) =
                anticheat::validate_keystrokes(&room.race.paragraph_content, &keystrokes, client_wpm)
            else {
                ctx.send_error(ErrorCode::InvalidPayload, "no derivable keystrokes");
                return;
            };

            let payload = serde_json::to_string(&keystrokes).unwrap_or_default();
            if let Err(error) = self
                .storage
                .create_keystroke_log(
                    race_id,
                    participant_id,
                    &payload,
                    client_wpm.map(|wpm| wpm.round() as i64),
                    verdict.server_calculated_wpm,
                    verdict.is_flagged,
                )
                .await
            {
                warn!(%error, participant_id, "keystroke log persist failed");
            }

            if verdict.is_flagged && !verdict.is_valid {
                info!(
                    race_id,
                    participant_id,
                    reasons = ?verdict.flag_reasons,
                    "keystroke evidence failed validation"
                );
                if room.race.status == RaceStatus::Racing {
                    self.disqualify_participant(&mut room, participant_id).await;
                    completion_due = true;
                }
            }
        }
        if completion_due {
            self.complete_race_with_lock(race_id, "keystroke_validation").await;
        }
    }

    pub(crate) async fn handle_chat(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        content: String,
    ) {
        let Ok(binding) = self.authorize(ctx, race_id, participant_id) else {
            ctx.send_error(ErrorCode::NotAuthorized, "not authorized");
            return;
        };

        let now = Instant::now();
        {
            let mut cooldowns = self.chat_cooldowns.lock().unwrap();
            if let Some(last) = cooldowns.get(&participant_id) {
                let since = now.saturating_duration_since(*last);
                if since < CHAT_COOLDOWN {
                    let retry_after = (CHAT_COOLDOWN - since).as_millis() as u64;
                    drop(cooldowns);
                    ctx.send(&ServerEvent::error_with_retry(
                        ErrorCode::ChatRateLimited,
                        "chat messages are limited",
                        retry_after,
                    ));
                    return;
                }
            }
            cooldowns.insert(participant_id, now);
        }

        let content = sanitize_chat(&content);
        if content.is_empty() {
            ctx.send_error(ErrorCode::InvalidPayload, "empty message");
            return;
        }

        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };
        let mut room = room.lock().await;
        if !room.clients.contains_key(&participant_id) {
            ctx.send_error(ErrorCode::NotAuthorized, "not in this room");
            return;
        }
        if let Err(error) = self
            .storage
            .create_race_chat_message(race_id, participant_id, &binding.username, &content)
            .await
        {
            warn!(%error, race_id, "chat persist failed");
        }
        let timestamp = Utc::now().timestamp_millis();
        room.push_chat(ChatBroadcast {
            participant_id,
            username: binding.username.clone(),
            content: content.clone(),
            timestamp,
        });
        if let Some(client) = room.clients.get_mut(&participant_id) {
            client.last_activity = Instant::now();
        }
        self.fanout(&room, &ServerEvent::ChatMessage {
            participant_id,
            username: binding.username,
            content,
            timestamp,
        });
    }

    pub(crate) async fn handle_kick(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        target_participant_id: i64,
    ) {
        if let Err(code) = self.authorize(ctx, race_id, participant_id) {
            ctx.send_error(code, "not authorized");
            return;
        }
        if target_participant_id == participant_id {
            ctx.send_error(ErrorCode::CannotKickSelf, "cannot kick yourself");
            return;
        }
        let Some(room) = self.room_if_loaded(race_id) else {
            ctx.send_error(ErrorCode::RoomNotFound, "room not found");
            return;
        };
        let mut room = room.lock().await;
        if let Err(code) = room.require_host(participant_id) {
            ctx.send_error(code, "only the host can kick");
            return;
        }
        if !matches!(room.race.status, RaceStatus::Waiting | RaceStatus::Countdown) {
            ctx.send_error(ErrorCode::RaceInProgress, "cannot kick once racing");
            return;
        }
        if !room.participants.contains_key(&target_participant_id) {
            ctx.send_error(ErrorCode::PlayerNotFound, "player not found");
            return;
        }

        room.kicked_players.insert(target_participant_id);
        if let Some(client) = room.clients.remove(&target_participant_id) {
            client
                .out
                .send_event(&ServerEvent::error(ErrorCode::Kicked, "kicked by host"));
        }
        if let Err(error) = self
            .storage
            .delete_race_participant(target_participant_id)
            .await
        {
            warn!(%error, target_participant_id, "kick soft delete failed");
        }
        room.participants.remove(&target_participant_id);
        self.cache.remove(target_participant_id);
        info!(race_id, target_participant_id, "player kicked");

        let event = ServerEvent::PlayerKicked {
            participant_id: target_participant_id,
            participants: room.participant_views(),
        };
        self.fanout(&room, &event);

        if room.race.status == RaceStatus::Countdown
            && room.connected_humans() < room.required_humans()
        {
            self.cancel_countdown(&mut room, "not enough players").await;
        }
    }

    pub(crate) async fn handle_lock_room(
        self: &Arc<Self>,
        ctx: &mut SocketContext,
        race_id: i64,
        participant_id: i64,
        locked: bool,
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
            ctx.send_error(code, "only the host can lock the room");
            return;
        }
        if room.race.status != RaceStatus::Waiting {
            ctx.send_error(ErrorCode::InvalidRaceStatus, "room can only be locked while waiting");
            return;
        }
        room.is_locked = locked;
        self.fanout(&room, &ServerEvent::RoomLockChanged { locked });
    }

    pub(crate) async fn handle_extend_paragraph(
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
        if room.race.status != RaceStatus::Racing {
            ctx.send_error(ErrorCode::InvalidRaceStatus, "race is not running");
            return;
        }
        if room.participants.values().any(|p| p.is_finished) {
            ctx.send_error(ErrorCode::InvalidRaceStatus, "someone already finished");
            return;
        }
        if room.extension.pending {
            ctx.send_error(ErrorCode::RateLimited, "extension already in flight");
            return;
        }
        if room.extension.count >= MAX_EXTENSIONS {
            ctx.send_error(ErrorCode::RateLimited, "extension limit reached");
            return;
        }
        if let Some(last) = room.extension.last_extended_at {
            let since = last.elapsed();
            if since < EXTENSION_COOLDOWN {
                let retry_after = (EXTENSION_COOLDOWN - since).as_millis() as u64;
                ctx.send(&ServerEvent::error_with_retry(
                    ErrorCode::RateLimited,
                    "extension cooldown",
                    retry_after,
                ));
                return;
            }
        }

        room.extension.pending = true;
        let block = match self.storage.get_random_paragraph().await {
            Ok((_, content)) => format!(" {content}"),
            Err(error) => {
                warn!(%error, race_id, "paragraph fetch failed");
                room.extension.pending = false;
                ctx.send_error(ErrorCode::RaceUnavailable, "no content available");
                return;
            }
        };
        if let Err(error) = self.storage.extend_race_paragraph(race_id, &block).await {
            warn!(%error, race_id, "paragraph extension persist failed");
            room.extension.pending = false;
            ctx.send_error(ErrorCode::RaceUnavailable, "could not extend paragraph");
            return;
        }

        let previous_length = room.race.paragraph_len();
        room.race.paragraph_content.push_str(&block);
        let new_total_length = room.race.paragraph_len();
        room.extension.count += 1;
        room.extension.last_extended_at = Some(Instant::now());
        room.extension.pending = false;
        info!(race_id, previous_length, new_total_length, "paragraph extended");

        self.fanout(&room, &ServerEvent::ParagraphExtended {
            additional_content: block,
            previous_length,
            new_total_length,
        });
    }

    pub(crate) async fn handle_rematch(
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
        let room = room.lock().await;
        if room.race.status != RaceStatus::Finished {
            ctx.send_error(ErrorCode::RematchFailed, "race is not finished");
            return;
        }
        // A rematch broadcast with nobody left to accept it is noise.
        if room.connected_humans() < 2 {
            ctx.send_error(ErrorCode::InsufficientPlayers, "not enough players for a rematch");
            return;
        }

        let paragraph = match self.storage.get_random_paragraph().await {
            Ok((id, content)) => (Some(id), content),
            Err(_) => (room.race.paragraph_id, room.race.paragraph_content.clone()),
        };
        let successor = self
            .storage
            .create_race(CreateRace {
                paragraph_content: paragraph.1,
                paragraph_id: paragraph.0,
                max_players: room.race.max_players,
                is_private: room.race.is_private,
                race_type: room.race.race_type,
                time_limit_seconds: room.race.time_limit_seconds,
            })
            .await;
        match successor {
            Ok(new_race) => {
                info!(race_id, new_race_id = new_race.id, "rematch created");
                self.fanout(&room, &ServerEvent::RematchAvailable {
                    race_id: new_race.id,
                    room_code: new_race.room_code,
                });
            }
            Err(error) => {
                warn!(%error, race_id, "rematch creation failed");
                ctx.send_error(ErrorCode::RematchFailed, "could not create rematch");
            }
        }
    }

    pub(crate) async fn handle_get_replay(self: &Arc<Self>, ctx: &mut SocketContext, race_id: i64) {
        let race = match self.storage.get_race(race_id).await {
            Ok(Some(race)) => race,
            Ok(None) => {
                ctx.send_error(ErrorCode::RoomNotFound, "race not found");
                return;
            }
            Err(_) => {
                ctx.send_error(ErrorCode::RaceUnavailable, "race unavailable");
                return;
            }
        };
        if race.status != RaceStatus::Finished {
            ctx.send_error(ErrorCode::InvalidRaceStatus, "race is not finished");
            return;
        }
        let participated = ctx
            .binding()
            .map_or(false, |binding| binding.race_id == race_id);
        if race.is_private && !participated {
            ctx.send_error(ErrorCode::NotAuthorized, "replay is private");
            return;
        }

        match self.storage.get_race_replays(race_id).await {
            Ok(rows) => {
                let replays = rows
                    .into_iter()
                    .map(|(participant_id, data)| ReplayEntry { participant_id, data })
                    .collect();
                ctx.send(&ServerEvent::ReplayData { race_id, replays });
            }
            Err(error) => {
                warn!(%error, race_id, "replay fetch failed");
                ctx.send_error(ErrorCode::RaceUnavailable, "replay unavailable");
            }
        }
    }

    pub(crate) async fn handle_get_rating(self: &Arc<Self>, ctx: &mut SocketContext, user_id: String) {
        match self.storage.get_or_create_user_rating(&user_id).await {
            Ok(rating) => ctx.send(&ServerEvent::RatingData {
                user_id: rating.user_id,
                rating: rating.rating,
                races_completed: rating.races_completed,
            }),
            Err(error) => {
                warn!(%error, user_id, "rating lookup failed");
                ctx.send_error(ErrorCode::RaceUnavailable, "rating unavailable");
            }
        }
    }

    /// Participant creation for successor races and tests; rides the same
    /// storage call the HTTP layer uses.
    pub async fn create_participant_for_race(
        &self,
        race_id: i64,
        username: &str,
        user_id: Option<String>,
        is_bot: bool,
    ) -> Result<crate::race::Participant, crate::storage::StorageError> {
        let guest_name = if user_id.is_none() && !is_bot {
            Some(format!("g-{}", uuid::Uuid::new_v4()))
        } else {
            None
        };
        self.storage
            .create_participant(CreateParticipant {
                race_id,
                username: username.to_owned(),
                user_id,
                guest_name,
                avatar_color: None,
                is_bot,
            })
            .await
    }
}
