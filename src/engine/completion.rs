use super::RaceEngine;
use crate::{
    anticheat, certificates,
    messages::{CertificateSummary, ErrorCode, FinalResult, RatingSummary, ServerEvent, CLOSE_NORMAL},
    race::{Participant, RaceStatus, RaceType, DNF_POSITION},
    ratings,
    room::{RaceRoom, ROOM_DESTROY_DELAY},
    storage::ProgressSnapshot,
    timers::TimerKind,
};
use chrono::Utc;
use std::{cmp::Ordering, collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{info, warn};

/// Shared-store expiry TTL buffer past the race time limit.
const TIMED_EXPIRY_BUFFER_SECS: i64 = 60;

impl RaceEngine {
    /// Transitions waiting → countdown and spawns the versioned ticker. The
    /// caller holds the room lock and has already verified host and quorum.
    pub(crate) async fn start_countdown(
        self: &Arc<Self>,
        room: &mut RaceRoom,
    ) -> Result<(), ErrorCode> {
        let race_id = room.race_id();
        let seconds = self.countdown_seconds_for(room.race.is_private).max(1);

        let moved = self
            .storage
            .update_race_status_atomic(race_id, RaceStatus::Countdown, RaceStatus::Waiting, None)
            .await
            .map_err(|_| ErrorCode::RaceUnavailable)?;
        if !moved {
            return Err(ErrorCode::RaceStartConflict);
        }
        room.race.status = RaceStatus::Countdown;

        let version = self.timers.register(race_id, TimerKind::Countdown);
        info!(race_id, seconds, "countdown started");
        self.fanout(room, &ServerEvent::CountdownStart {
            countdown: seconds,
            participants: room.participant_views(),
        });

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run_countdown(race_id, version, seconds).await;
        });
        self.timers.attach(race_id, TimerKind::Countdown, version, handle);
        Ok(())
    }

    async fn run_countdown(self: Arc<Self>, race_id: i64, version: u64, seconds: u64) {
        let mut remaining = seconds;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !self.timers.is_current(race_id, version) {
                return;
            }
            remaining -= 1;
            if remaining == 0 {
                break;
            }
            let Some(room) = self.room_if_loaded(race_id) else { return };
            let room = room.lock().await;
            self.fanout(&room, &ServerEvent::Countdown { countdown: remaining });
        }
        self.begin_race(race_id, version).await;
    }

    /// Countdown reached zero: commit the racing transition, then announce.
    /// `race_start` is broadcast only after `started_at` is durable.
    async fn begin_race(self: &Arc<Self>, race_id: i64, version: u64) {
        if !self.timers.is_current(race_id, version) {
            return;
        }
        let started_at = Utc::now();
        let moved = self
            .storage
            .update_race_status_atomic(
                race_id,
                RaceStatus::Racing,
                RaceStatus::Countdown,
                Some(started_at),
            )
            .await;
        let Some(room) = self.room_if_loaded(race_id) else { return };

        match moved {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                // Someone else moved the race on; resync and stand down.
                let mut room = room.lock().await;
                room.is_starting = false;
                if let Ok(Some(race)) = self.storage.get_race(race_id).await {
                    room.race = race;
                }
                self.fanout(&room, &ServerEvent::error(
                    ErrorCode::RaceStartConflict,
                    "race state changed during countdown",
                ));
                return;
            }
        }

        let (bot_ids, timed_limit) = {
            let mut room = room.lock().await;
            room.race.status = RaceStatus::Racing;
            room.race.started_at = Some(started_at);
            room.race_start = Some(Instant::now());
            room.is_starting = false;
            info!(race_id, "race started");
            self.fanout(&room, &ServerEvent::RaceStart {
                server_timestamp: started_at.timestamp_millis(),
            });
            let bot_ids: Vec<i64> = room
                .participants
                .values()
                .filter(|p| p.is_bot)
                .map(|p| p.id)
                .collect();
            let timed_limit = (room.race.race_type == RaceType::Timed)
                .then(|| room.race.time_limit_seconds.unwrap_or(30).max(1));
            (bot_ids, timed_limit)
        };

        self.bots.start_race_bots(self, race_id, bot_ids);

        if let Some(limit_secs) = timed_limit {
            let timer_version = self.timers.register(race_id, TimerKind::TimedRace);
            let engine = Arc::clone(self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(limit_secs as u64 + 1)).await;
                if engine.timers.is_current(race_id, timer_version) {
                    engine.force_finish_timed_race(race_id).await;
                }
            });
            self.timers
                .attach(race_id, TimerKind::TimedRace, timer_version, handle);
            let expiry_ms = started_at.timestamp_millis() + limit_secs * 1000;
            self.store
                .set_timed_race_expiry(
                    race_id,
                    expiry_ms,
                    (limit_secs + TIMED_EXPIRY_BUFFER_SECS) as usize,
                )
                .await;
        }
    }

    /// Reverts countdown → waiting. Called with the room lock held, under
    /// quorum loss or kick fallout.
    pub(crate) async fn cancel_countdown(self: &Arc<Self>, room: &mut RaceRoom, reason: &str) {
        if room.race.status != RaceStatus::Countdown {
            return;
        }
        let race_id = room.race_id();
        self.timers.cancel(race_id, TimerKind::Countdown);
        if let Err(error) = self
            .storage
            .update_race_status_atomic(race_id, RaceStatus::Waiting, RaceStatus::Countdown, None)
            .await
        {
            warn!(%error, race_id, "countdown revert failed");
        }
        room.race.status = RaceStatus::Waiting;
        room.is_starting = false;
        info!(race_id, reason, "countdown cancelled");
        self.fanout(room, &ServerEvent::CountdownCancelled {
            reason: reason.to_owned(),
        });
    }

    /// Exactly-once completion entry point. The per-process lock stops
    /// re-entry; `complete_race_atomic` is the fleet-wide source of truth.
    pub async fn complete_race_with_lock(self: &Arc<Self>, race_id: i64, trigger: &str) -> bool {
        {
            let mut locks = self.completion_locks.lock().unwrap();
            if !locks.insert(race_id) {
                return false;
            }
        }
        let completed = self.run_completion(race_id, trigger).await;
        self.completion_locks.lock().unwrap().remove(&race_id);
        completed
    }

    async fn run_completion(self: &Arc<Self>, race_id: i64, trigger: &str) -> bool {
        let (completed, race) = match self.storage.complete_race_atomic(race_id).await {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, race_id, "completion check failed");
                return false;
            }
        };
        if !completed {
            return false;
        }
        let Some(race) = race else { return false };
        info!(race_id, trigger, "race completed");

        let room_handle = self.room_if_loaded(race_id);
        if let Some(room) = &room_handle {
            let mut room = room.lock().await;
            room.is_finishing = true;
            room.race = race.clone();
        }
        self.timers.clear_race(race_id);
        self.bots.stop_race(race_id);

        let mut finishers = self
            .storage
            .get_race_participants(race_id)
            .await
            .unwrap_or_default();
        finishers.sort_by_key(|p| (p.finish_position.unwrap_or(DNF_POSITION), p.id));

        let rating_changes = match ratings::process_race_ratings(&self.storage, &finishers).await {
            Ok(changes) => changes,
            Err(error) => {
                warn!(%error, race_id, "rating processing failed, sending plain results");
                HashMap::new()
            }
        };

        let duration_seconds = race
            .started_at
            .zip(race.finished_at)
            .map_or(0, |(start, finish)| (finish - start).num_seconds().max(0));
        let issued = match certificates::issue_certificates(
            &self.storage,
            &self.keys,
            &race,
            &finishers,
            duration_seconds,
        )
        .await
        {
            Ok(issued) => issued,
            Err(error) => {
                warn!(%error, race_id, "certificate issuance failed");
                HashMap::new()
            }
        };

        self.persist_replays(race_id, &finishers).await;

        let results: Vec<FinalResult> = finishers
            .iter()
            .map(|p| FinalResult {
                participant_id: p.id,
                username: p.username.clone(),
                is_bot: p.is_bot,
                position: p.finish_position.unwrap_or(DNF_POSITION),
                wpm: p.wpm,
                accuracy: p.accuracy,
                progress: p.progress,
                errors: p.errors,
                rating: p
                    .user_id
                    .as_deref()
                    .and_then(|user_id| rating_changes.get(user_id))
                    .map(|change| RatingSummary {
                        rating: change.after,
                        change: change.delta(),
                    }),
            })
            .collect();
        let certificate_map: HashMap<i64, CertificateSummary> = issued
            .iter()
            .map(|(participant_id, cert)| {
                (*participant_id, CertificateSummary {
                    verification_id: cert.verification_id.clone(),
                    signature: cert.signature.clone(),
                })
            })
            .collect();

        let finished_event = ServerEvent::RaceFinished {
            results,
            certificates: certificate_map.clone(),
        };
        let certificates_event = ServerEvent::RaceCertificates {
            certificates: certificate_map,
        };
        if let Some(room) = &room_handle {
            let room = room.lock().await;
            room.broadcast(&finished_event);
            room.broadcast(&certificates_event);
        }
        self.publish_remote(race_id, &finished_event);
        self.publish_remote(race_id, &certificates_event);
        self.record_race_completed();
        self.store.clear_timed_race_expiry(race_id).await;

        // Room teardown after the grace period, unless the timers moved on.
        let version_snapshot = self.timers.current_version(race_id);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ROOM_DESTROY_DELAY).await;
            if engine.timers.current_version(race_id) != version_snapshot {
                return;
            }
            let participant_ids: Vec<i64> = match engine.room_if_loaded(race_id) {
                Some(room) => room.lock().await.participants.keys().copied().collect(),
                None => Vec::new(),
            };
            engine.destroy_room(race_id, &participant_ids);
        });
        true
    }

    async fn persist_replays(&self, race_id: i64, finishers: &[Participant]) {
        for participant in finishers {
            if participant.is_bot || participant.finish_position == Some(DNF_POSITION) {
                continue;
            }
            let strokes = match self
                .storage
                .get_race_keystrokes(race_id, participant.id)
                .await
            {
                Ok(strokes) if !strokes.is_empty() => strokes,
                _ => continue,
            };
            let data = format!("[{}]", strokes.join(","));
            if let Err(error) = self
                .storage
                .create_race_replay(race_id, participant.id, &data)
                .await
            {
                warn!(%error, participant_id = participant.id, "replay persist failed");
            }
        }
    }

    /// Ranking for timed races: fastest first, ties share a position, the
    /// next distinct result resumes at tie start + tie size.
    pub(crate) fn rank_timed(participants: &[Participant]) -> Vec<(i64, i64)> {
        let mut ranked: Vec<&Participant> = participants
            .iter()
            .filter(|p| p.finish_position != Some(DNF_POSITION) && !p.deleted)
            .collect();
        ranked.sort_by(|a, b| {
            b.wpm
                .cmp(&a.wpm)
                .then(b.accuracy.partial_cmp(&a.accuracy).unwrap_or(Ordering::Equal))
                .then(b.progress.cmp(&a.progress))
                .then(a.id.cmp(&b.id))
        });

        let mut rankings = Vec::with_capacity(ranked.len());
        let mut position = 1;
        for (index, participant) in ranked.iter().enumerate() {
            if index > 0 {
                let previous = ranked[index - 1];
                let tied = participant.wpm == previous.wpm
                    && participant.accuracy == previous.accuracy
                    && participant.progress == previous.progress;
                if !tied {
                    position = index as i64 + 1;
                }
            }
            rankings.push((participant.id, position));
        }
        rankings
    }

    /// Applies the timed ranking and runs completion.
    pub(crate) async fn finalize_timed_race(self: &Arc<Self>, race_id: i64, trigger: &str) {
        if let Some(room) = self.room_if_loaded(race_id) {
            let mut room = room.lock().await;
            let participants: Vec<Participant> = room.participants.values().cloned().collect();
            let rankings = Self::rank_timed(&participants);
            if let Err(error) = self
                .storage
                .assign_timed_race_positions_atomic(&rankings)
                .await
            {
                warn!(%error, race_id, "timed position assignment failed");
                return;
            }
            for (participant_id, position) in &rankings {
                if let Some(participant) = room.participants.get_mut(participant_id) {
                    participant.is_finished = true;
                    participant.finish_position = Some(*position);
                }
            }
        }
        self.complete_race_with_lock(race_id, trigger).await;
    }

    /// Server-side expiry of a timed race: snapshot every unfinished
    /// participant at the time limit, rank, complete.
    pub(crate) async fn force_finish_timed_race(self: &Arc<Self>, race_id: i64) {
        let Ok(room) = self.load_room(race_id).await else { return };
        {
            let mut room = room.lock().await;
            if room.race.status != RaceStatus::Racing {
                return;
            }
            info!(race_id, "timed race expired, force finishing");
            let limit = Duration::from_secs(
                room.race.time_limit_seconds.unwrap_or(30).max(1) as u64,
            );
            let unfinished: Vec<i64> = room
                .participants
                .values()
                .filter(|p| !p.is_finished)
                .map(|p| p.id)
                .collect();
            for participant_id in unfinished {
                let (progress, errors) = self.cache.get(participant_id).map_or_else(
                    || {
                        room.participants
                            .get(&participant_id)
                            .map_or((0, 0), |p| (p.progress, p.errors))
                    },
                    |entry| (entry.progress, entry.errors),
                );
                let progress = progress.min(room.race.paragraph_len());
                let errors = errors.min(progress);
                let (wpm, accuracy) = anticheat::server_metrics(progress, errors, limit);
                let snapshot = ProgressSnapshot { progress, wpm, accuracy, errors };
                if let Err(error) = self
                    .storage
                    .update_participant_progress(participant_id, snapshot)
                    .await
                {
                    warn!(%error, participant_id, "force finish snapshot failed");
                }
                if let Err(error) = self.storage.mark_participant_finished(participant_id).await {
                    warn!(%error, participant_id, "force finish mark failed");
                }
                if let Some(participant) = room.participants.get_mut(&participant_id) {
                    participant.progress = progress;
                    participant.errors = errors;
                    participant.wpm = wpm;
                    participant.accuracy = accuracy;
                    participant.is_finished = true;
                }
            }
        }
        self.finalize_timed_race(race_id, "timer").await;
    }

    /// Startup recovery: every persisted racing timed race either resumes
    /// its timer or is force-finished, depending on the stored expiry.
    pub async fn restore_timed_races(self: &Arc<Self>) {
        let races = match self.storage.get_active_timed_races().await {
            Ok(races) => races,
            Err(error) => {
                warn!(%error, "timed race recovery scan failed");
                return;
            }
        };
        let now_ms = Utc::now().timestamp_millis();

        for race in races {
            let race_id = race.id;
            let limit_secs = race.time_limit_seconds.unwrap_or(30).max(1);
            let stored_expiry = self.store.get_timed_race_expiry(race_id).await;
            let deadline_ms = stored_expiry.or_else(|| {
                race.started_at
                    .map(|started| started.timestamp_millis() + limit_secs * 1000)
            });

            let Some(deadline_ms) = deadline_ms else {
                // Racing with no start time is unrecoverable; close it out.
                self.force_finish_timed_race(race_id).await;
                continue;
            };
            let stale_ms = race
                .started_at
                .map(|started| {
                    started.timestamp_millis() + (limit_secs + TIMED_EXPIRY_BUFFER_SECS) * 1000
                })
                .unwrap_or(deadline_ms);

            if deadline_ms <= now_ms || (stored_expiry.is_none() && stale_ms <= now_ms) {
                self.force_finish_timed_race(race_id).await;
                continue;
            }

            // Reconstruct a clientless room and rearm the timer.
            if self.load_room(race_id).await.is_err() {
                continue;
            }
            if let Some(room) = self.room_if_loaded(race_id) {
                let mut room = room.lock().await;
                if let Some(started_at) = room.race.started_at {
                    let elapsed_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
                    room.race_start =
                        Some(Instant::now() - Duration::from_millis(elapsed_ms));
                }
            }
            let remaining = Duration::from_millis((deadline_ms - now_ms) as u64);
            info!(race_id, remaining_secs = remaining.as_secs(), "restored timed race timer");
            let version = self.timers.register(race_id, TimerKind::TimedRace);
            let engine = Arc::clone(self);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                if engine.timers.is_current(race_id, version) {
                    engine.force_finish_timed_race(race_id).await;
                }
            });
            self.timers.attach(race_id, TimerKind::TimedRace, version, handle);
        }
    }

    /// Graceful shutdown: notify, close with 1000, force-complete racing
    /// races, and flush the progress cache.
    pub async fn shutdown(self: &Arc<Self>) {
        self.mark_shutting_down();
        let rooms: Vec<(i64, Arc<tokio::sync::Mutex<RaceRoom>>)> = self
            .rooms
            .lock()
            .unwrap()
            .iter()
            .map(|(race_id, room)| (*race_id, Arc::clone(room)))
            .collect();

        for (race_id, room) in rooms {
            let (status, race_type, unfinished) = {
                let room = room.lock().await;
                room.broadcast(&ServerEvent::ServerShutdown);
                for client in room.clients.values() {
                    client.out.close(CLOSE_NORMAL, "server shutdown");
                }
                for spectator in room.spectators.values() {
                    spectator.close(CLOSE_NORMAL, "server shutdown");
                }
                let unfinished: Vec<i64> = room
                    .participants
                    .values()
                    .filter(|p| !p.is_finished)
                    .map(|p| p.id)
                    .collect();
                (room.race.status, room.race.race_type, unfinished)
            };

            if status != RaceStatus::Racing {
                continue;
            }
            if race_type == RaceType::Timed {
                self.force_finish_timed_race(race_id).await;
            } else {
                for participant_id in unfinished {
                    if let Err(error) = self
                        .storage
                        .update_participant_finish_position(participant_id, DNF_POSITION)
                        .await
                    {
                        warn!(%error, participant_id, "shutdown DNF failed");
                    }
                }
                {
                    let mut room = room.lock().await;
                    for participant in room.participants.values_mut() {
                        if !participant.is_finished {
                            participant.is_finished = true;
                            participant.finish_position = Some(DNF_POSITION);
                        }
                    }
                }
                self.complete_race_with_lock(race_id, "shutdown").await;
            }
        }

        self.bots.stop_all();
        crate::progress::flush_once(&self.cache, &self.storage, &self.db_health).await;
        info!("engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Secret;

    fn participant(id: i64, wpm: i64, accuracy: f64, progress: i64) -> Participant {
        Participant {
            id,
            race_id: 1,
            username: format!("p{id}"),
            user_id: None,
            guest_name: None,
            avatar_color: None,
            is_bot: false,
            progress,
            wpm,
            accuracy,
            errors: 0,
            is_finished: true,
            finish_position: None,
            join_token: Secret::from("t".to_owned()),
            deleted: false,
        }
    }

    #[test]
    fn timed_ranking_orders_by_wpm_then_accuracy_then_progress() {
        let field = vec![
            participant(1, 23, 96.67, 60),
            participant(2, 36, 100.0, 90),
        ];
        let rankings = RaceEngine::rank_timed(&field);
        assert_eq!(rankings, vec![(2, 1), (1, 2)]);
    }

    #[test]
    fn timed_ranking_without_ties_sums_to_triangular_number() {
        let field = vec![
            participant(1, 50, 99.0, 100),
            participant(2, 40, 98.0, 90),
            participant(3, 60, 97.0, 110),
            participant(4, 30, 96.0, 70),
        ];
        let rankings = RaceEngine::rank_timed(&field);
        let total: i64 = rankings.iter().map(|(_, position)| position).sum();
        let n = rankings.len() as i64;
        assert_eq!(total, n * (n + 1) / 2);
    }

    #[test]
    fn timed_ranking_ties_share_position_and_skip() {
        let field = vec![
            participant(1, 50, 99.0, 100),
            participant(2, 50, 99.0, 100),
            participant(3, 40, 99.0, 90),
        ];
        let rankings = RaceEngine::rank_timed(&field);
        assert_eq!(rankings, vec![(1, 1), (2, 1), (3, 3)]);
    }

    #[test]
    fn timed_ranking_breaks_exact_ties_by_id_for_order_only() {
        let field = vec![
            participant(9, 50, 99.0, 100),
            participant(3, 50, 99.0, 100),
        ];
        let rankings = RaceEngine::rank_timed(&field);
        // Lower id first in the list, but both share position 1.
        assert_eq!(rankings, vec![(3, 1), (9, 1)]);
    }

    #[test]
    fn disqualified_participants_are_excluded_from_ranking() {
        let mut dnf = participant(7, 80, 99.0, 120);
        dnf.finish_position = Some(DNF_POSITION);
        let field = vec![participant(1, 50, 99.0, 100), dnf];
        let rankings = RaceEngine::rank_timed(&field);
        assert_eq!(rankings, vec![(1, 1)]);
    }
}
