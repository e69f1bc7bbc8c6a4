pub mod completion;
mod handlers;
mod join;
mod socket;

pub use socket::{handle_socket, SocketContext};

use crate::{
    anticheat,
    bots::{BotDriver, BotTick},
    certificates::Keys,
    messages::{ErrorCode, ServerEvent, CLOSE_IDLE, CLOSE_OVERLOAD, CLOSE_POLICY},
    progress::{DbHealth, ProgressCache},
    race::{RaceStatus, RaceType, DNF_POSITION},
    rate_limit::{IpRejection, IpTracker},
    registry::ConnectionRegistry,
    room::RaceRoom,
    storage::{PersistentStorage, ProgressSnapshot},
    store::{SharedStore, TerminateRequest},
    timers::TimerRegistry,
};
use clap::Parser;
use indexmap::IndexMap;
use rand::Rng;
use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sockets idle beyond this are closed by the heartbeat with code 4001; the
/// bound is longer than any standard race.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(180);
/// Heartbeat sweep cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Countdown used for private lobbies when the override is enabled.
const PRIVATE_COUNTDOWN_SECONDS: u64 = 10;
/// Bound on the reconnect-candidate map.
const MAX_DISCONNECTED_ENTRIES: usize = 10_000;
/// Chat messages per participant are spaced at least this far apart.
pub const CHAT_COOLDOWN: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[group(skip)]
pub struct Options {
    /// Countdown length before a race starts, in seconds.
    #[clap(long, env = "RACE_COUNTDOWN_SECONDS", default_value = "3")]
    pub countdown_seconds: u64,

    /// Let private lobbies run the longer private countdown instead of the
    /// default.
    #[clap(long, env = "RACE_PRIVATE_CUSTOM_COUNTDOWN", default_value = "false")]
    pub private_custom_countdown: bool,

    /// Comma-separated proxy addresses whose X-Forwarded-For / X-Real-IP
    /// headers are trusted.
    #[clap(long, env = "TRUSTED_PROXIES", default_value = "")]
    pub trusted_proxies: String,

    /// Hard cap on concurrent sockets. Load shedding starts at 80% of this.
    #[clap(long, env, default_value = "50000")]
    pub max_connections: usize,
}

/// Outcome of socket admission, decided before the upgrade completes.
#[derive(Debug)]
pub enum Admission {
    Allow { conn_id: u64 },
    Reject {
        error: Option<ErrorCode>,
        close_code: u16,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub connections: usize,
    pub rooms: usize,
    pub races_completed: u64,
    pub uptime_seconds: u64,
}

/// The single long-lived engine object: every registry, cache, and room
/// hangs off it, which keeps multi-instance shutdown and tests simple.
pub struct RaceEngine {
    pub options: Options,
    pub(crate) storage: PersistentStorage,
    pub(crate) store: SharedStore,
    pub(crate) keys: Arc<Keys>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) timers: TimerRegistry,
    pub(crate) cache: Arc<ProgressCache>,
    pub(crate) db_health: Arc<DbHealth>,
    pub(crate) ip_tracker: IpTracker,
    pub(crate) bots: BotDriver,
    pub(crate) rooms: StdMutex<HashMap<i64, Arc<Mutex<RaceRoom>>>>,
    pub(crate) completion_locks: StdMutex<HashSet<i64>>,
    pub(crate) chat_cooldowns: StdMutex<HashMap<i64, Instant>>,
    pub(crate) disconnected: StdMutex<IndexMap<(i64, i64), Instant>>,
    pub(crate) trusted_proxies: Vec<IpAddr>,
    next_conn_id: AtomicU64,
    connections: AtomicUsize,
    races_completed: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
    started_at: Instant,
}

impl RaceEngine {
    #[must_use]
    pub fn new(
        options: Options,
        storage: PersistentStorage,
        store: SharedStore,
        keys: Arc<Keys>,
    ) -> Arc<Self> {
        let trusted_proxies = crate::identity::parse_trusted_proxies(&options.trusted_proxies);
        Arc::new(Self {
            options,
            storage,
            registry: ConnectionRegistry::new(store.clone()),
            store,
            keys,
            timers: TimerRegistry::default(),
            cache: Arc::new(ProgressCache::default()),
            db_health: Arc::new(DbHealth::default()),
            ip_tracker: IpTracker::default(),
            bots: BotDriver::default(),
            rooms: StdMutex::new(HashMap::new()),
            completion_locks: StdMutex::new(HashSet::new()),
            chat_cooldowns: StdMutex::new(HashMap::new()),
            disconnected: StdMutex::new(IndexMap::new()),
            trusted_proxies,
            next_conn_id: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            races_completed: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    #[must_use]
    pub fn storage(&self) -> &PersistentStorage {
        &self.storage
    }

    #[must_use]
    pub fn progress_cache(&self) -> &Arc<ProgressCache> {
        &self.cache
    }

    #[must_use]
    pub fn db_health(&self) -> &Arc<DbHealth> {
        &self.db_health
    }

    #[must_use]
    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            rooms: self.rooms.lock().unwrap().len(),
            races_completed: self.races_completed.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub(crate) fn record_race_completed(&self) {
        self.races_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Cancelled when shutdown begins; background loops hang their select
    /// arms on it.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub(crate) fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_token.cancel();
    }

    /// Admission control for a new socket: capacity, probabilistic shedding
    /// past 80% load, IP bans, and the per-IP connection cap.
    pub async fn admit_socket(&self, ip: IpAddr) -> Admission {
        if self.is_shutting_down() {
            return Admission::Reject {
                error: None,
                close_code: CLOSE_OVERLOAD,
                reason: "server shutting down",
            };
        }

        let current = self.connections.load(Ordering::Relaxed);
        let max = self.options.max_connections;
        if current >= max {
            return Admission::Reject {
                error: None,
                close_code: CLOSE_OVERLOAD,
                reason: "server at capacity",
            };
        }
        let shed_floor = max * 4 / 5;
        if current >= shed_floor {
            let overload = (current - shed_floor) as f64 / (max - shed_floor).max(1) as f64;
            if rand::thread_rng().gen::<f64>() < overload {
                return Admission::Reject {
                    error: None,
                    close_code: CLOSE_OVERLOAD,
                    reason: "server overloaded",
                };
            }
        }

        let now = Instant::now();
        if self.ip_tracker.is_banned(ip, now) || self.store.is_ip_banned(ip).await {
            return Admission::Reject {
                error: None,
                close_code: CLOSE_POLICY,
                reason: "address banned",
            };
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        match self.ip_tracker.register(ip, conn_id, now) {
            Ok(()) => {
                self.connections.fetch_add(1, Ordering::Relaxed);
                Admission::Allow { conn_id }
            }
            Err(IpRejection::Banned) => Admission::Reject {
                error: None,
                close_code: CLOSE_POLICY,
                reason: "address banned",
            },
            Err(IpRejection::LimitExceeded) => {
                self.record_ip_violation(ip).await;
                Admission::Reject {
                    error: Some(ErrorCode::IpLimitExceeded),
                    close_code: CLOSE_POLICY,
                    reason: "too many connections",
                }
            }
        }
    }

    pub(crate) async fn record_ip_violation(&self, ip: IpAddr) {
        if self.ip_tracker.record_violation(ip, Instant::now()) {
            warn!(%ip, "ip banned after repeated violations");
            self.store.ban_ip(ip).await;
        }
    }

    pub(crate) fn release_socket(&self, ip: IpAddr, conn_id: u64) {
        self.ip_tracker.unregister(ip, conn_id);
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub(crate) fn room_if_loaded(&self, race_id: i64) -> Option<Arc<Mutex<RaceRoom>>> {
        self.rooms.lock().unwrap().get(&race_id).cloned()
    }

    /// Loads a room, creating it from persistence on first touch.
    pub(crate) async fn load_room(
        &self,
        race_id: i64,
    ) -> Result<Arc<Mutex<RaceRoom>>, ErrorCode> {
        if let Some(room) = self.room_if_loaded(race_id) {
            return Ok(room);
        }
        let race = self
            .storage
            .get_race(race_id)
            .await
            .map_err(|_| ErrorCode::RaceUnavailable)?
            .ok_or(ErrorCode::RoomNotFound)?;
        let participants = self
            .storage
            .get_race_participants(race_id)
            .await
            .map_err(|_| ErrorCode::RaceUnavailable)?;

        let mut rooms = self.rooms.lock().unwrap();
        let room = rooms
            .entry(race_id)
            .or_insert_with(|| Arc::new(Mutex::new(RaceRoom::new(race, participants))));
        Ok(Arc::clone(room))
    }

    pub(crate) fn destroy_room(&self, race_id: i64, participant_ids: &[i64]) {
        debug!(race_id, "destroying room");
        self.rooms.lock().unwrap().remove(&race_id);
        self.timers.remove_race(race_id);
        self.bots.stop_race(race_id);
        self.cache.remove_race(participant_ids);
        self.completion_locks.lock().unwrap().remove(&race_id);
        {
            let mut cooldowns = self.chat_cooldowns.lock().unwrap();
            for id in participant_ids {
                cooldowns.remove(id);
            }
        }
        let mut disconnected = self.disconnected.lock().unwrap();
        disconnected.retain(|(room_race, _), _| *room_race != race_id);
    }

    /// Local broadcast plus cross-instance fan-out.
    pub(crate) fn fanout(&self, room: &RaceRoom, event: &ServerEvent) {
        room.broadcast(event);
        self.publish_remote(room.race_id(), event);
    }

    pub(crate) fn publish_remote(&self, race_id: i64, event: &ServerEvent) {
        if !self.store.is_enabled() {
            return;
        }
        let value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "failed to serialize event for remote fan-out");
                return;
            }
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            store.publish_race_event(race_id, &value).await;
        });
    }

    /// Marks a participant DNF with position 999 and announces it. The
    /// caller attempts race completion after releasing the room lock.
    pub(crate) async fn disqualify_participant(&self, room: &mut RaceRoom, participant_id: i64) {
        info!(race_id = room.race_id(), participant_id, "participant disqualified");
        if let Err(error) = self
            .storage
            .update_participant_finish_position(participant_id, DNF_POSITION)
            .await
        {
            warn!(%error, participant_id, "failed to persist disqualification");
        }
        if let Some(participant) = room.participants.get_mut(&participant_id) {
            participant.is_finished = true;
            participant.finish_position = Some(DNF_POSITION);
        }
        room.disqualified.insert(participant_id);
        self.fanout(room, &ServerEvent::ParticipantDnf { participant_id });
    }

    pub(crate) fn track_disconnected(&self, race_id: i64, participant_id: i64) {
        let mut disconnected = self.disconnected.lock().unwrap();
        if disconnected.len() >= MAX_DISCONNECTED_ENTRIES {
            disconnected.shift_remove_index(0);
        }
        disconnected.insert((race_id, participant_id), Instant::now());
    }

    pub(crate) fn untrack_disconnected(&self, race_id: i64, participant_id: i64) -> bool {
        self.disconnected
            .lock()
            .unwrap()
            .shift_remove(&(race_id, participant_id))
            .is_some()
    }

    #[must_use]
    pub(crate) fn countdown_seconds_for(&self, is_private: bool) -> u64 {
        if is_private && self.options.private_custom_countdown {
            PRIVATE_COUNTDOWN_SECONDS
        } else {
            self.options.countdown_seconds
        }
    }

    /// One bot progress push. The engine answers with what the bot should do
    /// next so driver tasks never inspect room state directly.
    pub async fn bot_progress(
        self: &Arc<Self>,
        race_id: i64,
        participant_id: i64,
        progress: i64,
    ) -> BotTick {
        let Some(room) = self.room_if_loaded(race_id) else {
            return BotTick::Stop;
        };
        let mut room = room.lock().await;
        if room.race.status != RaceStatus::Racing || room.is_finishing {
            return BotTick::Stop;
        }
        let paragraph_len = room.race.paragraph_len();
        let Some(participant) = room.participants.get(&participant_id) else {
            return BotTick::Stop;
        };
        if participant.is_finished {
            return BotTick::Stop;
        }

        let clamped = progress.max(participant.progress).min(paragraph_len);
        let elapsed = room
            .race_start
            .map_or(Duration::from_secs(1), |start| start.elapsed());
        let (wpm, accuracy) = anticheat::server_metrics(clamped, 0, elapsed);
        let snapshot = ProgressSnapshot {
            progress: clamped,
            wpm,
            accuracy,
            errors: 0,
        };
        self.cache.upsert(participant_id, snapshot, Instant::now());
        if let Some(participant) = room.participants.get_mut(&participant_id) {
            participant.progress = clamped;
            participant.wpm = wpm;
            participant.accuracy = accuracy;
        }
        self.fanout(&room, &ServerEvent::ProgressUpdate {
            participant_id,
            progress: clamped,
            wpm,
            accuracy,
            errors: 0,
        });

        if room.race.race_type == RaceType::Standard && clamped >= paragraph_len {
            BotTick::Finish
        } else {
            BotTick::Continue
        }
    }

    pub async fn bot_finish(self: &Arc<Self>, race_id: i64, participant_id: i64) {
        let Some(room) = self.room_if_loaded(race_id) else { return };
        {
            let mut room = room.lock().await;
            if room.race.status != RaceStatus::Racing {
                return;
            }
            let Some(participant) = room.participants.get(&participant_id) else { return };
            if participant.is_finished {
                return;
            }
            let paragraph_len = room.race.paragraph_len();
            let elapsed = room
                .race_start
                .map_or(Duration::from_secs(1), |start| start.elapsed());
            let (wpm, accuracy) = anticheat::server_metrics(paragraph_len, 0, elapsed);
            let snapshot = ProgressSnapshot {
                progress: paragraph_len,
                wpm,
                accuracy,
                errors: 0,
            };
            if let Err(error) = self
                .storage
                .update_participant_progress(participant_id, snapshot)
                .await
            {
                warn!(%error, participant_id, "bot final snapshot failed");
            }
            match self.storage.finish_participant(participant_id, race_id).await {
                Ok((position, true)) => {
                    if let Some(participant) = room.participants.get_mut(&participant_id) {
                        participant.progress = paragraph_len;
                        participant.wpm = wpm;
                        participant.accuracy = accuracy;
                        participant.is_finished = true;
                        participant.finish_position = Some(position);
                    }
                    self.fanout(&room, &ServerEvent::ParticipantFinished {
                        participant_id,
                        position,
                    });
                }
                Ok((_, false)) => {}
                Err(error) => {
                    warn!(%error, participant_id, "bot finish failed");
                    return;
                }
            }
        }
        self.complete_race_with_lock(race_id, "bot_finish").await;
    }

    /// Handles a message published to this server's control channel.
    pub(crate) async fn handle_terminate_request(&self, request: TerminateRequest) {
        let handles = self.registry.take_for_termination(&request.connection_key);
        for handle in handles {
            handle.supersede();
        }
    }

    /// Periodic sweep: idle sockets, expired rejoin requests, and racers
    /// disconnected long enough to be treated as DNF.
    pub(crate) async fn heartbeat_sweep(self: &Arc<Self>) {
        let rooms: Vec<Arc<Mutex<RaceRoom>>> =
            self.rooms.lock().unwrap().values().cloned().collect();
        let now = Instant::now();

        for room_handle in rooms {
            let mut completion_due = false;
            let race_id;
            {
                let mut room = room_handle.lock().await;
                race_id = room.race_id();

                for client in room.clients.values() {
                    if !client.is_bot
                        && now.saturating_duration_since(client.last_activity) > IDLE_TIMEOUT
                    {
                        debug!(race_id, participant_id = client.participant_id, "closing idle socket");
                        client.out.close(CLOSE_IDLE, "idle timeout");
                    }
                }

                for (_, pending) in room.expire_rejoins(now) {
                    pending.out.send_event(&ServerEvent::error(
                        ErrorCode::RequestTimeout,
                        "rejoin request timed out",
                    ));
                    pending.out.send_event(&ServerEvent::RejoinRejected {
                        reason: "timeout".to_owned(),
                    });
                }

                if room.race.status == RaceStatus::Racing {
                    let stale: Vec<i64> = {
                        let disconnected = self.disconnected.lock().unwrap();
                        disconnected
                            .iter()
                            .filter(|(key, since)| {
                                key.0 == race_id
                                    && now.saturating_duration_since(**since) > IDLE_TIMEOUT
                            })
                            .map(|(key, _)| key.1)
                            .collect()
                    };
                    for participant_id in stale {
                        let unfinished = room
                            .participants
                            .get(&participant_id)
                            .map_or(false, |p| !p.is_finished);
                        if unfinished {
                            self.disqualify_participant(&mut room, participant_id).await;
                            completion_due = true;
                        }
                        self.untrack_disconnected(race_id, participant_id);
                    }
                }
            }
            if completion_due {
                self.complete_race_with_lock(race_id, "heartbeat").await;
            }
        }
    }
}

/// Heartbeat loop, spawned once at server start and stopped by shutdown.
pub async fn heartbeat_on_interval(engine: Arc<RaceEngine>) {
    let shutdown = engine.shutdown_token();
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        engine.heartbeat_sweep().await;
    }
}

/// Cross-instance listener: supersession requests on this server's channel
/// and race events from the rest of the fleet. Stops at shutdown.
pub async fn run_store_listener(engine: Arc<RaceEngine>) {
    use futures::StreamExt;

    if !engine.store.is_enabled() {
        return;
    }
    let shutdown = engine.shutdown_token();
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let Some(mut pubsub) = engine.store.pubsub().await else {
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        };
        let subscribed = pubsub.subscribe(engine.store.server_channel()).await.is_ok()
            && pubsub.psubscribe("race:*:events").await.is_ok();
        if !subscribed {
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }
        info!("subscribed to shared store channels");

        let mut stream = pubsub.on_message();
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return,
                message = stream.next() => message,
            };
            let Some(message) = message else { break };
            let channel = message.get_channel_name().to_owned();
            let Ok(payload) = message.get_payload::<String>() else { continue };
            if channel == engine.store.server_channel() {
                if let Ok(request) = serde_json::from_str::<TerminateRequest>(&payload) {
                    engine.handle_terminate_request(request).await;
                }
            } else if let Ok(envelope) =
                serde_json::from_str::<crate::store::RaceEventEnvelope>(&payload)
            {
                engine.handle_remote_race_event(envelope).await;
            }
        }
        warn!("shared store subscription lost, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

impl RaceEngine {
    pub(crate) async fn handle_remote_race_event(
        &self,
        envelope: crate::store::RaceEventEnvelope,
    ) {
        if envelope.server_id == self.store.server_id() {
            return;
        }
        let Some(room) = self.room_if_loaded(envelope.race_id) else { return };
        let mut room = room.lock().await;

        // Status-bearing events resync the cached race row before fan-out.
        let event_type = envelope.event.get("type").and_then(|t| t.as_str());
        if matches!(
            event_type,
            Some("race_start" | "race_finished" | "countdown_start" | "countdown_cancelled")
        ) {
            if let Ok(Some(race)) = self.storage.get_race(envelope.race_id).await {
                room.race = race;
            }
        }

        match serde_json::to_string(&envelope.event) {
            Ok(text) => room.broadcast_raw(&Arc::from(text.as_str())),
            Err(error) => warn!(%error, "failed to re-serialize remote event"),
        }
    }
}
