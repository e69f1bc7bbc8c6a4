use crate::{
    anticheat::SpeedTracker,
    messages::{ChatBroadcast, ErrorCode, ServerEvent},
    race::{Participant, ParticipantView, Race},
    registry::OutboundHandle,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::warn;

/// Chat ring buffer replayed to joiners.
pub const CHAT_HISTORY_LIMIT: usize = 50;
/// Pending rejoin requests are bounded per race.
pub const MAX_PENDING_REJOINS: usize = 100;
/// Rejoin requests expire to a rejection after this long.
pub const REJOIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Rooms are torn down this long after the final broadcast.
pub const ROOM_DESTROY_DELAY: Duration = Duration::from_secs(5);
/// Spectator caps, per race and per instance.
pub const SPECTATOR_LIMIT_PER_RACE: i64 = 20;
pub const GLOBAL_SPECTATOR_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
pub struct RoomClient {
    pub participant_id: i64,
    pub conn_id: u64,
    pub out: OutboundHandle,
    pub username: String,
    pub connection_key: String,
    pub is_bot: bool,
    pub is_ready: bool,
    pub last_activity: Instant,
}

#[derive(Debug, Clone)]
pub struct PendingRejoin {
    pub conn_id: u64,
    pub out: OutboundHandle,
    pub auth: crate::registry::AuthCell,
    pub username: String,
    pub requested_at: Instant,
}

#[derive(Debug, Default)]
pub struct ExtensionState {
    pub last_extended_at: Option<Instant>,
    pub count: u32,
    pub pending: bool,
}

/// Per-race in-memory state. One instance owns a room at a time; the engine
/// serializes every mutation behind the room's mutex.
pub struct RaceRoom {
    pub race: Race,
    pub participants: HashMap<i64, Participant>,
    pub clients: HashMap<i64, RoomClient>,
    pub spectators: HashMap<u64, OutboundHandle>,
    pub host_participant_id: Option<i64>,
    pub host_version: u64,
    pub host_lock: bool,
    pub is_locked: bool,
    pub is_finishing: bool,
    pub is_starting: bool,
    pub kicked_players: HashSet<i64>,
    pub pending_rejoins: HashMap<i64, PendingRejoin>,
    pub chat_history: VecDeque<ChatBroadcast>,
    pub race_start: Option<Instant>,
    pub extension: ExtensionState,
    pub speed: HashMap<i64, SpeedTracker>,
    pub disqualified: HashSet<i64>,
}

impl RaceRoom {
    #[must_use]
    pub fn new(race: Race, participants: Vec<Participant>) -> Self {
        let participants = participants.into_iter().map(|p| (p.id, p)).collect();
        Self {
            race,
            participants,
            clients: HashMap::new(),
            spectators: HashMap::new(),
            host_participant_id: None,
            host_version: 0,
            host_lock: false,
            is_locked: false,
            is_finishing: false,
            is_starting: false,
            kicked_players: HashSet::new(),
            pending_rejoins: HashMap::new(),
            chat_history: VecDeque::new(),
            race_start: None,
            extension: ExtensionState::default(),
            speed: HashMap::new(),
            disqualified: HashSet::new(),
        }
    }

    #[must_use]
    pub fn race_id(&self) -> i64 {
        self.race.id
    }

    /// Serializes the event once and fans it out to all clients and
    /// spectators.
    pub fn broadcast(&self, event: &ServerEvent) {
        self.broadcast_filtered(event, |_| true);
    }

    pub fn broadcast_except(&self, excluded: i64, event: &ServerEvent) {
        self.broadcast_filtered(event, |client| client.participant_id != excluded);
    }

    fn broadcast_filtered(&self, event: &ServerEvent, include: impl Fn(&RoomClient) -> bool) {
        let text = match serde_json::to_string(event) {
            Ok(text) => Arc::from(text.as_str()),
            Err(error) => {
                warn!(%error, race_id = self.race.id, "failed to serialize broadcast");
                return;
            }
        };
        for client in self.clients.values().filter(|client| include(client)) {
            client.out.send_shared(&text);
        }
        for spectator in self.spectators.values() {
            spectator.send_shared(&text);
        }
    }

    /// Fans out pre-serialized text, used for events relayed from other
    /// instances.
    pub fn broadcast_raw(&self, text: &Arc<str>) {
        for client in self.clients.values() {
            client.out.send_shared(text);
        }
        for spectator in self.spectators.values() {
            spectator.send_shared(text);
        }
    }

    pub fn send_to(&self, participant_id: i64, event: &ServerEvent) -> bool {
        self.clients.get(&participant_id).map_or(false, |client| {
            client.out.send_event(event);
            true
        })
    }

    #[must_use]
    pub fn participant_views(&self) -> Vec<ParticipantView> {
        let mut views: Vec<ParticipantView> =
            self.participants.values().map(ParticipantView::from).collect();
        views.sort_by_key(|view| view.id);
        views
    }

    #[must_use]
    pub fn chat_snapshot(&self) -> Vec<ChatBroadcast> {
        self.chat_history.iter().cloned().collect()
    }

    pub fn push_chat(&mut self, entry: ChatBroadcast) {
        if self.chat_history.len() >= CHAT_HISTORY_LIMIT {
            self.chat_history.pop_front();
        }
        self.chat_history.push_back(entry);
    }

    /// Live human sockets; quorum is counted here, never from persistence.
    #[must_use]
    pub fn connected_humans(&self) -> usize {
        self.clients.values().filter(|client| !client.is_bot).count()
    }

    #[must_use]
    pub fn has_bots(&self) -> bool {
        self.participants.values().any(|p| p.is_bot)
    }

    /// Humans required before a countdown may start (or keep running).
    #[must_use]
    pub fn required_humans(&self) -> usize {
        if self.has_bots() {
            1
        } else {
            2
        }
    }

    /// Host selection on first join: creator when present, else the joiner.
    pub fn assign_initial_host(&mut self, joining_participant_id: i64) {
        if self.host_participant_id.is_some() {
            return;
        }
        let creator = self
            .race
            .creator_participant_id
            .filter(|id| self.participants.contains_key(id));
        self.host_participant_id = Some(creator.unwrap_or(joining_participant_id));
        self.host_version += 1;
    }

    /// Atomic host transfer to the lowest-id connected human, guarded by the
    /// host lock. Returns the new host's id and username.
    pub fn transfer_host(&mut self) -> Option<(i64, String)> {
        if self.host_lock {
            return None;
        }
        self.host_lock = true;
        let next = self
            .clients
            .values()
            .filter(|client| !client.is_bot)
            .min_by_key(|client| client.participant_id)
            .map(|client| (client.participant_id, client.username.clone()));
        if let Some((participant_id, _)) = next {
            self.host_participant_id = Some(participant_id);
            self.host_version += 1;
        } else {
            self.host_participant_id = None;
        }
        self.host_lock = false;
        next
    }

    #[must_use]
    pub fn is_host(&self, participant_id: i64) -> bool {
        self.host_participant_id == Some(participant_id)
    }

    /// Gate for host-only operations. A room whose host slot is vacant (every
    /// eligible human left) answers `NoHost`, not `NotHost`.
    pub fn require_host(&self, participant_id: i64) -> Result<(), ErrorCode> {
        match self.host_participant_id {
            None => Err(ErrorCode::NoHost),
            Some(host) if host == participant_id => Ok(()),
            Some(_) => Err(ErrorCode::NotHost),
        }
    }

    /// Queues a rejoin request, evicting nothing: beyond the bound the
    /// request is refused.
    pub fn queue_rejoin(&mut self, participant_id: i64, pending: PendingRejoin) -> bool {
        if self.pending_rejoins.len() >= MAX_PENDING_REJOINS {
            return false;
        }
        self.pending_rejoins.insert(participant_id, pending);
        true
    }

    /// Pending rejoins past their deadline, drained for rejection.
    pub fn expire_rejoins(&mut self, now: Instant) -> Vec<(i64, PendingRejoin)> {
        let expired: Vec<i64> = self
            .pending_rejoins
            .iter()
            .filter(|(_, pending)| {
                now.saturating_duration_since(pending.requested_at) >= REJOIN_TIMEOUT
            })
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending_rejoins.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// True when nothing keeps the room alive.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.clients.is_empty() && self.spectators.is_empty() && self.pending_rejoins.is_empty()
    }
}
