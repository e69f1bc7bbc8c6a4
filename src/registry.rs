use crate::{
    messages::{ServerEvent, SUPERSEDED_REASON},
    store::{SharedStore, TerminateRequest},
};
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};

/// A single identity may hold at most this many live connections fleet-wide;
/// the oldest is superseded beyond that.
pub const MAX_CONNECTIONS_PER_IDENTITY: usize = 2;
/// `lastActivity` writes to the shared store are throttled per connection.
const TOUCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum OutboundFrame {
    Text(Arc<str>),
    Close { code: u16, reason: String },
}

/// Handle to a socket's outbound queue. Sends never block the engine; frames
/// are drained by the per-socket writer task.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl OutboundHandle {
    #[must_use]
    pub fn new(conn_id: u64, tx: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            conn_id,
            tx,
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// True once a close frame has been queued for this socket.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn send_event(&self, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(text) => self.send_shared(&Arc::from(text.as_str())),
            Err(error) => warn!(%error, "failed to serialize outbound event"),
        }
    }

    pub fn send_shared(&self, text: &Arc<str>) {
        // A closed receiver means the socket is gone; nothing to do.
        let _ = self.tx.send(OutboundFrame::Text(Arc::clone(text)));
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.tx.send(OutboundFrame::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    /// Sends the supersession notice followed by the 4000 close.
    pub fn supersede(&self) {
        self.send_event(&ServerEvent::ConnectionSuperseded {
            reason: SUPERSEDED_REASON.to_owned(),
        });
        self.close(crate::messages::CLOSE_SUPERSEDED, SUPERSEDED_REASON);
    }
}

/// Socket → participant binding established by a successful `join`. Every
/// later frame must match both ids.
#[derive(Debug, Clone)]
pub struct AuthBinding {
    pub race_id: i64,
    pub participant_id: i64,
    pub connection_key: String,
    pub username: String,
}

/// Shared, mutable view of a socket's binding. Held by the socket task and,
/// for queued rejoins, by the room so approval can bind the waiting socket.
pub type AuthCell = Arc<Mutex<Option<AuthBinding>>>;

#[derive(Debug, Clone)]
pub struct LocalConnection {
    pub conn_id: u64,
    pub out: OutboundHandle,
    pub connected_at: Instant,
    pub race_id: Option<i64>,
    pub participant_id: Option<i64>,
    last_store_touch: Instant,
}

/// Identity → connection map. Local entries are authoritative for sockets on
/// this instance; the shared store extends uniqueness across the fleet.
pub struct ConnectionRegistry {
    store: SharedStore,
    local: Mutex<HashMap<String, Vec<LocalConnection>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a connection under an identity key. Returns the local
    /// handles that were superseded; the caller notifies and closes them.
    pub async fn register(
        &self,
        connection_key: &str,
        out: OutboundHandle,
        race_id: Option<i64>,
        participant_id: Option<i64>,
    ) -> Vec<OutboundHandle> {
        let now = Instant::now();
        let superseded = {
            let mut local = self.local.lock().unwrap();
            let entries = local.entry(connection_key.to_owned()).or_default();
            entries.retain(|entry| entry.conn_id != out.conn_id());
            entries.push(LocalConnection {
                conn_id: out.conn_id(),
                out,
                connected_at: now,
                race_id,
                participant_id,
                last_store_touch: now,
            });
            let mut superseded = Vec::new();
            while entries.len() > MAX_CONNECTIONS_PER_IDENTITY {
                let oldest = entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| entry.connected_at)
                    .map(|(index, _)| index)
                    .unwrap();
                superseded.push(entries.remove(oldest).out);
            }
            superseded
        };

        let previous_owner = self
            .store
            .register_connection(
                connection_key,
                race_id,
                participant_id,
                Utc::now().timestamp_millis(),
            )
            .await;
        if let Some(owner) = previous_owner {
            if owner != self.store.server_id() {
                debug!(connection_key, owner, "requesting cross-instance supersession");
                self.store
                    .publish_terminate(&owner, &TerminateRequest {
                        connection_key: connection_key.to_owned(),
                        reason: SUPERSEDED_REASON.to_owned(),
                    })
                    .await;
            }
        }
        superseded
    }

    /// Handles a termination request from another instance: removes and
    /// returns every local connection under the key.
    pub fn take_for_termination(&self, connection_key: &str) -> Vec<OutboundHandle> {
        let mut local = self.local.lock().unwrap();
        local
            .remove(connection_key)
            .map(|entries| entries.into_iter().map(|entry| entry.out).collect())
            .unwrap_or_default()
    }

    /// Unregisters one connection. The shared-store hash is deleted only when
    /// no local sockets remain under the key.
    pub async fn unregister(&self, connection_key: &str, conn_id: u64) {
        let last_gone = {
            let mut local = self.local.lock().unwrap();
            match local.get_mut(connection_key) {
                Some(entries) => {
                    entries.retain(|entry| entry.conn_id != conn_id);
                    if entries.is_empty() {
                        local.remove(connection_key);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last_gone {
            self.store.unregister_connection(connection_key).await;
        }
    }

    /// Refreshes `lastActivity`, at most once per `TOUCH_INTERVAL` per
    /// connection.
    pub async fn touch(&self, connection_key: &str, conn_id: u64) {
        let now = Instant::now();
        let due = {
            let mut local = self.local.lock().unwrap();
            local.get_mut(connection_key).map_or(false, |entries| {
                entries
                    .iter_mut()
                    .find(|entry| entry.conn_id == conn_id)
                    .map_or(false, |entry| {
                        if now.saturating_duration_since(entry.last_store_touch) >= TOUCH_INTERVAL {
                            entry.last_store_touch = now;
                            true
                        } else {
                            false
                        }
                    })
            })
        };
        if due {
            self.store
                .touch_connection(connection_key, Utc::now().timestamp_millis())
                .await;
        }
    }

    #[must_use]
    pub fn local_count(&self, connection_key: &str) -> usize {
        self.local
            .lock()
            .unwrap()
            .get(connection_key)
            .map_or(0, Vec::len)
    }
}
