use crate::storage::{PersistentStorage, ProgressSnapshot};
use indexmap::IndexMap;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cadence of the bulk flush to persistence.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive persistence failures that open the circuit.
const FAILURE_THRESHOLD: u32 = 5;
/// Flushes resume only after this long without a failure.
const QUIET_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct ProgressEntry {
    pub progress: i64,
    pub wpm: i64,
    pub accuracy: f64,
    pub errors: i64,
    pub last_update: Instant,
    dirty: bool,
    version: u64,
}

impl ProgressEntry {
    #[must_use]
    pub const fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            progress: self.progress,
            wpm: self.wpm,
            accuracy: self.accuracy,
            errors: self.errors,
        }
    }
}

/// Write-coalescing buffer between the progress firehose and persistence.
/// Each update overwrites the previous value; the flusher only ever sees the
/// latest snapshot per participant.
#[derive(Default)]
pub struct ProgressCache {
    inner: Mutex<IndexMap<i64, ProgressEntry>>,
}

impl ProgressCache {
    pub fn upsert(&self, participant_id: i64, snapshot: ProgressSnapshot, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(participant_id).or_insert(ProgressEntry {
            progress: 0,
            wpm: 0,
            accuracy: 100.0,
            errors: 0,
            last_update: now,
            dirty: false,
            version: 0,
        });
        entry.progress = snapshot.progress;
        entry.wpm = snapshot.wpm;
        entry.accuracy = snapshot.accuracy;
        entry.errors = snapshot.errors;
        entry.last_update = now;
        entry.dirty = true;
        entry.version += 1;
    }

    #[must_use]
    pub fn get(&self, participant_id: i64) -> Option<ProgressEntry> {
        self.inner.lock().unwrap().get(&participant_id).copied()
    }

    pub fn remove(&self, participant_id: i64) {
        self.inner.lock().unwrap().shift_remove(&participant_id);
    }

    pub fn remove_race(&self, participant_ids: &[i64]) {
        let mut inner = self.inner.lock().unwrap();
        for id in participant_ids {
            inner.shift_remove(id);
        }
    }

    /// Dirty entries in insertion order, with the version that must still be
    /// current for `mark_flushed` to clear the flag.
    #[must_use]
    pub fn collect_dirty(&self) -> Vec<(i64, ProgressSnapshot, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, entry)| (*id, entry.snapshot(), entry.version))
            .collect()
    }

    /// Clears dirty flags for entries that were not updated mid-flight.
    pub fn mark_flushed(&self, flushed: &[(i64, ProgressSnapshot, u64)]) {
        let mut inner = self.inner.lock().unwrap();
        for (id, _, version) in flushed {
            if let Some(entry) = inner.get_mut(id) {
                if entry.version == *version {
                    entry.dirty = false;
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[derive(Debug, Default)]
struct HealthState {
    failures: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker over persistence writes. Open after five failures; a
/// half-open probe is allowed again after thirty quiet seconds.
#[derive(Debug, Default)]
pub struct DbHealth {
    inner: Mutex<HealthState>,
}

impl DbHealth {
    pub fn record_failure(&self, now: Instant) {
        let mut state = self.inner.lock().unwrap();
        state.failures += 1;
        state.last_failure = Some(now);
    }

    pub fn record_success(&self) {
        let mut state = self.inner.lock().unwrap();
        state.failures = 0;
        state.last_failure = None;
    }

    #[must_use]
    pub fn is_degraded(&self, now: Instant) -> bool {
        let state = self.inner.lock().unwrap();
        state.failures >= FAILURE_THRESHOLD
            && state
                .last_failure
                .map_or(false, |at| now.saturating_duration_since(at) < QUIET_INTERVAL)
    }
}

pub async fn flush_once(cache: &ProgressCache, storage: &PersistentStorage, health: &DbHealth) {
    let now = Instant::now();
    if health.is_degraded(now) {
        debug!("progress flush skipped, persistence degraded");
        return;
    }
    let dirty = cache.collect_dirty();
    if dirty.is_empty() {
        return;
    }
    let updates: Vec<(i64, ProgressSnapshot)> =
        dirty.iter().map(|(id, snapshot, _)| (*id, *snapshot)).collect();
    match storage.bulk_update_participant_progress(&updates).await {
        Ok(()) => {
            cache.mark_flushed(&dirty);
            health.record_success();
        }
        Err(error) => {
            warn!(%error, entries = dirty.len(), "progress flush failed");
            health.record_failure(Instant::now());
        }
    }
}

/// Background flusher, spawned once at server start. Stops when shutdown is
/// signalled; the engine runs the final flush itself.
pub async fn flush_on_interval(
    cache: Arc<ProgressCache>,
    storage: PersistentStorage,
    health: Arc<DbHealth>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        flush_once(&cache, &storage, &health).await;
    }
}
