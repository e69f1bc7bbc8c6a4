use std::{collections::HashMap, sync::Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Countdown,
    TimedRace,
}

#[derive(Debug, Default)]
struct TimerEntry {
    version: u64,
    countdown: Option<JoinHandle<()>>,
    timed_race: Option<JoinHandle<()>>,
}

impl TimerEntry {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            TimerKind::Countdown => &mut self.countdown,
            TimerKind::TimedRace => &mut self.timed_race,
        }
    }
}

/// Versioned per-race timers. Every (re)registration bumps the race's
/// version; callbacks snapshot the version at spawn and self-cancel when a
/// later registration or cancellation has moved it on. This replaces any
/// reliance on runtime timer-cancellation semantics.
#[derive(Default)]
pub struct TimerRegistry {
    inner: Mutex<HashMap<i64, TimerEntry>>,
}

impl TimerRegistry {
    /// Registers intent to run a timer, aborting any prior timer of the same
    /// kind. Returns the version the new timer task must carry.
    pub fn register(&self, race_id: i64, kind: TimerKind) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(race_id).or_default();
        entry.version += 1;
        if let Some(handle) = entry.slot(kind).take() {
            handle.abort();
        }
        entry.version
    }

    /// Stores the spawned task handle, unless the version is already stale
    /// (in which case the task is aborted immediately).
    pub fn attach(&self, race_id: i64, kind: TimerKind, version: u64, handle: JoinHandle<()>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&race_id) {
            Some(entry) if entry.version == version => {
                *entry.slot(kind) = Some(handle);
            }
            _ => handle.abort(),
        }
    }

    #[must_use]
    pub fn is_current(&self, race_id: i64, version: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.get(&race_id).map_or(false, |entry| entry.version == version)
    }

    #[must_use]
    pub fn current_version(&self, race_id: i64) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.get(&race_id).map_or(0, |entry| entry.version)
    }

    pub fn cancel(&self, race_id: i64, kind: TimerKind) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(&race_id) {
            entry.version += 1;
            if let Some(handle) = entry.slot(kind).take() {
                handle.abort();
            }
        }
    }

    /// Cancels every timer for the race and invalidates outstanding
    /// callbacks. The entry stays so destruction guards can still snapshot.
    pub fn clear_race(&self, race_id: i64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(race_id).or_default();
        entry.version += 1;
        for kind in [TimerKind::Countdown, TimerKind::TimedRace] {
            if let Some(handle) = entry.slot(kind).take() {
                handle.abort();
            }
        }
        entry.version
    }

    pub fn remove_race(&self, race_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut entry) = inner.remove(&race_id) {
            for kind in [TimerKind::Countdown, TimerKind::TimedRace] {
                if let Some(handle) = entry.slot(kind).take() {
                    handle.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn reregistration_invalidates_prior_version() {
        let timers = TimerRegistry::default();
        let v1 = timers.register(7, TimerKind::Countdown);
        assert!(timers.is_current(7, v1));
        let v2 = timers.register(7, TimerKind::Countdown);
        assert!(!timers.is_current(7, v1));
        assert!(timers.is_current(7, v2));
        assert!(v2 > v1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_callback_self_cancels() {
        let timers = Arc::new(TimerRegistry::default());
        let fired = Arc::new(AtomicBool::new(false));

        let version = timers.register(1, TimerKind::TimedRace);
        let handle = {
            let timers = Arc::clone(&timers);
            let fired = Arc::clone(&fired);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                if timers.is_current(1, version) {
                    fired.store(true, Ordering::SeqCst);
                }
            })
        };
        timers.attach(1, TimerKind::TimedRace, version, handle);

        // A later registration bumps the version before the timer fires.
        let _v2 = timers.register(1, TimerKind::Countdown);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn attach_aborts_stale_handles() {
        let timers = TimerRegistry::default();
        let version = timers.register(2, TimerKind::Countdown);
        let _newer = timers.register(2, TimerKind::Countdown);
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        timers.attach(2, TimerKind::Countdown, version, handle);
        // The stale handle must not be stored; clearing finds nothing live.
        timers.remove_race(2);
        assert_eq!(timers.current_version(2), 0);
    }
}
