use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::IpAddr,
    sync::Mutex,
    time::Duration,
};
use thiserror::Error;
use tokio::time::Instant;

pub const MAX_CONNECTIONS_PER_IP: usize = 5;
pub const MAX_TRACKED_IPS: usize = 10_000;
/// Violations within the rolling minute beyond which a decision is flagged.
const VIOLATION_FLAG_THRESHOLD: usize = 10;
/// IP violations that trigger a ban.
const IP_BAN_THRESHOLD: u32 = 50;
pub const IP_BAN_DURATION: Duration = Duration::from_secs(15 * 60);
const VIOLATION_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Per-message-type buckets: burst capacity plus sustained refill.
#[must_use]
pub fn bucket_for(message_type: &str) -> BucketConfig {
    match message_type {
        "progress" => BucketConfig { capacity: 30.0, refill_per_sec: 20.0 },
        "join" | "ready" | "ready_toggle" | "finish" | "timed_finish" | "leave" => {
            BucketConfig { capacity: 5.0, refill_per_sec: 1.0 }
        }
        "chat_message" => BucketConfig { capacity: 20.0, refill_per_sec: 4.0 },
        "submit_keystrokes" => BucketConfig { capacity: 2.0, refill_per_sec: 1.0 },
        "kick_player" => BucketConfig { capacity: 3.0, refill_per_sec: 0.5 },
        "lock_room" => BucketConfig { capacity: 2.0, refill_per_sec: 0.33 },
        "rematch" => BucketConfig { capacity: 2.0, refill_per_sec: 0.2 },
        _ => BucketConfig { capacity: 10.0, refill_per_sec: 5.0 },
    }
}

/// Sliding-window parameters for the distributed plane, derived from the
/// local bucket: sustained rate over a one-minute window.
#[must_use]
pub fn distributed_window(message_type: &str) -> (u64, i64) {
    let config = bucket_for(message_type);
    let per_minute = (config.refill_per_sec * 60.0).max(config.capacity);
    (per_minute.ceil() as u64, 60_000)
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
        }
    }

    fn try_take(&mut self, config: BucketConfig, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * config.refill_per_sec).min(config.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / config.refill_per_sec))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Set once the connection exceeds the violation threshold within the
    /// rolling minute; feeds the IP plane.
    pub violation_flagged: bool,
    pub retry_after_ms: Option<u64>,
}

/// Per-connection limiter. Not shared: each socket owns one.
#[derive(Debug, Default)]
pub struct ConnectionLimiter {
    buckets: HashMap<&'static str, TokenBucket>,
    violations: VecDeque<Instant>,
}

impl ConnectionLimiter {
    pub fn check(&mut self, message_type: &'static str, now: Instant) -> RateDecision {
        let config = bucket_for(message_type);
        let bucket = self
            .buckets
            .entry(message_type)
            .or_insert_with(|| TokenBucket::new(config, now));
        match bucket.try_take(config, now) {
            Ok(()) => RateDecision {
                allowed: true,
                violation_flagged: false,
                retry_after_ms: None,
            },
            Err(retry_after) => {
                self.violations.push_back(now);
                while let Some(first) = self.violations.front() {
                    if now.saturating_duration_since(*first) > VIOLATION_WINDOW {
                        self.violations.pop_front();
                    } else {
                        break;
                    }
                }
                RateDecision {
                    allowed: false,
                    violation_flagged: self.violations.len() > VIOLATION_FLAG_THRESHOLD,
                    retry_after_ms: Some(retry_after.as_millis() as u64),
                }
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpRejection {
    #[error("too many connections from this address")]
    LimitExceeded,
    #[error("address is banned")]
    Banned,
}

#[derive(Debug)]
struct IpEntry {
    connections: HashSet<u64>,
    violations: u32,
    banned_until: Option<Instant>,
    last_activity: Instant,
}

impl IpEntry {
    fn new(now: Instant) -> Self {
        Self {
            connections: HashSet::new(),
            violations: 0,
            banned_until: None,
            last_activity: now,
        }
    }
}

/// Per-IP aggregate plane: connection caps, violation counting, bans. The
/// table is bounded; when full, the oldest inactive entry is evicted.
#[derive(Debug, Default)]
pub struct IpTracker {
    inner: Mutex<HashMap<IpAddr, IpEntry>>,
}

impl IpTracker {
    pub fn register(&self, ip: IpAddr, conn_id: u64, now: Instant) -> Result<(), IpRejection> {
        let mut entries = self.inner.lock().unwrap();
        Self::evict_if_full(&mut entries, ip);
        let entry = entries.entry(ip).or_insert_with(|| IpEntry::new(now));
        entry.last_activity = now;
        if let Some(until) = entry.banned_until {
            if now < until {
                return Err(IpRejection::Banned);
            }
            entry.banned_until = None;
            entry.violations = 0;
        }
        if entry.connections.len() >= MAX_CONNECTIONS_PER_IP {
            return Err(IpRejection::LimitExceeded);
        }
        entry.connections.insert(conn_id);
        Ok(())
    }

    pub fn unregister(&self, ip: IpAddr, conn_id: u64) {
        let mut entries = self.inner.lock().unwrap();
        if let Some(entry) = entries.get_mut(&ip) {
            entry.connections.remove(&conn_id);
        }
    }

    /// Records a violation; returns true when the IP just crossed the ban
    /// threshold so the caller can mirror the ban into the shared store.
    pub fn record_violation(&self, ip: IpAddr, now: Instant) -> bool {
        let mut entries = self.inner.lock().unwrap();
        Self::evict_if_full(&mut entries, ip);
        let entry = entries.entry(ip).or_insert_with(|| IpEntry::new(now));
        entry.last_activity = now;
        entry.violations += 1;
        if entry.violations >= IP_BAN_THRESHOLD && entry.banned_until.is_none() {
            entry.banned_until = Some(now + IP_BAN_DURATION);
            return true;
        }
        false
    }

    #[must_use]
    pub fn is_banned(&self, ip: IpAddr, now: Instant) -> bool {
        let entries = self.inner.lock().unwrap();
        entries
            .get(&ip)
            .and_then(|entry| entry.banned_until)
            .map_or(false, |until| now < until)
    }

    #[must_use]
    pub fn connection_count(&self, ip: IpAddr) -> usize {
        let entries = self.inner.lock().unwrap();
        entries.get(&ip).map_or(0, |entry| entry.connections.len())
    }

    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn evict_if_full(entries: &mut HashMap<IpAddr, IpEntry>, incoming: IpAddr) {
        if entries.len() < MAX_TRACKED_IPS || entries.contains_key(&incoming) {
            return;
        }
        let oldest = entries
            .iter()
            .filter(|(_, entry)| entry.connections.is_empty())
            .min_by_key(|(_, entry)| entry.last_activity)
            .map(|(ip, _)| *ip);
        if let Some(ip) = oldest {
            entries.remove(&ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_exhausts_and_refills() {
        let mut limiter = ConnectionLimiter::default();
        let now = Instant::now();
        for _ in 0..2 {
            assert!(limiter.check("submit_keystrokes", now).allowed);
        }
        let denied = limiter.check("submit_keystrokes", now);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms.is_some());

        // One token per second refill.
        let later = now + Duration::from_millis(1100);
        assert!(limiter.check("submit_keystrokes", later).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_sustains_twenty_per_second() {
        let mut limiter = ConnectionLimiter::default();
        let mut now = Instant::now();
        let mut allowed = 0;
        // 2 seconds at 25 msg/s offered: 30 burst + 40 refilled ≈ 50 allowed.
        for _ in 0..50 {
            now += Duration::from_millis(40);
            if limiter.check("progress", now).allowed {
                allowed += 1;
            }
        }
        assert!((45..=50).contains(&allowed), "allowed={allowed}");
    }

    #[tokio::test(start_paused = true)]
    async fn violation_flag_raises_after_threshold() {
        let mut limiter = ConnectionLimiter::default();
        let now = Instant::now();
        let mut flagged = false;
        for _ in 0..20 {
            let decision = limiter.check("rematch", now);
            if !decision.allowed {
                flagged |= decision.violation_flagged;
            }
        }
        assert!(flagged);
    }

    #[tokio::test(start_paused = true)]
    async fn ip_plane_caps_connections() {
        let tracker = IpTracker::default();
        let now = Instant::now();
        for conn_id in 0..MAX_CONNECTIONS_PER_IP as u64 {
            assert!(tracker.register(ip(1), conn_id, now).is_ok());
        }
        assert_eq!(
            tracker.register(ip(1), 99, now),
            Err(IpRejection::LimitExceeded)
        );
        tracker.unregister(ip(1), 0);
        assert!(tracker.register(ip(1), 99, now).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fifty_violations_ban_for_fifteen_minutes() {
        let tracker = IpTracker::default();
        let now = Instant::now();
        let mut newly_banned = false;
        for _ in 0..50 {
            newly_banned = tracker.record_violation(ip(2), now);
        }
        assert!(newly_banned);
        assert!(tracker.is_banned(ip(2), now));
        assert_eq!(tracker.register(ip(2), 1, now), Err(IpRejection::Banned));

        let after_ban = now + IP_BAN_DURATION + Duration::from_secs(1);
        assert!(!tracker.is_banned(ip(2), after_ban));
        assert!(tracker.register(ip(2), 1, after_ban).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn table_evicts_oldest_inactive_when_full() {
        let tracker = IpTracker::default();
        let mut now = Instant::now();
        for i in 0..MAX_TRACKED_IPS {
            now += Duration::from_millis(1);
            let octets = [(i >> 16) as u8, (i >> 8) as u8, i as u8, 1];
            tracker.record_violation(IpAddr::from([11, octets[0], octets[1], octets[2]]), now);
        }
        assert_eq!(tracker.tracked_ips(), MAX_TRACKED_IPS);
        tracker.record_violation(ip(3), now + Duration::from_secs(1));
        assert_eq!(tracker.tracked_ips(), MAX_TRACKED_IPS);
    }
}
