use clap::Parser;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::warn;

/// TTL on `conn:{key}` hashes, refreshed by `touch`.
const CONNECTION_TTL_MS: i64 = 5 * 60 * 1000;
/// TTL on `race:{id}:connections` sets.
const RACE_CONNECTIONS_TTL_SECS: usize = 60 * 60;
/// IP bans last fifteen minutes.
pub const IP_BAN_TTL_SECS: usize = 15 * 60;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[group(skip)]
pub struct Options {
    /// Connection string for the shared key/value + pub/sub store, e.g.
    /// `redis://127.0.0.1:6379`. When absent the server runs single-instance
    /// and every distributed check degrades to the local decision.
    #[clap(long, env)]
    pub redis_url: Option<String>,
}

/// Cross-instance supersession request, published to the owning server's
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    pub connection_key: String,
    pub reason: String,
}

/// Envelope for race events fanned out between instances. Receivers drop
/// envelopes stamped with their own server id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceEventEnvelope {
    pub server_id: String,
    pub race_id: i64,
    pub event: serde_json::Value,
}

/// Shared key/value + pub/sub store. Every call fails open: on connection or
/// command errors the caller gets the answer that lets local processing
/// proceed.
#[derive(Clone)]
pub struct SharedStore {
    client: Option<redis::Client>,
    server_id: String,
}

impl SharedStore {
    pub fn new(options: &Options, server_id: String) -> eyre::Result<Self> {
        let client = options
            .redis_url
            .as_deref()
            .map(redis::Client::open)
            .transpose()?;
        Ok(Self { client, server_id })
    }

    #[must_use]
    pub fn disabled(server_id: String) -> Self {
        Self {
            client: None,
            server_id,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    #[must_use]
    pub fn server_channel(&self) -> String {
        format!("server:{}:channel", self.server_id)
    }

    async fn conn(&self) -> Option<redis::aio::Connection> {
        let client = self.client.as_ref()?;
        match client.get_async_connection().await {
            Ok(conn) => Some(conn),
            Err(error) => {
                warn!(%error, "shared store unavailable, failing open");
                None
            }
        }
    }

    pub async fn pubsub(&self) -> Option<redis::aio::PubSub> {
        Some(self.conn().await?.into_pubsub())
    }

    /// Atomically replaces `conn:{key}` with this server's entry and returns
    /// the server id that previously owned the key, if any.
    pub async fn register_connection(
        &self,
        connection_key: &str,
        race_id: Option<i64>,
        participant_id: Option<i64>,
        now_ms: i64,
    ) -> Option<String> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(
            r"
            local prev = redis.call('HGET', KEYS[1], 'serverId')
            redis.call('DEL', KEYS[1])
            redis.call('HSET', KEYS[1],
                'serverId', ARGV[1],
                'raceId', ARGV[2],
                'participantId', ARGV[3],
                'connectedAt', ARGV[4],
                'lastActivity', ARGV[4])
            redis.call('PEXPIRE', KEYS[1], ARGV[5])
            return prev
            ",
        );
        let result: Result<Option<String>, _> = script
            .key(format!("conn:{connection_key}"))
            .arg(&self.server_id)
            .arg(race_id.map_or_else(String::new, |id| id.to_string()))
            .arg(participant_id.map_or_else(String::new, |id| id.to_string()))
            .arg(now_ms)
            .arg(CONNECTION_TTL_MS)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(prev) => prev.filter(|prev| !prev.is_empty()),
            Err(error) => {
                warn!(%error, connection_key, "connection registration failed, failing open");
                None
            }
        }
    }

    /// Deletes `conn:{key}` only while this server still owns it.
    pub async fn unregister_connection(&self, connection_key: &str) {
        let Some(mut conn) = self.conn().await else { return };
        let script = redis::Script::new(
            r"
            if redis.call('HGET', KEYS[1], 'serverId') == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            ",
        );
        let result: Result<i64, _> = script
            .key(format!("conn:{connection_key}"))
            .arg(&self.server_id)
            .invoke_async(&mut conn)
            .await;
        if let Err(error) = result {
            warn!(%error, connection_key, "connection unregister failed");
        }
    }

    pub async fn touch_connection(&self, connection_key: &str, now_ms: i64) {
        let Some(mut conn) = self.conn().await else { return };
        let key = format!("conn:{connection_key}");
        let result: Result<(), redis::RedisError> = redis::pipe()
            .hset(&key, "lastActivity", now_ms)
            .ignore()
            .pexpire(&key, CONNECTION_TTL_MS as usize)
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(error) = result {
            warn!(%error, connection_key, "connection touch failed");
        }
    }

    pub async fn publish_terminate(&self, owner_server_id: &str, request: &TerminateRequest) {
        let Some(mut conn) = self.conn().await else { return };
        let channel = format!("server:{owner_server_id}:channel");
        let Ok(payload) = serde_json::to_string(request) else { return };
        let result: Result<(), redis::RedisError> = conn.publish(channel, payload).await;
        if let Err(error) = result {
            warn!(%error, "terminate publish failed");
        }
    }

    /// Fans a locally-produced race event out to the rest of the fleet.
    pub async fn publish_race_event(&self, race_id: i64, event: &serde_json::Value) {
        let Some(mut conn) = self.conn().await else { return };
        let envelope = RaceEventEnvelope {
            server_id: self.server_id.clone(),
            race_id,
            event: event.clone(),
        };
        let Ok(payload) = serde_json::to_string(&envelope) else { return };
        let result: Result<(), redis::RedisError> =
            conn.publish(format!("race:{race_id}:events"), payload).await;
        if let Err(error) = result {
            warn!(%error, race_id, "race event publish failed");
        }
    }

    pub async fn add_race_connection(&self, race_id: i64, participant_id: i64) {
        let Some(mut conn) = self.conn().await else { return };
        let key = format!("race:{race_id}:connections");
        let result: Result<(), redis::RedisError> = redis::pipe()
            .sadd(&key, participant_id)
            .ignore()
            .expire(&key, RACE_CONNECTIONS_TTL_SECS)
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(error) = result {
            warn!(%error, race_id, "race connection add failed");
        }
    }

    pub async fn remove_race_connection(&self, race_id: i64, participant_id: i64) {
        let Some(mut conn) = self.conn().await else { return };
        let result: Result<(), redis::RedisError> = conn
            .srem(format!("race:{race_id}:connections"), participant_id)
            .await;
        if let Err(error) = result {
            warn!(%error, race_id, "race connection remove failed");
        }
    }

    /// Distributed sliding-window check. `None` means the store could not
    /// answer and the caller should fall back to its local decision.
    pub async fn rate_limit_check(
        &self,
        identity_key: &str,
        message_type: &str,
        limit: u64,
        window_ms: i64,
        now_ms: i64,
    ) -> Option<bool> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(
            r"
            redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, ARGV[1] - ARGV[2])
            local count = redis.call('ZCARD', KEYS[1])
            if count < tonumber(ARGV[3]) then
                redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
                redis.call('PEXPIRE', KEYS[1], ARGV[2])
                return 1
            end
            return 0
            ",
        );
        let member = format!("{now_ms}:{}", uuid::Uuid::new_v4());
        let result: Result<i64, _> = script
            .key(format!("ratelimit:{identity_key}:{message_type}"))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(allowed) => Some(allowed == 1),
            Err(error) => {
                warn!(%error, identity_key, message_type, "distributed rate limit failed open");
                None
            }
        }
    }

    pub async fn is_ip_banned(&self, ip: IpAddr) -> bool {
        let Some(mut conn) = self.conn().await else { return false };
        let result: Result<bool, redis::RedisError> =
            conn.exists(format!("ban:ip:{ip}")).await;
        result.unwrap_or(false)
    }

    pub async fn ban_ip(&self, ip: IpAddr) {
        let Some(mut conn) = self.conn().await else { return };
        let result: Result<(), redis::RedisError> = conn
            .set_ex(format!("ban:ip:{ip}"), 1, IP_BAN_TTL_SECS)
            .await;
        if let Err(error) = result {
            warn!(%error, %ip, "ip ban write failed");
        }
    }

    /// Persists the absolute wall-clock expiry of a timed race so a restarted
    /// instance can resume or force-finish it.
    pub async fn set_timed_race_expiry(&self, race_id: i64, expiry_ms: i64, ttl_secs: usize) {
        let Some(mut conn) = self.conn().await else { return };
        let result: Result<(), redis::RedisError> = conn
            .set_ex(format!("timedRaceExpiry:{race_id}"), expiry_ms, ttl_secs)
            .await;
        if let Err(error) = result {
            warn!(%error, race_id, "timed race expiry write failed");
        }
    }

    pub async fn get_timed_race_expiry(&self, race_id: i64) -> Option<i64> {
        let mut conn = self.conn().await?;
        let result: Result<Option<i64>, redis::RedisError> =
            conn.get(format!("timedRaceExpiry:{race_id}")).await;
        match result {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, race_id, "timed race expiry read failed");
                None
            }
        }
    }

    pub async fn clear_timed_race_expiry(&self, race_id: i64) {
        let Some(mut conn) = self.conn().await else { return };
        let result: Result<(), redis::RedisError> =
            conn.del(format!("timedRaceExpiry:{race_id}")).await;
        if let Err(error) = result {
            warn!(%error, race_id, "timed race expiry clear failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_store_fails_open_everywhere() {
        let store = SharedStore::disabled("srv-test".into());
        assert!(!store.is_enabled());
        assert!(store
            .register_connection("user:u1", Some(1), Some(2), 0)
            .await
            .is_none());
        assert_eq!(store.rate_limit_check("user:u1", "progress", 1, 1000, 0).await, None);
        assert!(!store.is_ip_banned("127.0.0.1".parse().unwrap()).await);
        assert_eq!(store.get_timed_race_expiry(1).await, None);
        // Writes are no-ops rather than errors.
        store.touch_connection("user:u1", 0).await;
        store.publish_race_event(1, &serde_json::json!({"type": "noop"})).await;
    }
}
