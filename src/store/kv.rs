// ── Airborne Store: Key-Value Seam ─────────────────────────────────────────
// Two implementations of the `KvStore` trait:
//
//   • RedisKv  — production backend. The increment-and-expire pair runs as
//     one Lua script, so a counter can never exist without a TTL and there
//     is no race between INCRBY and EXPIRE.
//   • MemoryKv — in-process twin with the same atomicity guarantees under a
//     single mutex. Used by tests and by single-node deployments that run
//     without Redis.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::atoms::error::GatewayResult;
use crate::atoms::traits::KvStore;

// ── Redis backend ──────────────────────────────────────────────────────────

/// Atomic increment-and-expire. EXPIRE fires only when the INCRBY created
/// the key (post-increment value equals the delta), which keys the tumbling
/// window from the first increment.
const INCR_WITH_TTL_SCRIPT: &str = r"
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if v == tonumber(ARGV[1]) then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return v
";

pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
    incr_script: redis::Script,
}

impl RedisKv {
    pub async fn connect(addr: &str, password: Option<&str>, db: i64) -> GatewayResult<Self> {
        let url = match password {
            Some(pw) if !pw.is_empty() => format!("redis://:{pw}@{addr}/{db}"),
            _ => format!("redis://{addr}/{db}"),
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        log::info!("[store] Connected to key-value store at {addr} (db {db})");
        Ok(RedisKv {
            conn,
            incr_script: redis::Script::new(INCR_WITH_TTL_SCRIPT),
        })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> GatewayResult<i64> {
        let mut conn = self.conn.clone();
        let v: i64 = self
            .incr_script
            .key(key)
            .arg(delta)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(v)
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn.clone();
        let v: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(v)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> GatewayResult<Option<HashMap<String, String>>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> GatewayResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> GatewayResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let t: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(if t < 0 { None } else { Some(t) })
    }
}

// ── In-memory twin ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Entry {
    Counter(i64),
    Value(String),
    Hash(HashMap<String, String>),
}

struct MemEntry {
    entry: Entry,
    expires_at: Option<Instant>,
}

/// In-process `KvStore`. A single mutex over the whole map gives every
/// operation the same atomicity as the Redis scripts.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, MemEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(map: &mut HashMap<String, MemEntry>, key: &str) {
        if let Some(e) = map.get(key) {
            if let Some(at) = e.expires_at {
                if Instant::now() >= at {
                    map.remove(key);
                }
            }
        }
    }

    /// Remaining TTL of a key, for tests asserting expiry was set.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let map = self.inner.lock();
        map.get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr_with_ttl(&self, key: &str, delta: i64, ttl_secs: u64) -> GatewayResult<i64> {
        let mut map = self.inner.lock();
        Self::purge_expired(&mut map, key);
        match map.get_mut(key) {
            Some(MemEntry { entry: Entry::Counter(v), .. }) => {
                *v += delta;
                Ok(*v)
            }
            _ => {
                map.insert(
                    key.to_string(),
                    MemEntry {
                        entry: Entry::Counter(delta),
                        expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut map = self.inner.lock();
        Self::purge_expired(&mut map, key);
        Ok(match map.get(key) {
            Some(MemEntry { entry: Entry::Value(s), .. }) => Some(s.clone()),
            Some(MemEntry { entry: Entry::Counter(v), .. }) => Some(v.to_string()),
            _ => None,
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> GatewayResult<()> {
        let mut map = self.inner.lock();
        map.insert(
            key.to_string(),
            MemEntry {
                entry: Entry::Value(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> GatewayResult<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> GatewayResult<Option<HashMap<String, String>>> {
        let mut map = self.inner.lock();
        Self::purge_expired(&mut map, key);
        Ok(match map.get(key) {
            Some(MemEntry { entry: Entry::Hash(h), .. }) => Some(h.clone()),
            _ => None,
        })
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> GatewayResult<()> {
        let mut map = self.inner.lock();
        match map.get_mut(key) {
            Some(MemEntry { entry: Entry::Hash(h), .. }) => {
                h.extend(fields.clone());
            }
            _ => {
                map.insert(
                    key.to_string(),
                    MemEntry { entry: Entry::Hash(fields.clone()), expires_at: None },
                );
            }
        }
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> GatewayResult<Vec<String>> {
        // Glob support limited to a trailing '*', which is all the key
        // layouts use.
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let now = Instant::now();
        let map = self.inner.lock();
        Ok(map
            .iter()
            .filter(|(k, e)| {
                k.starts_with(prefix) && e.expires_at.map(|at| now < at).unwrap_or(true)
            })
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn ttl(&self, key: &str) -> GatewayResult<Option<i64>> {
        Ok(self
            .ttl_remaining(key)
            .map(|d| d.as_secs() as i64))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
