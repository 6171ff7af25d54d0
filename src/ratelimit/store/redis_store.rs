//! Redis-backed shared quota store.
//!
//! Each mutating primitive is a single Lua script, so the check and the update
//! execute atomically on the server in one round trip.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::{
    BucketOutcome, BucketSpec, BucketState, QuotaStore, WindowOutcome, WindowState, TOKEN_EPSILON,
};
use crate::error::{GatekeeperError, Result};

const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local hits = tonumber(ARGV[3])

local current = redis.call('GET', key)
if not current then
  if hits > limit then
    return {0, 0, window_ms}
  end
  redis.call('SET', key, hits, 'PX', window_ms)
  return {1, hits, window_ms}
end

current = tonumber(current)
local ttl = redis.call('PTTL', key)
if ttl < 0 then
  redis.call('PEXPIRE', key, window_ms)
  ttl = window_ms
end

if current + hits > limit then
  return {0, current, ttl}
end

current = redis.call('INCRBY', key, hits)
return {1, current, ttl}
"#;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local hits = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local nonce = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
local count = redis.call('ZCARD', key)
local allowed = 0

if count + hits <= limit then
  for i = 1, hits do
    redis.call('ZADD', key, now, nonce .. ':' .. i)
  end
  count = count + hits
  allowed = 1
  redis.call('PEXPIRE', key, window_ms)
end

local ttl = window_ms
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
  ttl = math.max(0, tonumber(oldest[2]) + window_ms - now)
end
return {allowed, count, ttl}
"#;

const SLIDING_WINDOW_PEEK_SCRIPT: &str = r#"
local key = KEYS[1]
local horizon = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local count = redis.call('ZCOUNT', key, '(' .. horizon, '+inf')
local ttl = 0
local oldest = redis.call('ZRANGEBYSCORE', key, '(' .. horizon, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
if oldest[2] then
  ttl = math.max(0, tonumber(oldest[2]) + window_ms - now)
end
return {count, ttl}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local hits = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local epsilon = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * refill_per_sec / 1000)

local allowed = 0
if tokens + epsilon >= hits then
  tokens = math.max(0, tokens - hits)
  allowed = 1
end

local full_in = math.ceil((capacity - tokens) * 1000 / refill_per_sec)
redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', math.max(ts, now))
redis.call('PEXPIRE', key, full_in + 1000)
return {allowed, tostring(tokens)}
"#;

/// A [`QuotaStore`] backed by a Redis server.
pub struct RedisStore {
    conn: ConnectionManager,
    fixed_window: Script,
    sliding_window: Script,
    sliding_window_peek: Script,
    token_bucket: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %redacted(url), "Connected to Redis quota store");

        Ok(Self {
            conn,
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            sliding_window_peek: Script::new(SLIDING_WINDOW_PEEK_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }
}

/// Strip credentials from a connection URL before logging it.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn parse_tokens(raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| GatekeeperError::StoreUnavailable(format!("malformed token count {raw}: {e}")))
}

#[async_trait]
impl QuotaStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        hits: u64,
        _now_ms: u64,
    ) -> Result<WindowOutcome> {
        let mut conn = self.conn.clone();
        let (allowed, count, ttl): (i64, i64, i64) = self
            .fixed_window
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .arg(hits)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count: to_u64(count),
            ttl_ms: to_u64(ttl),
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        hits: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let nonce = format!("{}-{:016x}", now_ms, rand::random::<u64>());
        let mut conn = self.conn.clone();
        let (allowed, count, ttl): (i64, i64, i64) = self
            .sliding_window
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .arg(hits)
            .arg(now_ms)
            .arg(nonce)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count: to_u64(count),
            ttl_ms: to_u64(ttl),
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        hits: u64,
        now_ms: u64,
    ) -> Result<BucketOutcome> {
        let mut conn = self.conn.clone();
        let (allowed, tokens): (i64, String) = self
            .token_bucket
            .key(key)
            .arg(spec.capacity)
            .arg(spec.refill_per_sec)
            .arg(hits)
            .arg(now_ms)
            .arg(TOKEN_EPSILON)
            .invoke_async(&mut conn)
            .await?;

        let tokens = parse_tokens(&tokens)?;
        let allowed = allowed == 1;
        Ok(BucketOutcome {
            allowed,
            tokens,
            retry_after_ms: if allowed { 0 } else { spec.retry_after_ms(tokens, hits) },
            full_in_ms: spec.full_in_ms(tokens),
        })
    }

    async fn peek_fixed_window(&self, key: &str, _now_ms: u64) -> Result<WindowState> {
        let mut conn = self.conn.clone();
        let (count, ttl): (Option<u64>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;

        Ok(WindowState {
            count: count.unwrap_or(0),
            ttl_ms: to_u64(ttl),
        })
    }

    async fn peek_sliding_window(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowState> {
        let mut conn = self.conn.clone();
        let (count, ttl): (i64, i64) = self
            .sliding_window_peek
            .key(key)
            .arg(now_ms.saturating_sub(window_ms))
            .arg(window_ms)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowState {
            count: to_u64(count),
            ttl_ms: to_u64(ttl),
        })
    }

    async fn peek_token_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        now_ms: u64,
    ) -> Result<BucketState> {
        let mut conn = self.conn.clone();
        let (tokens, updated): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("ts")
            .query_async(&mut conn)
            .await?;

        let tokens = match (tokens, updated) {
            (Some(tokens), Some(updated)) => spec.refill(parse_tokens(&tokens)?, updated, now_ms),
            _ => spec.capacity as f64,
        };
        Ok(BucketState {
            tokens,
            full_in_ms: spec.full_in_ms(tokens),
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<u32> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u32 = conn.del(keys).await?;
        debug!(keys = ?keys, removed, "Deleted quota keys");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
