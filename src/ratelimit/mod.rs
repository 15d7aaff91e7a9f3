use anyhow::Result;
use once_cell::sync::OnceCell;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::config;
use crate::secrets::SecretIndex;

// Token bucket: state is (tokens, last-refill timestamp), refilled by
// elapsed time, clamped at the burst size.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local burst = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local tokens = burst
local last = now
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
if state[1] then
  tokens = tonumber(state[1])
  last = tonumber(state[2])
end

tokens = math.min(burst, tokens + math.max(0, now - last) * refill)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now)
redis.call('EXPIRE', KEYS[1], ttl)
return allowed
"#;

/// Redis-backed token bucket. Keys are HMAC-derived from the caller scope
/// so the limiter database never sees API keys or client addresses in
/// plaintext.
pub struct RateLimiter {
    redis: ConnectionManager,
    script: redis::Script,
}

impl RateLimiter {
    pub async fn new() -> Result<Self> {
        let settings = config::get_settings();
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let redis = ConnectionManager::new(client).await?;
        Ok(RateLimiter {
            redis,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// Take one token from the bucket for `scope`. A limiter backend outage
    /// does not block issuance.
    pub async fn allow(
        &self,
        secrets: &SecretIndex,
        scope: &str,
        burst: i64,
        refill_per_sec: f64,
    ) -> bool {
        let key = format!("rl:{}", secrets.rate_limit_key(scope));
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

        // Bucket state is garbage after the bucket would have fully
        // refilled anyway.
        let ttl = ((burst as f64 / refill_per_sec.max(0.001)).ceil() as i64).clamp(60, 86400);

        let mut conn = self.redis.clone();
        let result: redis::RedisResult<i64> = self
            .script
            .key(&key)
            .arg(burst)
            .arg(refill_per_sec)
            .arg(now)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(allowed) => allowed == 1,
            Err(e) => {
                warn!(error = %e, "rate limiter backend unavailable, allowing request");
                true
            }
        }
    }
}

static RATE_LIMITER: OnceCell<RateLimiter> = OnceCell::new();

pub async fn init_ratelimit() -> Result<()> {
    if RATE_LIMITER.get().is_some() {
        return Ok(());
    }
    let limiter = RateLimiter::new().await?;
    RATE_LIMITER.set(limiter).ok();
    info!("Rate limiter initialized");
    Ok(())
}

pub fn get_ratelimit() -> &'static RateLimiter {
    RATE_LIMITER.get().expect("Rate limiter not initialized")
}
