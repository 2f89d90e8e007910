// Redis-backed counter store shared by every gateway instance.
//
// Both window counters are bumped by one Lua script so the increment, the
// read-back and the first-write EXPIRE happen atomically on the server.

use super::store::{CounterStore, StoreError, WindowCounts, WindowIncrement};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sha1::{Digest, Sha1};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::OnceCell;

/// KEYS[1] = burst key, KEYS[2] = daily key,
/// ARGV = increment, burst ttl (s), daily ttl (s). Returns {burst, daily}.
const INCREMENT_WINDOWS_LUA: &str = r#"
local inc  = tonumber(ARGV[1])
local mttl = tonumber(ARGV[2])
local dttl = tonumber(ARGV[3])

local m = redis.call('INCRBY', KEYS[1], inc)
if m == inc then
  redis.call('EXPIRE', KEYS[1], mttl)
end

local d = redis.call('INCRBY', KEYS[2], inc)
if d == inc then
  redis.call('EXPIRE', KEYS[2], dttl)
end

return {m, d}
"#;

pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    script_sha: RwLock<String>,
    timeout: Duration,
}

impl RedisCounterStore {
    /// Parses the URL only; the connection is opened on first use so an
    /// unreachable store fails admissions instead of startup.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script_sha: RwLock::new(script_sha1(INCREMENT_WINDOWS_LUA)),
            timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                tracing::info!("Connecting to Redis counter store");
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| StoreError::Unreachable(e.to_string()))
            })
            .await?;
        Ok(manager.clone())
    }

    fn cached_sha(&self) -> String {
        match self.script_sha.read() {
            Ok(sha) => sha.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cached_sha(&self, sha: String) {
        match self.script_sha.write() {
            Ok(mut guard) => *guard = sha,
            Err(poisoned) => *poisoned.into_inner() = sha,
        }
    }

    async fn run_script(
        &self,
        burst: &WindowIncrement,
        daily: &WindowIncrement,
        amount: u64,
    ) -> Result<WindowCounts, StoreError> {
        let mut conn = self.connection().await?;

        let by_sha = script_command("EVALSHA", &self.cached_sha(), burst, daily, amount);
        let reply: redis::RedisResult<(u64, u64)> = by_sha.query_async(&mut conn).await;

        let (burst_count, daily_count) = match reply {
            Ok(counts) => counts,
            Err(err) if err.kind() == redis::ErrorKind::NoScriptError => {
                tracing::debug!("Rate-limit script not cached on server, sending full body");
                let by_body =
                    script_command("EVAL", INCREMENT_WINDOWS_LUA, burst, daily, amount);
                let counts: (u64, u64) = by_body
                    .query_async(&mut conn)
                    .await
                    .map_err(classify_error)?;
                self.reload_script(&mut conn).await;
                counts
            }
            Err(err) => return Err(classify_error(err)),
        };

        Ok(WindowCounts {
            burst: burst_count,
            daily: daily_count,
        })
    }

    async fn reload_script(&self, conn: &mut ConnectionManager) {
        let loaded: redis::RedisResult<String> = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(INCREMENT_WINDOWS_LUA)
            .query_async(conn)
            .await;
        match loaded {
            Ok(sha) => self.set_cached_sha(sha),
            // The EVAL already succeeded; the next call simply misses again.
            Err(err) => tracing::warn!("Failed to reload rate-limit script: {}", err),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_windows(
        &self,
        burst: &WindowIncrement,
        daily: &WindowIncrement,
        amount: u64,
    ) -> Result<WindowCounts, StoreError> {
        tokio::time::timeout(self.timeout, self.run_script(burst, daily, amount))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn script_command(
    verb: &str,
    script: &str,
    burst: &WindowIncrement,
    daily: &WindowIncrement,
    amount: u64,
) -> redis::Cmd {
    let mut cmd = redis::cmd(verb);
    cmd.arg(script)
        .arg(2)
        .arg(&burst.key)
        .arg(&daily.key)
        .arg(amount)
        .arg(ttl_secs(burst.ttl))
        .arg(ttl_secs(daily.ttl));
    cmd
}

// EXPIRE 0 would delete the key outright.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn classify_error(err: redis::RedisError) -> StoreError {
    if err.kind() == redis::ErrorKind::TypeError {
        StoreError::Protocol(err.to_string())
    } else {
        StoreError::Unreachable(err.to_string())
    }
}

fn script_sha1(script: &str) -> String {
    format!("{:x}", Sha1::digest(script.as_bytes()))
}
