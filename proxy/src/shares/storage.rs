/// Share and block persistence
///
/// Handles:
/// - Round share credit (shares:roundCurrent)
/// - Duplicate guard per (login, nonce, witness)
/// - Hashrate samples (hashrate, hashrate:<login>)
/// - Block candidates (blocks:candidates) and round close
/// - Node state heartbeat (nodes)
///
/// Uses redis::aio::ConnectionManager for async operations. Every call,
/// connection setup included, is bounded by the configured timeout.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use num_bigint::BigUint;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;

use super::solution::Solution;

/// A share to credit.
#[derive(Debug, Clone)]
pub struct ShareRecord {
    pub login: String,
    pub worker: String,
    pub solution: Solution,
    pub share_difficulty: u64,
    pub height: u64,
    pub expiration: Duration,
}

/// A solution the node accepted as a block.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub login: String,
    pub worker: String,
    pub solution: Solution,
    pub share_difficulty: u64,
    pub network_difficulty: BigUint,
    pub height: u64,
    pub expiration: Duration,
    pub header: String,
}

/// Durable accounting backend.
#[async_trait]
pub trait ShareStorage: Send + Sync {
    /// Credit a share. Returns `true` when the same share was already
    /// recorded; nothing is credited in that case.
    async fn write_share(&self, share: &ShareRecord) -> Result<bool>;

    async fn write_block(&self, block: &BlockRecord) -> Result<()>;

    async fn write_node_state(&self, name: &str, height: u64, difficulty: &BigUint) -> Result<()>;

    /// Backend reachability, for the health endpoint.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Closes the current round and registers the block candidate in one step.
///
/// KEYS: roundCurrent, closed round, candidates, finders, notification channel
/// ARGV: candidate member, height, login, notification
const CLOSE_ROUND_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('RENAME', KEYS[1], KEYS[2])
end
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
redis.call('HINCRBY', KEYS[4], ARGV[3], 1)
redis.call('PUBLISH', KEYS[5], ARGV[4])
return 1
"#;

/// Redis storage manager
pub struct RedisStorage {
    client: redis::Client,
    connection: RwLock<Option<redis::aio::ConnectionManager>>,
    prefix: String,
    timeout: Duration,
    close_round: redis::Script,
}

impl RedisStorage {
    pub fn new(redis_url: &str, prefix: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            prefix: prefix.to_string(),
            timeout,
            close_round: redis::Script::new(CLOSE_ROUND_SCRIPT),
        })
    }

    /// Run `op`, failing once the storage timeout elapses.
    async fn bounded<T>(&self, what: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| anyhow!("Redis {} timed out after {:?}", what, self.timeout))?
    }

    /// Get async connection (lazy initialization)
    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for p in parts {
            key.push(':');
            key.push_str(p);
        }
        key
    }
}

impl RedisStorage {
    /// Commands crediting a first-seen share, run as one MULTI/EXEC.
    fn credit_pipeline(&self, share: &ShareRecord, now: i64, expiration: u64) -> redis::Pipeline {
        let sample = format!("{}:{}:{}:{}", share.share_difficulty, share.login, share.worker, now);
        let cutoff = now - expiration as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hincr(self.key(&["shares", "roundCurrent"]), &share.login, share.share_difficulty)
            .ignore();
        // Hashrate samples, pool-wide and per miner
        for key in [self.key(&["hashrate"]), self.key(&["hashrate", &share.login])] {
            pipe.zadd(&key, &sample, now)
                .ignore()
                .cmd("ZREMRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(format!("({}", cutoff))
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(expiration)
                .ignore();
        }
        pipe.hset(self.key(&["miners", &share.login]), "lastShare", now)
            .ignore();
        pipe
    }

    async fn store_share(&self, share: &ShareRecord) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let now = Utc::now().timestamp();
        let expiration = share.expiration.as_secs().max(1);

        let guard_key = self.key(&["shares", "seen", &share.login, &share.solution.share_key()]);
        let first: Option<String> = redis::cmd("SET")
            .arg(&guard_key)
            .arg(share.height)
            .arg("NX")
            .arg("EX")
            .arg(expiration)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to set duplicate guard: {}", e))?;
        if first.is_none() {
            return Ok(true);
        }

        let credited: redis::RedisResult<()> = self
            .credit_pipeline(share, now, expiration)
            .query_async(&mut conn)
            .await;
        if let Err(e) = credited {
            // Release the guard so a resubmit gets credited
            let released: redis::RedisResult<()> = conn.del(&guard_key).await;
            if let Err(del_err) = released {
                tracing::error!("Failed to release duplicate guard {}: {}", guard_key, del_err);
            }
            return Err(anyhow!("Failed to credit share: {}", e));
        }

        Ok(false)
    }

    async fn store_block(&self, block: &BlockRecord) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let now = Utc::now().timestamp();

        let candidate = format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            block.solution.n,
            block.header,
            block.solution.distance(),
            now,
            block.network_difficulty,
            block.share_difficulty,
            block.login,
            block.worker
        );
        let notif = serde_json::json!({
            "height": block.height,
            "header": block.header,
            "login": block.login,
            "worker": block.worker,
            "timestamp": now,
        });

        let closed: redis::RedisResult<()> = self
            .close_round
            .key(self.key(&["shares", "roundCurrent"]))
            .key(self.key(&["shares", &format!("round{}", block.height), &block.solution.n]))
            .key(self.key(&["blocks", "candidates"]))
            .key(self.key(&["finders"]))
            .key(self.key(&["blocks"]))
            .arg(&candidate)
            .arg(block.height)
            .arg(&block.login)
            .arg(notif.to_string())
            .invoke_async(&mut conn)
            .await;
        closed.map_err(|e| anyhow!("Failed to close round for block candidate: {}", e))
    }

    async fn store_node_state(&self, name: &str, height: u64, difficulty: &BigUint) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let now = Utc::now().timestamp();

        let fields = [
            (format!("{}:name", name), name.to_string()),
            (format!("{}:height", name), height.to_string()),
            (format!("{}:difficulty", name), difficulty.to_string()),
            (format!("{}:lastBeat", name), now.to_string()),
        ];
        conn.hset_multiple::<_, _, _, ()>(self.key(&["nodes"]), &fields)
            .await
            .map_err(|e| anyhow!("Failed to write node state: {}", e))?;

        Ok(())
    }

    async fn ping_backend(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis PING failed: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl ShareStorage for RedisStorage {
    async fn write_share(&self, share: &ShareRecord) -> Result<bool> {
        self.bounded("share write", self.store_share(share)).await
    }

    async fn write_block(&self, block: &BlockRecord) -> Result<()> {
        self.bounded("block write", self.store_block(block)).await
    }

    async fn write_node_state(&self, name: &str, height: u64, difficulty: &BigUint) -> Result<()> {
        self.bounded("node state write", self.store_node_state(name, height, difficulty))
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", self.ping_backend()).await
    }
}
