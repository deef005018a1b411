//! Count-min sketch rate limiter — an approximate per-key counter with
//! minute-aligned windows, TTL, and fail-open policy.
//!
//! FNV-1a is hand-rolled from the published constants rather than pulled in
//! as a dependency: no crate provides it anywhere in this codebase's
//! existing dependency tree, and the algorithm itself is a few lines of
//! well-known, non-novel arithmetic — the same tradeoff this codebase makes
//! elsewhere for small, stable algorithms that aren't worth a dependency.

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("redis error: {0}")]
    Redis(String),
}

impl From<redis::RedisError> for LimiterError {
    fn from(e: redis::RedisError) -> Self {
        LimiterError::Redis(e.to_string())
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub width: u32,
    pub depth: u32,
    pub window: std::time::Duration,
    pub key_prefix: String,
}

/// UTC time formatted at minute granularity, e.g. `2026-07-27T14:32`.
fn window_key() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M").to_string()
}

fn column(item: &str, row: u32, width: u32) -> u32 {
    let mut bytes = item.as_bytes().to_vec();
    bytes.extend_from_slice(&row.to_le_bytes());
    (fnv1a(&bytes) % width as u64) as u32
}

fn row_key(prefix: &str, window: &str, row: u32) -> String {
    format!("{}:{}:{}", prefix, window, row)
}

pub struct RateLimiter {
    conn: ConnectionManager,
    config: LimiterConfig,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager, config: LimiterConfig) -> Self {
        RateLimiter { conn, config }
    }

    /// For each of `depth` rows, increments the item's column by 1 in that
    /// row's hash, then sets the row's TTL to `2*window` (sliding
    /// tolerance). Pipelined into one round trip.
    pub async fn increment(&self, item: &str) -> Result<(), LimiterError> {
        let window = window_key();
        let ttl = (self.config.window.as_secs() * 2) as i64;
        let mut pipe = redis::pipe();
        for row in 0..self.config.depth {
            let key = row_key(&self.config.key_prefix, &window, row);
            let col = column(item, row, self.config.width).to_string();
            pipe.hincr(&key, col, 1i64).ignore();
            pipe.expire(&key, ttl).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// For each row, reads the item's column (missing = 0) and returns the
    /// minimum across rows. Pipelined.
    pub async fn count(&self, item: &str) -> Result<u64, LimiterError> {
        let window = window_key();
        let mut pipe = redis::pipe();
        for row in 0..self.config.depth {
            let key = row_key(&self.config.key_prefix, &window, row);
            let col = column(item, row, self.config.width).to_string();
            pipe.hget(&key, col);
        }
        let mut conn = self.conn.clone();
        let counts: Vec<Option<u64>> = pipe.query_async(&mut conn).await?;
        Ok(counts.into_iter().map(|c| c.unwrap_or(0)).min().unwrap_or(0))
    }

    /// `increment` then `count`. On either error, fails open: returns
    /// `allow = true` with the error attached for the caller to log.
    pub async fn allow(&self, item: &str, limit: u64) -> (bool, Option<LimiterError>) {
        if let Err(e) = self.increment(item).await {
            return (true, Some(e));
        }
        match self.count(item).await {
            Ok(count) => (count <= limit, None),
            Err(e) => (true, Some(e)),
        }
    }
}
