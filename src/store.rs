//! Registry store — a strongly-typed wrapper over a hash-per-hostname Redis
//! key store, with scan, get-all, hash-field upsert, conditional-upsert,
//! per-key TTL, and delete.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Hash field names for the per-hostname registry entry, per §6's
/// "Registry store layout": `Fields are Registration, Health, Prometheus`.
/// `HeartbeatMessage`'s own serde renames (see `heartbeat.rs`) keep the
/// wire frames and these hash fields using the same names.
pub const FIELD_REGISTRATION: &str = "Registration";
pub const FIELD_HEALTH: &str = "Health";
pub const FIELD_PROMETHEUS: &str = "Prometheus";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("redis error: {0}")]
    Redis(String),
    #[error("conditional write missed: field {0} absent")]
    ConditionalMiss(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Redis(e.to_string())
    }
}

/// Write options for `Store::put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// If non-empty, the write is atomic with a pre-check that `key`
    /// already has this field; otherwise the write is a no-op (reported as
    /// `ConditionalMiss`).
    pub field_must_exist: Option<String>,
    /// Refresh the key's TTL to `Store`'s configured expiry on success.
    pub with_expire: bool,
}

/// Absent `field_must_exist` is checked first; if present, the write and
/// the pre-check happen inside a single `EVAL` so no client ever observes
/// (or causes) a read-then-write race against this conditional.
static CONDITIONAL_UPSERT: &str = r#"
if ARGV[2] ~= "" then
    if redis.call("HEXISTS", KEYS[1], ARGV[2]) == 0 then
        return 0
    end
end
redis.call("HSET", KEYS[1], ARGV[1], ARGV[3])
if ARGV[4] == "1" then
    redis.call("EXPIRE", KEYS[1], ARGV[5])
end
return 1
"#;

pub struct Store {
    conn: ConnectionManager,
    key_prefix: String,
    key_expiry_secs: u64,
}

impl Store {
    pub fn new(conn: ConnectionManager, key_prefix: String, key_expiry_secs: u64) -> Self {
        Store {
            conn,
            key_prefix,
            key_expiry_secs,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Serializes `value` as JSON and writes it as `field` of the hash at
    /// `key`. See `PutOptions` for the conditional/TTL behavior. The
    /// conditional check and the write happen in one scripted `EVAL`, never
    /// as a separate client-side read-then-write.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        field: &str,
        value: &T,
        opts: PutOptions,
    ) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_string(value).map_err(|e| StoreError::Serialize(e.to_string()))?;
        let full_key = self.full_key(key);
        let must_exist = opts.field_must_exist.unwrap_or_default();
        let with_expire = if opts.with_expire { "1" } else { "0" };

        let mut conn = self.conn.clone();
        let result: i64 = Script::new(CONDITIONAL_UPSERT)
            .key(&full_key)
            .arg(field)
            .arg(&must_exist)
            .arg(&encoded)
            .arg(with_expire)
            .arg(self.key_expiry_secs)
            .invoke_async(&mut conn)
            .await?;

        if result == 0 {
            return Err(StoreError::ConditionalMiss(must_exist));
        }
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.full_key(key)).await?;
        Ok(())
    }

    /// Iterates all matching keys with a cursor-scan, reads each key's hash,
    /// and deserializes into `V`. Returns the complete mapping, or on any
    /// per-key failure returns an error and no partial mapping.
    pub async fn get_all<V: DeserializeOwned>(&self) -> Result<HashMap<String, V>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut keys: Vec<String> = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        let mut out = HashMap::with_capacity(keys.len());
        for full_key in keys {
            let fields: HashMap<String, String> = conn.hgetall(&full_key).await?;
            let merged = serde_json::Map::from_iter(fields.into_iter().filter_map(
                |(field, json_value)| {
                    serde_json::from_str::<serde_json::Value>(&json_value)
                        .ok()
                        .map(|v| (field, v))
                },
            ));
            let value: V = serde_json::from_value(serde_json::Value::Object(merged))
                .map_err(|e| StoreError::Serialize(e.to_string()))?;
            let hostname = full_key
                .strip_prefix(&format!("{}:", self.key_prefix))
                .unwrap_or(&full_key)
                .to_string();
            out.insert(hostname, value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_options_default_has_no_conditional() {
        let opts = PutOptions::default();
        assert!(opts.field_must_exist.is_none());
        assert!(!opts.with_expire);
    }
}
