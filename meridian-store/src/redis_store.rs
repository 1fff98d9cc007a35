//! Redis-backed store.
//!
//! Batches run as MULTI/EXEC pipelines. Compare-and-delete, guarded hash
//! deletes and extend-only expiry run as Lua scripts. Subscriptions use a
//! dedicated pub/sub connection per subscriber.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use meridian_core::{StoreConfig, StoreError};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use tracing::{debug, info};

use crate::{
    Batch, Command, KeyValueStore, Reply, StoreInfo, StoreMessage, StoreResult, Subscription,
};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const HASH_DELETE_UNLESS_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
return redis.call('HDEL', KEYS[1], ARGV[1])
"#;

// PTTL is -1 for keys without expiry, so those always receive one.
const EXTEND_EXPIRY: &str = r#"
local current = redis.call('PTTL', KEYS[1])
if current == -2 then
    return 0
end
if current < tonumber(ARGV[1]) then
    return redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

const SCAN_COUNT: usize = 500;

/// Expected shape of a pipeline reply.
#[derive(Debug, Clone, Copy)]
enum Shape {
    Bytes,
    Hash,
    Int,
    Ok,
}

impl Shape {
    fn of(command: &Command) -> Self {
        match command {
            Command::Get { .. } => Shape::Bytes,
            Command::HashGetAll { .. } => Shape::Hash,
            Command::Set { .. } => Shape::Ok,
            _ => Shape::Int,
        }
    }
}

/// [`KeyValueStore`] over a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    config: StoreConfig,
}

impl RedisStore {
    /// Connect using the given configuration.
    pub async fn connect(config: StoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| StoreError::Connection {
            reason: e.to_string(),
        })?;

        let conn = tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout {
            after: config.connect_timeout,
        })?
        .map_err(|e| StoreError::Connection {
            reason: e.to_string(),
        })?;

        info!(url = %config.url, "Connected to Redis store");
        Ok(Self {
            client,
            conn,
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn store_error(command: &'static str) -> impl Fn(RedisError) -> StoreError {
    move |e| {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Connection {
                reason: e.to_string(),
            }
        } else {
            StoreError::CommandFailed {
                command: command.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn protocol_error(command: &str, e: RedisError) -> StoreError {
    StoreError::Protocol {
        command: command.to_string(),
        reason: e.to_string(),
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn to_reply(shape: Shape, command: &str, value: &redis::Value) -> StoreResult<Reply> {
    match shape {
        Shape::Bytes => {
            let bytes: Option<Vec<u8>> =
                redis::from_redis_value(value).map_err(|e| protocol_error(command, e))?;
            Ok(bytes.map(Reply::Bytes).unwrap_or(Reply::Nil))
        }
        Shape::Hash => {
            let fields: HashMap<String, String> =
                redis::from_redis_value(value).map_err(|e| protocol_error(command, e))?;
            Ok(Reply::Hash(fields))
        }
        Shape::Int => {
            let n: i64 = redis::from_redis_value(value).map_err(|e| protocol_error(command, e))?;
            Ok(Reply::Int(n))
        }
        Shape::Ok => Ok(Reply::Ok),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.connection();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error("GET"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(store_error("SET"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error("DEL"))?;
        Ok(removed > 0)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection();
        let reply: redis::Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error("SET NX"))?;
        Ok(!matches!(reply, redis::Value::Nil))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let removed: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("EVALSHA"))?;
        Ok(removed > 0)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error("HGETALL"))?;
        Ok(fields)
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(store_error("HGET"))?;
        Ok(value)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error("SMEMBERS"))?;
        Ok(members)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(store_error("SCAN"))?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn execute(&self, batch: Batch) -> StoreResult<Vec<Reply>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let commands = batch.into_commands();
        let shapes: Vec<(Shape, &'static str)> = commands
            .iter()
            .map(|command| (Shape::of(command), command.name()))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in commands {
            match command {
                Command::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                Command::Set { key, value, ttl } => {
                    pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        pipe.arg("PX").arg(millis(ttl));
                    }
                }
                Command::Delete { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                Command::HashGetAll { key } => {
                    pipe.cmd("HGETALL").arg(key);
                }
                Command::HashSet { key, fields } => {
                    pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        pipe.arg(field).arg(value);
                    }
                }
                Command::HashDelete { key, field } => {
                    pipe.cmd("HDEL").arg(key).arg(field);
                }
                Command::HashDeleteUnlessExists { key, field, guard } => {
                    pipe.cmd("EVAL")
                        .arg(HASH_DELETE_UNLESS_EXISTS)
                        .arg(2)
                        .arg(key)
                        .arg(guard)
                        .arg(field);
                }
                Command::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl));
                }
                Command::ExtendExpiry { key, ttl } => {
                    pipe.cmd("EVAL")
                        .arg(EXTEND_EXPIRY)
                        .arg(1)
                        .arg(key)
                        .arg(millis(ttl));
                }
                Command::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member);
                }
                Command::SetRemove { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member);
                }
            }
        }
        debug!(commands = shapes.len(), "Executing pipeline");

        let mut conn = self.connection();
        let raw: Vec<redis::Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(store_error("EXEC"))?;

        if raw.len() != shapes.len() {
            return Err(StoreError::Protocol {
                command: "EXEC".to_string(),
                reason: format!("expected {} replies, got {}", shapes.len(), raw.len()),
            });
        }

        shapes
            .iter()
            .zip(raw.iter())
            .map(|((shape, name), value)| to_reply(*shape, name, value))
            .collect()
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<usize> {
        let mut conn = self.connection();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(store_error("PUBLISH"))?;
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(store_error("SUBSCRIBE"))?;
        for channel in channels {
            pubsub
                .subscribe(channel.as_str())
                .await
                .map_err(store_error("SUBSCRIBE"))?;
        }

        let messages = pubsub.into_on_message().map(|msg| StoreMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(Box::pin(messages))
    }

    async fn db_size(&self) -> StoreResult<u64> {
        let mut conn = self.connection();
        let size: u64 = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(store_error("DBSIZE"))?;
        Ok(size)
    }

    async fn info(&self) -> StoreResult<StoreInfo> {
        let mut conn = self.connection();
        let raw: String = redis::cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(store_error("INFO"))?;
        let details = raw
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Ok(StoreInfo {
            backend: "redis".to_string(),
            key_count: self.db_size().await?,
            details,
        })
    }
}
