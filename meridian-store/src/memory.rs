//! In-memory store.
//!
//! A single mutex guards the keyspace so every batch is atomic; a failing
//! command rolls back the slots the batch already touched.
//! Expiry is evaluated lazily against the injected clock, which lets tests
//! expire entries by advancing a [`meridian_core::ManualClock`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use meridian_core::{GlobPattern, SharedClock, StoreError, SystemClock, Timestamp};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    Batch, Command, KeyValueStore, Reply, StoreInfo, StoreMessage, StoreResult, Subscription,
};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    /// Drop `key` if it has expired, then return it.
    fn live(&mut self, key: &str, now: Timestamp) -> Option<&mut Slot> {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| now >= at);
        if expired {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn purge_expired(&mut self, now: Timestamp) {
        self.slots
            .retain(|_, slot| slot.expires_at.is_none_or(|at| now < at));
    }

    fn apply(&mut self, command: Command, now: Timestamp) -> StoreResult<Reply> {
        let name = command.name();
        match command {
            Command::Get { key } => match self.live(&key, now) {
                None => Ok(Reply::Nil),
                Some(Slot {
                    value: Value::Bytes(bytes),
                    ..
                }) => Ok(Reply::Bytes(bytes.clone())),
                Some(slot) => Err(wrong_type(name, slot)),
            },
            Command::Set { key, value, ttl } => {
                self.slots.insert(
                    key,
                    Slot {
                        value: Value::Bytes(value),
                        expires_at: ttl.map(|ttl| deadline(now, ttl)),
                    },
                );
                Ok(Reply::Ok)
            }
            Command::Delete { key } => {
                let existed = self.live(&key, now).is_some();
                self.slots.remove(&key);
                Ok(Reply::Int(i64::from(existed)))
            }
            Command::HashGetAll { key } => match self.live(&key, now) {
                None => Ok(Reply::Hash(HashMap::new())),
                Some(Slot {
                    value: Value::Hash(fields),
                    ..
                }) => Ok(Reply::Hash(fields.clone())),
                Some(slot) => Err(wrong_type(name, slot)),
            },
            Command::HashSet { key, fields } => {
                let slot = self.entry(&key, now, || Value::Hash(HashMap::new()));
                match &mut slot.value {
                    Value::Hash(existing) => {
                        let added = fields
                            .into_iter()
                            .filter(|(field, value)| {
                                existing.insert(field.clone(), value.clone()).is_none()
                            })
                            .count();
                        Ok(Reply::Int(added as i64))
                    }
                    _ => Err(wrong_type(name, slot)),
                }
            }
            Command::HashDelete { key, field } => {
                let (removed, now_empty) = match self.live(&key, now) {
                    None => (false, false),
                    Some(slot) => match &mut slot.value {
                        Value::Hash(fields) => (fields.remove(&field).is_some(), fields.is_empty()),
                        _ => return Err(wrong_type(name, slot)),
                    },
                };
                if now_empty {
                    self.slots.remove(&key);
                }
                Ok(Reply::Int(i64::from(removed)))
            }
            Command::HashDeleteUnlessExists { key, field, guard } => {
                if self.live(&guard, now).is_some() {
                    return Ok(Reply::Int(0));
                }
                self.apply(Command::HashDelete { key, field }, now)
            }
            Command::Expire { key, ttl } => match self.live(&key, now) {
                None => Ok(Reply::Int(0)),
                Some(slot) => {
                    slot.expires_at = Some(deadline(now, ttl));
                    Ok(Reply::Int(1))
                }
            },
            Command::ExtendExpiry { key, ttl } => match self.live(&key, now) {
                None => Ok(Reply::Int(0)),
                Some(slot) => {
                    let candidate = deadline(now, ttl);
                    let extend = slot.expires_at.is_none_or(|current| current < candidate);
                    if extend {
                        slot.expires_at = Some(candidate);
                    }
                    Ok(Reply::Int(i64::from(extend)))
                }
            },
            Command::SetAdd { key, member } => {
                let slot = self.entry(&key, now, || Value::Set(BTreeSet::new()));
                match &mut slot.value {
                    Value::Set(members) => Ok(Reply::Int(i64::from(members.insert(member)))),
                    _ => Err(wrong_type(name, slot)),
                }
            }
            Command::SetRemove { key, member } => {
                let (removed, now_empty) = match self.live(&key, now) {
                    None => (false, false),
                    Some(slot) => match &mut slot.value {
                        Value::Set(members) => (members.remove(&member), members.is_empty()),
                        _ => return Err(wrong_type(name, slot)),
                    },
                };
                if now_empty {
                    self.slots.remove(&key);
                }
                Ok(Reply::Int(i64::from(removed)))
            }
        }
    }

    /// Put back the recorded slots, newest first.
    fn restore(&mut self, undo: Vec<(String, Option<Slot>)>) {
        for (key, prior) in undo.into_iter().rev() {
            match prior {
                Some(slot) => {
                    self.slots.insert(key, slot);
                }
                None => {
                    self.slots.remove(&key);
                }
            }
        }
    }

    fn entry(&mut self, key: &str, now: Timestamp, init: impl FnOnce() -> Value) -> &mut Slot {
        // Evict an expired predecessor before reusing the key.
        self.live(key, now);
        self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: init(),
            expires_at: None,
        })
    }
}

fn deadline(now: Timestamp, ttl: Duration) -> Timestamp {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn wrong_type(command: &str, slot: &Slot) -> StoreError {
    StoreError::CommandFailed {
        command: command.to_string(),
        reason: format!(
            "WRONGTYPE operation against a key holding a {}",
            slot.value.type_name()
        ),
    }
}

/// Single-process implementation of [`KeyValueStore`].
///
/// Share one instance (behind an `Arc`) between several cache nodes to
/// simulate a cluster. Publish/subscribe is backed by a tokio broadcast
/// channel; slow subscribers lose messages exactly like a real broker would
/// drop them for a disconnected client.
#[derive(Debug)]
pub struct InMemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: SharedClock,
    bus: broadcast::Sender<StoreMessage>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Store driven by the given clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self::with_clock_and_capacity(clock, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_clock_and_capacity(clock: SharedClock, channel_capacity: usize) -> Self {
        let (bus, _rx) = broadcast::channel(channel_capacity.max(1));
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
            bus,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Remaining lifetime of a key, `None` if missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut keyspace = self.lock();
        keyspace
            .live(key, now)
            .and_then(|slot| slot.expires_at)
            .and_then(|at| (at - now).to_std().ok())
    }

    /// Whether a key currently exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock().live(key, now).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn run(&self, command: Command) -> StoreResult<Reply> {
        self.ensure_available()?;
        let now = self.clock.now();
        self.lock().apply(command, now)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .run(Command::Get {
                key: key.to_string(),
            })?
            .into_bytes())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        self.run(Command::Set {
            key: key.to_string(),
            value,
            ttl,
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let reply = self.run(Command::Delete {
            key: key.to_string(),
        })?;
        Ok(reply.as_int() > 0)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut keyspace = self.lock();
        if keyspace.live(key, now).is_some() {
            return Ok(false);
        }
        keyspace.apply(
            Command::Set {
                key: key.to_string(),
                value: value.as_bytes().to_vec(),
                ttl: Some(ttl),
            },
            now,
        )?;
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut keyspace = self.lock();
        let matches = match keyspace.live(key, now) {
            Some(Slot {
                value: Value::Bytes(bytes),
                ..
            }) => bytes.as_slice() == expected.as_bytes(),
            _ => false,
        };
        if matches {
            keyspace.slots.remove(key);
        }
        Ok(matches)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .run(Command::HashGetAll {
                key: key.to_string(),
            })?
            .into_hash())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hash_get_all(key).await?.remove(field))
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut keyspace = self.lock();
        match keyspace.live(key, now) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(slot) => Err(wrong_type("SMEMBERS", slot)),
        }
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        let glob = GlobPattern::new(pattern).map_err(|e| StoreError::CommandFailed {
            command: "SCAN".to_string(),
            reason: e.to_string(),
        })?;
        let now = self.clock.now();
        let mut keyspace = self.lock();
        keyspace.purge_expired(now);
        let mut keys: Vec<String> = keyspace
            .slots
            .keys()
            .filter(|key| glob.matches(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn execute(&self, batch: Batch) -> StoreResult<Vec<Reply>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut keyspace = self.lock();

        // Each command touches one key; remember its prior slot so a
        // failing command can roll the batch back.
        let commands = batch.into_commands();
        let mut undo: Vec<(String, Option<Slot>)> = Vec::with_capacity(commands.len());
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let key = command.key().to_string();
            let prior = keyspace.slots.get(&key).cloned();
            undo.push((key, prior));
            match keyspace.apply(command, now) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    keyspace.restore(undo);
                    return Err(e);
                }
            }
        }
        Ok(replies)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StoreResult<usize> {
        self.ensure_available()?;
        let message = StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        match self.bus.send(message) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                debug!(channel = channel, "No subscribers for message");
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        self.ensure_available()?;
        let rx = self.bus.subscribe();
        let channels: BTreeSet<String> = channels.iter().cloned().collect();

        let messages = stream::unfold((rx, channels), |(mut rx, channels)| async move {
            loop {
                match rx.recv().await {
                    Ok(message) if channels.contains(&message.channel) => {
                        return Some((message, (rx, channels)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Subscriber lagged, messages were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(messages))
    }

    async fn db_size(&self) -> StoreResult<u64> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut keyspace = self.lock();
        keyspace.purge_expired(now);
        Ok(keyspace.slots.len() as u64)
    }

    async fn info(&self) -> StoreResult<StoreInfo> {
        let key_count = self.db_size().await?;
        let mut details = HashMap::new();
        details.insert(
            "subscribers".to_string(),
            self.bus.receiver_count().to_string(),
        );
        Ok(StoreInfo {
            backend: "memory".to_string(),
            key_count,
            details,
        })
    }
}
