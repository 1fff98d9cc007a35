//! Batched command model.
//!
//! A [`Batch`] is an ordered list of [`Command`]s that a store executes
//! atomically: other observers see either none or all of its effects. Each
//! command yields one [`Reply`] at the same position.

use std::collections::HashMap;
use std::time::Duration;

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read a string value.
    Get { key: String },
    /// Write a string value, optionally expiring.
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Remove a key of any type. Replies with the number of keys removed.
    Delete { key: String },
    /// Read every field of a hash.
    HashGetAll { key: String },
    /// Write several fields of a hash.
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Remove one field of a hash. Replies with the number removed.
    HashDelete { key: String, field: String },
    /// Remove one field of a hash only while `guard` does not exist.
    /// Replies with the number removed.
    HashDeleteUnlessExists {
        key: String,
        field: String,
        guard: String,
    },
    /// Set a key's expiry. Replies 1 if the key exists.
    Expire { key: String, ttl: Duration },
    /// Lengthen a key's expiry to at least `ttl` from now; never shortens it.
    /// A key without an expiry receives one.
    ExtendExpiry { key: String, ttl: Duration },
    /// Add a member to a set. Replies with the number added.
    SetAdd { key: String, member: String },
    /// Remove a member from a set. Replies with the number removed.
    SetRemove { key: String, member: String },
}

impl Command {
    /// Store-protocol name, for logging and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Delete { .. } => "DEL",
            Command::HashGetAll { .. } => "HGETALL",
            Command::HashSet { .. } => "HSET",
            Command::HashDelete { .. } => "HDEL",
            Command::HashDeleteUnlessExists { .. } => "HDEL_UNLESS_EXISTS",
            Command::Expire { .. } => "PEXPIRE",
            Command::ExtendExpiry { .. } => "PEXPIRE_GT",
            Command::SetAdd { .. } => "SADD",
            Command::SetRemove { .. } => "SREM",
        }
    }

    /// The one key this command reads or writes.
    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Delete { key }
            | Command::HashGetAll { key }
            | Command::HashSet { key, .. }
            | Command::HashDelete { key, .. }
            | Command::HashDeleteUnlessExists { key, .. }
            | Command::Expire { key, .. }
            | Command::ExtendExpiry { key, .. }
            | Command::SetAdd { key, .. }
            | Command::SetRemove { key, .. } => key,
        }
    }
}

/// The reply to one command in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
}

impl Reply {
    /// Bytes of a string reply, `None` for nil.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Reply::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Fields of a hash reply; nil and non-hash replies are empty.
    pub fn into_hash(self) -> HashMap<String, String> {
        match self {
            Reply::Hash(fields) => fields,
            _ => HashMap::new(),
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Reply::Int(n) => *n,
            _ => 0,
        }
    }
}

/// An ordered group of commands executed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn get(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Get { key: key.into() })
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value,
            ttl,
        })
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Delete { key: key.into() })
    }

    pub fn hash_get_all(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::HashGetAll { key: key.into() })
    }

    pub fn hash_set(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.push(Command::HashSet {
            key: key.into(),
            fields,
        })
    }

    pub fn hash_delete(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.push(Command::HashDelete {
            key: key.into(),
            field: field.into(),
        })
    }

    pub fn hash_delete_unless_exists(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        guard: impl Into<String>,
    ) -> &mut Self {
        self.push(Command::HashDeleteUnlessExists {
            key: key.into(),
            field: field.into(),
            guard: guard.into(),
        })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn extend_expiry(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::ExtendExpiry {
            key: key.into(),
            ttl,
        })
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Command::SetAdd {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Command::SetRemove {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = Batch::new();
        batch
            .set("a", b"1".to_vec(), None)
            .hash_set("m", vec![("f".to_string(), "v".to_string())])
            .set_add("t", "a")
            .delete("b");

        let names: Vec<_> = batch.commands().iter().map(Command::name).collect();
        assert_eq!(names, vec!["SET", "HSET", "SADD", "DEL"]);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.commands()[1].key(), "m");
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(Reply::Bytes(b"x".to_vec()).into_bytes(), Some(b"x".to_vec()));
        assert_eq!(Reply::Nil.into_bytes(), None);
        assert!(Reply::Nil.into_hash().is_empty());
        assert_eq!(Reply::Int(3).as_int(), 3);
        assert_eq!(Reply::Ok.as_int(), 0);
    }
}
