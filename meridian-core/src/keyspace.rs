//! Store key layout.
//!
//! ```text
//! <prefix>:data:<key>          cached value (string, TTL)
//! <prefix>:meta:<key>          entry metadata (hash, TTL)
//! <prefix>:tag:<tag>           tag index (set)
//! <prefix>:versions            authoritative version table (hash key -> version)
//! <prefix>:lock:<key>          stampede lock (string, TTL)
//! <prefix>:cache:changes       change channel
//! <prefix>:cache:invalidation  invalidation channel
//! ```

use crate::pattern::escape_glob;

/// Namespaced key builder shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn data(&self, key: &str) -> String {
        format!("{}:data:{}", self.prefix, key)
    }

    pub fn meta(&self, key: &str) -> String {
        format!("{}:meta:{}", self.prefix, key)
    }

    pub fn tag(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.prefix, tag)
    }

    pub fn versions(&self) -> String {
        format!("{}:versions", self.prefix)
    }

    pub fn lock(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    pub fn changes_channel(&self) -> String {
        format!("{}:cache:changes", self.prefix)
    }

    pub fn invalidation_channel(&self) -> String {
        format!("{}:cache:invalidation", self.prefix)
    }

    /// Store-level glob selecting the data keys whose cache key matches
    /// `pattern`. The prefix is matched literally.
    pub fn data_pattern(&self, pattern: &str) -> String {
        format!("{}:data:{}", escape_glob(&self.prefix), pattern)
    }

    /// Glob selecting every key in the namespace.
    pub fn namespace_pattern(&self) -> String {
        format!("{}:*", escape_glob(&self.prefix))
    }

    /// Recover the cache key from a data key.
    pub fn key_from_data<'a>(&self, store_key: &'a str) -> Option<&'a str> {
        store_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(":data:"))
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("meridian")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GlobPattern;

    #[test]
    fn test_layout() {
        let ks = KeySpace::new("app");
        assert_eq!(ks.data("user:1"), "app:data:user:1");
        assert_eq!(ks.meta("user:1"), "app:meta:user:1");
        assert_eq!(ks.tag("users"), "app:tag:users");
        assert_eq!(ks.versions(), "app:versions");
        assert_eq!(ks.lock("user:1"), "app:lock:user:1");
        assert_eq!(ks.changes_channel(), "app:cache:changes");
        assert_eq!(ks.invalidation_channel(), "app:cache:invalidation");
        assert_eq!(ks.data_pattern("user:*"), "app:data:user:*");
    }

    #[test]
    fn test_key_from_data_round_trips() {
        let ks = KeySpace::default();
        let store_key = ks.data("a:b:c");
        assert_eq!(ks.key_from_data(&store_key), Some("a:b:c"));
        assert_eq!(ks.key_from_data("meridian:meta:a"), None);
        assert_eq!(ks.key_from_data("other:data:a"), None);
    }

    #[test]
    fn test_patterns_match_prefix_literally() {
        let ks = KeySpace::new("svc?[1]");
        assert_eq!(ks.namespace_pattern(), r"svc\?\[1\]:*");
        assert_eq!(ks.data_pattern("user:*"), r"svc\?\[1\]:data:user:*");

        let namespace = GlobPattern::new(&ks.namespace_pattern()).unwrap();
        assert!(namespace.matches("svc?[1]:data:k"));
        assert!(!namespace.matches("svcB1:data:k"));
        assert!(!namespace.matches("svcB[1]:versions"));
    }
}
