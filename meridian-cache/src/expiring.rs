//! Clock-driven set whose members expire after a fixed window.
//!
//! Used for pending invalidations: keys a peer announced as deleted stay
//! provisionally stale until the window passes or a fresh write clears them.
//! Members live in a map keyed by name with a deadline-ordered index beside
//! it, so purging touches only what has actually expired.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use meridian_core::{SharedClock, Timestamp};

#[derive(Debug, Default)]
struct Members {
    deadlines: HashMap<String, Timestamp>,
    by_deadline: BTreeSet<(Timestamp, String)>,
}

impl Members {
    fn purge(&mut self, now: Timestamp) {
        while let Some((deadline, _)) = self.by_deadline.first() {
            if *deadline > now {
                break;
            }
            if let Some((_, key)) = self.by_deadline.pop_first() {
                self.deadlines.remove(&key);
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.deadlines.remove(key) {
            Some(deadline) => {
                self.by_deadline.remove(&(deadline, key.to_string()));
                true
            }
            None => false,
        }
    }
}

/// A set of keys that each expire `window` after they were last marked.
#[derive(Debug)]
pub struct ExpiringSet {
    clock: SharedClock,
    window: Duration,
    members: Mutex<Members>,
}

impl ExpiringSet {
    pub fn new(clock: SharedClock, window: Duration) -> Self {
        Self {
            clock,
            window,
            members: Mutex::new(Members::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `key`, restarting its window if already present.
    pub fn mark(&self, key: &str) {
        let now = self.clock.now();
        let deadline = now
            + chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::days(1));
        let mut members = self.lock();
        members.purge(now);
        members.remove(key);
        members.deadlines.insert(key.to_string(), deadline);
        members.by_deadline.insert((deadline, key.to_string()));
    }

    /// Whether `key` is marked and its window has not passed.
    pub fn contains(&self, key: &str) -> bool {
        let mut members = self.lock();
        members.purge(self.clock.now());
        members.deadlines.contains_key(key)
    }

    /// Drop `key` early. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut members = self.lock();
        members.purge(self.clock.now());
        members.remove(key)
    }

    pub fn clear(&self) {
        let mut members = self.lock();
        members.deadlines.clear();
        members.by_deadline.clear();
    }

    /// Live members.
    pub fn len(&self) -> usize {
        let mut members = self.lock();
        members.purge(self.clock.now());
        members.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
