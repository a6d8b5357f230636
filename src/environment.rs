// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A keyed store shared by every `Task` executed by one `Worker`. Entries
/// may carry a TTL; expiry is lazy, checked on access, never by a
/// background sweep. Not shared across workers, not transactional.
///
/// Locking is internal and per-call, not held for the duration of a
/// `Task::run` — `Task::run` takes `&Environment`, so two jobs on the same
/// worker only ever contend for the instant either one actually reads or
/// writes an entry, never for the rest of their work. `child::spawn_job`
/// relies on this to run jobs concurrently on one worker.
#[derive(Default)]
pub struct Environment {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a value, evicting it first if its TTL has lapsed.
    pub fn get<V: Any + Clone>(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        evict_if_expired(&mut entries, key);
        entries.get(key).and_then(|e| e.value.downcast_ref::<V>()).cloned()
    }

    pub fn set<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.lock().insert(
            key.into(),
            Entry {
                value: Box::new(value),
                expires_at,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of live entries, counting lazily expired ones as absent.
    pub fn size(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.remove(&key);
        }
        entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn evict_if_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    let expired = entries.get(key).map(|e| e.is_expired(Instant::now())).unwrap_or(false);
    if expired {
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_then_get_round_trips() {
        let env = Environment::new();
        env.set("count", 42i32, None);
        assert_eq!(env.get::<i32>("count"), Some(42));
    }

    #[test]
    fn missing_key_is_none() {
        let env = Environment::new();
        assert_eq!(env.get::<i32>("missing"), None);
    }

    #[test]
    fn delete_removes_entry() {
        let env = Environment::new();
        env.set("k", "v".to_string(), None);
        env.delete("k");
        assert_eq!(env.get::<String>("k"), None);
    }

    #[test]
    fn clear_empties_store() {
        let env = Environment::new();
        env.set("a", 1i32, None);
        env.set("b", 2i32, None);
        env.clear();
        assert_eq!(env.size(), 0);
    }

    #[test]
    fn expired_entry_is_treated_as_absent() {
        let env = Environment::new();
        env.set("k", "v".to_string(), Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(env.get::<String>("k"), None);
        assert_eq!(env.size(), 0);
    }

    #[test]
    fn size_counts_live_entries_only() {
        let env = Environment::new();
        env.set("a", 1i32, None);
        env.set("b", 2i32, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(env.size(), 1);
    }
}
