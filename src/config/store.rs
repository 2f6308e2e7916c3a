//! `JobStore` / `KeyValueStore` trait abstractions (SPEC_FULL §6), so the
//! crate compiles and is testable without a live Postgres/Redis instance.
//! Real deployments bind these to `sqlx`/`redis` clients.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::OsmoResult;

/// Narrow relational-store abstraction: row-level-locked key/value rows plus
/// row counting, enough for job dedupe/retry bookkeeping and the operator
/// message worker's writes.
pub trait JobStore: Send + Sync {
    fn upsert(&self, table: &str, key: &str, value: &str) -> OsmoResult<()>;
    fn get(&self, table: &str, key: &str) -> OsmoResult<Option<String>>;
    fn delete(&self, table: &str, key: &str) -> OsmoResult<()>;
}

/// Narrow key/value-store abstraction covering the primitives §4.5/4.6 need:
/// plain keys with TTL, a counter, a list for the job queues' actual publish
/// path, and a sorted set for the delayed-job queue.
pub trait KeyValueStore: Send + Sync {
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> OsmoResult<bool>;
    fn get(&self, key: &str) -> OsmoResult<Option<String>>;
    fn delete(&self, key: &str) -> OsmoResult<()>;
    fn incr(&self, key: &str) -> OsmoResult<i64>;

    /// Appends `value` to the tail of the list at `key` (Redis `RPUSH`).
    fn list_push(&self, key: &str, value: &str) -> OsmoResult<()>;
    /// Pops and returns the head of the list at `key` (Redis `LPOP`), or
    /// `None` if empty.
    fn list_pop(&self, key: &str) -> OsmoResult<Option<String>>;

    fn zadd(&self, key: &str, member: &str, score: f64) -> OsmoResult<()>;
    fn zrangebyscore(&self, key: &str, max_score: f64) -> OsmoResult<Vec<String>>;
    fn zrem(&self, key: &str, member: &str) -> OsmoResult<()>;
}

#[derive(Default)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory `KeyValueStore` fake, used by unit tests in place of Redis.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
    sorted_sets: Mutex<HashMap<String, BTreeMap<String, f64>>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        InMemoryKeyValueStore::default()
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(at) => at > Instant::now(),
            None => true,
        }
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> OsmoResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key) {
            if Self::is_live(existing) {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: ttl.map(|d| Instant::now() + d) },
        );
        Ok(true)
    }

    fn get(&self, key: &str) -> OsmoResult<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).filter(|e| Self::is_live(e)).map(|e| e.value.clone()))
    }

    fn delete(&self, key: &str) -> OsmoResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn incr(&self, key: &str) -> OsmoResult<i64> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry { value: "0".to_string(), expires_at: None });
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    fn list_push(&self, key: &str, value: &str) -> OsmoResult<()> {
        self.lists.lock().unwrap().entry(key.to_string()).or_default().push_back(value.to_string());
        Ok(())
    }

    fn list_pop(&self, key: &str) -> OsmoResult<Option<String>> {
        Ok(self.lists.lock().unwrap().get_mut(key).and_then(VecDeque::pop_front))
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> OsmoResult<()> {
        self.sorted_sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    fn zrangebyscore(&self, key: &str, max_score: f64) -> OsmoResult<Vec<String>> {
        let sets = self.sorted_sets.lock().unwrap();
        let Some(set) = sets.get(key) else { return Ok(vec![]) };
        let mut members: Vec<(String, f64)> =
            set.iter().filter(|(_, &score)| score <= max_score).map(|(m, &s)| (m.clone(), s)).collect();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    fn zrem(&self, key: &str, member: &str) -> OsmoResult<()> {
        if let Some(set) = self.sorted_sets.lock().unwrap().get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }
}

/// In-memory `JobStore` fake, used by unit tests in place of Postgres.
#[derive(Default)]
pub struct InMemoryJobStore {
    tables: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        InMemoryJobStore::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn upsert(&self, table: &str, key: &str, value: &str) -> OsmoResult<()> {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, table: &str, key: &str) -> OsmoResult<Option<String>> {
        Ok(self.tables.lock().unwrap().get(table).and_then(|t| t.get(key)).cloned())
    }

    fn delete(&self, table: &str, key: &str) -> OsmoResult<()> {
        if let Some(t) = self.tables.lock().unwrap().get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }
}
