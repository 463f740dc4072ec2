//! A deterministic, in-process fake [`Broker`] for tests and local exercise
//! without a running Redis server.
//!
//! A plain struct implementing the same trait as the production backend, so
//! code written against `Arc<dyn Broker>` cannot tell the difference.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::trait_def::{Broker, StreamEntry};

#[derive(Default)]
struct StreamState {
    /// Appended entries in arrival order; `id` is the decimal string form of
    /// its position (1-indexed) in this vector.
    entries: Vec<HashMap<String, String>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Index (0-based) of the next entry this group has not yet delivered.
    next_index: usize,
    /// Entries delivered but not yet acked: id -> (index, consumer that holds it).
    pending: HashMap<String, (usize, String)>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    counters: HashMap<String, i64>,
}

/// An in-memory stand-in for a Redis-compatible broker.
///
/// Blocking reads are implemented with a [`Notify`] rather than polling:
/// every mutating call wakes any reader waiting on new data, and readers
/// re-check state immediately on wake rather than trusting the wakeup alone.
pub struct InMemoryBroker {
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // Only the `*` wildcard is supported, which is all the stated contract
    // (bootstrap key-flush) requires.
    match pattern.split_once('*') {
        None => pattern == key,
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn xadd(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
    ) -> Result<String, BrokerError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            let s = state.streams.entry(stream.to_owned()).or_default();
            s.entries.push(fields.clone());
            s.entries.len().to_string()
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        _from_id: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        let s = state.streams.entry(stream.to_owned()).or_default();
        s.groups.entry(group.to_owned()).or_default();
        Ok(())
    }

    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, String)],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let batch = self.try_read(group, consumer, streams, count);
            if !batch.is_empty() || block_ms == 0 {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let remaining = deadline - now;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.streams.get_mut(stream) {
            if let Some(g) = s.groups.get_mut(group) {
                g.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state
            .hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let state = self.state.lock().unwrap();
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if let Some(h) = state.hashes.get_mut(key) {
            h.remove(field);
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut state = self.state.lock().unwrap();
        let counter = state.counters.entry(key.to_owned()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn expire(&self, _key: &str, _seconds: u64) -> Result<(), BrokerError> {
        // No TTL enforcement in the fake: tests run far faster than any
        // realistic rate-limit window, so expiry is a documented no-op here.
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<String> = state
            .hashes
            .keys()
            .chain(state.sets.keys())
            .chain(state.counters.keys())
            .chain(state.streams.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.hashes.remove(key);
        state.sets.remove(key);
        state.counters.remove(key);
        state.streams.remove(key);
        Ok(())
    }
}

impl InMemoryBroker {
    fn try_read(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, String)],
        count: usize,
    ) -> Vec<StreamEntry> {
        let mut state = self.state.lock().unwrap();
        let mut out = Vec::new();

        for (stream_name, from_id) in streams {
            if out.len() >= count {
                break;
            }
            let Some(s) = state.streams.get_mut(stream_name) else {
                continue;
            };
            let Some(g) = s.groups.get_mut(group) else {
                continue;
            };

            if from_id == ">" {
                while out.len() < count && g.next_index < s.entries.len() {
                    let idx = g.next_index;
                    g.next_index += 1;
                    let id = (idx + 1).to_string();
                    g.pending.insert(id.clone(), (idx, consumer.to_owned()));
                    out.push(StreamEntry {
                        stream: stream_name.clone(),
                        id,
                        fields: s.entries[idx].clone(),
                    });
                }
            } else {
                // Reclaim this consumer's own pending entries, oldest first.
                let mut mine: Vec<(String, usize)> = g
                    .pending
                    .iter()
                    .filter(|(_, (_, c))| c == consumer)
                    .map(|(id, (idx, _))| (id.clone(), *idx))
                    .collect();
                mine.sort_by_key(|(_, idx)| *idx);
                for (id, idx) in mine.into_iter().take(count - out.len()) {
                    out.push(StreamEntry {
                        stream: stream_name.clone(),
                        id,
                        fields: s.entries[idx].clone(),
                    });
                }
            }
        }

        out
    }
}
