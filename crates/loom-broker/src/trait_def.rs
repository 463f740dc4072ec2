//! The `Broker` trait -- the backend-agnostic interface over a stream/hash
//! store with consumer-group semantics.
//!
//! Two concrete backends implement this trait: [`crate::redis_broker::RedisBroker`]
//! against a real Redis-compatible server, and [`crate::memory::InMemoryBroker`],
//! a deterministic in-process fake used for tests. The runtime loops in
//! `loom-core` are written against `Arc<dyn Broker>` and never know which
//! backend they are talking to.
//!
//! # Object Safety
//!
//! Every method returns a concrete type, so the trait can be stored as
//! `Arc<dyn Broker>`.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::BrokerError;

/// One entry returned by [`Broker::xreadgroup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Name of the stream this entry was read from.
    pub stream: String,
    /// Broker-assigned entry id, unique and monotonically increasing within
    /// its stream.
    pub id: String,
    /// The entry's field/value pairs, in insertion order is not guaranteed.
    pub fields: HashMap<String, String>,
}

/// Backend-agnostic broker operations: streams with consumer groups, hashes,
/// sets, and TTL'd counters. The in-memory fake and the Redis backend must
/// agree on every method's exact semantics so callers can swap one for the
/// other without changing behavior.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a record to `stream`; returns the assigned entry id.
    async fn xadd(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
    ) -> Result<String, BrokerError>;

    /// Idempotently create consumer group `group` on `stream`, starting from
    /// `from_id` (`"0"` or `"$"`). Creates the stream itself if it does not
    /// yet exist. An "already exists" condition is treated as success.
    async fn xgroup_create(&self, stream: &str, group: &str, from_id: &str)
    -> Result<(), BrokerError>;

    /// Read up to `count` entries across `streams` (pairs of `(stream,
    /// from_id)`, where `from_id` is `">"` for undelivered entries or a
    /// literal id to reclaim entries already pending for `consumer`), as
    /// `group`/`consumer`. Blocks up to `block_ms` milliseconds if nothing is
    /// immediately available; `block_ms == 0` returns immediately.
    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, String)],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledge `id` on `stream`/`group`, removing it from the group's
    /// pending-entries list.
    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    /// Set a single field on hash `key`.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError>;

    /// Fetch a single field from hash `key`, or `None` if the field or the
    /// hash itself is absent.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError>;

    /// Fetch every field/value pair in hash `key`. Returns an empty map if
    /// the hash does not exist.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// Remove a single field from hash `key`.
    async fn hdel(&self, key: &str, field: &str) -> Result<(), BrokerError>;

    /// Add `member` to set `key`.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Atomically increment the integer counter at `key` and return the new
    /// value. Creates the counter at `1` if absent.
    async fn incr(&self, key: &str) -> Result<i64, BrokerError>;

    /// Set a TTL of `seconds` on `key`. A no-op if the key does not exist.
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), BrokerError>;

    /// List every key matching glob `pattern`. Used only at bootstrap to
    /// flush prior run state; not expected to be called on a hot path.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;

    /// Delete `key` entirely (hash, stream, set, or counter).
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
}

// Compile-time assertion: Broker must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Broker) {}
};
