//! The production [`Broker`] backend: a real Redis-compatible server
//! accessed through `redis`'s auto-reconnecting [`ConnectionManager`].

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, FromRedisValue, RedisError};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::trait_def::{Broker, StreamEntry};

fn map_err(err: RedisError) -> BrokerError {
    BrokerError::Command(err.to_string())
}

fn is_busygroup(err: &RedisError) -> bool {
    err.to_string().contains("BUSYGROUP")
}

/// A [`Broker`] backed by a real Redis (or Redis-protocol-compatible)
/// server, connected via [`ConnectionManager`] so transient disconnects are
/// retried transparently rather than surfacing to callers.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to the server described by `config`.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.redis_url())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn xadd(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
    ) -> Result<String, BrokerError> {
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &items)
            .await
            .map_err(map_err)?;
        Ok(id)
    }

    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        from_id: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, from_id).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_busygroup(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, String)],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<&str> = streams.iter().map(|(s, _)| s.as_str()).collect();
        let ids: Vec<&str> = streams.iter().map(|(_, id)| id.as_str()).collect();

        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&keys, &ids, &opts)
            .await
            .map_err(map_err)?;

        let mut out = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let mut fields = HashMap::new();
                for (field, value) in entry.map {
                    let value = String::from_redis_value(&value)
                        .map_err(|e| BrokerError::Encoding(e.to_string()))?;
                    fields.insert(field, value);
                }
                out.push(StreamEntry {
                    stream: stream_key.key.clone(),
                    id: entry.id,
                    fields,
                });
            }
        }
        Ok(out)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await.map_err(map_err)?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await.map_err(map_err)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await.map_err(map_err)?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn.clone();
        let value: HashMap<String, String> = conn.hgetall(key).await.map_err(map_err)?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(key, field).await.map_err(map_err)?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await.map_err(map_err)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await.map_err(map_err)?;
        Ok(value)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: bool = conn
            .expire(key, seconds as i64)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> =
            conn.scan_match(pattern).await.map_err(map_err)?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(map_err)?;
        Ok(())
    }
}
