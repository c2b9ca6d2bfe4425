//! Append-only log broker + key-value store, backed by Redis Streams and
//! Redis hashes/strings. This is the one place that talks to Redis; every
//! other module is written against [`BrokerOps`] so tests can swap in an
//! in-memory fake.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

/// One delivered stream entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: String,
    pub payload: serde_json::Value,
}

/// Result of `XPENDING <stream> <group>` (summary form).
#[derive(Debug, Clone, Default)]
pub struct PendingSummary {
    pub count: i64,
    pub smallest_id: Option<String>,
    pub greatest_id: Option<String>,
    pub per_consumer: Vec<(String, i64)>,
}

/// The broker capabilities the stream runtime and orchestrator need.
/// Implemented by [`RedisBroker`] for real traffic and by a `FakeBroker` in
/// `#[cfg(test)]` modules for dependency-free tests.
#[async_trait]
pub trait BrokerOps: Send + Sync {
    async fn append(&self, stream: &str, payload: &serde_json::Value) -> anyhow::Result<String>;
    async fn ensure_group(&self, stream: &str, group: &str) -> anyhow::Result<()>;
    async fn read_backlog(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>>;
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<Entry>>;
    async fn ack(&self, stream: &str, group: &str, id: &str) -> anyhow::Result<()>;
    async fn pending_summary(&self, stream: &str, group: &str) -> anyhow::Result<PendingSummary>;
    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>>;
    async fn delete(&self, stream: &str, id: &str) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    /// `SET key value NX EX ttl_secs`. Returns `true` if the key was set
    /// (i.e. it did not already exist).
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<bool>;
    /// `DEL key`. Used to release a `set_nx_ex` claim when the claimed work
    /// did not actually complete.
    async fn kv_del(&self, key: &str) -> anyhow::Result<()>;
    async fn hash_get_all(&self, key: &str) -> anyhow::Result<HashMap<String, String>>;
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> anyhow::Result<()>;
    async fn hincrbyfloat(&self, key: &str, field: &str, amount: f64) -> anyhow::Result<f64>;
    async fn hincr_int(&self, key: &str, field: &str, amount: i64) -> anyhow::Result<i64>;
    async fn hash_del_field(&self, key: &str, field: &str) -> anyhow::Result<()>;
    async fn scan_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>>;
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Redis-backed implementation. Cheap to clone: `ConnectionManager` is a
/// multiplexed, auto-reconnecting handle, not a single socket.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn parse_stream_reply(reply: redis::streams::StreamReadReply) -> Vec<Entry> {
    let mut out = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let Some(raw) = id.map.get("data") else {
                continue;
            };
            let raw_str: String = match redis::from_redis_value(raw) {
                Ok(s) => s,
                Err(e) => {
                    warn!(entry_id = %id.id, error = %e, "stream entry missing utf-8 data field");
                    continue;
                }
            };
            match serde_json::from_str(&raw_str) {
                Ok(payload) => out.push(Entry { id: id.id, payload }),
                Err(e) => {
                    warn!(entry_id = %id.id, error = %e, "stream entry is not valid JSON, skipping");
                }
            }
        }
    }
    out
}

#[async_trait]
impl BrokerOps for RedisBroker {
    async fn append(&self, stream: &str, payload: &serde_json::Value) -> anyhow::Result<String> {
        let mut conn = self.conn();
        let body = serde_json::to_string(payload)?;
        let id: String = conn.xadd(stream, "*", &[("data", body)]).await?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_backlog(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>> {
        let mut conn = self.conn();
        let opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[stream], &["0"], &opts)
            .await
            .unwrap_or_default();
        Ok(parse_stream_reply(reply))
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<Entry>> {
        let mut conn = self.conn();
        let opts = redis::streams::StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: redis::streams::StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .unwrap_or_default();
        Ok(parse_stream_reply(reply))
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> anyhow::Result<PendingSummary> {
        let mut conn = self.conn();
        let reply: redis::streams::StreamPendingReply =
            redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .query_async(&mut conn)
                .await?;
        Ok(match reply {
            redis::streams::StreamPendingReply::Empty => PendingSummary::default(),
            redis::streams::StreamPendingReply::Data(data) => PendingSummary {
                count: data.count,
                smallest_id: Some(data.start),
                greatest_id: Some(data.end),
                per_consumer: data
                    .consumers
                    .into_iter()
                    .map(|c| (c.name, c.pending))
                    .collect(),
            },
        })
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>> {
        let mut conn = self.conn();
        let reply: redis::streams::StreamRangeReply =
            conn.xrange_count(stream, start, end, count).await?;
        let mut out = Vec::new();
        for id in reply.ids {
            let Some(raw) = id.map.get("data") else {
                continue;
            };
            let raw_str: String = redis::from_redis_value(raw)?;
            let payload = serde_json::from_str(&raw_str)?;
            out.push(Entry { id: id.id, payload });
        }
        Ok(out)
    }

    async fn delete(&self, stream: &str, id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.xdel(stream, &[id]).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<bool> {
        let mut conn = self.conn();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn kv_del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hincrbyfloat(&self, key: &str, field: &str, amount: f64) -> anyhow::Result<f64> {
        let mut conn = self.conn();
        let value: f64 = redis::cmd("HINCRBYFLOAT")
            .arg(key)
            .arg(field)
            .arg(amount)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hincr_int(&self, key: &str, field: &str, amount: i64) -> anyhow::Result<i64> {
        let mut conn = self.conn();
        let value: i64 = conn.hincr(key, field, amount).await?;
        Ok(value)
    }

    async fn hash_del_field(&self, key: &str, field: &str) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        let mut out = Vec::new();
        use futures_util::StreamExt;
        while let Some(key) = iter.next().await {
            out.push(key);
        }
        Ok(out)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-memory stand-in for [`BrokerOps`], used by unit tests so the stream
/// runtime and orchestrator contracts can be exercised without a live Redis.
#[cfg(test)]
pub mod fake {
    use super::{BrokerOps, Entry, PendingSummary};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct StreamState {
        entries: Vec<(String, serde_json::Value)>,
        next_id: u64,
    }

    #[derive(Default)]
    struct GroupState {
        last_delivered: usize,
        pending: Vec<String>,
    }

    #[derive(Default)]
    pub struct FakeBroker {
        streams: Mutex<HashMap<String, StreamState>>,
        groups: Mutex<HashMap<(String, String), GroupState>>,
        kv: Mutex<HashMap<String, (String, Instant)>>,
        hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    }

    impl FakeBroker {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn glob_match(pattern: &str, candidate: &str) -> bool {
        match pattern.split_once('*') {
            None => pattern == candidate,
            Some((prefix, suffix)) => {
                candidate.starts_with(prefix) && candidate.ends_with(suffix) && candidate.len() >= prefix.len() + suffix.len()
            }
        }
    }

    #[async_trait]
    impl BrokerOps for FakeBroker {
        async fn append(&self, stream: &str, payload: &serde_json::Value) -> anyhow::Result<String> {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = format!("{}-0", state.next_id);
            state.next_id += 1;
            state.entries.push((id.clone(), payload.clone()));
            Ok(id)
        }

        async fn ensure_group(&self, stream: &str, group: &str) -> anyhow::Result<()> {
            let mut groups = self.groups.lock();
            groups
                .entry((stream.to_string(), group.to_string()))
                .or_default();
            Ok(())
        }

        async fn read_backlog(
            &self,
            stream: &str,
            group: &str,
            _consumer: &str,
            count: usize,
        ) -> anyhow::Result<Vec<Entry>> {
            let streams = self.streams.lock();
            let mut groups = self.groups.lock();
            let gstate = groups
                .entry((stream.to_string(), group.to_string()))
                .or_default();
            let Some(sstate) = streams.get(stream) else {
                return Ok(Vec::new());
            };
            let by_id: HashMap<&str, &serde_json::Value> =
                sstate.entries.iter().map(|(id, p)| (id.as_str(), p)).collect();
            Ok(gstate
                .pending
                .iter()
                .take(count)
                .filter_map(|id| by_id.get(id.as_str()).map(|p| Entry { id: id.clone(), payload: (*p).clone() }))
                .collect())
        }

        async fn read_new(
            &self,
            stream: &str,
            group: &str,
            _consumer: &str,
            count: usize,
            _block: Duration,
        ) -> anyhow::Result<Vec<Entry>> {
            let streams = self.streams.lock();
            let mut groups = self.groups.lock();
            let gstate = groups
                .entry((stream.to_string(), group.to_string()))
                .or_default();
            let Some(sstate) = streams.get(stream) else {
                return Ok(Vec::new());
            };
            let slice: Vec<Entry> = sstate.entries[gstate.last_delivered..]
                .iter()
                .take(count)
                .map(|(id, p)| Entry { id: id.clone(), payload: p.clone() })
                .collect();
            gstate.last_delivered += slice.len();
            for entry in &slice {
                gstate.pending.push(entry.id.clone());
            }
            Ok(slice)
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> anyhow::Result<()> {
            let mut groups = self.groups.lock();
            if let Some(gstate) = groups.get_mut(&(stream.to_string(), group.to_string())) {
                gstate.pending.retain(|pid| pid != id);
            }
            Ok(())
        }

        async fn pending_summary(&self, stream: &str, group: &str) -> anyhow::Result<PendingSummary> {
            let groups = self.groups.lock();
            let count = groups
                .get(&(stream.to_string(), group.to_string()))
                .map(|g| g.pending.len() as i64)
                .unwrap_or(0);
            Ok(PendingSummary {
                count,
                smallest_id: None,
                greatest_id: None,
                per_consumer: Vec::new(),
            })
        }

        async fn range(
            &self,
            stream: &str,
            _start: &str,
            _end: &str,
            count: usize,
        ) -> anyhow::Result<Vec<Entry>> {
            let streams = self.streams.lock();
            Ok(streams
                .get(stream)
                .map(|s| {
                    s.entries
                        .iter()
                        .take(count)
                        .map(|(id, p)| Entry { id: id.clone(), payload: p.clone() })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn delete(&self, stream: &str, id: &str) -> anyhow::Result<()> {
            let mut streams = self.streams.lock();
            if let Some(state) = streams.get_mut(stream) {
                state.entries.retain(|(eid, _)| eid != id);
            }
            Ok(())
        }

        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            let kv = self.kv.lock();
            Ok(kv
                .get(key)
                .map(|(_, expires)| *expires > Instant::now())
                .unwrap_or(false))
        }

        async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<bool> {
            let mut kv = self.kv.lock();
            let expired = kv.get(key).map(|(_, exp)| *exp <= Instant::now()).unwrap_or(true);
            if expired {
                kv.insert(
                    key.to_string(),
                    (value.to_string(), Instant::now() + Duration::from_secs(ttl_secs.max(1))),
                );
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn kv_del(&self, key: &str) -> anyhow::Result<()> {
            self.kv.lock().remove(key);
            Ok(())
        }

        async fn hash_get_all(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
            let hashes = self.hashes.lock();
            Ok(hashes.get(key).cloned().unwrap_or_default())
        }

        async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> anyhow::Result<()> {
            let mut hashes = self.hashes.lock();
            let entry = hashes.entry(key.to_string()).or_default();
            for (field, value) in fields {
                entry.insert(field.to_string(), value.clone());
            }
            Ok(())
        }

        async fn hincrbyfloat(&self, key: &str, field: &str, amount: f64) -> anyhow::Result<f64> {
            let mut hashes = self.hashes.lock();
            let entry = hashes.entry(key.to_string()).or_default();
            let current: f64 = entry.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
            let updated = current + amount;
            entry.insert(field.to_string(), updated.to_string());
            Ok(updated)
        }

        async fn hincr_int(&self, key: &str, field: &str, amount: i64) -> anyhow::Result<i64> {
            let mut hashes = self.hashes.lock();
            let entry = hashes.entry(key.to_string()).or_default();
            let current: i64 = entry.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
            let updated = current + amount;
            entry.insert(field.to_string(), updated.to_string());
            Ok(updated)
        }

        async fn hash_del_field(&self, key: &str, field: &str) -> anyhow::Result<()> {
            let mut hashes = self.hashes.lock();
            if let Some(entry) = hashes.get_mut(key) {
                entry.remove(field);
            }
            Ok(())
        }

        async fn scan_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
            let hashes = self.hashes.lock();
            Ok(hashes.keys().filter(|k| glob_match(pattern, k)).cloned().collect())
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
