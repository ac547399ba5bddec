// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The partition router: consistent hash to a partition, replica failover
//! inside it.

use std::{collections::HashMap, sync::Arc, sync::RwLock, time::Duration};

use redis::{Cmd, FromRedisValue, aio::ConnectionManager, aio::ConnectionManagerConfig};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    errors::RedisError,
    redis::{
        hash_ring::ConsistentHashRing,
        keys::{GROUP_REDIS_ACTIVE, GROUP_REDIS_ACTIVE_TTL_SECS},
    },
    settings::RedisSettings,
};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(1_500);
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// How an operation selects its partition.
#[derive(Clone, Copy, Debug)]
pub enum PartitionKey<'a> {
    Gid(u64),
    Key(&'a str),
    /// Address a specific partition directly, bypassing the hash. The
    /// offline scan uses this to visit every partition.
    Named(&'a str),
}

struct Replica {
    url: String,
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
}

impl Replica {
    fn new(url: &str) -> Result<Self, RedisError> {
        Ok(Self {
            url: url.to_owned(),
            client: redis::Client::open(url)?,
            conn: Mutex::new(None),
        })
    }

    /// Get the cached connection handle, connecting lazily.
    async fn manager(&self) -> Result<ConnectionManager, redis::RedisError> {
        let mut guard = self.conn.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_number_of_retries(1);
        let manager =
            ConnectionManager::new_with_config(self.client.clone(), config).await?;
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

struct Partition {
    name: String,
    replicas: Vec<Replica>,
    /// Index of the replica operations currently go to.
    current: RwLock<usize>,
}

impl Partition {
    fn current_index(&self) -> usize {
        *self.current.read().expect("replica index lock poisoned")
    }

    fn set_current_index(&self, index: usize) {
        let mut current = self.current.write().expect("replica index lock poisoned");
        if *current != index {
            info!(
                partition = %self.name,
                from = *current,
                to = index,
                "switching active replica"
            );
            *current = index;
        }
    }
}

/// Partition-routing facade over a small superset of Redis commands.
pub struct RedisRouter {
    ring: ConsistentHashRing,
    partitions: HashMap<String, Partition>,
}

fn is_transport_error(e: &redis::RedisError) -> bool {
    e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(e.kind(), redis::ErrorKind::IoError)
}

impl RedisRouter {
    pub fn new(settings: &RedisSettings) -> Result<Self, RedisError> {
        let mut ring = ConsistentHashRing::with_default_replicas();
        let mut partitions = HashMap::new();
        for partition in &settings.partitions {
            let replicas = partition
                .replicas
                .iter()
                .map(|url| Replica::new(url))
                .collect::<Result<Vec<_>, _>>()?;
            ring.add_node(&partition.name);
            partitions.insert(
                partition.name.clone(),
                Partition {
                    name: partition.name.clone(),
                    replicas,
                    current: RwLock::new(0),
                },
            );
        }
        Ok(Self { ring, partitions })
    }

    fn partition_for(&self, key: PartitionKey<'_>) -> Result<&Partition, RedisError> {
        let name = match key {
            PartitionKey::Gid(gid) => self.ring.pick_gid(gid),
            PartitionKey::Key(k) => self.ring.pick_key(k),
            PartitionKey::Named(name) => Some(name),
        }
        .ok_or(RedisError::NoPartition)?;
        self.partitions.get(name).ok_or(RedisError::NoPartition)
    }

    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run a command against the selected partition, failing over through
    /// its replicas. Command-level errors (wrong type, parse) do not fail
    /// over; only transport errors advance the replica index.
    async fn execute<T: FromRedisValue>(
        &self,
        key: PartitionKey<'_>,
        cmd: &Cmd,
    ) -> Result<T, RedisError> {
        let partition = self.partition_for(key)?;
        let start = partition.current_index();
        let replica_count = partition.replicas.len();
        let mut last_error = String::from("no replicas configured");

        for attempt in 0..replica_count {
            let index = (start + attempt) % replica_count;
            let replica = &partition.replicas[index];
            let mut conn = match replica.manager().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(partition = %partition.name, replica = %replica.url, error = %e,
                        "replica connect failed");
                    last_error = e.to_string();
                    continue;
                }
            };
            match cmd.query_async::<T>(&mut conn).await {
                Ok(value) => {
                    if index != start {
                        partition.set_current_index(index);
                    }
                    return Ok(value);
                }
                Err(e) if is_transport_error(&e) => {
                    warn!(partition = %partition.name, replica = %replica.url, error = %e,
                        "replica failed, trying next");
                    last_error = e.to_string();
                }
                Err(e) => return Err(RedisError::Driver(e)),
            }
        }

        Err(RedisError::AllReplicasFailed {
            partition: partition.name.clone(),
            last_error,
        })
    }

    /// Spawn the background liveness probe. Replica 0 of each partition is
    /// probed with a short-TTL sentinel write; when it responds, the
    /// partition's active replica resets to 0.
    pub fn spawn_probe(self: &Arc<Self>, cancel: CancellationToken) {
        let router = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                for partition in router.partitions.values() {
                    router.probe_partition(partition).await;
                }
            }
        });
    }

    async fn probe_partition(&self, partition: &Partition) {
        let Some(primary) = partition.replicas.first() else {
            return;
        };
        let mut cmd = redis::cmd("SET");
        cmd.arg(GROUP_REDIS_ACTIVE)
            .arg(embercommon::time::now_secs())
            .arg("EX")
            .arg(GROUP_REDIS_ACTIVE_TTL_SECS);
        let result: Result<ConnectionManager, _> = primary.manager().await;
        let alive = match result {
            Ok(mut conn) => cmd.query_async::<()>(&mut conn).await.is_ok(),
            Err(_) => false,
        };
        if alive {
            partition.set_current_index(0);
        } else {
            debug!(partition = %partition.name, "primary replica still down");
        }
    }

    // --- string ops ------------------------------------------------------

    pub async fn get(&self, key: PartitionKey<'_>, k: &str) -> Result<Option<String>, RedisError> {
        self.execute(key, redis::cmd("GET").arg(k)).await
    }

    pub async fn set(&self, key: PartitionKey<'_>, k: &str, value: &str) -> Result<(), RedisError> {
        self.execute(key, redis::cmd("SET").arg(k).arg(value)).await
    }

    pub async fn set_ex(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), RedisError> {
        self.execute(key, redis::cmd("SET").arg(k).arg(value).arg("EX").arg(ttl_secs))
            .await
    }

    /// `SET k v NX EX ttl`; returns whether the key was set.
    pub async fn set_nx_ex(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, RedisError> {
        let reply: Option<String> = self
            .execute(
                key,
                redis::cmd("SET").arg(k).arg(value).arg("NX").arg("EX").arg(ttl_secs),
            )
            .await?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, key: PartitionKey<'_>, k: &str) -> Result<bool, RedisError> {
        let removed: u64 = self.execute(key, redis::cmd("DEL").arg(k)).await?;
        Ok(removed > 0)
    }

    pub async fn incr(&self, key: PartitionKey<'_>, k: &str) -> Result<u64, RedisError> {
        self.execute(key, redis::cmd("INCR").arg(k)).await
    }

    pub async fn expire(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        ttl_secs: u64,
    ) -> Result<bool, RedisError> {
        let set: u64 = self
            .execute(key, redis::cmd("EXPIRE").arg(k).arg(ttl_secs))
            .await?;
        Ok(set > 0)
    }

    pub async fn ttl(&self, key: PartitionKey<'_>, k: &str) -> Result<i64, RedisError> {
        self.execute(key, redis::cmd("TTL").arg(k)).await
    }

    // --- hash ops --------------------------------------------------------

    pub async fn hset(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        field: &str,
        value: &str,
    ) -> Result<(), RedisError> {
        self.execute(key, redis::cmd("HSET").arg(k).arg(field).arg(value))
            .await
    }

    pub async fn hget(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        field: &str,
    ) -> Result<Option<String>, RedisError> {
        self.execute(key, redis::cmd("HGET").arg(k).arg(field)).await
    }

    pub async fn hmset(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        pairs: &[(String, String)],
    ) -> Result<(), RedisError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(k);
        for (field, value) in pairs {
            cmd.arg(field).arg(value);
        }
        self.execute(key, &cmd).await
    }

    pub async fn hmget(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, RedisError> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(k);
        for field in fields {
            cmd.arg(field);
        }
        self.execute(key, &cmd).await
    }

    /// One HSCAN step. Returns the next cursor (0 when done) and the
    /// field/value pairs of this page.
    pub async fn hscan(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<(String, String)>), RedisError> {
        self.execute(
            key,
            redis::cmd("HSCAN").arg(k).arg(cursor).arg("COUNT").arg(count),
        )
        .await
    }

    pub async fn hdel(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        fields: &[String],
    ) -> Result<u64, RedisError> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(k);
        for field in fields {
            cmd.arg(field);
        }
        self.execute(key, &cmd).await
    }

    pub async fn hlen(&self, key: PartitionKey<'_>, k: &str) -> Result<u64, RedisError> {
        self.execute(key, redis::cmd("HLEN").arg(k)).await
    }

    // --- sorted set ops --------------------------------------------------

    pub async fn zadd(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        member: &str,
        score: i64,
    ) -> Result<(), RedisError> {
        self.execute(key, redis::cmd("ZADD").arg(k).arg(score).arg(member))
            .await
    }

    pub async fn zrem(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        members: &[String],
    ) -> Result<u64, RedisError> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(k);
        for member in members {
            cmd.arg(member);
        }
        self.execute(key, &cmd).await
    }

    /// `ZRANGEBYSCORE k -inf (max WITHSCORES LIMIT offset count`, ascending.
    pub async fn zrange_by_score_below(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        max_exclusive: i64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, i64)>, RedisError> {
        self.execute(
            key,
            redis::cmd("ZRANGEBYSCORE")
                .arg(k)
                .arg("-inf")
                .arg(format!("({max_exclusive}"))
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(offset)
                .arg(count),
        )
        .await
    }

    // --- set ops ---------------------------------------------------------

    pub async fn sadd(
        &self,
        key: PartitionKey<'_>,
        k: &str,
        members: &[String],
    ) -> Result<u64, RedisError> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(k);
        for member in members {
            cmd.arg(member);
        }
        self.execute(key, &cmd).await
    }

    pub async fn smembers(
        &self,
        key: PartitionKey<'_>,
        k: &str,
    ) -> Result<Vec<String>, RedisError> {
        self.execute(key, redis::cmd("SMEMBERS").arg(k)).await
    }

    // --- pub/sub ---------------------------------------------------------

    pub async fn publish(
        &self,
        key: PartitionKey<'_>,
        channel: &str,
        payload: &[u8],
    ) -> Result<u64, RedisError> {
        self.execute(key, redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await
    }
}
