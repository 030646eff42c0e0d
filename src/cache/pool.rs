//! Shard pool: one cache interface over M remote shards plus the in-process
//! fallback map.
//!
//! Routing rules:
//! - keyed commands hash (SHA-256) to one shard, modulo the set of healthy
//!   under-quota shards — a stable shard set means a stable placement;
//! - global commands (`KEYS`, `DBSIZE`, `FLUSHDB`) scatter to every healthy
//!   shard and merge;
//! - keyless commands go to the shard with the fewest requests today.
//!
//! Every shard carries a daily command quota with the same UTC-midnight reset
//! rule as credentials. A shard that reports "limit exceeded" is dead for the
//! rest of the UTC day; transport errors mark it unhealthy until the next
//! health pass revives it. When no remote shard can serve a command, the
//! in-process map takes it — cache traffic degrades, it does not fail.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::cache::shard::{Command, MemoryShard, Reply, RestShard, Routing, ShardError};
use crate::config::ShardConfig;
use crate::util::{key_hash, utc_day};

// ============================================================================
// Per-shard bookkeeping
// ============================================================================

#[derive(Debug, Clone)]
struct ShardState {
    healthy: bool,
    /// Daily quota exhausted; revives at UTC midnight.
    dead: bool,
    daily_requests: u64,
    daily_limit: u64,
    latency_ms: Option<u64>,
    error_count: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub id: usize,
    pub endpoint: String,
    pub healthy: bool,
    pub dead: bool,
    pub daily_requests: u64,
    pub daily_limit: u64,
    pub latency_ms: Option<u64>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

struct PoolState {
    shards: Vec<ShardState>,
    last_reset_day: NaiveDate,
}

impl PoolState {
    fn reset_if_day_rolled(&mut self, today: NaiveDate) {
        if self.last_reset_day == today {
            return;
        }
        for shard in &mut self.shards {
            shard.daily_requests = 0;
            shard.dead = false;
            shard.last_error = None;
        }
        self.last_reset_day = today;
    }

    fn eligible(&self) -> Vec<usize> {
        self.shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.healthy && !s.dead && s.daily_requests < s.daily_limit)
            .map(|(i, _)| i)
            .collect()
    }
}

// ============================================================================
// ShardPool
// ============================================================================

pub struct ShardPool {
    shards: Vec<RestShard>,
    state: Mutex<PoolState>,
    memory: MemoryShard,
    disabled: bool,
}

impl ShardPool {
    pub fn new(configs: Vec<ShardConfig>, disabled: bool) -> Self {
        let client = reqwest::Client::new();
        let mut shards = Vec::with_capacity(configs.len());
        let mut states = Vec::with_capacity(configs.len());
        for (index, config) in configs.into_iter().enumerate() {
            shards.push(RestShard::new(
                index + 1,
                config.endpoint,
                config.token,
                client.clone(),
            ));
            states.push(ShardState {
                healthy: false,
                dead: false,
                daily_requests: 0,
                daily_limit: config.daily_limit,
                latency_ms: None,
                error_count: 0,
                last_error: None,
            });
        }
        Self {
            shards,
            state: Mutex::new(PoolState {
                shards: states,
                last_reset_day: utc_day(Utc::now()),
            }),
            memory: MemoryShard::new(),
            disabled,
        }
    }

    /// In-process-only pool (tests, `CACHE_DISABLED=true` with no shards).
    pub fn memory_only() -> Self {
        Self::new(Vec::new(), true)
    }

    /// Startup probe: ping every shard, record latency, mark healthy.
    pub async fn init(&self) {
        self.health_check_once().await;
    }

    /// One health pass: ping each shard (dead ones included, since the UTC
    /// day may have rolled), refresh latency, and sweep the fallback map.
    pub async fn health_check_once(&self) {
        {
            let mut state = self.state.lock().await;
            state.reset_if_day_rolled(utc_day(Utc::now()));
        }

        for (index, shard) in self.shards.iter().enumerate() {
            match shard.ping().await {
                Ok(latency) => {
                    let mut state = self.state.lock().await;
                    let s = &mut state.shards[index];
                    s.daily_requests += 1;
                    if !s.healthy {
                        tracing::info!(shard = shard.id, endpoint = %shard.endpoint, "Shard healthy");
                    }
                    s.healthy = true;
                    s.latency_ms = Some(latency.as_millis() as u64);
                }
                Err(ShardError::QuotaExceeded) => {
                    let mut state = self.state.lock().await;
                    let s = &mut state.shards[index];
                    s.dead = true;
                    s.last_error = Some("daily quota exceeded".to_string());
                    tracing::warn!(shard = shard.id, "Shard over daily quota, dead until UTC midnight");
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    let s = &mut state.shards[index];
                    s.healthy = false;
                    s.error_count += 1;
                    s.last_error = Some(e.to_string());
                    tracing::warn!(shard = shard.id, error = %e, "Shard health check failed");
                }
            }
        }

        self.memory.sweep().await;
    }

    pub async fn stats(&self) -> Vec<ShardStats> {
        let state = self.state.lock().await;
        self.shards
            .iter()
            .zip(state.shards.iter())
            .map(|(shard, s)| ShardStats {
                id: shard.id,
                endpoint: shard.endpoint.clone(),
                healthy: s.healthy,
                dead: s.dead,
                daily_requests: s.daily_requests,
                daily_limit: s.daily_limit,
                latency_ms: s.latency_ms,
                error_count: s.error_count,
                last_error: s.last_error.clone(),
            })
            .collect()
    }

    // ========================================================================
    // Command execution
    // ========================================================================

    /// Execute a command with routing, failover, and memory fallback.
    ///
    /// The returned error surface is intentionally small: by the time every
    /// remote shard and the in-process map have been tried, the only failures
    /// left are type/protocol mistakes, which are programming errors.
    pub async fn execute(&self, command: Command) -> Result<Reply, ShardError> {
        if self.disabled || self.shards.is_empty() {
            return self.memory.execute(&command).await;
        }

        match command.routing() {
            Routing::Global => return self.execute_global(&command).await,
            Routing::Key(_) | Routing::Any => {}
        }

        // Multi-key commands split per key: each key owns its placement, so
        // a batched DEL must not be routed by its first key alone.
        match &command {
            Command::Del { keys } if keys.len() > 1 => {
                let mut total = 0;
                for key in keys {
                    total += Box::pin(self.execute(Command::Del {
                        keys: vec![key.clone()],
                    }))
                    .await?
                    .as_int();
                }
                return Ok(Reply::Int(total));
            }
            Command::Exists { keys } if keys.len() > 1 => {
                let mut total = 0;
                for key in keys {
                    total += Box::pin(self.execute(Command::Exists {
                        keys: vec![key.clone()],
                    }))
                    .await?
                    .as_int();
                }
                return Ok(Reply::Int(total));
            }
            _ => {}
        }

        // Excluded shards accumulate across attempts so a rerouted command
        // never lands back on the shard that just failed it.
        let mut excluded: HashSet<usize> = HashSet::new();

        loop {
            let target = {
                let mut state = self.state.lock().await;
                state.reset_if_day_rolled(utc_day(Utc::now()));
                let eligible: Vec<usize> = state
                    .eligible()
                    .into_iter()
                    .filter(|i| !excluded.contains(i))
                    .collect();
                if eligible.is_empty() {
                    None
                } else {
                    let index = match command.routing() {
                        Routing::Key(key) => {
                            eligible[(key_hash(key) % eligible.len() as u64) as usize]
                        }
                        Routing::Any => eligible
                            .iter()
                            .copied()
                            .min_by_key(|&i| state.shards[i].daily_requests)
                            .unwrap_or(eligible[0]),
                        Routing::Global => unreachable!("handled above"),
                    };
                    state.shards[index].daily_requests += 1;
                    Some(index)
                }
            };

            let Some(index) = target else {
                tracing::debug!(command = command.name(), "No remote shard available, using in-process fallback");
                return self.memory.execute(&command).await;
            };

            match self.shards[index].execute(&command).await {
                Ok(reply) => {
                    self.mirror_write(&command).await;
                    return Ok(reply);
                }
                Err(ShardError::QuotaExceeded) => {
                    let mut state = self.state.lock().await;
                    let s = &mut state.shards[index];
                    s.dead = true;
                    s.last_error = Some("daily quota exceeded".to_string());
                    tracing::warn!(
                        shard = self.shards[index].id,
                        command = command.name(),
                        "Shard over daily quota, rerouting"
                    );
                    excluded.insert(index);
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    let s = &mut state.shards[index];
                    s.healthy = false;
                    s.error_count += 1;
                    s.last_error = Some(e.to_string());
                    drop(state);
                    tracing::warn!(
                        shard = self.shards[index].id,
                        command = command.name(),
                        error = %e,
                        "Shard command failed, rerouting"
                    );
                    excluded.insert(index);
                }
            }
        }
    }

    /// Scatter a global command to every healthy shard concurrently, merge
    /// the replies, and apply the command to the in-process map as well.
    async fn execute_global(&self, command: &Command) -> Result<Reply, ShardError> {
        let targets = {
            let mut state = self.state.lock().await;
            state.reset_if_day_rolled(utc_day(Utc::now()));
            let targets = state.eligible();
            for &index in &targets {
                state.shards[index].daily_requests += 1;
            }
            targets
        };

        let replies = futures::future::join_all(
            targets
                .iter()
                .map(|&index| async move { (index, self.shards[index].execute(command).await) }),
        )
        .await;

        let mut merged_list: Vec<String> = Vec::new();
        let mut merged_int: i64 = 0;
        let mut any_ok = false;

        for (index, reply) in replies {
            match reply {
                Ok(Reply::List(items)) => {
                    any_ok = true;
                    merged_list.extend(items);
                }
                Ok(Reply::Int(n)) => {
                    any_ok = true;
                    merged_int += n;
                }
                Ok(_) => any_ok = true,
                Err(e) => {
                    let mut state = self.state.lock().await;
                    let s = &mut state.shards[index];
                    if matches!(e, ShardError::QuotaExceeded) {
                        s.dead = true;
                    } else {
                        s.healthy = false;
                        s.error_count += 1;
                    }
                    s.last_error = Some(e.to_string());
                }
            }
        }

        // Merge in the fallback map's view: keys written during a remote
        // outage remain discoverable.
        let local = self.memory.execute(command).await?;
        match (command, local) {
            (Command::Keys { .. }, Reply::List(items)) => {
                merged_list.extend(items);
                merged_list.sort();
                merged_list.dedup();
                Ok(Reply::List(merged_list))
            }
            (Command::DbSize, Reply::Int(n)) => Ok(Reply::Int(merged_int + n)),
            (Command::FlushDb, reply) => {
                if any_ok {
                    Ok(Reply::Ok)
                } else {
                    Ok(reply)
                }
            }
            (_, reply) => Ok(reply),
        }
    }

    /// Write-through of explicit sets and deletes into the in-process map so
    /// a later remote outage serves recent data instead of nothing. Remote
    /// read misses are deliberately not copied in.
    async fn mirror_write(&self, command: &Command) {
        match command {
            Command::Set { .. } | Command::SetEx { .. } | Command::Del { .. } => {
                if let Err(e) = self.memory.execute(command).await {
                    tracing::debug!(error = %e, "In-process mirror write failed");
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Convenience wrappers
    // ========================================================================

    pub async fn get(&self, key: &str) -> Option<String> {
        match self.execute(Command::Get { key: key.into() }).await {
            Ok(reply) => reply.into_text(),
            Err(e) => {
                tracing::debug!(key = key, error = %e, "GET failed");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> bool {
        self.execute(Command::Set {
            key: key.into(),
            value: value.into(),
        })
        .await
        .is_ok()
    }

    pub async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> bool {
        self.execute(Command::SetEx {
            key: key.into(),
            ttl_secs,
            value: value.into(),
        })
        .await
        .is_ok()
    }

    pub async fn del(&self, keys: &[String]) -> i64 {
        if keys.is_empty() {
            return 0;
        }
        match self.execute(Command::Del { keys: keys.to_vec() }).await {
            Ok(reply) => reply.as_int(),
            Err(_) => 0,
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self
            .execute(Command::Exists {
                keys: vec![key.into()],
            })
            .await
        {
            Ok(reply) => reply.as_int() > 0,
            Err(_) => false,
        }
    }

    pub async fn ttl(&self, key: &str) -> i64 {
        match self.execute(Command::Ttl { key: key.into() }).await {
            Ok(reply) => reply.as_int(),
            Err(_) => -2,
        }
    }

    pub async fn incr(&self, key: &str) -> Option<i64> {
        self.execute(Command::Incr { key: key.into() })
            .await
            .ok()
            .map(|r| r.as_int())
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> bool {
        match self
            .execute(Command::Expire {
                key: key.into(),
                ttl_secs,
            })
            .await
        {
            Ok(reply) => reply.as_int() > 0,
            Err(_) => false,
        }
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        match self
            .execute(Command::Keys {
                pattern: pattern.into(),
            })
            .await
        {
            Ok(reply) => reply.into_list(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.execute(Command::HGet {
            key: key.into(),
            field: field.into(),
        })
        .await
        .ok()
        .and_then(Reply::into_text)
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> bool {
        self.execute(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        })
        .await
        .is_ok()
    }

    pub async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        match self.execute(Command::HGetAll { key: key.into() }).await {
            Ok(reply) => reply.into_map(),
            Err(_) => HashMap::new(),
        }
    }

    pub async fn lpush(&self, key: &str, values: &[String]) -> i64 {
        match self
            .execute(Command::LPush {
                key: key.into(),
                values: values.to_vec(),
            })
            .await
        {
            Ok(reply) => reply.as_int(),
            Err(_) => 0,
        }
    }

    pub async fn rpush(&self, key: &str, values: &[String]) -> i64 {
        match self
            .execute(Command::RPush {
                key: key.into(),
                values: values.to_vec(),
            })
            .await
        {
            Ok(reply) => reply.as_int(),
            Err(_) => 0,
        }
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        match self
            .execute(Command::LRange {
                key: key.into(),
                start,
                stop,
            })
            .await
        {
            Ok(reply) => reply.into_list(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn llen(&self, key: &str) -> i64 {
        match self.execute(Command::LLen { key: key.into() }).await {
            Ok(reply) => reply.as_int(),
            Err(_) => 0,
        }
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> bool {
        self.execute(Command::LTrim {
            key: key.into(),
            start,
            stop,
        })
        .await
        .is_ok()
    }

    pub async fn info(&self) -> Option<String> {
        match self.execute(Command::Info).await {
            Ok(Reply::Text(info)) => Some(info),
            Ok(_) => None,
            Err(_) => None,
        }
    }

    pub async fn dbsize(&self) -> i64 {
        match self.execute(Command::DbSize).await {
            Ok(reply) => reply.as_int(),
            Err(_) => 0,
        }
    }

    pub async fn flushdb(&self) -> bool {
        self.execute(Command::FlushDb).await.is_ok()
    }

    pub async fn ping(&self) -> bool {
        self.execute(Command::Ping).await.is_ok()
    }
}

// ============================================================================
// Tests
// ============================================================================
