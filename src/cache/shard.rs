//! Cache shard backends: the remote REST shard and the in-process fallback.
//!
//! The remote backend speaks the REST dialect of the hosted KV provider:
//! each command is POSTed as a JSON array (`["SETEX", key, secs, value]`)
//! with a bearer token, and the reply arrives as `{"result": ...}` or
//! `{"error": "..."}`. The in-process shard implements the same command set
//! over a plain map with lazy expiry, and exists so cache traffic degrades
//! instead of failing when every remote shard is down or over quota.

use lru::LruCache;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::glob_match;

/// Deadline for any single remote cache command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry cap for the in-process fallback map. LRU eviction bounds memory if
/// the remote shards stay down for a long stretch.
const MEMORY_SHARD_CAPACITY: usize = 10_000;

// ============================================================================
// Commands and replies
// ============================================================================

/// The command set the pool exposes. Matches standard KV semantics with list
/// extensions; only what the pipeline actually uses is represented.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
    SetEx { key: String, ttl_secs: u64, value: String },
    Del { keys: Vec<String> },
    Exists { keys: Vec<String> },
    Ttl { key: String },
    Incr { key: String },
    Expire { key: String, ttl_secs: u64 },
    Keys { pattern: String },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: String },
    HGetAll { key: String },
    LPush { key: String, values: Vec<String> },
    RPush { key: String, values: Vec<String> },
    LRange { key: String, start: i64, stop: i64 },
    LLen { key: String },
    LTrim { key: String, start: i64, stop: i64 },
    Info,
    DbSize,
    FlushDb,
    Ping,
}

/// How a command is routed across the shard set.
pub enum Routing<'a> {
    /// Keyed: consistent-hash to one shard.
    Key(&'a str),
    /// Scatter to every healthy shard and merge.
    Global,
    /// No key: pick the least-loaded shard.
    Any,
}

impl Command {
    pub fn routing(&self) -> Routing<'_> {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::SetEx { key, .. }
            | Command::Ttl { key }
            | Command::Incr { key }
            | Command::Expire { key, .. }
            | Command::HGet { key, .. }
            | Command::HSet { key, .. }
            | Command::HGetAll { key }
            | Command::LPush { key, .. }
            | Command::RPush { key, .. }
            | Command::LRange { key, .. }
            | Command::LLen { key }
            | Command::LTrim { key, .. } => Routing::Key(key),
            // Multi-key commands route on their first key; the pipeline only
            // ever batches keys that share a routing prefix.
            Command::Del { keys } | Command::Exists { keys } => match keys.first() {
                Some(key) => Routing::Key(key),
                None => Routing::Any,
            },
            Command::Keys { .. } | Command::DbSize | Command::FlushDb => Routing::Global,
            Command::Info | Command::Ping => Routing::Any,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::SetEx { .. } => "SETEX",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::Ttl { .. } => "TTL",
            Command::Incr { .. } => "INCR",
            Command::Expire { .. } => "EXPIRE",
            Command::Keys { .. } => "KEYS",
            Command::HGet { .. } => "HGET",
            Command::HSet { .. } => "HSET",
            Command::HGetAll { .. } => "HGETALL",
            Command::LPush { .. } => "LPUSH",
            Command::RPush { .. } => "RPUSH",
            Command::LRange { .. } => "LRANGE",
            Command::LLen { .. } => "LLEN",
            Command::LTrim { .. } => "LTRIM",
            Command::Info => "INFO",
            Command::DbSize => "DBSIZE",
            Command::FlushDb => "FLUSHDB",
            Command::Ping => "PING",
        }
    }

    /// Wire encoding: the flat argument array the REST endpoint expects.
    fn to_wire(&self) -> Vec<String> {
        let mut parts = vec![self.name().to_string()];
        match self {
            Command::Get { key }
            | Command::Ttl { key }
            | Command::Incr { key }
            | Command::HGetAll { key }
            | Command::LLen { key } => parts.push(key.clone()),
            Command::Set { key, value } => {
                parts.push(key.clone());
                parts.push(value.clone());
            }
            Command::SetEx { key, ttl_secs, value } => {
                parts.push(key.clone());
                parts.push(ttl_secs.to_string());
                parts.push(value.clone());
            }
            Command::Del { keys } | Command::Exists { keys } => {
                parts.extend(keys.iter().cloned());
            }
            Command::Expire { key, ttl_secs } => {
                parts.push(key.clone());
                parts.push(ttl_secs.to_string());
            }
            Command::Keys { pattern } => parts.push(pattern.clone()),
            Command::HGet { key, field } => {
                parts.push(key.clone());
                parts.push(field.clone());
            }
            Command::HSet { key, field, value } => {
                parts.push(key.clone());
                parts.push(field.clone());
                parts.push(value.clone());
            }
            Command::LPush { key, values } | Command::RPush { key, values } => {
                parts.push(key.clone());
                parts.extend(values.iter().cloned());
            }
            Command::LRange { key, start, stop } | Command::LTrim { key, start, stop } => {
                parts.push(key.clone());
                parts.push(start.to_string());
                parts.push(stop.to_string());
            }
            Command::Info | Command::DbSize | Command::FlushDb | Command::Ping => {}
        }
        parts
    }
}

/// Command reply, normalized across backends.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl Reply {
    pub fn into_text(self) -> Option<String> {
        match self {
            Reply::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Reply::Int(n) => *n,
            _ => 0,
        }
    }

    pub fn into_list(self) -> Vec<String> {
        match self {
            Reply::List(items) => items,
            _ => Vec::new(),
        }
    }

    /// Interpret a flat `[field, value, ...]` reply (HGETALL) as a map.
    pub fn into_map(self) -> HashMap<String, String> {
        let items = self.into_list();
        let mut map = HashMap::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            map.insert(field, value);
        }
        map
    }
}

#[derive(Debug, Error)]
pub enum ShardError {
    /// The shard reported its daily command quota exhausted.
    #[error("Shard daily quota exceeded")]
    QuotaExceeded,

    #[error("Command timed out after {}s", COMMAND_TIMEOUT.as_secs())]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// Remote REST shard
// ============================================================================

pub struct RestShard {
    pub id: usize,
    pub endpoint: String,
    token: SecretString,
    client: reqwest::Client,
}

impl RestShard {
    pub fn new(id: usize, endpoint: String, token: SecretString, client: reqwest::Client) -> Self {
        Self {
            id,
            endpoint,
            token,
            client,
        }
    }

    pub async fn execute(&self, command: &Command) -> Result<Reply, ShardError> {
        let body = Value::Array(
            command
                .to_wire()
                .into_iter()
                .map(Value::String)
                .collect(),
        );

        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            self.token.expose_secret()
        ))
        .map_err(|_| ShardError::Protocol("token contains invalid header characters".into()))?;
        auth.set_sensitive(true);

        let request = self
            .client
            .post(&self.endpoint)
            .header("Authorization", auth)
            .json(&body);

        let response = tokio::time::timeout(COMMAND_TIMEOUT, request.send())
            .await
            .map_err(|_| ShardError::Timeout)?
            .map_err(|e| ShardError::Network(e.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ShardError::Protocol(e.to_string()))?;

        if let Some(error) = payload.get("error").and_then(Value::as_str) {
            let lowered = error.to_lowercase();
            if lowered.contains("limit exceeded") || lowered.contains("quota") {
                return Err(ShardError::QuotaExceeded);
            }
            return Err(ShardError::Protocol(error.to_string()));
        }
        if !status.is_success() {
            // 429 without a parseable error body is still a quota signal.
            if status.as_u16() == 429 {
                return Err(ShardError::QuotaExceeded);
            }
            return Err(ShardError::HttpStatus(status.as_u16()));
        }

        Ok(decode_result(payload.get("result").cloned().unwrap_or(Value::Null)))
    }

    /// Health probe; returns observed round-trip latency.
    pub async fn ping(&self) -> Result<Duration, ShardError> {
        let start = Instant::now();
        self.execute(&Command::Ping).await?;
        Ok(start.elapsed())
    }
}

fn decode_result(value: Value) -> Reply {
    match value {
        Value::Null => Reply::Nil,
        Value::String(s) if s == "OK" || s == "PONG" => Reply::Ok,
        Value::String(s) => Reply::Text(s),
        Value::Number(n) => Reply::Int(n.as_i64().unwrap_or(0)),
        Value::Array(items) => Reply::List(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
        ),
        other => Reply::Text(other.to_string()),
    }
}

// ============================================================================
// In-process fallback shard
// ============================================================================

enum Stored {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// In-process LRU map implementing the shard command set with lazy expiry:
/// entries are dropped when touched after their deadline, and a periodic
/// sweep (driven by the pool's health loop) clears the rest. No per-entry
/// timers; the LRU cap bounds memory during long remote outages.
pub struct MemoryShard {
    entries: Mutex<LruCache<String, Entry>>,
}

impl Default for MemoryShard {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryShard {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(MEMORY_SHARD_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Drop every expired entry. Called from the pool's periodic health pass.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
    }

    pub async fn execute(&self, command: &Command) -> Result<Reply, ShardError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        // Lazy expiry for the keys this command touches.
        let touched: Vec<String> = command_keys(command);
        for key in &touched {
            if entries.peek(key).is_some_and(|e| e.expired(now)) {
                entries.pop(key);
            }
        }

        let reply = match command {
            Command::Get { key } => match entries.get(key) {
                Some(Entry {
                    value: Stored::Str(s),
                    ..
                }) => Reply::Text(s.clone()),
                Some(_) => return Err(ShardError::Protocol("wrong type for GET".into())),
                None => Reply::Nil,
            },
            Command::Set { key, value } => {
                entries.put(
                    key.clone(),
                    Entry {
                        value: Stored::Str(value.clone()),
                        expires_at: None,
                    },
                );
                Reply::Ok
            }
            Command::SetEx {
                key,
                ttl_secs,
                value,
            } => {
                entries.put(
                    key.clone(),
                    Entry {
                        value: Stored::Str(value.clone()),
                        expires_at: Some(now + Duration::from_secs(*ttl_secs)),
                    },
                );
                Reply::Ok
            }
            Command::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if entries.pop(key).is_some() {
                        removed += 1;
                    }
                }
                Reply::Int(removed)
            }
            Command::Exists { keys } => {
                let count = keys.iter().filter(|k| entries.contains(*k)).count();
                Reply::Int(count as i64)
            }
            Command::Ttl { key } => match entries.get(key) {
                None => Reply::Int(-2),
                Some(Entry {
                    expires_at: None, ..
                }) => Reply::Int(-1),
                Some(Entry {
                    expires_at: Some(deadline),
                    ..
                }) => Reply::Int(deadline.saturating_duration_since(now).as_secs() as i64),
            },
            Command::Incr { key } => {
                let entry = entries.get_or_insert_mut(key.clone(), || Entry {
                    value: Stored::Str("0".to_string()),
                    expires_at: None,
                });
                let Stored::Str(current) = &mut entry.value else {
                    return Err(ShardError::Protocol("wrong type for INCR".into()));
                };
                let n: i64 = current
                    .parse()
                    .map_err(|_| ShardError::Protocol("value is not an integer".into()))?;
                let next = n + 1;
                *current = next.to_string();
                Reply::Int(next)
            }
            Command::Expire { key, ttl_secs } => match entries.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(now + Duration::from_secs(*ttl_secs));
                    Reply::Int(1)
                }
                None => Reply::Int(0),
            },
            Command::Keys { pattern } => {
                let mut keys: Vec<String> = entries
                    .iter()
                    .filter(|(_, entry)| !entry.expired(now))
                    .map(|(key, _)| key.clone())
                    .filter(|key| glob_match(pattern, key))
                    .collect();
                keys.sort();
                Reply::List(keys)
            }
            Command::HGet { key, field } => match entries.get(key) {
                Some(Entry {
                    value: Stored::Hash(map),
                    ..
                }) => map
                    .get(field)
                    .map(|v| Reply::Text(v.clone()))
                    .unwrap_or(Reply::Nil),
                Some(_) => return Err(ShardError::Protocol("wrong type for HGET".into())),
                None => Reply::Nil,
            },
            Command::HSet { key, field, value } => {
                let entry = entries.get_or_insert_mut(key.clone(), || Entry {
                    value: Stored::Hash(HashMap::new()),
                    expires_at: None,
                });
                let Stored::Hash(map) = &mut entry.value else {
                    return Err(ShardError::Protocol("wrong type for HSET".into()));
                };
                let added = !map.contains_key(field);
                map.insert(field.clone(), value.clone());
                Reply::Int(added as i64)
            }
            Command::HGetAll { key } => match entries.get(key) {
                Some(Entry {
                    value: Stored::Hash(map),
                    ..
                }) => {
                    let mut flat = Vec::with_capacity(map.len() * 2);
                    let mut fields: Vec<_> = map.iter().collect();
                    fields.sort_by(|a, b| a.0.cmp(b.0));
                    for (field, value) in fields {
                        flat.push(field.clone());
                        flat.push(value.clone());
                    }
                    Reply::List(flat)
                }
                Some(_) => return Err(ShardError::Protocol("wrong type for HGETALL".into())),
                None => Reply::List(Vec::new()),
            },
            Command::LPush { key, values } => {
                let entry = entries.get_or_insert_mut(key.clone(), || Entry {
                    value: Stored::List(VecDeque::new()),
                    expires_at: None,
                });
                let Stored::List(list) = &mut entry.value else {
                    return Err(ShardError::Protocol("wrong type for LPUSH".into()));
                };
                for value in values {
                    list.push_front(value.clone());
                }
                Reply::Int(list.len() as i64)
            }
            Command::RPush { key, values } => {
                let entry = entries.get_or_insert_mut(key.clone(), || Entry {
                    value: Stored::List(VecDeque::new()),
                    expires_at: None,
                });
                let Stored::List(list) = &mut entry.value else {
                    return Err(ShardError::Protocol("wrong type for RPUSH".into()));
                };
                for value in values {
                    list.push_back(value.clone());
                }
                Reply::Int(list.len() as i64)
            }
            Command::LRange { key, start, stop } => match entries.get(key) {
                Some(Entry {
                    value: Stored::List(list),
                    ..
                }) => {
                    let (from, to) = normalize_range(*start, *stop, list.len());
                    Reply::List(
                        list.iter()
                            .skip(from)
                            .take(to.saturating_sub(from))
                            .cloned()
                            .collect(),
                    )
                }
                Some(_) => return Err(ShardError::Protocol("wrong type for LRANGE".into())),
                None => Reply::List(Vec::new()),
            },
            Command::LLen { key } => match entries.get(key) {
                Some(Entry {
                    value: Stored::List(list),
                    ..
                }) => Reply::Int(list.len() as i64),
                Some(_) => return Err(ShardError::Protocol("wrong type for LLEN".into())),
                None => Reply::Int(0),
            },
            Command::LTrim { key, start, stop } => {
                let mut drop_empty = false;
                if let Some(Entry {
                    value: Stored::List(list),
                    ..
                }) = entries.get_mut(key)
                {
                    let (from, to) = normalize_range(*start, *stop, list.len());
                    let kept: VecDeque<String> = list
                        .iter()
                        .skip(from)
                        .take(to.saturating_sub(from))
                        .cloned()
                        .collect();
                    if kept.is_empty() {
                        drop_empty = true;
                    } else {
                        *list = kept;
                    }
                }
                // An emptied list is removed outright, matching the remote
                // backend where a trimmed-to-nothing key stops existing.
                if drop_empty {
                    entries.pop(key);
                }
                Reply::Ok
            }
            Command::Info => Reply::Text("backend:memory".to_string()),
            Command::DbSize => {
                let live = entries.iter().filter(|(_, e)| !e.expired(now)).count();
                Reply::Int(live as i64)
            }
            Command::FlushDb => {
                entries.clear();
                Reply::Ok
            }
            Command::Ping => Reply::Ok,
        };

        Ok(reply)
    }
}

fn command_keys(command: &Command) -> Vec<String> {
    match command {
        Command::Del { keys } | Command::Exists { keys } => keys.clone(),
        Command::Get { key }
        | Command::Set { key, .. }
        | Command::SetEx { key, .. }
        | Command::Ttl { key }
        | Command::Incr { key }
        | Command::Expire { key, .. }
        | Command::HGet { key, .. }
        | Command::HSet { key, .. }
        | Command::HGetAll { key }
        | Command::LPush { key, .. }
        | Command::RPush { key, .. }
        | Command::LRange { key, .. }
        | Command::LLen { key }
        | Command::LTrim { key, .. } => vec![key.clone()],
        _ => Vec::new(),
    }
}

/// Normalize redis-style `[start, stop]` (inclusive, negatives from the end)
/// into a `[from, to)` half-open range over a list of `len` items.
fn normalize_range(start: i64, stop: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    let mut from = if start < 0 { len + start } else { start };
    let mut to = if stop < 0 { len + stop } else { stop };
    from = from.clamp(0, len);
    to = to.clamp(-1, len - 1);
    if from > to {
        return (0, 0);
    }
    (from as usize, (to + 1) as usize)
}

// ============================================================================
// Tests
// ============================================================================
