//! Key-pool load balancing over quota-limited credentials.
//!
//! Each upstream (the AI provider, each publisher API) hands out free-tier
//! credentials with daily budgets — tokens for the AI provider, request
//! counts for publishers. A [`KeyPool`] spreads calls round-robin across its
//! credentials, tracks per-credential usage, quarantines rate-limited keys
//! until the next UTC midnight, and permanently retires keys that fail
//! authentication.
//!
//! Failure handling per attempt:
//! - rate limit → credential dead for the UTC day, try the next one
//! - auth failure → credential dead for the process lifetime, try the next
//! - transient (5xx, timeout, transport) → note it, try the next
//! - anything else → abort the dispatch; rotating keys won't fix a bad request

use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::future::Future;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::{next_utc_midnight, utc_day};

// ============================================================================
// Error Types
// ============================================================================

/// Per-attempt error reported by a dispatch closure. The variant decides how
/// the pool treats the credential that made the attempt.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The upstream signalled quota exhaustion (HTTP 429 or a provider
    /// "limit exceeded" marker).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Credential rejected (HTTP 401/403). Permanent for the process.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Transport error, timeout, or 5xx. The credential stays usable.
    #[error("Transient upstream error: {0}")]
    Transient(String),

    /// Request-shaped failure that no other credential can fix.
    #[error("Upstream error: {0}")]
    Fatal(String),
}

/// Terminal outcome of a dispatch after rotation is exhausted.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Every credential is dead or over budget for the current UTC day.
    #[error("All credentials exhausted for pool '{pool}'")]
    Exhausted { pool: &'static str },

    /// Every eligible credential failed authentication.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Attempts were made but all failed transiently, or the upstream
    /// returned a non-retryable error.
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl BalancerError {
    /// Whether a later retry (with backoff) could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        // Exhausted pools revive at UTC midnight and transient upstream
        // failures may clear; auth failures never do.
        !matches!(self, BalancerError::Auth(_))
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Successful dispatch result: the value plus the units of quota it consumed
/// (observed token count for the AI provider, 1 for publisher requests).
pub struct Usage<T> {
    pub value: T,
    pub units: u64,
}

impl<T> Usage<T> {
    pub fn new(value: T, units: u64) -> Self {
        Self { value, units }
    }
}

/// Pool-wide parameters. `safety_buffer` keeps a margin below each daily
/// limit; `reserved_quantum` is the worst-case cost of one more call, used
/// during candidate selection.
#[derive(Debug, Clone)]
pub struct KeyPoolConfig {
    pub name: &'static str,
    pub daily_limit: u64,
    pub safety_buffer: u64,
    pub reserved_quantum: u64,
}

#[derive(Debug)]
struct Credential {
    id: usize,
    secret: SecretString,
    daily_limit: u64,
    used_today: u64,
    /// Quarantined for the current UTC day (quota exhausted).
    dead: bool,
    /// Rejected authentication; never revived within this process.
    auth_failed: bool,
    last_error: Option<String>,
}

impl Credential {
    fn available(&self) -> bool {
        !self.dead && !self.auth_failed
    }

    /// Whether one more call (costing up to `reserved_quantum`) fits under
    /// this credential's limit with the safety buffer intact.
    fn fits(&self, config: &KeyPoolConfig) -> bool {
        let budget = self.daily_limit.saturating_sub(config.safety_buffer);
        self.available() && self.used_today + config.reserved_quantum < budget.max(1)
    }
}

struct PoolState {
    credentials: Vec<Credential>,
    next_index: usize,
    last_reset_day: NaiveDate,
}

impl PoolState {
    /// Lazy UTC-midnight reset: at the first operation of a new day, usage
    /// counters zero and quota quarantines clear. Auth failures persist.
    fn reset_if_day_rolled(&mut self, today: NaiveDate) {
        if self.last_reset_day == today {
            return;
        }
        for credential in &mut self.credentials {
            credential.used_today = 0;
            credential.dead = false;
            if !credential.auth_failed {
                credential.last_error = None;
            }
        }
        self.last_reset_day = today;
    }
}

// ============================================================================
// Stats snapshots
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub id: usize,
    pub used_today: u64,
    pub daily_limit: u64,
    pub available: bool,
    pub dead: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool: &'static str,
    pub credentials: Vec<CredentialStats>,
    pub total_used: u64,
    pub total_limit: u64,
    pub next_reset: DateTime<Utc>,
}

// ============================================================================
// KeyPool
// ============================================================================

pub struct KeyPool {
    config: KeyPoolConfig,
    state: Mutex<PoolState>,
}

impl KeyPool {
    pub fn new(config: KeyPoolConfig, secrets: Vec<SecretString>) -> Self {
        let credentials = secrets
            .into_iter()
            .enumerate()
            .map(|(index, secret)| Credential {
                id: index + 1,
                secret,
                daily_limit: config.daily_limit,
                used_today: 0,
                dead: false,
                auth_failed: false,
                last_error: None,
            })
            .collect();
        Self {
            config,
            state: Mutex::new(PoolState {
                credentials,
                next_index: 0,
                last_reset_day: utc_day(Utc::now()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Run `op` with a chosen credential, rotating through the pool on
    /// per-request failures.
    ///
    /// Selection walks round-robin from the cursor, skipping dead and
    /// over-budget credentials. When nothing is eligible, the least-used
    /// live credential gets one last-resort attempt before the pool reports
    /// itself exhausted.
    pub async fn dispatch<T, F, Fut>(&self, op: F) -> Result<T, BalancerError>
    where
        F: Fn(usize, SecretString) -> Fut,
        Fut: Future<Output = Result<Usage<T>, DispatchError>>,
    {
        let candidates = self.select_candidates().await;

        if candidates.is_empty() {
            return match self.select_last_resort().await {
                Some(candidate) => self.attempt_last_resort(candidate, &op).await,
                None => {
                    tracing::warn!(pool = self.config.name, "No usable credentials remain");
                    Err(BalancerError::Exhausted {
                        pool: self.config.name,
                    })
                }
            };
        }

        let mut last_transient: Option<String> = None;
        let mut last_auth: Option<String> = None;

        for (id, secret) in candidates {
            match op(id, secret).await {
                Ok(usage) => {
                    self.record_success(id, usage.units).await;
                    return Ok(usage.value);
                }
                Err(DispatchError::RateLimited(msg)) => {
                    tracing::warn!(
                        pool = self.config.name,
                        credential = id,
                        error = %msg,
                        "Credential rate limited, quarantining until UTC midnight"
                    );
                    self.mark_dead(id, &msg).await;
                }
                Err(DispatchError::Auth(msg)) => {
                    tracing::error!(
                        pool = self.config.name,
                        credential = id,
                        error = %msg,
                        "Credential failed authentication, retiring for process lifetime"
                    );
                    self.mark_auth_failed(id, &msg).await;
                    last_auth = Some(msg);
                }
                Err(DispatchError::Transient(msg)) => {
                    tracing::debug!(
                        pool = self.config.name,
                        credential = id,
                        error = %msg,
                        "Transient upstream error, trying next credential"
                    );
                    self.note_error(id, &msg).await;
                    last_transient = Some(msg);
                }
                Err(DispatchError::Fatal(msg)) => {
                    return Err(BalancerError::Upstream(msg));
                }
            }
        }

        if let Some(msg) = last_transient {
            return Err(BalancerError::Upstream(msg));
        }
        if let Some(msg) = last_auth {
            return Err(BalancerError::Auth(msg));
        }
        Err(BalancerError::Exhausted {
            pool: self.config.name,
        })
    }

    /// Per-credential counters, totals, and the next UTC reset.
    pub async fn stats(&self) -> PoolStats {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.reset_if_day_rolled(utc_day(now));
        let credentials: Vec<CredentialStats> = state
            .credentials
            .iter()
            .map(|c| CredentialStats {
                id: c.id,
                used_today: c.used_today,
                daily_limit: c.daily_limit,
                available: c.available(),
                dead: c.dead,
                last_error: c.last_error.clone(),
            })
            .collect();
        PoolStats {
            pool: self.config.name,
            total_used: credentials.iter().map(|c| c.used_today).sum(),
            total_limit: credentials.iter().map(|c| c.daily_limit).sum(),
            credentials,
            next_reset: next_utc_midnight(now),
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    async fn select_candidates(&self) -> Vec<(usize, SecretString)> {
        let mut state = self.state.lock().await;
        state.reset_if_day_rolled(utc_day(Utc::now()));

        let len = state.credentials.len();
        if len == 0 {
            return Vec::new();
        }
        let start = state.next_index % len;
        state.next_index = (state.next_index + 1) % len;

        let config = &self.config;
        (0..len)
            .map(|offset| (start + offset) % len)
            .filter(|&i| state.credentials[i].fits(config))
            .map(|i| {
                let c = &state.credentials[i];
                (c.id, c.secret.clone())
            })
            .collect()
    }

    /// Least-used live credential, ignoring the reserved-quantum check. Used
    /// once per dispatch when every credential is nominally over budget.
    async fn select_last_resort(&self) -> Option<(usize, SecretString)> {
        let state = self.state.lock().await;
        state
            .credentials
            .iter()
            .filter(|c| c.available() && c.used_today < c.daily_limit)
            .min_by_key(|c| c.used_today)
            .map(|c| (c.id, c.secret.clone()))
    }

    async fn attempt_last_resort<T, F, Fut>(
        &self,
        (id, secret): (usize, SecretString),
        op: &F,
    ) -> Result<T, BalancerError>
    where
        F: Fn(usize, SecretString) -> Fut,
        Fut: Future<Output = Result<Usage<T>, DispatchError>>,
    {
        tracing::info!(
            pool = self.config.name,
            credential = id,
            "All credentials over budget, attempting least-used as last resort"
        );
        match op(id, secret).await {
            Ok(usage) => {
                self.record_success(id, usage.units).await;
                Ok(usage.value)
            }
            Err(DispatchError::Fatal(msg)) => Err(BalancerError::Upstream(msg)),
            Err(e) => {
                match &e {
                    DispatchError::RateLimited(msg) => self.mark_dead(id, msg).await,
                    DispatchError::Auth(msg) => self.mark_auth_failed(id, msg).await,
                    DispatchError::Transient(msg) => self.note_error(id, msg).await,
                    DispatchError::Fatal(_) => unreachable!("handled above"),
                }
                Err(BalancerError::Exhausted {
                    pool: self.config.name,
                })
            }
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    async fn record_success(&self, id: usize, units: u64) {
        let mut state = self.state.lock().await;
        if let Some(c) = state.credentials.iter_mut().find(|c| c.id == id) {
            // Clamp so an over-estimate from the upstream can never push the
            // counter past the daily limit.
            c.used_today = (c.used_today + units).min(c.daily_limit);
            c.last_error = None;
        }
    }

    async fn mark_dead(&self, id: usize, error: &str) {
        let mut state = self.state.lock().await;
        if let Some(c) = state.credentials.iter_mut().find(|c| c.id == id) {
            c.dead = true;
            c.last_error = Some(error.to_string());
        }
    }

    async fn mark_auth_failed(&self, id: usize, error: &str) {
        let mut state = self.state.lock().await;
        if let Some(c) = state.credentials.iter_mut().find(|c| c.id == id) {
            c.auth_failed = true;
            c.last_error = Some(error.to_string());
        }
    }

    async fn note_error(&self, id: usize, error: &str) {
        let mut state = self.state.lock().await;
        if let Some(c) = state.credentials.iter_mut().find(|c| c.id == id) {
            c.last_error = Some(error.to_string());
        }
    }

    /// Test hook: pretend the last reset happened on `day` so the next
    /// operation observes a day roll.
    #[cfg(test)]
    pub(crate) async fn set_last_reset_day(&self, day: NaiveDate) {
        self.state.lock().await.last_reset_day = day;
    }
}

// ============================================================================
// Tests
// ============================================================================
