//! Environment-driven configuration.
//!
//! Everything operational comes from environment variables (the deploy target
//! is a serverless/container platform with env-based secrets). Parsing goes
//! through an injected lookup function so tests can feed a plain map instead
//! of mutating process-global state.
//!
//! Secrets are held as [`SecretString`] and masked in `Debug` output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::balance::KeyPoolConfig;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// A cache shard URL was supplied without its companion token.
    #[error("CACHE_URL_{0} is set but CACHE_TOKEN_{0} is missing")]
    ShardTokenMissing(usize),
}

// ============================================================================
// Shard endpoints
// ============================================================================

/// One remote cache shard endpoint plus its bearer token.
#[derive(Clone)]
pub struct ShardConfig {
    pub endpoint: String,
    pub token: SecretString,
    /// Daily command quota for this shard. The default sits under the
    /// provider's free-tier 10k/day ceiling.
    pub daily_limit: u64,
}

impl std::fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &"[REDACTED]")
            .field("daily_limit", &self.daily_limit)
            .finish()
    }
}

impl ShardConfig {
    pub const DEFAULT_DAILY_LIMIT: u64 = 9_000;

    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: SecretString::from(token.into()),
            daily_limit: Self::DEFAULT_DAILY_LIMIT,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level service configuration.
///
/// Tuning fields (pacing, dispatch window, health period) have production
/// defaults and are not environment-mapped; tests shrink them to keep suites
/// fast.
#[derive(Clone)]
pub struct Config {
    /// Document store connection string.
    pub store_uri: String,

    /// Remote cache shards, in declaration order. May be empty.
    pub cache_shards: Vec<ShardConfig>,

    /// Skip remote shards entirely; serve cache traffic from the in-process
    /// map only.
    pub cache_disabled: bool,

    /// AI provider credentials (1..4 accepted).
    pub ai_keys: Vec<SecretString>,
    pub ai_base_url: String,
    pub ai_model: String,

    /// Section-keyed top-stories publisher (single credential).
    pub publisher_a_key: Option<SecretString>,
    pub publisher_a_base_url: String,

    /// Query-keyed headlines publisher (up to five credentials).
    pub publisher_b_keys: Vec<SecretString>,
    pub publisher_b_base_url: String,

    /// Scheduler tick period.
    pub rotation_period: Duration,

    /// Minimum enriched articles per section before the gate opens.
    pub section_threshold: u32,

    /// FIFO list cap per section.
    pub max_section_cache: usize,

    /// Courtesy pause between articles within one section batch.
    pub item_pacing: Duration,

    /// Queue dispatcher idle delay when the queue is empty.
    pub drain_delay: Duration,

    /// Shard pool health re-check period.
    pub health_check_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_uri: "sqlite:newsflow.db?mode=rwc".to_string(),
            cache_shards: Vec::new(),
            cache_disabled: false,
            ai_keys: Vec::new(),
            ai_base_url: "https://api.openai.com".to_string(),
            ai_model: "gpt-4o-mini".to_string(),
            publisher_a_key: None,
            publisher_a_base_url: "https://api.nytimes.com".to_string(),
            publisher_b_keys: Vec::new(),
            publisher_b_base_url: "https://gnews.io".to_string(),
            rotation_period: Duration::from_secs(180),
            section_threshold: 8,
            max_section_cache: 20,
            item_pacing: Duration::from_secs(2),
            drain_delay: Duration::from_secs(30),
            health_check_period: Duration::from_secs(300),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("store_uri", &self.store_uri)
            .field("cache_shards", &self.cache_shards)
            .field("cache_disabled", &self.cache_disabled)
            .field("ai_keys", &format!("[{} key(s)]", self.ai_keys.len()))
            .field("ai_base_url", &self.ai_base_url)
            .field("ai_model", &self.ai_model)
            .field(
                "publisher_a_key",
                &self.publisher_a_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("publisher_a_base_url", &self.publisher_a_base_url)
            .field(
                "publisher_b_keys",
                &format!("[{} key(s)]", self.publisher_b_keys.len()),
            )
            .field("publisher_b_base_url", &self.publisher_b_base_url)
            .field("rotation_period", &self.rotation_period)
            .field("section_threshold", &self.section_threshold)
            .field("max_section_cache", &self.max_section_cache)
            .finish()
    }
}

/// Maximum number of cache shards scanned from the environment.
const MAX_SHARDS: usize = 4;

/// Maximum number of AI credentials scanned from the environment.
const MAX_AI_KEYS: usize = 4;

/// Maximum number of headlines-publisher credentials.
const MAX_PUBLISHER_B_KEYS: usize = 5;

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an injected variable lookup.
    ///
    /// Missing variables fall back to defaults; malformed numeric values are
    /// errors rather than silent fallbacks so a typoed deploy fails loudly.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(uri) = lookup("STORE_URI") {
            config.store_uri = uri;
        }

        config.cache_disabled = lookup("CACHE_DISABLED")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        // Shards are declared as CACHE_URL_1/CACHE_TOKEN_1 .. pairs. A URL
        // without its token is a misconfiguration, not a shard to skip.
        for index in 1..=MAX_SHARDS {
            let url_var = format!("CACHE_URL_{index}");
            let token_var = format!("CACHE_TOKEN_{index}");
            match (lookup(&url_var), lookup(&token_var)) {
                (Some(endpoint), Some(token)) => {
                    config.cache_shards.push(ShardConfig::new(endpoint, token));
                }
                (Some(_), None) => return Err(ConfigError::ShardTokenMissing(index)),
                _ => {}
            }
        }

        if let Some(key) = lookup("AI_KEY") {
            config.ai_keys.push(SecretString::from(key));
        }
        for index in 2..=MAX_AI_KEYS {
            if let Some(key) = lookup(&format!("AI_KEY_{index}")) {
                config.ai_keys.push(SecretString::from(key));
            }
        }
        if let Some(base) = lookup("AI_BASE_URL") {
            config.ai_base_url = base;
        }
        if let Some(model) = lookup("AI_MODEL") {
            config.ai_model = model;
        }

        config.publisher_a_key = lookup("PUBLISHER_A_KEY").map(SecretString::from);
        if let Some(base) = lookup("PUBLISHER_A_BASE_URL") {
            config.publisher_a_base_url = base;
        }
        for index in 1..=MAX_PUBLISHER_B_KEYS {
            if let Some(key) = lookup(&format!("PUBLISHER_B_KEY_{index}")) {
                config.publisher_b_keys.push(SecretString::from(key));
            }
        }
        if let Some(base) = lookup("PUBLISHER_B_BASE_URL") {
            config.publisher_b_base_url = base;
        }

        if let Some(value) = lookup("ROTATION_PERIOD_SEC") {
            let secs = parse_number::<u64>("ROTATION_PERIOD_SEC", &value)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "ROTATION_PERIOD_SEC",
                    value,
                    reason: "must be at least 1 second".to_string(),
                });
            }
            config.rotation_period = Duration::from_secs(secs);
        }

        if let Some(value) = lookup("SECTION_THRESHOLD") {
            config.section_threshold = parse_number("SECTION_THRESHOLD", &value)?;
        }

        if let Some(value) = lookup("MAX_SECTION_CACHE") {
            let cap = parse_number::<usize>("MAX_SECTION_CACHE", &value)?;
            if cap == 0 {
                return Err(ConfigError::Invalid {
                    var: "MAX_SECTION_CACHE",
                    value,
                    reason: "must be at least 1".to_string(),
                });
            }
            config.max_section_cache = cap;
        }

        tracing::info!(
            shards = config.cache_shards.len(),
            cache_disabled = config.cache_disabled,
            ai_keys = config.ai_keys.len(),
            publisher_b_keys = config.publisher_b_keys.len(),
            rotation_period_secs = config.rotation_period.as_secs(),
            threshold = config.section_threshold,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Load configuration from a plain map (test convenience).
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|var| vars.get(var).cloned())
    }

    /// Key-pool parameters for the AI provider: token-denominated quotas with
    /// headroom so one commentary's worth of tokens never overshoots a limit.
    pub fn ai_pool_config(&self) -> KeyPoolConfig {
        KeyPoolConfig {
            name: "ai",
            daily_limit: 250_000,
            safety_buffer: 1_000,
            reserved_quantum: 600,
        }
    }

    /// Key-pool parameters for publisher APIs: request-count quotas, no
    /// buffer (a single request either fits the day's budget or it doesn't).
    pub fn publisher_pool_config(&self, name: &'static str, daily_limit: u64) -> KeyPoolConfig {
        KeyPoolConfig {
            name,
            daily_limit,
            safety_buffer: 0,
            reserved_quantum: 1,
        }
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: "not a valid number".to_string(),
    })
}

// ============================================================================
// Tests
// ============================================================================
