//! Tiered cache: in-process map → sharded remote cache, fronted by an
//! application-level facade.
//!
//! - [`shard`] — the two backends: the REST shard client and the in-process
//!   fallback map.
//! - [`pool`] — routing, health, and daily quotas across shards.
//! - [`tiers`] — TTL classes, read-through `get_or_set`, invalidation, and
//!   the FIFO section lists.

pub mod pool;
pub mod shard;
pub mod tiers;

pub use pool::{ShardPool, ShardStats};
pub use shard::{Command, MemoryShard, Reply, RestShard, ShardError};
pub use tiers::{
    article_key, commentary_key, section_list_key, section_view_pattern, FifoOutcome, TieredCache,
    TtlClass, ARTICLE_SNAPSHOT_TTL_SECS, HOMEPAGE_LIST_KEY, HOMEPAGE_LIST_MAX,
};
