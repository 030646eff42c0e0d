//! Canonical article shape and the closed section enumeration.
//!
//! Every publisher adapter normalizes its raw payload into [`Article`] at the
//! adapter boundary; raw shapes never travel further into the pipeline. An
//! article is *complete* once it carries a non-empty AI commentary — the cache
//! tier only ever publishes complete articles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Sections
// ============================================================================

/// Topical channel. Fixed, closed enumeration — the rotation scheduler walks
/// exactly this list and the threshold gate counts against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    World,
    Us,
    Politics,
    Business,
    Technology,
    Health,
    Sports,
    Entertainment,
    Finance,
}

impl Section {
    /// All sections, in rotation order.
    pub const ALL: [Section; 9] = [
        Section::World,
        Section::Us,
        Section::Politics,
        Section::Business,
        Section::Technology,
        Section::Health,
        Section::Sports,
        Section::Entertainment,
        Section::Finance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::World => "world",
            Section::Us => "us",
            Section::Politics => "politics",
            Section::Business => "business",
            Section::Technology => "technology",
            Section::Health => "health",
            Section::Sports => "sports",
            Section::Entertainment => "entertainment",
            Section::Finance => "finance",
        }
    }

    /// Hard-news sections whose enrichment jobs get a priority bump.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            Section::Politics | Section::Us | Section::World | Section::Business
        )
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized section names coming from persisted rows.
#[derive(Debug, thiserror::Error)]
#[error("unknown section: {0}")]
pub struct UnknownSection(pub String);

impl FromStr for Section {
    type Err = UnknownSection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Section::ALL
            .iter()
            .copied()
            .find(|section| section.as_str() == s)
            .ok_or_else(|| UnknownSection(s.to_string()))
    }
}

// ============================================================================
// Articles
// ============================================================================

/// Where a commentary came from: the AI provider, or the deterministic
/// template used after terminal enrichment failure. Either way the article
/// counts as complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentarySource {
    Ai,
    Fallback,
}

impl CommentarySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentarySource::Ai => "ai",
            CommentarySource::Fallback => "fallback",
        }
    }
}

impl FromStr for CommentarySource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai" => Ok(CommentarySource::Ai),
            "fallback" => Ok(CommentarySource::Fallback),
            _ => Err(()),
        }
    }
}

/// Canonical article record.
///
/// `url` is the deduplication key (unique in the store); `id` is derived from
/// it and used for cache keys and job ids. Optional fields stay optional all
/// the way through — adapters do not invent data the publisher didn't send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub summary: String,
    pub url: String,
    pub published_date: Option<DateTime<Utc>>,
    pub byline: Option<String>,
    pub image_url: Option<String>,
    pub source: String,
    pub section: Section,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub keywords: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_commentary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary_generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary_source: Option<CommentarySource>,
}

impl Article {
    /// An article is complete iff its commentary is present and non-empty.
    /// An empty string counts as absent.
    pub fn is_complete(&self) -> bool {
        self.ai_commentary
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    /// Temporary ids (prefix `temp-`) identify ad-hoc articles that bypass
    /// the store and never enter section lists.
    pub fn is_ephemeral(&self) -> bool {
        self.id.starts_with("temp-")
    }

    /// Age relative to `now`, if the publisher supplied a publication date.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.published_date.map(|published| now - published)
    }
}

/// Snapshot written under `article:{id}` by the enrichment worker: the full
/// enriched article plus the moment it was cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedArticle {
    #[serde(flatten)]
    pub article: Article,
    pub cached_at: DateTime<Utc>,
}
