//! Publisher API adapters.
//!
//! Two upstream shapes exist:
//!
//! - the *top-stories* API: one endpoint per section, a single credential
//!   with a whole-key daily request budget;
//! - the *headlines* API: category query parameter, up to five pooled
//!   credentials.
//!
//! Each adapter pulls a raw batch through its key pool and normalizes every
//! item into the canonical [`Article`] at this boundary. Raw shapes do not
//! travel past this module.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::balance::{BalancerError, DispatchError, KeyPool, Usage};
use crate::model::{Article, Section};
use crate::util::article_id_from_url;

/// Deadline for a publisher request.
const PUBLISHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Which upstream serves a section. Static map, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    TopStories,
    Headlines,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::TopStories => "topstories",
            SourceKind::Headlines => "headlines",
        }
    }
}

pub fn source_for(section: Section) -> SourceKind {
    match section {
        // The top-stories publisher has no entertainment or finance channel;
        // those come from the headlines API.
        Section::Entertainment | Section::Finance => SourceKind::Headlines,
        _ => SourceKind::TopStories,
    }
}

/// Map a publisher HTTP response status onto the pool's failure taxonomy.
fn classify_status(status: reqwest::StatusCode, credential_id: usize) -> Option<DispatchError> {
    match status.as_u16() {
        200..=299 => None,
        429 => Some(DispatchError::RateLimited(format!(
            "credential {credential_id} rate limited"
        ))),
        401 | 403 => Some(DispatchError::Auth(format!("status {status}"))),
        s if s >= 500 => Some(DispatchError::Transient(format!("status {status}"))),
        s => Some(DispatchError::Fatal(format!("status {s}"))),
    }
}

// ============================================================================
// Top-stories API
// ============================================================================

#[derive(Debug, Deserialize)]
struct TopStoriesResponse {
    #[serde(default)]
    results: Vec<TopStoryRaw>,
}

#[derive(Debug, Deserialize)]
struct TopStoryRaw {
    #[serde(default)]
    title: String,
    #[serde(default, rename = "abstract")]
    abstract_text: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    published_date: Option<String>,
    #[serde(default)]
    byline: Option<String>,
    #[serde(default)]
    multimedia: Vec<TopStoryImage>,
    #[serde(default)]
    des_facet: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TopStoryImage {
    #[serde(default)]
    url: String,
}

pub struct TopStoriesApi {
    client: reqwest::Client,
    base_url: String,
    pool: Arc<KeyPool>,
}

impl TopStoriesApi {
    pub fn new(base_url: &str, pool: Arc<KeyPool>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub async fn fetch_section(&self, section: Section) -> Result<Vec<Article>, BalancerError> {
        let url = format!("{}/svc/topstories/v2/{}.json", self.base_url, section);
        let client = self.client.clone();

        let response: TopStoriesResponse = self
            .pool
            .dispatch(move |credential_id, secret| {
                let client = client.clone();
                let url = url.clone();
                async move { fetch_json(&client, &url, &[("api-key", secret)], credential_id).await }
            })
            .await?;

        let total = response.results.len();
        let articles: Vec<Article> = response
            .results
            .into_iter()
            .filter_map(|raw| normalize_top_story(raw, section))
            .collect();
        if articles.len() < total {
            tracing::debug!(
                section = %section,
                dropped = total - articles.len(),
                "Top-stories items skipped during normalization"
            );
        }
        Ok(articles)
    }
}

fn normalize_top_story(raw: TopStoryRaw, section: Section) -> Option<Article> {
    let url = valid_url(&raw.url)?;
    let title = raw.title.trim();
    if title.is_empty() {
        return None;
    }
    Some(Article {
        id: article_id_from_url(&url),
        title: title.to_string(),
        summary: raw.abstract_text.trim().to_string(),
        url,
        published_date: raw.published_date.as_deref().and_then(parse_timestamp),
        byline: raw.byline.filter(|b| !b.trim().is_empty()),
        image_url: raw
            .multimedia
            .into_iter()
            .map(|m| m.url)
            .find(|u| !u.is_empty()),
        source: "topstories".to_string(),
        section,
        keywords: raw
            .des_facet
            .into_iter()
            .filter(|k| !k.trim().is_empty())
            .collect::<BTreeSet<String>>(),
        ai_commentary: None,
        commentary_generated_at: None,
        commentary_source: None,
    })
}

// ============================================================================
// Headlines API
// ============================================================================

#[derive(Debug, Deserialize)]
struct HeadlinesResponse {
    #[serde(default)]
    articles: Vec<HeadlineRaw>,
}

#[derive(Debug, Deserialize)]
struct HeadlineRaw {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "publishedAt")]
    published_at: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    source: Option<HeadlineSource>,
}

#[derive(Debug, Deserialize)]
struct HeadlineSource {
    #[serde(default)]
    name: String,
}

pub struct HeadlinesApi {
    client: reqwest::Client,
    base_url: String,
    pool: Arc<KeyPool>,
}

impl HeadlinesApi {
    pub fn new(base_url: &str, pool: Arc<KeyPool>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub async fn fetch_section(&self, section: Section) -> Result<Vec<Article>, BalancerError> {
        // The headlines publisher has no finance category; business is the
        // closest channel and the canonical section stays `finance`.
        let category = match section {
            Section::Finance => "business",
            other => other.as_str(),
        };
        let url = format!(
            "{}/api/v4/top-headlines?category={}&lang=en",
            self.base_url, category
        );
        let client = self.client.clone();

        let response: HeadlinesResponse = self
            .pool
            .dispatch(move |credential_id, secret| {
                let client = client.clone();
                let url = url.clone();
                async move { fetch_json(&client, &url, &[("apikey", secret)], credential_id).await }
            })
            .await?;

        Ok(response
            .articles
            .into_iter()
            .filter_map(|raw| normalize_headline(raw, section))
            .collect())
    }
}

fn normalize_headline(raw: HeadlineRaw, section: Section) -> Option<Article> {
    let url = valid_url(&raw.url)?;
    let title = raw.title.trim();
    if title.is_empty() {
        return None;
    }
    Some(Article {
        id: article_id_from_url(&url),
        title: title.to_string(),
        summary: raw.description.trim().to_string(),
        url,
        published_date: raw.published_at.as_deref().and_then(parse_timestamp),
        byline: None,
        image_url: raw.image.filter(|u| !u.is_empty()),
        source: raw
            .source
            .map(|s| s.name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "headlines".to_string()),
        section,
        keywords: BTreeSet::new(),
        ai_commentary: None,
        commentary_generated_at: None,
        commentary_source: None,
    })
}

// ============================================================================
// Shared request plumbing
// ============================================================================

async fn fetch_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    query_auth: &[(&str, SecretString)],
    credential_id: usize,
) -> Result<Usage<T>, DispatchError> {
    let mut request = client.get(url);
    for (param, secret) in query_auth {
        request = request.query(&[(*param, secret.expose_secret())]);
    }

    let response = tokio::time::timeout(PUBLISHER_TIMEOUT, request.send())
        .await
        .map_err(|_| DispatchError::Transient("publisher request timed out".into()))?
        .map_err(|e| DispatchError::Transient(e.to_string()))?;

    if let Some(error) = classify_status(response.status(), credential_id) {
        return Err(error);
    }

    let payload: T = response
        .json()
        .await
        .map_err(|e| DispatchError::Transient(format!("malformed publisher payload: {e}")))?;
    // Publisher quotas are request-count denominated.
    Ok(Usage::new(payload, 1))
}

/// Accept only absolute http(s) URLs; anything else is dropped at the
/// adapter boundary.
fn valid_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.trim()).ok()?;
    match parsed.scheme() {
        "http" | "https" => Some(parsed.to_string()),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Tests
// ============================================================================
