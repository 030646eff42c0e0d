//! Document store adapter over SQLite.
//!
//! The pipeline treats the store as a document collection keyed by article
//! URL: idempotent upsert-by-url, point lookups, and the per-section
//! enriched-count aggregation the threshold gate runs on. Connection policy
//! is serverless-friendly — a single pooled connection, short acquire
//! timeout, and a bounded reconnect loop at startup. If the store cannot be
//! reached at all, reads degrade to an empty in-memory stub while writes
//! surface errors.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Article, CommentarySource, Section};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    /// Initial connection failed after the bounded reconnect loop.
    #[error("Store unreachable after {attempts} attempts: {last_error}")]
    Connect { attempts: u32, last_error: String },

    /// The adapter is running on the in-memory stub; writes are refused.
    #[error("Store unavailable (running on in-memory stub)")]
    Unavailable,

    /// A persisted row no longer decodes into the canonical article shape.
    #[error("Corrupt row for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Row mapping
// ============================================================================

/// Internal row type; converts into the canonical [`Article`].
#[derive(Debug, sqlx::FromRow)]
struct ArticleRow {
    id: String,
    url: String,
    title: String,
    summary: String,
    published: Option<i64>,
    byline: Option<String>,
    image_url: Option<String>,
    source: String,
    section: String,
    keywords: String,
    ai_commentary: Option<String>,
    commentary_generated_at: Option<i64>,
    commentary_source: Option<String>,
}

impl ArticleRow {
    fn into_article(self) -> Result<Article, StoreError> {
        let section = Section::from_str(&self.section).map_err(|e| StoreError::Corrupt {
            key: self.url.clone(),
            reason: e.to_string(),
        })?;
        let keywords = serde_json::from_str(&self.keywords).map_err(|e| StoreError::Corrupt {
            key: self.url.clone(),
            reason: format!("keywords: {e}"),
        })?;
        Ok(Article {
            id: self.id,
            title: self.title,
            summary: self.summary,
            url: self.url,
            published_date: self.published.and_then(ts_to_datetime),
            byline: self.byline,
            image_url: self.image_url,
            source: self.source,
            section,
            keywords,
            ai_commentary: self.ai_commentary,
            commentary_generated_at: self.commentary_generated_at.and_then(ts_to_datetime),
            commentary_source: self
                .commentary_source
                .as_deref()
                .and_then(|s| CommentarySource::from_str(s).ok()),
        })
    }
}

fn ts_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

// ============================================================================
// Store
// ============================================================================

/// Backend selector: live SQLite pool, or the degraded read-only stub.
enum Backend {
    Sqlite(SqlitePool),
    /// Empty read stub installed when the store never came up. Reads return
    /// nothing; writes fail with [`StoreError::Unavailable`].
    Stub,
}

pub struct Store {
    backend: Backend,
}

/// Reconnect policy: 5 attempts, exponential delay capped at 16 s.
const CONNECT_ATTEMPTS: u32 = 5;

impl Store {
    /// Open the store, running migrations. Fails if the database cannot be
    /// reached within the bounded reconnect loop.
    pub async fn open(uri: &str) -> Result<Self, StoreError> {
        let mut last_error = String::new();
        for attempt in 0..CONNECT_ATTEMPTS {
            match Self::try_open(uri).await {
                Ok(store) => {
                    if attempt > 0 {
                        tracing::info!(attempt = attempt + 1, "Store connected after retry");
                    }
                    return Ok(store);
                }
                Err(e) => {
                    last_error = e.to_string();
                    let delay = Duration::from_secs(1u64 << attempt); // 1,2,4,8,16
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = CONNECT_ATTEMPTS,
                        error = %last_error,
                        delay_secs = delay.as_secs(),
                        "Store connection failed, backing off"
                    );
                    if attempt + 1 < CONNECT_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(StoreError::Connect {
            attempts: CONNECT_ATTEMPTS,
            last_error,
        })
    }

    /// Open the store, degrading to the in-memory stub when the reconnect
    /// loop is exhausted. Reads then return empty results; writes error.
    pub async fn open_or_stub(uri: &str) -> Self {
        match Self::open(uri).await {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, "Store unreachable, degrading to in-memory stub");
                Self {
                    backend: Backend::Stub,
                }
            }
        }
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::try_open("sqlite::memory:").await
    }

    async fn try_open(uri: &str) -> Result<Self, StoreError> {
        // busy_timeout handles transient lock contention from concurrent
        // writers; a single pooled connection keeps the serverless footprint
        // minimal and sidesteps SQLite writer contention entirely.
        let options = SqliteConnectOptions::from_str(uri)?
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;
        let store = Self {
            backend: Backend::Sqlite(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.backend, Backend::Stub)
    }

    fn pool(&self) -> Result<&SqlitePool, StoreError> {
        match &self.backend {
            Backend::Sqlite(pool) => Ok(pool),
            Backend::Stub => Err(StoreError::Unavailable),
        }
    }

    /// All schema changes run in one transaction; `IF NOT EXISTS` keeps
    /// re-runs idempotent.
    async fn migrate(&self) -> Result<(), StoreError> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                summary TEXT NOT NULL,
                published INTEGER,
                byline TEXT,
                image_url TEXT,
                source TEXT NOT NULL,
                section TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                ai_commentary TEXT,
                commentary_generated_at INTEGER,
                commentary_source TEXT,
                first_seen_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_section_published
             ON articles(section, published DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // Partial index backing the threshold gate's enriched-per-section
        // aggregation; the empty-string guard mirrors the completeness rule.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_enriched
             ON articles(section)
             WHERE ai_commentary IS NOT NULL AND ai_commentary != ''",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert-or-merge keyed on `url`.
    ///
    /// Metadata fields take the incoming value; commentary fields only move
    /// forward (an upsert without commentary never erases an existing one).
    /// Returns `true` when a new row was inserted.
    pub async fn upsert_by_url(&self, article: &Article) -> Result<bool, StoreError> {
        let pool = self.pool()?;
        let now = Utc::now().timestamp();
        let keywords = serde_json::to_string(&article.keywords)
            .unwrap_or_else(|_| "[]".to_string());

        // Existence check and upsert run in one transaction so the
        // inserted/updated report stays accurate under concurrent callers.
        let mut tx = pool.begin().await?;
        let existed: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE url = ?")
            .bind(&article.url)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO articles (
                id, url, title, summary, published, byline, image_url,
                source, section, keywords, ai_commentary,
                commentary_generated_at, commentary_source,
                first_seen_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                summary = excluded.summary,
                published = excluded.published,
                byline = COALESCE(excluded.byline, articles.byline),
                image_url = COALESCE(excluded.image_url, articles.image_url),
                source = excluded.source,
                section = excluded.section,
                keywords = excluded.keywords,
                ai_commentary = COALESCE(excluded.ai_commentary, articles.ai_commentary),
                commentary_generated_at =
                    COALESCE(excluded.commentary_generated_at, articles.commentary_generated_at),
                commentary_source =
                    COALESCE(excluded.commentary_source, articles.commentary_source),
                updated_at = excluded.updated_at
        "#,
        )
        .bind(&article.id)
        .bind(&article.url)
        .bind(&article.title)
        .bind(&article.summary)
        .bind(article.published_date.map(|d| d.timestamp()))
        .bind(&article.byline)
        .bind(&article.image_url)
        .bind(&article.source)
        .bind(article.section.as_str())
        .bind(&keywords)
        .bind(&article.ai_commentary)
        .bind(article.commentary_generated_at.map(|d| d.timestamp()))
        .bind(article.commentary_source.map(|s| s.as_str()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(existed.0 == 0)
    }

    /// Attach (or refresh) a commentary on an existing article by id.
    pub async fn set_commentary(
        &self,
        article_id: &str,
        commentary: &str,
        source: CommentarySource,
        generated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let pool = self.pool()?;
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET ai_commentary = ?,
                commentary_generated_at = ?,
                commentary_source = ?,
                updated_at = ?
            WHERE id = ?
        "#,
        )
        .bind(commentary)
        .bind(generated_at.timestamp())
        .bind(source.as_str())
        .bind(Utc::now().timestamp())
        .bind(article_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn find_by_url(&self, url: &str) -> Result<Option<Article>, StoreError> {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(_) => return Ok(None), // stub: degrade, don't fail
        };
        let row: Option<ArticleRow> = sqlx::query_as(
            "SELECT id, url, title, summary, published, byline, image_url, source,
                    section, keywords, ai_commentary, commentary_generated_at,
                    commentary_source
             FROM articles WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(pool)
        .await?;
        row.map(ArticleRow::into_article).transpose()
    }

    pub async fn find_by_id(&self, article_id: &str) -> Result<Option<Article>, StoreError> {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(_) => return Ok(None),
        };
        let row: Option<ArticleRow> = sqlx::query_as(
            "SELECT id, url, title, summary, published, byline, image_url, source,
                    section, keywords, ai_commentary, commentary_generated_at,
                    commentary_source
             FROM articles WHERE id = ?",
        )
        .bind(article_id)
        .fetch_optional(pool)
        .await?;
        row.map(ArticleRow::into_article).transpose()
    }

    /// Count stored articles, optionally restricted to a section and/or to
    /// complete (enriched) articles only.
    pub async fn count_articles(
        &self,
        section: Option<Section>,
        enriched_only: bool,
    ) -> Result<i64, StoreError> {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(_) => return Ok(0),
        };
        let mut sql = String::from("SELECT COUNT(*) FROM articles WHERE 1=1");
        if section.is_some() {
            sql.push_str(" AND section = ?");
        }
        if enriched_only {
            sql.push_str(" AND ai_commentary IS NOT NULL AND ai_commentary != ''");
        }
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        if let Some(section) = section {
            query = query.bind(section.as_str());
        }
        let count = query.fetch_one(pool).await?;
        Ok(count.0)
    }

    /// Most recently published enriched articles for a section, newest
    /// first. Feeds the catch-up publication pass when the gate opens.
    pub async fn recent_enriched(
        &self,
        section: Section,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(_) => return Ok(Vec::new()),
        };
        let rows: Vec<ArticleRow> = sqlx::query_as(
            "SELECT id, url, title, summary, published, byline, image_url, source,
                    section, keywords, ai_commentary, commentary_generated_at,
                    commentary_source
             FROM articles
             WHERE section = ? AND ai_commentary IS NOT NULL AND ai_commentary != ''
             ORDER BY published DESC, updated_at DESC
             LIMIT ?",
        )
        .bind(section.as_str())
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(ArticleRow::into_article).collect()
    }

    /// Enriched-article counts per section. Sections with no rows appear with
    /// a zero count so the threshold gate sees every section every time.
    pub async fn enriched_counts_by_section(
        &self,
    ) -> Result<BTreeMap<Section, i64>, StoreError> {
        let mut counts: BTreeMap<Section, i64> =
            Section::ALL.iter().map(|s| (*s, 0)).collect();

        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(_) => return Ok(counts),
        };

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT section, COUNT(*) FROM articles
             WHERE ai_commentary IS NOT NULL AND ai_commentary != ''
             GROUP BY section",
        )
        .fetch_all(pool)
        .await?;

        for (section, count) in rows {
            match Section::from_str(&section) {
                Ok(section) => {
                    counts.insert(section, count);
                }
                Err(_) => {
                    // A row from outside the closed enumeration can only come
                    // from manual edits; count it nowhere.
                    tracing::warn!(section = %section, "Ignoring row with unknown section");
                }
            }
        }
        Ok(counts)
    }
}

// ============================================================================
// Tests
// ============================================================================
