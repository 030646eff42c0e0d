//! AI provider client for commentary generation.
//!
//! Speaks the chat-completions protocol against a configurable base URL (the
//! default points at the hosted provider; tests point it at a mock server).
//! Every call goes through the AI key pool, which spreads token spend across
//! credentials and quarantines exhausted keys.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::balance::{BalancerError, DispatchError, KeyPool, Usage};
use crate::config::Config;
use crate::model::Article;

/// Deadline for a single generation request.
const AI_TIMEOUT: Duration = Duration::from_secs(30);

/// Generation parameters: factual-leaning temperature, output bounded to the
/// reserved token quantum the key pool budgets per call.
const TEMPERATURE: f64 = 0.5;
const MAX_OUTPUT_TOKENS: u32 = 600;

const SYSTEM_PROMPT: &str = "You are a news analyst. Write tight, factual \
analytical commentary for the article you are given. Do not speculate beyond \
the provided material.";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

pub struct AiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    pool: Arc<KeyPool>,
}

impl AiClient {
    pub fn new(config: &Config, pool: Arc<KeyPool>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.ai_base_url.trim_end_matches('/').to_string(),
            model: config.ai_model.clone(),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Generate the three-part commentary for an article.
    ///
    /// Token spend is taken from the provider's usage report; when the
    /// report is missing, the budgeted maximum is charged so the quota
    /// ledger errs on the safe side.
    pub async fn generate_commentary(&self, article: &Article) -> Result<String, BalancerError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let prompt = build_prompt(article);
        let client = self.client.clone();
        let model = self.model.clone();

        self.pool
            .dispatch(move |credential_id, secret| {
                let client = client.clone();
                let url = url.clone();
                let model = model.clone();
                let prompt = prompt.clone();
                async move {
                    request_completion(&client, &url, &model, &prompt, credential_id, secret).await
                }
            })
            .await
    }
}

async fn request_completion(
    client: &reqwest::Client,
    url: &str,
    model: &str,
    prompt: &str,
    credential_id: usize,
    secret: SecretString,
) -> Result<Usage<String>, DispatchError> {
    let body = json!({
        "model": model,
        "temperature": TEMPERATURE,
        "max_tokens": MAX_OUTPUT_TOKENS,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": prompt },
        ],
    });

    let mut auth =
        reqwest::header::HeaderValue::from_str(&format!("Bearer {}", secret.expose_secret()))
            .map_err(|_| DispatchError::Auth("key contains invalid header characters".into()))?;
    auth.set_sensitive(true);

    let response = tokio::time::timeout(
        AI_TIMEOUT,
        client
            .post(url)
            .header("Authorization", auth)
            .json(&body)
            .send(),
    )
    .await
    .map_err(|_| DispatchError::Transient("generation timed out".into()))?
    .map_err(|e| DispatchError::Transient(e.to_string()))?;

    let status = response.status();
    match status.as_u16() {
        429 => {
            return Err(DispatchError::RateLimited(format!(
                "credential {credential_id} rate limited"
            )))
        }
        401 | 403 => {
            return Err(DispatchError::Auth(format!("status {status}")));
        }
        s if s >= 500 => {
            return Err(DispatchError::Transient(format!("status {status}")));
        }
        s if s >= 400 => {
            // Request-shaped failure; other credentials would fail the same way.
            let detail = response.text().await.unwrap_or_default();
            return Err(DispatchError::Fatal(format!("status {s}: {detail}")));
        }
        _ => {}
    }

    let payload: ChatResponse = response
        .json()
        .await
        .map_err(|e| DispatchError::Transient(format!("malformed completion: {e}")))?;

    // Some providers flag quota exhaustion in-band with a 200.
    let text = payload
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.trim().to_string())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(DispatchError::Transient("empty completion".into()));
    }

    let tokens = payload
        .usage
        .map(|u| u.total_tokens)
        .unwrap_or(MAX_OUTPUT_TOKENS as u64);
    Ok(Usage::new(text, tokens))
}

/// The prompt constrains the output to the three labeled sections the reader
/// UI renders; each section is asked for 2-3 complete sentences.
fn build_prompt(article: &Article) -> String {
    format!(
        "Write an analytical commentary for this {} article.\n\
         \n\
         Title: {}\n\
         Summary: {}\n\
         \n\
         Structure the commentary as exactly three labeled sections:\n\
         \n\
         Key Points\n\
         2-3 complete sentences distilling what happened.\n\
         \n\
         Impact Analysis\n\
         2-3 complete sentences on who is affected and how.\n\
         \n\
         Future Outlook\n\
         2-3 complete sentences on what is likely to happen next.",
        article.section, article.title, article.summary
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::KeyPoolConfig;
    use crate::model::Section;
    use std::collections::BTreeSet;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article() -> Article {
        Article {
            id: "abc".into(),
            title: "Markets rally".into(),
            summary: "Stocks rose broadly.".into(),
            url: "https://example.com/markets".into(),
            published_date: None,
            byline: None,
            image_url: None,
            source: "topstories".into(),
            section: Section::Business,
            keywords: BTreeSet::new(),
            ai_commentary: None,
            commentary_generated_at: None,
            commentary_source: None,
        }
    }

    fn client_for(server: &MockServer, keys: usize) -> AiClient {
        let mut config = Config::default();
        config.ai_base_url = server.uri();
        let secrets = (0..keys)
            .map(|i| SecretString::from(format!("ai-key-{i}")))
            .collect();
        let pool = Arc::new(KeyPool::new(
            KeyPoolConfig {
                name: "ai",
                daily_limit: 10_000,
                safety_buffer: 1_000,
                reserved_quantum: 600,
            },
            secrets,
        ));
        AiClient::new(&config, pool)
    }

    fn completion_body(text: &str, tokens: u64) -> serde_json::Value {
        json!({
            "choices": [ { "message": { "role": "assistant", "content": text } } ],
            "usage": { "prompt_tokens": 100, "completion_tokens": tokens - 100, "total_tokens": tokens },
        })
    }

    #[tokio::test]
    async fn test_generation_success_records_token_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_exists("Authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("Key Points\nIt went up.", 450)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let text = client.generate_commentary(&article()).await.unwrap();
        assert!(text.starts_with("Key Points"));

        let stats = client.pool().stats().await;
        assert_eq!(stats.credentials[0].used_today, 450);
    }

    #[tokio::test]
    async fn test_rate_limit_fails_over_to_next_key() {
        let server = MockServer::start().await;
        // First request 429, everything after succeeds.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion_body("Commentary", 300)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let text = client.generate_commentary(&article()).await.unwrap();
        assert_eq!(text, "Commentary");

        let stats = client.pool().stats().await;
        assert!(stats.credentials[0].dead);
        assert_eq!(stats.credentials[1].used_today, 300);
    }

    #[tokio::test]
    async fn test_single_key_rate_limit_is_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let result = client.generate_commentary(&article()).await;
        assert!(matches!(result, Err(BalancerError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let result = client.generate_commentary(&article()).await;
        assert!(matches!(result, Err(BalancerError::Auth(_))));
    }

    #[tokio::test]
    async fn test_empty_completion_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("  ", 100)))
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let result = client.generate_commentary(&article()).await;
        assert!(matches!(result, Err(BalancerError::Upstream(_))));
    }

    #[test]
    fn test_prompt_names_all_three_sections() {
        let prompt = build_prompt(&article());
        assert!(prompt.contains("Key Points"));
        assert!(prompt.contains("Impact Analysis"));
        assert!(prompt.contains("Future Outlook"));
        assert!(prompt.contains("Markets rally"));
    }
}
