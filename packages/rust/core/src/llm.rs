//! Text-generation collaborator.
//!
//! [`TextGenerator`] is the completion contract; [`OpenRouterGenerator`] talks
//! to an OpenAI-compatible chat endpoint, [`CachedGenerator`] memoizes
//! completions in storage, and [`LlmClient`] applies the [`CallPolicy`]
//! (timeout, bounded retries with backoff, pacing, in-flight cap) and prices
//! every call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use curator_shared::{CuratorError, LlmConfig, Result};
use curator_storage::Storage;

use crate::schema;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Structure the caller expects back; also the cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaHint {
    /// One relevance judgment per item in a batch.
    BatchJudgments,
    /// Five dimension scores for a single item.
    DimensionScores,
    /// Consensus stage 1: momentum case.
    Bull,
    /// Consensus stage 2: maturity and risk case.
    Bear,
    /// Free-text neutral rewrite.
    Paraphrase,
}

impl SchemaHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchJudgments => "batch_judgments",
            Self::DimensionScores => "dimension_scores",
            Self::Bull => "bull",
            Self::Bear => "bear",
            Self::Paraphrase => "paraphrase",
        }
    }

    /// Whether the response must be a JSON object.
    pub fn expects_json(&self) -> bool {
        !matches!(self, Self::Paraphrase)
    }
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub schema: SchemaHint,
    pub system: String,
    pub prompt: String,
    /// Item or entity ids the request is about (for logging and test doubles).
    pub subject_ids: Vec<String>,
}

/// A completion and what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    pub latency_ms: u64,
    /// Served from the completion cache (no tokens spent).
    pub cached: bool,
}

/// Produces completions for prompts.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Model identifier used for cache keying.
    fn model_id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenRouter
// ---------------------------------------------------------------------------

/// Chat-completions client for OpenRouter (or any OpenAI-compatible API).
pub struct OpenRouterGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenRouterGenerator {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("curator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CuratorError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let started = Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: 0.0,
            response_format: request
                .schema
                .expects_json()
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Title", "curator")
            .json(&body)
            .send()
            .await
            .map_err(|e| CuratorError::Collaborator(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CuratorError::Collaborator(format!(
                "HTTP {status}: {}",
                truncate_chars(&detail, 200)
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CuratorError::schema(format!("invalid completion envelope: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CuratorError::Collaborator("empty completion".into()))?;
        let usage = parsed.usage.unwrap_or(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });

        Ok(Completion {
            text,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Completion cache
// ---------------------------------------------------------------------------

/// Compute a prompt hash for cache keying.
pub fn prompt_hash(request: &CompletionRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.schema.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(request.system.as_bytes());
    hasher.update(b"\0");
    hasher.update(request.prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Serves repeated prompts from the storage completion cache.
pub struct CachedGenerator {
    inner: Arc<dyn TextGenerator>,
    storage: Arc<Storage>,
}

impl CachedGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, storage: Arc<Storage>) -> Self {
        Self { inner, storage }
    }
}

#[async_trait]
impl TextGenerator for CachedGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let hash = prompt_hash(request);
        let model = self.inner.model_id();

        if let Some(text) = self
            .storage
            .get_completion_cache(request.schema.as_str(), &hash, model)
            .await?
        {
            debug!(schema = request.schema.as_str(), "completion cache hit");
            return Ok(Completion {
                text,
                tokens_in: 0,
                tokens_out: 0,
                model: model.to_string(),
                latency_ms: 0,
                cached: true,
            });
        }

        let completion = self.inner.complete(request).await?;
        if let Err(e) = schema::conforms(request.schema, &completion.text) {
            debug!(schema = request.schema.as_str(), error = %e, "not caching malformed completion");
            return Ok(completion);
        }
        if let Err(e) = self
            .storage
            .set_completion_cache(request.schema.as_str(), &hash, model, &completion.text)
            .await
        {
            warn!(error = %e, "failed to cache completion");
        }
        Ok(completion)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

// ---------------------------------------------------------------------------
// Call policy
// ---------------------------------------------------------------------------

/// Enforces a minimum spacing between call starts.
pub struct Pacer {
    min_delay: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until the next call may start.
    pub async fn wait(&self) {
        let mut next = self.next_slot.lock().await;
        if let Some(slot) = *next {
            tokio::time::sleep_until(slot).await;
        }
        *next = Some(Instant::now() + self.min_delay);
    }
}

/// Timeout, retry and rate limits applied to every collaborator call.
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pacer: Pacer,
    in_flight: Semaphore,
}

impl CallPolicy {
    pub fn new(
        timeout: Duration,
        max_retries: u32,
        backoff_base: Duration,
        min_delay: Duration,
        max_in_flight: usize,
    ) -> Self {
        Self {
            timeout,
            max_retries,
            backoff_base,
            pacer: Pacer::new(min_delay),
            in_flight: Semaphore::new(max_in_flight.max(1)),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.min_delay_ms),
            config.max_in_flight,
        )
    }

    /// Issue `request`, retrying transport failures and timeouts with
    /// exponential backoff. A timed-out attempt counts as a failure.
    pub async fn call(
        &self,
        generator: &dyn TextGenerator,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|e| CuratorError::Collaborator(format!("call limiter closed: {e}")))?;

        let mut attempt = 0u32;
        loop {
            self.pacer.wait().await;
            let err = match tokio::time::timeout(self.timeout, generator.complete(request)).await {
                Ok(Ok(completion)) => return Ok(completion),
                Ok(Err(e)) if is_retryable(&e) => e,
                Ok(Err(e)) => return Err(e),
                Err(_) => CuratorError::Collaborator(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )),
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            let delay = self.backoff_base * 2u32.saturating_pow(attempt);
            warn!(
                schema = request.schema.as_str(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "collaborator call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_retryable(err: &CuratorError) -> bool {
    matches!(err, CuratorError::Collaborator(_) | CuratorError::Network(_))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Token and cost totals for a set of calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub calls: u64,
    pub cache_hits: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.calls += other.calls;
        self.cache_hits += other.cache_hits;
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
        self.cost_usd += other.cost_usd;
    }

    /// Copy the counters into a phase metrics map.
    pub fn write_metrics(&self, metrics: &mut BTreeMap<String, f64>) {
        metrics.insert("calls".into(), self.calls as f64);
        metrics.insert("cache_hits".into(), self.cache_hits as f64);
        metrics.insert("tokens_in".into(), self.tokens_in as f64);
        metrics.insert("tokens_out".into(), self.tokens_out as f64);
        metrics.insert("cost_usd".into(), self.cost_usd);
    }
}

/// Shared handle used by every phase that calls the collaborator.
#[derive(Clone)]
pub struct LlmClient {
    generator: Arc<dyn TextGenerator>,
    policy: Arc<CallPolicy>,
    input_cost_per_mtok: f64,
    output_cost_per_mtok: f64,
}

impl LlmClient {
    pub fn new(generator: Arc<dyn TextGenerator>, config: &LlmConfig) -> Self {
        Self::with_policy(generator, CallPolicy::from_config(config), config)
    }

    pub fn with_policy(
        generator: Arc<dyn TextGenerator>,
        policy: CallPolicy,
        config: &LlmConfig,
    ) -> Self {
        Self {
            generator,
            policy: Arc::new(policy),
            input_cost_per_mtok: config.input_cost_per_mtok,
            output_cost_per_mtok: config.output_cost_per_mtok,
        }
    }

    /// Complete a request under the call policy; returns the completion and its usage.
    #[instrument(skip_all, fields(schema = request.schema.as_str(), subjects = request.subject_ids.len()))]
    pub async fn complete(&self, request: &CompletionRequest) -> Result<(Completion, Usage)> {
        let completion = self.policy.call(self.generator.as_ref(), request).await?;
        let usage = Usage {
            calls: 1,
            cache_hits: u64::from(completion.cached),
            tokens_in: completion.tokens_in,
            tokens_out: completion.tokens_out,
            cost_usd: (completion.tokens_in as f64 * self.input_cost_per_mtok
                + completion.tokens_out as f64 * self.output_cost_per_mtok)
                / 1_000_000.0,
        };
        debug!(
            tokens_in = usage.tokens_in,
            tokens_out = usage.tokens_out,
            latency_ms = completion.latency_ms,
            cached = completion.cached,
            "completion received"
        );
        Ok((completion, usage))
    }

    pub fn model_id(&self) -> &str {
        self.generator.model_id()
    }
}

/// Truncate text to roughly `max_chars` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(schema: SchemaHint) -> CompletionRequest {
        CompletionRequest {
            schema,
            system: "You are a scorer.".into(),
            prompt: "Score these.".into(),
            subject_ids: vec!["a".into()],
        }
    }

    /// Fails `failures` times, then answers; counts calls.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TextGenerator for Flaky {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.failures {
                return Err(CuratorError::Collaborator("HTTP 503".into()));
            }
            Ok(Completion {
                text: r#"{"ok":true}"#.into(),
                tokens_in: 1_000,
                tokens_out: 500,
                model: "test-model".into(),
                latency_ms: 1,
                cached: false,
            })
        }

        fn model_id(&self) -> &str {
            "test-model"
        }
    }

    fn fast_policy(max_retries: u32, timeout: Duration) -> CallPolicy {
        CallPolicy::new(
            timeout,
            max_retries,
            Duration::from_millis(1),
            Duration::ZERO,
            2,
        )
    }

    #[test]
    fn prompt_hash_differs_by_schema() {
        let a = prompt_hash(&request(SchemaHint::BatchJudgments));
        let b = prompt_hash(&request(SchemaHint::DimensionScores));
        assert_ne!(a, b);
        assert_eq!(a, prompt_hash(&request(SchemaHint::BatchJudgments)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let generator = Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        };
        let policy = fast_policy(2, Duration::from_secs(1));
        let completion = policy
            .call(&generator, &request(SchemaHint::BatchJudgments))
            .await
            .unwrap();
        assert_eq!(completion.text, r#"{"ok":true}"#);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_retries() {
        let generator = Flaky {
            failures: 10,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        };
        let policy = fast_policy(1, Duration::from_secs(1));
        let err = policy
            .call(&generator, &request(SchemaHint::BatchJudgments))
            .await
            .unwrap_err();
        assert!(matches!(err, CuratorError::Collaborator(_)));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_is_a_failed_call() {
        let generator = Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(500),
        };
        let policy = fast_policy(0, Duration::from_millis(20));
        let err = policy
            .call(&generator, &request(SchemaHint::DimensionScores))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn pacer_spaces_call_starts() {
        let pacer = Pacer::new(Duration::from_millis(30));
        let started = Instant::now();
        for _ in 0..3 {
            pacer.wait().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn client_prices_usage() {
        let generator = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let config = LlmConfig::default();
        let client = LlmClient::with_policy(generator, fast_policy(0, Duration::from_secs(1)), &config);
        let (_, usage) = client.complete(&request(SchemaHint::Bull)).await.unwrap();
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.tokens_in, 1_000);
        let expected = config.cost_usd(1_000, 500);
        assert!((usage.cost_usd - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn cached_generator_serves_repeats() {
        let tmp = std::env::temp_dir().join(format!("curator_llm_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.unwrap());
        let inner = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let cached = CachedGenerator::new(inner.clone(), storage);

        let first = cached.complete(&request(SchemaHint::Paraphrase)).await.unwrap();
        let second = cached.complete(&request(SchemaHint::Paraphrase)).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.tokens_in, 0);
        assert_eq!(first.text, second.text);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    /// Answers with prose first, then with a valid bear payload.
    struct Recovering {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for Recovering {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let text = if n == 0 {
                "sorry, I cannot".to_string()
            } else {
                r#"{"maturity":40,"brand_safety":80,"primary_risk":"legal"}"#.to_string()
            };
            Ok(Completion {
                text,
                tokens_in: 10,
                tokens_out: 5,
                model: "test-model".into(),
                latency_ms: 1,
                cached: false,
            })
        }

        fn model_id(&self) -> &str {
            "test-model"
        }
    }

    #[tokio::test]
    async fn malformed_completion_is_not_cached() {
        let tmp = std::env::temp_dir().join(format!("curator_llm_{}.db", uuid::Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.unwrap());
        let inner = Arc::new(Recovering {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedGenerator::new(inner.clone(), storage);

        let first = cached.complete(&request(SchemaHint::Bear)).await.unwrap();
        assert_eq!(first.text, "sorry, I cannot");

        let second = cached.complete(&request(SchemaHint::Bear)).await.unwrap();
        assert!(!second.cached);
        assert!(second.text.contains("maturity"));

        let third = cached.complete(&request(SchemaHint::Bear)).await.unwrap();
        assert!(third.cached);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn openrouter_parses_chat_completion() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/chat/completions"))
            .and(wiremock::matchers::header("authorization", "Bearer test-key"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "moonshotai/kimi-k2.5",
                "choices": [{ "message": { "content": "{\"judgments\":[]}" } }],
                "usage": { "prompt_tokens": 120, "completion_tokens": 8 }
            })))
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: server.uri(),
            ..LlmConfig::default()
        };
        let generator = OpenRouterGenerator::new(&config, "test-key".into()).unwrap();
        let completion = generator
            .complete(&request(SchemaHint::BatchJudgments))
            .await
            .unwrap();
        assert_eq!(completion.text, r#"{"judgments":[]}"#);
        assert_eq!(completion.tokens_in, 120);
        assert_eq!(completion.tokens_out, 8);
    }

    #[tokio::test]
    async fn openrouter_http_error_is_collaborator_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: server.uri(),
            ..LlmConfig::default()
        };
        let generator = OpenRouterGenerator::new(&config, "k".into()).unwrap();
        let err = generator
            .complete(&request(SchemaHint::Paraphrase))
            .await
            .unwrap_err();
        assert!(matches!(err, CuratorError::Collaborator(_)));
        assert!(err.to_string().contains("429"));
    }
}
