//! LLM client: transport trait, HTTP adapter, and the resilient
//! wrapper used by the rest of the pipeline.
//!
//! The wrapper retries transient failures with exponential backoff,
//! short-circuits through a shared circuit breaker, and substitutes a
//! state-keyed canned fallback on exhaustion so callers never see a
//! transport error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use sf_domain::{Error, Result};

use crate::breaker::CircuitBreaker;
use crate::fallback::fallback_for_state;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw text-generation transport.
///
/// Implementations are thin adapters over a remote model endpoint; all
/// resilience (retry, breaker, fallback) lives in [`LlmClient`].
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one prompt and wait for the full completion.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Whether the endpoint is currently reachable.
    async fn health_check(&self) -> bool;

    /// Model identifier, reported in `/health` and compaction metadata.
    fn model(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for the Ollama-compatible HTTP adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLlmConfig {
    pub endpoint: String,
    pub model: String,
    pub request_timeout_secs: u64,
    pub temperature: f32,
}

impl Default for HttpLlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".into(),
            model: "qwen2.5:14b".into(),
            request_timeout_secs: 60,
            temperature: 0.3,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateRequestOptions,
}

#[derive(Serialize)]
struct GenerateRequestOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Adapter over an Ollama-compatible `/api/generate` endpoint.
pub struct HttpLlm {
    config: HttpLlmConfig,
    http: reqwest::Client,
}

impl HttpLlm {
    pub fn new(config: HttpLlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }
}

#[async_trait::async_trait]
impl LlmProvider for HttpLlm {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/api/generate",
            self.config.endpoint.trim_end_matches('/')
        );
        let body = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: GenerateRequestOptions {
                temperature: self.config.temperature,
            },
        };

        let resp = self.http.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("llm request timed out: {e}"))
            } else {
                Error::Http(format!("llm request failed: {e}"))
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("HTTP {status}: {text}")));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| Error::Llm(format!("failed to parse completion: {e}")))?;
        Ok(parsed.response)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.config.endpoint.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Statistics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters shared across all sessions using one client.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LlmStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub fallback_uses: u64,
    pub circuit_trips: u64,
    pub total_latency_ms: u64,
}

impl LlmStats {
    /// Success percentage; 100 on zero traffic.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.successes as f64 / self.total_requests as f64 * 100.0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resilient client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call options for [`LlmClient::generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions<'a> {
    /// Current dialogue state, used to pick the canned fallback.
    pub state: &'a str,
    /// When `false`, exhaustion returns an empty string instead of the
    /// canned fallback (callers with their own deterministic path).
    pub allow_fallback: bool,
}

impl Default for GenerateOptions<'_> {
    fn default() -> Self {
        Self {
            state: "",
            allow_fallback: true,
        }
    }
}

/// Retry/backoff tunables.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `k` (0-based), capped at `max_delay`.
    fn delay(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }
}

/// The resilient LLM client handed to the orchestrator.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    stats: Mutex<LlmStats>,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self::with_policy(provider, RetryPolicy::default())
    }

    pub fn with_policy(provider: Arc<dyn LlmProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            breaker: CircuitBreaker::new(5, Duration::from_secs(60)),
            stats: Mutex::new(LlmStats::default()),
        }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }

    /// Generate text for a prompt.
    ///
    /// Never returns an error: on breaker-open or retry exhaustion the
    /// state-keyed canned fallback is returned (empty string when
    /// `allow_fallback` is off) and `fallback_uses` is incremented.
    pub async fn generate(&self, prompt: &str, opts: GenerateOptions<'_>) -> String {
        if !self.breaker.allow() {
            tracing::warn!(state = opts.state, "llm circuit open, serving fallback");
            return self.serve_fallback(&opts);
        }

        let start = Instant::now();
        self.stats.lock().total_requests += 1;

        for attempt in 0..=self.retry.max_retries {
            match self.provider.complete(prompt).await {
                Ok(text) => {
                    self.breaker.record_success();
                    let mut stats = self.stats.lock();
                    stats.successes += 1;
                    stats.total_latency_ms += start.elapsed().as_millis() as u64;
                    return text;
                }
                Err(err) => {
                    self.breaker.record_failure();
                    let retryable = matches!(err, Error::Timeout(_) | Error::Http(_) | Error::Llm(_));
                    tracing::warn!(
                        attempt,
                        error = %err,
                        retryable,
                        "llm call failed"
                    );
                    if !retryable || attempt == self.retry.max_retries || !self.breaker.allow() {
                        break;
                    }
                    self.stats.lock().retries += 1;
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.failures += 1;
        stats.total_latency_ms += start.elapsed().as_millis() as u64;
        drop(stats);

        self.serve_fallback(&opts)
    }

    /// Generate and parse a structured JSON reply.
    ///
    /// Returns an error on parse failure; callers are expected to have
    /// their own deterministic fallback.
    pub async fn generate_structured<T: DeserializeOwned>(&self, prompt: &str) -> Result<T> {
        let raw = self
            .generate(
                prompt,
                GenerateOptions {
                    state: "",
                    allow_fallback: false,
                },
            )
            .await;
        if raw.is_empty() {
            return Err(Error::Llm("empty structured reply".into()));
        }
        let json = extract_json(&raw)
            .ok_or_else(|| Error::Llm(format!("no JSON object in reply: {}", truncate(&raw, 120))))?;
        serde_json::from_str(json).map_err(Error::Json)
    }

    pub fn stats(&self) -> LlmStats {
        let mut stats = self.stats.lock().clone();
        stats.circuit_trips = self.breaker.trips();
        stats
    }

    fn serve_fallback(&self, opts: &GenerateOptions<'_>) -> String {
        if !opts.allow_fallback {
            return String::new();
        }
        self.stats.lock().fallback_uses += 1;
        fallback_for_state(opts.state).to_owned()
    }
}

/// Extract the first balanced JSON object from a model reply, skipping
/// code fences and surrounding prose.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock provider (tests and offline runs)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic in-memory provider used by tests.
///
/// Replies are popped from a script queue; when the queue is empty the
/// default reply is returned. `fail_next(n)` injects transport errors.
pub struct MockLlm {
    script: Mutex<Vec<String>>,
    default_reply: String,
    failures_remaining: Mutex<u32>,
    calls: Mutex<u64>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new("Хорошо, расскажите подробнее.")
    }
}

impl MockLlm {
    pub fn new(default_reply: &str) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            default_reply: default_reply.to_owned(),
            failures_remaining: Mutex::new(0),
            calls: Mutex::new(0),
        }
    }

    /// Queue replies returned in order before the default kicks in.
    pub fn push_reply(&self, reply: &str) {
        self.script.lock().insert(0, reply.to_owned());
    }

    /// Make the next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        *self.failures_remaining.lock() = n;
    }

    pub fn call_count(&self) -> u64 {
        *self.calls.lock()
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockLlm {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        *self.calls.lock() += 1;
        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Http("mock transport failure".into()));
            }
        }
        Ok(self
            .script
            .lock()
            .pop()
            .unwrap_or_else(|| self.default_reply.clone()))
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(mock: Arc<MockLlm>) -> LlmClient {
        LlmClient::with_policy(
            mock,
            RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                multiplier: 2.0,
                max_delay: Duration::from_millis(4),
            },
        )
    }

    #[tokio::test]
    async fn success_passes_text_through() {
        let mock = Arc::new(MockLlm::new("ответ"));
        let client = client_with(mock);
        let text = client.generate("prompt", GenerateOptions::default()).await;
        assert_eq!(text, "ответ");
        assert_eq!(client.stats().successes, 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let mock = Arc::new(MockLlm::new("после ретрая"));
        mock.fail_next(2);
        let client = client_with(mock);
        let text = client.generate("prompt", GenerateOptions::default()).await;
        assert_eq!(text, "после ретрая");
        assert_eq!(client.stats().retries, 2);
        assert_eq!(client.stats().fallback_uses, 0);
    }

    #[tokio::test]
    async fn exhaustion_returns_state_fallback() {
        let mock = Arc::new(MockLlm::default());
        mock.fail_next(10);
        let client = client_with(mock);
        let text = client
            .generate(
                "prompt",
                GenerateOptions {
                    state: "greeting",
                    allow_fallback: true,
                },
            )
            .await;
        assert!(text.contains("Здравствуйте"));
        let stats = client.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.fallback_uses, 1);
    }

    #[tokio::test]
    async fn exhaustion_without_fallback_is_empty() {
        let mock = Arc::new(MockLlm::default());
        mock.fail_next(10);
        let client = client_with(mock);
        let text = client
            .generate(
                "prompt",
                GenerateOptions {
                    state: "greeting",
                    allow_fallback: false,
                },
            )
            .await;
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn open_circuit_skips_provider_calls() {
        let mock = Arc::new(MockLlm::default());
        mock.fail_next(100);
        let client = LlmClient::with_policy(
            mock.clone(),
            RetryPolicy {
                max_retries: 10,
                initial_delay: Duration::from_millis(1),
                multiplier: 1.0,
                max_delay: Duration::from_millis(1),
            },
        );

        let _ = client.generate("p", GenerateOptions::default()).await;
        let calls_after_first = mock.call_count();

        // Circuit is open now; further generates must not hit the provider.
        let _ = client.generate("p", GenerateOptions::default()).await;
        assert_eq!(mock.call_count(), calls_after_first);
        assert!(client.stats().circuit_trips >= 1);
    }

    #[tokio::test]
    async fn structured_parses_fenced_json() {
        let mock = Arc::new(MockLlm::default());
        mock.push_reply("Вот ответ:\n```json\n{\"intent\": \"price_question\", \"confidence\": 0.8}\n```");
        let client = client_with(mock);

        #[derive(Deserialize)]
        struct Out {
            intent: String,
            confidence: f64,
        }

        let out: Out = client.generate_structured("classify").await.unwrap();
        assert_eq!(out.intent, "price_question");
        assert!((out.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn structured_rejects_prose() {
        let mock = Arc::new(MockLlm::default());
        mock.push_reply("не могу классифицировать");
        let client = client_with(mock);

        let result: Result<serde_json::Value> = client.generate_structured("classify").await;
        assert!(result.is_err());
    }

    #[test]
    fn success_rate_is_100_on_zero_traffic() {
        let stats = LlmStats::default();
        assert_eq!(stats.success_rate(), 100.0);
    }

    #[test]
    fn extract_json_handles_nested_and_strings() {
        let raw = r#"prefix {"a": {"b": "te}xt"}, "c": 1} suffix"#;
        let json = extract_json(raw).unwrap();
        assert_eq!(json, r#"{"a": {"b": "te}xt"}, "c": 1}"#);
    }
}
