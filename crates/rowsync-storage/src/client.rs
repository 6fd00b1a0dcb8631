//! Rate-limited, retrying JSON client for the remote service.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

const REMAINING_HEADERS: [&str; 2] = ["x-ratelimit-remaining", "ratelimit-remaining"];
const LIMIT_HEADERS: [&str; 2] = ["x-ratelimit-limit", "ratelimit-limit"];

const SLOW_BELOW: u32 = 20;
const CRAWL_BELOW: u32 = 10;
const CRAWL_FLOOR: Duration = Duration::from_millis(100);
const DEFAULT_LIMIT: u32 = 50;

/// Throttle state observed from rate-limit response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    pub remaining: Option<u32>,
    pub limit: u32,
    pub last_request_at: Option<Instant>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            remaining: None,
            limit: DEFAULT_LIMIT,
            last_request_at: None,
        }
    }
}

impl RateLimitState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Minimum spacing between calls for the current `remaining` budget.
    pub fn delay_for(&self, base: Duration) -> Duration {
        match self.remaining {
            Some(remaining) if remaining < CRAWL_BELOW => base.saturating_mul(5).max(CRAWL_FLOOR),
            Some(remaining) if remaining < SLOW_BELOW => base.saturating_mul(2),
            _ => base,
        }
    }

    /// How long to sleep at `now` before the next call may start.
    pub fn wait_before_next(&self, base: Duration, now: Instant) -> Duration {
        let Some(last) = self.last_request_at else {
            return Duration::ZERO;
        };
        self.delay_for(base)
            .saturating_sub(now.saturating_duration_since(last))
    }

    pub fn observe(&mut self, headers: &HeaderMap) {
        if let Some(remaining) = header_u32(headers, &REMAINING_HEADERS) {
            self.remaining = Some(remaining);
        }
        if let Some(limit) = header_u32(headers, &LIMIT_HEADERS) {
            self.limit = limit;
        }
    }
}

fn header_u32(headers: &HeaderMap, names: &[&str]) -> Option<u32> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split([',', ';']).next())
        .and_then(|v| v.trim().parse().ok())
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

/// One entry of the structured `errors` array in a rejection body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiProblem {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub source: Option<ProblemSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProblemSource {
    #[serde(default)]
    pub pointer: Option<String>,
    #[serde(default)]
    pub parameter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ApiProblem>,
}

fn parse_problems(body: &str) -> Vec<ApiProblem> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.errors)
        .unwrap_or_default()
}

fn describe_rejection(status: u16, body: &str) -> String {
    let problems = parse_problems(body);
    if let Some(text) = problems
        .iter()
        .find_map(|p| p.detail.clone().or_else(|| p.title.clone()))
    {
        return text;
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.chars().take(200).collect();
    }
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("no response body")
        .to_string()
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} {path} returned http {status}: {cause}")]
    Status {
        method: String,
        path: String,
        status: u16,
        retry_after: Option<Duration>,
        body: String,
        cause: String,
    },
    #[error("{method} {path} failed: {source}")]
    Transport {
        method: String,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {path} returned an unreadable body: {message}")]
    Decode {
        method: String,
        path: String,
        message: String,
    },
    #[error("cannot build a request path from {path}: {message}")]
    InvalidPath { path: String, message: String },
}

impl ApiError {
    pub fn from_status(
        method: &str,
        path: &str,
        status: u16,
        retry_after: Option<Duration>,
        body: impl Into<String>,
    ) -> Self {
        let body = body.into();
        ApiError::Status {
            method: method.to_string(),
            path: path.to_string(),
            status,
            retry_after,
            cause: describe_rejection(status, &body),
            body,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Raw rejection body, kept for diagnostics.
    pub fn body(&self) -> Option<&str> {
        match self {
            ApiError::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn problems(&self) -> Vec<ApiProblem> {
        self.body().map(parse_problems).unwrap_or_default()
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// 429, 5xx, and connect/timeout transport failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            ApiError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            ApiError::Decode { .. } | ApiError::InvalidPath { .. } => false,
        }
    }

    /// Human-readable cause without the request line.
    pub fn summary(&self) -> String {
        match self {
            ApiError::Status { status, cause, .. } => format!("http {status}: {cause}"),
            ApiError::Transport { source, .. } => source.to_string(),
            ApiError::Decode { message, .. } | ApiError::InvalidPath { message, .. } => {
                message.clone()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(250),
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Exponential part of the backoff for zero-based `attempt_index`.
    pub fn backoff_floor(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn backoff_for(&self, attempt_index: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff_floor(attempt_index) + jitter
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the attempt budget is spent.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempt += 1;
        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }
        let wait = match (err.status(), err.retry_after()) {
            (Some(429), Some(after)) => after,
            _ => policy.backoff_for(attempt - 1),
        };
        warn!(
            status = ?err.status(),
            attempt,
            max_attempts,
            wait_ms = wait.as_millis() as u64,
            "transient remote failure, retrying"
        );
        tokio::time::sleep(wait).await;
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub base_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            base_delay: Duration::from_millis(50),
            retry: RetryPolicy::default(),
        }
    }
}

/// Authenticated JSON client that self-throttles from rate-limit headers.
#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    base_delay: Duration,
    retry: RetryPolicy,
    rate: Mutex<RateLimitState>,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().context("building reqwest client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            base_delay: config.base_delay,
            retry: config.retry,
            rate: Mutex::new(RateLimitState::default()),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Forget observed limits; called at the start of each independently limited unit of work.
    pub async fn reset_rate_limit(&self) {
        self.rate.lock().await.reset();
    }

    pub async fn rate_limit_state(&self) -> RateLimitState {
        self.rate.lock().await.clone()
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn throttle(&self) {
        let mut state = self.rate.lock().await;
        let wait = state.wait_before_next(self.base_delay, Instant::now());
        if !wait.is_zero() {
            debug!(
                wait_ms = wait.as_millis() as u64,
                remaining = ?state.remaining,
                "throttling before remote call"
            );
            tokio::time::sleep(wait).await;
        }
        state.last_request_at = Some(Instant::now());
    }

    /// Single attempt: throttle, send, record rate-limit headers, then check the status.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, ApiError> {
        let span = info_span!("api_request", method = %method, path);
        async {
            self.throttle().await;

            let mut request = self
                .http
                .request(method.clone(), self.url_for(path))
                .header(ACCEPT, "application/json");
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let transport = |source: reqwest::Error| ApiError::Transport {
                method: method.to_string(),
                path: path.to_string(),
                source,
            };

            let response = request.send().await.map_err(transport)?;
            let status = response.status();
            self.rate.lock().await.observe(response.headers());
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = response.text().await.map_err(transport)?;

            if !status.is_success() {
                debug!(status = status.as_u16(), "remote call rejected");
                return Err(ApiError::from_status(
                    method.as_str(),
                    path,
                    status.as_u16(),
                    retry_after,
                    text,
                ));
            }
            if text.trim().is_empty() {
                return Ok(JsonValue::Null);
            }
            serde_json::from_str(&text).map_err(|e| ApiError::Decode {
                method: method.to_string(),
                path: path.to_string(),
                message: e.to_string(),
            })
        }
        .instrument(span)
        .await
    }

    /// `request` wrapped in the client's retry policy.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, ApiError> {
        with_retry(&self.retry, || self.request(method.clone(), path, body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_tiers_follow_remaining_budget() {
        let base = Duration::from_millis(10);
        let mut state = RateLimitState::default();
        assert_eq!(state.delay_for(base), base);
        state.remaining = Some(20);
        assert_eq!(state.delay_for(base), base);
        state.remaining = Some(19);
        assert_eq!(state.delay_for(base), Duration::from_millis(20));
        state.remaining = Some(9);
        assert_eq!(state.delay_for(base), Duration::from_millis(100));
        assert_eq!(
            state.delay_for(Duration::from_millis(40)),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn delay_is_non_decreasing_as_remaining_drops() {
        let base = Duration::from_millis(15);
        let mut state = RateLimitState::default();
        let mut previous = Duration::ZERO;
        for remaining in (0..=60).rev() {
            state.remaining = Some(remaining);
            let delay = state.delay_for(base);
            assert!(delay >= previous, "remaining={remaining}");
            previous = delay;
        }
    }

    #[test]
    fn wait_subtracts_time_since_last_call() {
        let base = Duration::from_millis(100);
        let now = Instant::now();
        let state = RateLimitState {
            remaining: Some(50),
            limit: 50,
            last_request_at: Some(now - Duration::from_millis(30)),
        };
        assert_eq!(state.wait_before_next(base, now), Duration::from_millis(70));
        assert_eq!(
            state.wait_before_next(base, now + Duration::from_millis(500)),
            Duration::ZERO
        );
        assert_eq!(
            RateLimitState::default().wait_before_next(base, now),
            Duration::ZERO
        );
    }

    #[test]
    fn both_header_conventions_are_recognized() {
        let mut state = RateLimitState::default();
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("17"));
        headers.insert("X-RateLimit-Limit", HeaderValue::from_static("60"));
        state.observe(&headers);
        assert_eq!(state.remaining, Some(17));
        assert_eq!(state.limit, 60);

        let mut headers = HeaderMap::new();
        headers.insert("RateLimit-Remaining", HeaderValue::from_static("4"));
        state.observe(&headers);
        assert_eq!(state.remaining, Some(4));

        state.reset();
        assert_eq!(state, RateLimitState::default());
    }

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn rejection_cause_prefers_structured_detail() {
        let body = r#"{"errors":[{"code":"validation.invalid","title":"Invalid","detail":"owner must be an existing member","source":{"pointer":"/data/owner"}}]}"#;
        let err = ApiError::from_status("POST", "/notes", 422, None, body);
        assert_eq!(err.summary(), "http 422: owner must be an existing member");
        let problems = err.problems();
        assert_eq!(problems.len(), 1);
        assert_eq!(
            problems[0].source.as_ref().and_then(|s| s.pointer.as_deref()),
            Some("/data/owner")
        );

        let bare = ApiError::from_status("GET", "/x", 503, None, "");
        assert_eq!(bare.summary(), "http 503: Service Unavailable");
        assert!(bare.is_retryable());
        assert!(!ApiError::from_status("GET", "/x", 404, None, "").is_retryable());
    }

    #[test]
    fn backoff_is_exponential_from_base() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(250),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));

        let jittered = RetryPolicy::default().backoff_for(1);
        assert!(jittered >= Duration::from_millis(500));
        assert!(jittered <= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_stops_on_non_retryable_status() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = with_retry(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::from_status("PATCH", "/companies/1", 422, None, ""))
        })
        .await;
        assert_eq!(result.unwrap_err().status(), Some(422));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_spends_exactly_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), ApiError> = with_retry(&RetryPolicy::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::from_status("GET", "/notes", 502, None, ""))
        })
        .await;
        assert_eq!(result.unwrap_err().status(), Some(502));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        // 250 + 500 + 1000 + 2000 + 4000 ms before jitter
        assert!(started.elapsed() >= Duration::from_millis(7750));
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_honours_retry_after_on_429() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let value = with_retry(&RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ApiError::from_status(
                    "POST",
                    "/companies",
                    429,
                    Some(Duration::from_secs(2)),
                    "",
                ))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_millis(2100));
    }
}
