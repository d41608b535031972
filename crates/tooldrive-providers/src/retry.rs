//! Quota (HTTP 429) detection and backoff computation.

use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tooldrive_core::config::Config;

use crate::ProviderError;

static RETRY_DELAY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""retryDelay":\s*"(\d+(\.\d+)?)s""#).ok());
static PLEASE_RETRY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Please retry in (\d+(\.\d+)?)s").ok());

/// Result of inspecting a provider error.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaClassification {
    pub is_quota: bool,
    pub status: Option<u16>,
    /// Server-provided wait, in seconds.
    pub retry_after: Option<f64>,
}

pub fn is_quota_error(error: &ProviderError) -> bool {
    if error.status() == Some(429) {
        return true;
    }
    let text = error.to_string().to_lowercase();
    text.contains("rate limit")
        || text.contains("too many requests")
        || text.contains("http 429")
        || text.contains("resource exhausted")
}

pub fn classify(error: &ProviderError) -> QuotaClassification {
    let is_quota = is_quota_error(error);
    let retry_after = match error {
        ProviderError::Http { headers, body, .. } => {
            extract_retry_after(headers, body, &error.to_string())
        }
        _ => extract_retry_after(&HeaderMap::new(), "", &error.to_string()),
    };
    QuotaClassification {
        is_quota,
        status: error.status(),
        retry_after,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn non_negative(v: f64) -> Option<f64> {
    (v.is_finite() && v >= 0.0).then_some(v)
}

/// Find a retry hint in headers, then the JSON body, then the error text.
pub fn extract_retry_after(headers: &HeaderMap, body: &str, message: &str) -> Option<f64> {
    for name in ["retry-after", "x-retry-after"] {
        if let Some(v) = header_str(headers, name).and_then(|s| s.parse::<f64>().ok()) {
            if let Some(v) = non_negative(v) {
                return Some(v);
            }
        }
    }

    for name in ["x-ratelimit-reset-tokens", "x-ratelimit-reset-requests"] {
        let Some(raw) = header_str(headers, name) else {
            continue;
        };
        let raw = raw.strip_suffix('s').unwrap_or(raw).trim();
        if let Some(v) = raw.parse::<f64>().ok().and_then(non_negative) {
            return Some(v);
        }
    }

    for name in ["retry-after-ms", "x-ms-retry-after-ms"] {
        if let Some(ms) = header_str(headers, name)
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(non_negative)
        {
            return Some(ms / 1000.0);
        }
    }

    if !body.is_empty() {
        if let Some(v) = RETRY_DELAY_RE
            .as_ref()
            .and_then(|re| re.captures(body))
            .and_then(|c| c[1].parse::<f64>().ok())
        {
            return Some(v);
        }
        if let Some(v) = retry_delay_from_details(body) {
            return Some(v);
        }
    }

    PLEASE_RETRY_RE
        .as_ref()
        .and_then(|re| re.captures(message))
        .and_then(|c| c[1].parse::<f64>().ok())
}

fn retry_delay_from_details(body: &str) -> Option<f64> {
    let data: Value = serde_json::from_str(body).ok()?;
    data.get("error")?
        .get("details")?
        .as_array()?
        .iter()
        .filter_map(|d| d.get("retryDelay").and_then(Value::as_str))
        .find_map(|rd| rd.strip_suffix('s')?.parse::<f64>().ok())
}

/// Seconds to wait before retry `attempt` (1-based).
pub fn compute_wait(attempt: u32, hint: Option<f64>, base: f64, cap: f64) -> f64 {
    if let Some(hint) = hint.and_then(non_negative) {
        return hint.min(cap);
    }
    let exponent = attempt.saturating_sub(1).min(62) as i32;
    let exp = cap.min(base * 2f64.powi(exponent));
    let jitter_max = (exp * 0.1).min(1.0);
    let jitter = if jitter_max > 0.0 {
        rand::rng().random_range(0.0..=jitter_max)
    } else {
        0.0
    };
    cap.min(exp + jitter)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_secs: f64,
    pub cap_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 20,
            base_secs: 2.0,
            cap_secs: 65.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries(),
            base_secs: config.backoff_base_secs(),
            cap_secs: config.backoff_cap_secs(),
        }
    }
}

/// Retry bookkeeping for one call sequence.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub last_hint: Option<f64>,
}

impl RetryContext {
    /// Record a quota failure. Returns the wait, or `None` once retries are exhausted.
    pub fn next_wait(&mut self, policy: &RetryPolicy, classification: &QuotaClassification) -> Option<Duration> {
        self.attempt += 1;
        self.last_hint = classification.retry_after;
        if self.attempt > policy.max_retries {
            return None;
        }
        let secs = compute_wait(
            self.attempt,
            classification.retry_after,
            policy.base_secs,
            policy.cap_secs,
        );
        Some(Duration::from_secs_f64(secs))
    }
}
