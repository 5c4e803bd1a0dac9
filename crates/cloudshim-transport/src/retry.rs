//! Backoff policy and server-directed retry delays
//!
//! The state machine that applies these lives in `sender`; this module only
//! computes how long to wait.

use async_trait::async_trait;
use cloudshim_config::RetrySettings;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Retry behavior for one transport
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failures tolerated on one endpoint before giving up on it
    pub max_retries: u32,
    /// Physical sends allowed across all endpoints for one call
    pub max_total_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each time)
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0-1.0) to add randomness and prevent thundering herd
    pub jitter_factor: f64,
    /// Server-directed delays longer than this are not slept; the next
    /// endpoint is tried instead
    pub long_delay_threshold: Duration,
    /// Used when `Retry-After` is present but unparsable
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            max_total_attempts: settings.max_total_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
            long_delay_threshold: Duration::from_millis(settings.long_delay_threshold_ms),
            default_retry_after: Duration::from_millis(settings.default_retry_after_ms),
        }
    }
}

impl RetryPolicy {
    /// `initial * multiplier^(failures-1)`, capped at `max_delay`, plus jitter
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let jitter_ms = if self.jitter_factor > 0.0 {
            let factor: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
            capped_ms * self.jitter_factor * factor
        } else {
            0.0
        };

        Duration::from_millis((capped_ms + jitter_ms).max(0.0) as u64)
    }

    /// How long a 429 asks us to wait.
    ///
    /// A structured delay in the error body wins, then `Retry-After`, then
    /// plain backoff when the server gave no hint at all.
    pub fn rate_limit_delay(&self, headers: &HeaderMap, body: &[u8], failures: u32) -> Duration {
        if let Some(delay) = vendor_retry_delay(body) {
            debug!(delay_ms = delay.as_millis() as u64, "using structured retry delay");
            return delay;
        }

        match headers.get(RETRY_AFTER) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|value| parse_retry_after(value, chrono::Utc::now()))
                .unwrap_or(self.default_retry_after),
            None => self.backoff_delay(failures),
        }
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date. Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - now;
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Delay carried in a Google-style error body: `RetryInfo.retryDelay`, or
/// `ErrorInfo.metadata.quotaResetDelay`.
pub fn vendor_retry_delay(body: &[u8]) -> Option<Duration> {
    let parsed: Value = serde_json::from_slice(body).ok()?;
    let details = parsed.get("error")?.get("details")?.as_array()?;

    let type_is = |detail: &Value, suffix: &str| {
        detail
            .get("@type")
            .and_then(Value::as_str)
            .is_some_and(|t| t.ends_with(suffix))
    };

    let retry_info = details
        .iter()
        .filter(|d| type_is(d, "RetryInfo"))
        .find_map(|d| d.get("retryDelay").and_then(Value::as_str))
        .and_then(parse_delay_string);
    if retry_info.is_some() {
        return retry_info;
    }

    details
        .iter()
        .filter(|d| type_is(d, "ErrorInfo"))
        .find_map(|d| {
            d.get("metadata")?
                .get("quotaResetDelay")
                .and_then(Value::as_str)
        })
        .and_then(parse_delay_string)
}

/// `"1.5s"`, `"250ms"`, or bare seconds
fn parse_delay_string(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, millis) = if let Some(ms) = raw.strip_suffix("ms") {
        (ms, true)
    } else if let Some(secs) = raw.strip_suffix('s') {
        (secs, false)
    } else {
        (raw, false)
    };

    let value: f64 = number.trim().parse().ok()?;
    let secs = if millis { value / 1000.0 } else { value };
    Duration::try_from_secs_f64(secs).ok()
}

/// Where backoff sleeps go. Swapped out in tests to observe delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_total_attempts, 20);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.long_delay_threshold, Duration::from_secs(5));
        assert_eq!(policy.default_retry_after, Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_exponential() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_delay(30), Duration::from_millis(10_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.1,
            ..no_jitter()
        };
        for _ in 0..50 {
            let delay = policy.backoff_delay(2).as_millis();
            assert!((180..=220).contains(&delay), "delay {delay}");
        }
    }

    #[test]
    fn test_parse_retry_after_seconds_and_date() {
        let now = chrono::DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&chrono::Utc);

        assert_eq!(parse_retry_after("60", now), Some(Duration::from_secs(60)));
        assert_eq!(parse_retry_after(" 1.5 ", now), Some(Duration::from_millis(1500)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-3", now), None);
    }

    #[test]
    fn test_vendor_retry_info() {
        let body = json!({
            "error": {
                "code": 429,
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.ErrorInfo", "metadata": {"quotaResetDelay": "9s"}},
                    {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "1.5s"}
                ]
            }
        });
        assert_eq!(
            vendor_retry_delay(body.to_string().as_bytes()),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_vendor_quota_reset_delay() {
        let body = json!({
            "error": {
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.ErrorInfo", "metadata": {"quotaResetDelay": "331ms"}}
                ]
            }
        });
        assert_eq!(
            vendor_retry_delay(body.to_string().as_bytes()),
            Some(Duration::from_millis(331))
        );
    }

    #[test]
    fn test_vendor_delay_absent_or_garbage() {
        assert_eq!(vendor_retry_delay(b"not json"), None);
        assert_eq!(vendor_retry_delay(br#"{"error": {"message": "slow down"}}"#), None);
        let garbage = json!({"error": {"details": [{"@type": "x.RetryInfo", "retryDelay": "soon"}]}});
        assert_eq!(vendor_retry_delay(garbage.to_string().as_bytes()), None);
    }

    #[test]
    fn test_parse_delay_string() {
        assert_eq!(parse_delay_string("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_delay_string("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_delay_string("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_delay_string("-1s"), None);
        assert_eq!(parse_delay_string("1e30s"), None);
        assert_eq!(parse_delay_string("NaNms"), None);
    }

    #[test]
    fn test_oversized_delays_are_treated_as_garbage() {
        let policy = no_jitter();

        let mut huge = HeaderMap::new();
        huge.insert(RETRY_AFTER, HeaderValue::from_static("1e300"));
        assert_eq!(policy.rate_limit_delay(&huge, b"", 1), Duration::from_secs(2));

        let body = br#"{"error":{"details":[{"@type":"google.rpc.RetryInfo","retryDelay":"1e30s"}]}}"#;
        assert_eq!(vendor_retry_delay(body), None);
        assert_eq!(
            policy.rate_limit_delay(&HeaderMap::new(), body, 1),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_rate_limit_delay_precedence() {
        let policy = no_jitter();

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("4"));
        let vendor = br#"{"error":{"details":[{"@type":"google.rpc.RetryInfo","retryDelay":"1s"}]}}"#;
        assert_eq!(
            policy.rate_limit_delay(&headers, vendor, 1),
            Duration::from_secs(1)
        );
        assert_eq!(policy.rate_limit_delay(&headers, b"", 1), Duration::from_secs(4));

        let mut garbage = HeaderMap::new();
        garbage.insert(RETRY_AFTER, HeaderValue::from_static("whenever"));
        assert_eq!(
            policy.rate_limit_delay(&garbage, b"", 1),
            Duration::from_secs(2)
        );

        assert_eq!(
            policy.rate_limit_delay(&HeaderMap::new(), b"", 2),
            Duration::from_millis(200)
        );
    }
}
