//! Retry, backoff, and endpoint fallback around the physical send
//!
//! One logical call walks the candidate endpoints in order:
//! - timeouts back off and retry the same endpoint
//! - 429 sleeps for the server-directed delay, or moves on when it is long
//! - 403 and 5xx move on immediately
//! - 401/403 and bot-challenge 400s refresh the token once per call
//!
//! Whatever is left when candidates or attempts run out is returned as-is.

use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::headers::set_bearer;
use crate::http::{HttpResponse, HttpTransport, OutgoingRequest};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use cloudshim_auth::CredentialManager;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Case-insensitive markers of an HTML bot-protection page served as a 400
const BOT_CHALLENGE_MARKERS: &[&str] = &[
    "unusual traffic",
    "captcha",
    "/sorry/index",
    "cf-chl",
    "attention required",
];

/// Position of one logical call in its retry budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    /// Failures on the current candidate
    pub attempt: u32,
    /// Physical sends so far, across all candidates
    pub total: u32,
    pub candidate: usize,
    candidates: usize,
}

impl RetryPlan {
    pub fn new(candidates: usize) -> Self {
        Self {
            attempt: 0,
            total: 0,
            candidate: 0,
            candidates,
        }
    }

    /// Move to the next candidate, resetting the per-candidate counter.
    /// Returns false when there is none.
    pub fn advance(&mut self) -> bool {
        if self.candidate + 1 >= self.candidates {
            return false;
        }
        self.candidate += 1;
        self.attempt = 0;
        true
    }

    pub fn out_of_attempts(&self, policy: &RetryPolicy) -> bool {
        self.total >= policy.max_total_attempts
    }

    pub fn candidate_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempt > policy.max_retries
    }
}

pub struct ResilientSender {
    inner: Arc<dyn HttpTransport>,
    endpoints: Vec<String>,
    policy: RetryPolicy,
    credentials: Option<Arc<CredentialManager>>,
    sleeper: Arc<dyn Sleeper>,
}

impl ResilientSender {
    pub fn new(inner: Arc<dyn HttpTransport>, endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(TransportError::Configuration(
                "at least one endpoint is required".to_string(),
            ));
        }
        Ok(Self {
            inner,
            endpoints,
            policy: RetryPolicy::default(),
            credentials: None,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<CredentialManager>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn inner(&self) -> &Arc<dyn HttpTransport> {
        &self.inner
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `template` to the candidate endpoints until one answers with
    /// something that should not be retried.
    pub async fn send(
        &self,
        template: OutgoingRequest,
        ctx: &mut CallContext,
    ) -> Result<HttpResponse> {
        let mut request = template;
        let mut plan = RetryPlan::new(self.endpoints.len());

        loop {
            request.base_url = self.endpoints[plan.candidate].clone();
            plan.total += 1;
            debug!(
                request_id = ctx.request_id(),
                endpoint = %request.base_url,
                attempt = plan.attempt + 1,
                total = plan.total,
                "sending request"
            );

            let outcome = self.send_once(request.clone(), ctx).await;

            let mut response = match outcome {
                Ok(response) => response,
                Err(err) if err.is_transient() => {
                    plan.attempt += 1;
                    if plan.candidate_exhausted(&self.policy) || plan.out_of_attempts(&self.policy)
                    {
                        warn!(
                            request_id = ctx.request_id(),
                            attempts = plan.total,
                            error = %err,
                            "retries exhausted after timeouts"
                        );
                        return Err(err);
                    }
                    let delay = self.policy.backoff_delay(plan.attempt);
                    warn!(
                        request_id = ctx.request_id(),
                        attempt = plan.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "request timed out, retrying after delay"
                    );
                    self.pause(delay, ctx).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if needs_credentials(&mut response).await? {
                if !plan.out_of_attempts(&self.policy) && self.try_refresh(&mut request, ctx).await? {
                    continue;
                }
                if status != StatusCode::FORBIDDEN {
                    return Ok(response);
                }
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let body = response.read().await?;
                plan.attempt += 1;
                let delay = self
                    .policy
                    .rate_limit_delay(response.headers(), &body, plan.attempt);

                if plan.out_of_attempts(&self.policy) {
                    warn!(request_id = ctx.request_id(), "attempt ceiling reached on 429");
                    return Ok(response);
                }

                if delay > self.policy.long_delay_threshold
                    || plan.candidate_exhausted(&self.policy)
                {
                    if plan.advance() {
                        warn!(
                            request_id = ctx.request_id(),
                            delay_ms = delay.as_millis() as u64,
                            next = %self.endpoints[plan.candidate],
                            "rate limited, trying next endpoint"
                        );
                        continue;
                    }
                    warn!(request_id = ctx.request_id(), "rate limited on every endpoint");
                    return Ok(response);
                }

                warn!(
                    request_id = ctx.request_id(),
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, retrying after delay"
                );
                self.pause(delay, ctx).await?;
                continue;
            }

            if status == StatusCode::FORBIDDEN || status.is_server_error() {
                if !plan.out_of_attempts(&self.policy) && plan.advance() {
                    warn!(
                        request_id = ctx.request_id(),
                        status = status.as_u16(),
                        next = %self.endpoints[plan.candidate],
                        "endpoint failed, trying next endpoint"
                    );
                    continue;
                }
                warn!(
                    request_id = ctx.request_id(),
                    status = status.as_u16(),
                    "every endpoint failed"
                );
                return Ok(response);
            }

            return Ok(response);
        }
    }

    async fn send_once(&self, request: OutgoingRequest, ctx: &CallContext) -> Result<HttpResponse> {
        match ctx.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, self.inner.send(request))
                .await
                .map_err(|_| TransportError::DeadlineExceeded)?,
            None => self.inner.send(request).await,
        }
    }

    /// One refresh per logical call. Returns true when `request` now carries
    /// a new token and should be resent to the same endpoint.
    async fn try_refresh(&self, request: &mut OutgoingRequest, ctx: &mut CallContext) -> Result<bool> {
        let Some(credentials) = &self.credentials else {
            return Ok(false);
        };
        if ctx.refresh_attempted() {
            debug!(request_id = ctx.request_id(), "token already refreshed for this call");
            return Ok(false);
        }
        ctx.mark_refresh_attempted();

        let stale = CredentialManager::extract_bearer(&request.headers);
        match credentials.refresh(stale.as_deref()).await {
            Some(token) => {
                set_bearer(&mut request.headers, &token)?;
                info!(request_id = ctx.request_id(), "retrying with refreshed token");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pause(&self, delay: Duration, ctx: &CallContext) -> Result<()> {
        if ctx.would_outlive(delay) {
            warn!(
                request_id = ctx.request_id(),
                delay_ms = delay.as_millis() as u64,
                "retry delay would pass the call deadline"
            );
            return Err(TransportError::DeadlineExceeded);
        }
        self.sleeper.sleep(delay).await;
        Ok(())
    }
}

/// 401, 403, or a 400 that is really a bot-protection page
async fn needs_credentials(response: &mut HttpResponse) -> Result<bool> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(true),
        StatusCode::BAD_REQUEST => {
            let body = response.read().await?;
            Ok(is_bot_challenge(response, &body))
        }
        _ => Ok(false),
    }
}

fn is_bot_challenge(response: &HttpResponse, body: &[u8]) -> bool {
    let html_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("text/html"));
    let html_body = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<');
    if !html_type && !html_body {
        return false;
    }

    let text = String::from_utf8_lossy(body).to_ascii_lowercase();
    BOT_CHALLENGE_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_plan_advance_resets_attempts() {
        let mut plan = RetryPlan::new(2);
        plan.attempt = 3;
        assert!(plan.advance());
        assert_eq!(plan.candidate, 1);
        assert_eq!(plan.attempt, 0);
        assert!(!plan.advance());
        assert_eq!(plan.candidate, 1);
    }

    #[test]
    fn test_plan_limits() {
        let policy = RetryPolicy {
            max_retries: 2,
            max_total_attempts: 5,
            ..RetryPolicy::default()
        };
        let mut plan = RetryPlan::new(3);
        plan.attempt = 2;
        assert!(!plan.candidate_exhausted(&policy));
        plan.attempt = 3;
        assert!(plan.candidate_exhausted(&policy));
        plan.total = 5;
        assert!(plan.out_of_attempts(&policy));
    }

    #[test]
    fn test_bot_challenge_detection() {
        let mut html = HeaderMap::new();
        html.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=UTF-8"));
        let page = HttpResponse::buffered(StatusCode::BAD_REQUEST, html.clone(), "");
        assert!(is_bot_challenge(
            &page,
            b"<html><title>Sorry...</title>Our systems have detected Unusual Traffic</html>"
        ));
        assert!(is_bot_challenge(&page, b"<html>Attention Required! | Cloudflare</html>"));
        assert!(!is_bot_challenge(&page, b"<html>Bad Request</html>"));

        let untyped = HttpResponse::buffered(StatusCode::BAD_REQUEST, HeaderMap::new(), "");
        assert!(is_bot_challenge(&untyped, b"  <html><a href=\"/sorry/index\">"));
        assert!(!is_bot_challenge(
            &untyped,
            br#"{"error":{"message":"captcha field is invalid"}}"#
        ));
    }

    #[tokio::test]
    async fn test_needs_credentials_by_status() {
        let mut unauthorized =
            HttpResponse::buffered(StatusCode::UNAUTHORIZED, HeaderMap::new(), "");
        assert!(needs_credentials(&mut unauthorized).await.unwrap());

        let mut plain_400 = HttpResponse::buffered(
            StatusCode::BAD_REQUEST,
            HeaderMap::new(),
            r#"{"error":{"message":"invalid argument"}}"#,
        );
        assert!(!needs_credentials(&mut plain_400).await.unwrap());

        let mut server_error =
            HttpResponse::buffered(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), "");
        assert!(!needs_credentials(&mut server_error).await.unwrap());
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        struct Never;
        #[async_trait::async_trait]
        impl HttpTransport for Never {
            async fn send(&self, _request: OutgoingRequest) -> Result<HttpResponse> {
                Err(TransportError::Stream("unused".into()))
            }
        }
        assert!(matches!(
            ResilientSender::new(Arc::new(Never), Vec::new()),
            Err(TransportError::Configuration(_))
        ));
    }
}
