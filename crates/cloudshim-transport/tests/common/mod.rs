//! Scripted transports and sleepers shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cloudshim_auth::{AuthError, TokenRefresher, TokenState};
use cloudshim_transport::{
    HttpResponse, HttpTransport, OutgoingRequest, Result, Sleeper, TransportError,
};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Answers each send with the next scripted outcome and records the request.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<OutgoingRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<HttpResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<OutgoingRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn endpoints_hit(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.base_url)
            .collect()
    }

    pub fn bearers(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|request| request.headers.get("authorization"))
            .map(|value| value.to_str().unwrap().to_string())
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Stream("script exhausted".to_string())))
    }
}

/// Records requested delays without waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// Hands out a fixed token and counts exchanges.
pub struct FixedRefresher {
    token: Option<String>,
    calls: AtomicUsize,
}

impl FixedRefresher {
    pub fn issuing(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            token: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for FixedRefresher {
    async fn refresh(&self, _refresh_token: &str) -> cloudshim_auth::Result<TokenState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.token {
            Some(token) => Ok(TokenState::new(token.clone())),
            None => Err(AuthError::RefreshFailed("invalid_grant".to_string())),
        }
    }
}

pub fn timeout() -> Result<HttpResponse> {
    Err(TransportError::Timeout("operation timed out".into()))
}

pub fn status(code: u16) -> Result<HttpResponse> {
    Ok(HttpResponse::buffered(
        StatusCode::from_u16(code).unwrap(),
        HeaderMap::new(),
        "",
    ))
}

pub fn ok_json(body: &str) -> Result<HttpResponse> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(HttpResponse::buffered(
        StatusCode::OK,
        headers,
        body.to_string(),
    ))
}

pub fn rate_limited(retry_after: &'static str) -> Result<HttpResponse> {
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from_static(retry_after));
    Ok(HttpResponse::buffered(
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED"}}"#,
    ))
}

pub fn bot_challenge() -> Result<HttpResponse> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=UTF-8"));
    Ok(HttpResponse::buffered(
        StatusCode::BAD_REQUEST,
        headers,
        "<html><body>Our systems have detected unusual traffic. Please solve the CAPTCHA.</body></html>",
    ))
}
