//! Header rewrite for wrapped requests
//!
//! The backend identifies clients by user agent and rejects API-key headers,
//! so every wrapped request gets the same identity and only a bearer token.

use crate::error::{Result, TransportError};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT,
};

/// Client identity sent on every wrapped request
pub const CLIENT_USER_AGENT: &str = "antigravity/1.11.5 linux/amd64";

/// Beta feature: Interleaved thinking (extended thinking)
pub const BETA_INTERLEAVED_THINKING: &str = "interleaved-thinking-2025-05-14";

pub const ANTHROPIC_BETA: HeaderName = HeaderName::from_static("anthropic-beta");

const STRIPPED_HEADERS: &[&str] = &["x-goog-api-key", "x-api-key"];

/// Tracks which beta features are enabled and builds the header value
#[derive(Debug, Default, Clone)]
pub struct BetaFeatures {
    pub interleaved_thinking: bool,
}

impl BetaFeatures {
    /// Features a model needs; reasoning-tier models think between tool calls
    pub fn for_model(reasoning_tier: bool) -> Self {
        Self {
            interleaved_thinking: reasoning_tier,
        }
    }

    /// Comma-separated enabled features, or an empty string if none
    pub fn to_header_value(&self) -> String {
        let mut features = Vec::new();

        if self.interleaved_thinking {
            features.push(BETA_INTERLEAVED_THINKING);
        }

        features.join(",")
    }
}

/// Rewrite caller headers in place for a wrapped request.
pub fn prepare_headers(headers: &mut HeaderMap, reasoning_tier: bool) {
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
    // the body was rewritten; reqwest recomputes the length
    headers.remove(CONTENT_LENGTH);

    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let beta = BetaFeatures::for_model(reasoning_tier).to_header_value();
    match HeaderValue::from_str(&beta) {
        Ok(value) if !beta.is_empty() => {
            headers.insert(ANTHROPIC_BETA, value);
        }
        _ => {
            headers.remove(ANTHROPIC_BETA);
        }
    }
}

pub fn set_bearer(headers: &mut HeaderMap, token: &str) -> Result<()> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| TransportError::Configuration("access token is not a valid header value".into()))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beta_header_value() {
        assert_eq!(BetaFeatures::default().to_header_value(), "");
        assert_eq!(
            BetaFeatures::for_model(true).to_header_value(),
            "interleaved-thinking-2025-05-14"
        );
    }

    #[test]
    fn test_prepare_headers_for_reasoning_model() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("AIza-secret"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-secret"));
        headers.insert(USER_AGENT, HeaderValue::from_static("google-genai-sdk/1.0"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        prepare_headers(&mut headers, true);

        assert!(headers.get("x-goog-api-key").is_none());
        assert!(headers.get("x-api-key").is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(headers[USER_AGENT], CLIENT_USER_AGENT);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[ANTHROPIC_BETA], BETA_INTERLEAVED_THINKING);
        assert_eq!(headers["x-custom"], "kept");
    }

    #[test]
    fn test_prepare_headers_drops_stale_beta_for_plain_models() {
        let mut headers = HeaderMap::new();
        headers.insert(ANTHROPIC_BETA, HeaderValue::from_static("something-old"));
        prepare_headers(&mut headers, false);
        assert!(headers.get(ANTHROPIC_BETA).is_none());
    }

    #[test]
    fn test_set_bearer() {
        let mut headers = HeaderMap::new();
        set_bearer(&mut headers, "ya29.token").unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer ya29.token");
        assert!(headers[AUTHORIZATION].is_sensitive());

        assert!(set_bearer(&mut headers, "bad\ntoken").is_err());
    }
}
