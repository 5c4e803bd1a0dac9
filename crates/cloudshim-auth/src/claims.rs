//! Bearer token age from JWT claims
//!
//! Only the payload segment is decoded; signatures are never checked. The
//! result is a hint for proactive refresh, not an authorization decision.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::Value;

/// Lifetime assumed when a token carries `exp` but no `iat`.
pub const MAX_TOKEN_LIFETIME_SECS: f64 = 3600.0;

/// Age of a JWT bearer token in seconds.
///
/// Returns `None` for anything that is not a decodable three-segment token
/// with a numeric `iat` or `exp` claim (opaque OAuth tokens included).
pub fn token_age_seconds(token: &str) -> Option<f64> {
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    token_age_at(token, now)
}

pub(crate) fn token_age_at(token: &str, now: f64) -> Option<f64> {
    let segments: Vec<&str> = token.split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return None;
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;

    let issued_at = match claims.get("iat").and_then(Value::as_f64) {
        Some(iat) => iat,
        None => claims.get("exp").and_then(Value::as_f64)? - MAX_TOKEN_LIFETIME_SECS,
    };

    Some((now - issued_at).max(0.0))
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_age_from_iat() {
        let token = encode_test_token(&json!({"iat": 1_000}));
        assert_eq!(token_age_at(&token, 1_250.0), Some(250.0));
    }

    #[test]
    fn test_age_from_exp_when_iat_missing() {
        let token = encode_test_token(&json!({"exp": 5_000}));
        // issued at 5000 - 3600 = 1400
        assert_eq!(token_age_at(&token, 2_000.0), Some(600.0));
    }

    #[test]
    fn test_future_iat_clamps_to_zero() {
        let token = encode_test_token(&json!({"iat": 10_000}));
        assert_eq!(token_age_at(&token, 9_000.0), Some(0.0));
    }

    #[test]
    fn test_padded_payload_is_accepted() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"iat":10}"#);
        let token = format!("h.{payload}.s");
        assert_eq!(token_age_at(&token, 20.0), Some(10.0));
    }

    #[test]
    fn test_malformed_tokens_yield_none() {
        assert_eq!(token_age_at("ya29.opaque-google-token", 0.0), None);
        assert_eq!(token_age_at("a.b.c.d", 0.0), None);
        assert_eq!(token_age_at("a.!!!not-base64!!!.c", 0.0), None);

        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode("not json"));
        assert_eq!(token_age_at(&not_json, 0.0), None);

        let no_claims = encode_test_token(&json!({"sub": "user"}));
        assert_eq!(token_age_at(&no_claims, 0.0), None);

        let string_iat = encode_test_token(&json!({"iat": "yesterday"}));
        assert_eq!(token_age_at(&string_iat, 0.0), None);
    }

    #[test]
    fn test_wall_clock_age_is_positive() {
        let issued = chrono::Utc::now().timestamp() - 120;
        let token = encode_test_token(&json!({ "iat": issued }));
        let age = token_age_seconds(&token).unwrap();
        assert!((119.0..=125.0).contains(&age));
    }
}
