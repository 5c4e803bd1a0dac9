use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// OAuth credential set used to authorize backend calls.
///
/// `expires_at` is a unix timestamp in seconds.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenState {
    #[serde(with = "secret_string_serde")]
    pub access_token: SecretString,
    #[serde(default, with = "option_secret_string_serde")]
    pub refresh_token: Option<SecretString>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

pub fn expires_at_from_now(expires_in_seconds: Option<i64>) -> Option<i64> {
    let expires_in = expires_in_seconds?;
    if expires_in <= 0 {
        return None;
    }
    Some(chrono::Utc::now().timestamp() + expires_in)
}

impl TokenState {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            refresh_token: None,
            expires_at: None,
            email: None,
            project_id: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::from(refresh_token.into()));
        self
    }

    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// True when the token expires within `skew_secs` of `now`.
    /// A token without a known expiry is never considered expired.
    pub fn expires_within(&self, skew_secs: i64, now: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - skew_secs <= now)
    }

    /// Combine this state with the result of a refresh.
    ///
    /// The refresh endpoint may omit the refresh token and never knows the
    /// account metadata, so those carry over. Expiry never moves backwards.
    pub fn refreshed_with(&self, fresh: TokenState) -> TokenState {
        let expires_at = match (self.expires_at, fresh.expires_at) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };

        TokenState {
            access_token: fresh.access_token,
            refresh_token: fresh.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at,
            email: fresh.email.or_else(|| self.email.clone()),
            project_id: fresh.project_id.or_else(|| self.project_id.clone()),
        }
    }
}

impl std::fmt::Debug for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("email", &self.email)
            .field("project_id", &self.project_id)
            .finish()
    }
}

mod secret_string_serde {
    use super::*;

    pub fn serialize<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        secret.expose_secret().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString::from)
    }
}

mod option_secret_string_serde {
    use super::*;

    pub fn serialize<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match secret {
            Some(s) => serializer.serialize_some(s.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(|opt| opt.map(SecretString::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_tokens() {
        let state = TokenState::new("ya29.secret").with_refresh_token("1//refresh");
        let debug = format!("{:?}", state);
        assert!(!debug.contains("ya29.secret"));
        assert!(!debug.contains("1//refresh"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_secrets() {
        let state = TokenState::new("access")
            .with_refresh_token("refresh")
            .with_expires_at(1_700_000_000)
            .with_project_id("proj-1");
        let json = serde_json::to_string(&state).unwrap();
        let parsed: TokenState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.access_token(), "access");
        assert_eq!(
            parsed.refresh_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("refresh".to_string())
        );
        assert_eq!(parsed.expires_at, Some(1_700_000_000));
        assert_eq!(parsed.project_id.as_deref(), Some("proj-1"));
    }

    #[test]
    fn test_minimal_state_deserializes() {
        let parsed: TokenState = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(parsed.access_token(), "a");
        assert!(parsed.refresh_token.is_none());
        assert!(parsed.expires_at.is_none());
    }

    #[test]
    fn test_expires_within() {
        let state = TokenState::new("a").with_expires_at(1_000);
        assert!(state.expires_within(60, 950));
        assert!(!state.expires_within(60, 900));
        assert!(!TokenState::new("a").expires_within(60, i64::MAX));
    }

    #[test]
    fn test_refreshed_with_carries_over_and_never_rewinds_expiry() {
        let mut old = TokenState::new("old")
            .with_refresh_token("keep-me")
            .with_expires_at(2_000)
            .with_project_id("proj");
        old.email = Some("dev@example.com".to_string());

        let fresh = TokenState::new("new").with_expires_at(1_500);
        let next = old.refreshed_with(fresh);

        assert_eq!(next.access_token(), "new");
        assert_eq!(
            next.refresh_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("keep-me".to_string())
        );
        assert_eq!(next.expires_at, Some(2_000));
        assert_eq!(next.email.as_deref(), Some("dev@example.com"));
        assert_eq!(next.project_id.as_deref(), Some("proj"));

        let later = next.refreshed_with(TokenState::new("newer").with_expires_at(5_000));
        assert_eq!(later.expires_at, Some(5_000));
    }

    #[test]
    fn test_expires_at_from_now() {
        assert!(expires_at_from_now(None).is_none());
        assert!(expires_at_from_now(Some(0)).is_none());
        let now = chrono::Utc::now().timestamp();
        let at = expires_at_from_now(Some(3600)).unwrap();
        assert!(at >= now + 3600 && at <= now + 3601);
    }
}
