//! Bearer token lifecycle: extraction, staleness, and serialized refresh

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::{token_age_seconds, AuthError, CredentialStore, Result, TokenRefresher, TokenState};

/// Tokens older than this are refreshed before use (Google tokens live 3600s).
pub const STALE_AFTER_SECS: f64 = 3000.0;

/// Stored tokens expiring within this window count as expired.
pub const EXPIRY_SKEW_SECS: i64 = 60;

type InFlightRefresh = Shared<BoxFuture<'static, Option<TokenState>>>;

/// Owns the shared credential state for every call made through a transport.
///
/// Refreshes are single-flight: callers that discover a stale token at the
/// same time all await the same OAuth exchange. The mutex only guards the
/// in-flight slot and is never held across the network call.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    stale_after_secs: f64,
    in_flight: Mutex<Option<InFlightRefresh>>,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            store,
            refresher,
            stale_after_secs: STALE_AFTER_SECS,
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_stale_after(mut self, secs: f64) -> Self {
        self.stale_after_secs = secs;
        self
    }

    /// Token from an `Authorization: Bearer ...` header, if any
    pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    /// Current stored state; storage failures read as "no credentials".
    pub async fn stored_state(&self) -> Option<TokenState> {
        match self.store.load().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "failed to load stored token");
                None
            }
        }
    }

    pub async fn current_token(&self) -> Option<String> {
        self.stored_state()
            .await
            .map(|state| state.access_token().to_string())
    }

    /// Whether the bearer on `headers` should be replaced before sending.
    ///
    /// JWT bearers are judged by age; opaque ones by the stored expiry.
    pub async fn should_refresh(&self, headers: &HeaderMap) -> bool {
        let Some(token) = Self::extract_bearer(headers) else {
            return false;
        };

        match token_age_seconds(&token) {
            Some(age) => {
                debug!(age_secs = age, "bearer token age");
                age > self.stale_after_secs
            }
            None => self.stored_token_expired().await,
        }
    }

    async fn stored_token_expired(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.stored_state()
            .await
            .is_some_and(|state| state.expires_within(EXPIRY_SKEW_SECS, now))
    }

    /// Refresh the stored token and return the new access token.
    ///
    /// `stale` is the token the caller found lacking. When the store already
    /// holds a different token, another caller refreshed in the meantime and
    /// that token is returned without a new exchange. Any failure yields
    /// `None`.
    pub async fn refresh(&self, stale: Option<&str>) -> Option<String> {
        if let Some(stale) = stale {
            if let Some(current) = self.current_token().await {
                if current != stale {
                    debug!("stored token already replaced, reusing it");
                    return Some(current);
                }
            }
        }

        let refresh = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(refresh) => refresh.clone(),
                None => {
                    let refresh = self.start_refresh().shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        let result = refresh.clone().await;

        {
            let mut slot = self.in_flight.lock();
            if slot
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&refresh))
            {
                *slot = None;
            }
        }

        result.map(|state| state.access_token.expose_secret().to_string())
    }

    fn start_refresh(&self) -> BoxFuture<'static, Option<TokenState>> {
        let store = self.store.clone();
        let refresher = self.refresher.clone();

        async move {
            match exchange(store.as_ref(), refresher.as_ref()).await {
                Ok(next) => {
                    info!(expires_at = ?next.expires_at, "access token refreshed");
                    Some(next)
                }
                Err(e) => {
                    warn!(error = %e, "token refresh failed");
                    None
                }
            }
        }
        .boxed()
    }
}

/// Trade the stored refresh token for a new access token and persist the merge.
async fn exchange(
    store: &dyn CredentialStore,
    refresher: &dyn TokenRefresher,
) -> Result<TokenState> {
    let current = store
        .load()
        .await?
        .ok_or_else(|| AuthError::StorageError("no stored token to refresh".to_string()))?;
    let refresh_token = current
        .refresh_token
        .as_ref()
        .ok_or(AuthError::MissingRefreshToken)?;

    let fresh = refresher.refresh(refresh_token.expose_secret()).await?;
    let next = current.refreshed_with(fresh);
    if let Err(e) = store.save(&next).await {
        warn!(error = %e, "failed to persist refreshed token");
    }
    Ok(next)
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("stale_after_secs", &self.stale_after_secs)
            .field("refresh_in_flight", &self.in_flight.lock().is_some())
            .finish()
    }
}
