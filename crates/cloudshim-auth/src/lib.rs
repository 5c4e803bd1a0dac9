pub mod claims;
pub mod error;
pub mod manager;
pub mod refresh;
pub mod storage;
pub mod types;

pub use claims::{token_age_seconds, MAX_TOKEN_LIFETIME_SECS};
pub use error::{AuthError, Result};
pub use manager::{CredentialManager, EXPIRY_SKEW_SECS, STALE_AFTER_SECS};
pub use refresh::{GoogleOAuthRefresher, TokenRefresher, GOOGLE_TOKEN_URL};
pub use storage::{CredentialStore, FileTokenStore, MemoryTokenStore};
pub use types::{expires_at_from_now, TokenState};

pub use secrecy;
