use crate::{AuthError, Result, TokenState};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where token state lives between process runs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenState>>;

    async fn save(&self, state: &TokenState) -> Result<()>;
}

/// JSON file store with an in-memory copy.
///
/// Every rewrite reads the token, so reads are served from memory after the
/// first load; writes replace the file atomically and then the cache.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    cache: RwLock<Option<TokenState>>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    /// `~/.local/share/cloudshim/oauth.json` on Linux, the platform data dir elsewhere
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| AuthError::StorageError("No data directory found".to_string()))?;

        Ok(data_dir.join("cloudshim").join("oauth.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileTokenStore {
    async fn load(&self) -> Result<Option<TokenState>> {
        if let Some(cached) = self.cache.read().clone() {
            return Ok(Some(cached));
        }

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AuthError::StorageError(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let state: TokenState = serde_json::from_str(&content)?;
        *self.cache.write() = Some(state.clone());
        Ok(Some(state))
    }

    async fn save(&self, state: &TokenState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_private(&path, &content))
            .await
            .map_err(|e| AuthError::StorageError(format!("Token write task failed: {}", e)))??;

        *self.cache.write() = Some(state.clone());
        Ok(())
    }
}

/// Replace `path` with `content` via a temp file in the same directory, so a
/// crash leaves either the old or the new token, never half of one.
fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AuthError::StorageError("Token path has no parent directory".into()))?;
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(path)
        .map_err(|e| AuthError::StorageError(format!("Failed to persist token: {}", e.error)))?;
    Ok(())
}

/// Process-local store for embedders that manage persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    state: RwLock<Option<TokenState>>,
}

impl MemoryTokenStore {
    pub fn new(state: Option<TokenState>) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<TokenState>> {
        Ok(self.state.read().clone())
    }

    async fn save(&self, state: &TokenState) -> Result<()> {
        *self.state.write() = Some(state.clone());
        Ok(())
    }
}
