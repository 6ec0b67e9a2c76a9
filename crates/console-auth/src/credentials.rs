//! Credential record and its process-wide store
//!
//! The store holds at most one credential: the access token, the refresh token
//! and the access token's expiry. It is mutated only by login, a successful
//! renewal, and an explicit clear (logout or a fatal 401). Every mutation
//! replaces the whole record, so a reader never observes a half-updated
//! credential.
//!
//! Durability is delegated to a `CredentialBackend`. Backend failures are
//! logged and swallowed: the in-memory record stays authoritative and store
//! operations never fail once the store is loaded.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::EXPIRY_BUFFER;
use crate::error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The credential record.
///
/// `expires_at` is an absolute unix timestamp in milliseconds, computed when
/// the record is created from the server's seconds-to-live hint. It is absent
/// when the server gave no hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<Secret<String>>,
        refresh_token: impl Into<Secret<String>>,
        expires_at: Option<u64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Build a credential whose expiry is `ttl_secs` after `now_millis`.
    pub fn with_ttl(
        access_token: impl Into<Secret<String>>,
        refresh_token: impl Into<Secret<String>>,
        ttl_secs: Option<u64>,
        now_millis: u64,
    ) -> Self {
        let expires_at = ttl_secs.map(|ttl| now_millis.saturating_add(ttl.saturating_mul(1000)));
        Self::new(access_token, refresh_token, expires_at)
    }

    /// Whether `now_millis` falls inside the renewal buffer before expiry.
    ///
    /// A credential without a recorded expiry is never near expiry.
    pub fn is_near_expiry_at(&self, now_millis: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let buffer = EXPIRY_BUFFER.as_millis() as u64;
                now_millis >= expires_at.saturating_sub(buffer)
            }
            None => false,
        }
    }
}

/// Durable storage behind the credential store.
///
/// Uses `Pin<Box<dyn Future>>` return types so the store can hold a
/// `Box<dyn CredentialBackend>` chosen at startup.
pub trait CredentialBackend: Send + Sync {
    /// Read the persisted credential, if any.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<Credential>>> + Send + '_>>;

    /// Persist `credential`, replacing whatever was stored.
    fn save<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove the persisted credential.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Keeps the credential in process memory only.
#[derive(Default)]
pub struct MemoryBackend {
    saved: Mutex<Option<Credential>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded with a credential, as if left by a previous run.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            saved: Mutex::new(Some(credential)),
        }
    }
}

impl CredentialBackend for MemoryBackend {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<Credential>>> + Send + '_>> {
        Box::pin(async move { Ok(self.saved.lock().await.clone()) })
    }

    fn save<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            *self.saved.lock().await = Some(credential.clone());
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.saved.lock().await = None;
            Ok(())
        })
    }
}

/// Persists the credential as a JSON file.
///
/// Writes go through a temp file + rename so a crash mid-write never leaves a
/// truncated file behind. The file is created with 0600 permissions on unix.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialBackend for FileBackend {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<Credential>>> + Send + '_>> {
        Box::pin(async move {
            if !self.path.exists() {
                info!(path = %self.path.display(), "credential file not found, starting signed out");
                return Ok(None);
            }
            let contents = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credential: Credential = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %self.path.display(), "loaded credential");
            Ok(Some(credential))
        })
    }

    fn save<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(write_atomic(&self.path, credential))
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!(path = %self.path.display(), "removed credential file");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
            }
        })
    }
}

/// Process-wide credential store.
///
/// The Mutex serializes writes so the backend always receives them in the
/// order they were applied in memory. Reads hold the lock only long enough to
/// clone the record.
pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
    state: Mutex<Option<Credential>>,
}

impl CredentialStore {
    /// Create a store backed by `backend`, seeded with whatever it has persisted.
    pub async fn load(backend: impl CredentialBackend + 'static) -> Result<Self> {
        let state = backend.load().await?;
        Ok(Self {
            backend: Box::new(backend),
            state: Mutex::new(state),
        })
    }

    /// An empty store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            state: Mutex::new(None),
        }
    }

    /// Clone of the current credential, if signed in.
    pub async fn get(&self) -> Option<Credential> {
        self.state.lock().await.clone()
    }

    /// Store a fresh token pair expiring `ttl_secs` from now.
    pub async fn set(&self, access: String, refresh: String, ttl_secs: Option<u64>) {
        self.replace(Credential::with_ttl(access, refresh, ttl_secs, now_millis()))
            .await;
    }

    /// Replace the whole record and persist it.
    pub async fn replace(&self, credential: Credential) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.backend.save(&credential).await {
            warn!(error = %e, "failed to persist credential");
        }
        debug!(expires_at = ?credential.expires_at, "stored credential");
        *state = Some(credential);
    }

    /// Drop the credential from memory and from the backend.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            info!("credential cleared");
        }
        if let Err(e) = self.backend.clear().await {
            warn!(error = %e, "failed to clear persisted credential");
        }
    }

    /// Whether the stored access token is inside the renewal buffer.
    pub async fn is_near_expiry(&self) -> bool {
        self.is_near_expiry_at(now_millis()).await
    }

    pub async fn is_near_expiry_at(&self, now_millis: u64) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.is_near_expiry_at(now_millis))
    }
}

/// Write the credential to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets 0600 permissions since the file contains tokens.
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let json = serde_json::to_string_pretty(credential)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;
    }

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}
