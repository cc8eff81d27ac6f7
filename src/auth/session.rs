//! Server-side sessions
//!
//! The browser only holds an HMAC-signed session id. Session contents live in
//! a [`SessionStore`] (SQLite or in-process memory) and are exposed to
//! handlers through a request-scoped [`Session`] handle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::data::{Database, SessionRecord};
use crate::error::AppError;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "session";

/// Session keys used by the application.
pub mod keys {
    /// Anti-forgery state sent with the authorization request.
    pub const STATE: &str = "state";
    /// Serialized external token cache.
    pub const TOKEN_CACHE: &str = "token_cache";
    /// Identity claims of an external sign-in.
    pub const USER_CLAIMS: &str = "user";
    /// Row id of the attached local account.
    pub const USER_ID: &str = "_user_id";
    /// Set when the session cookie should outlive the browser session.
    pub const REMEMBER: &str = "_remember";
}

/// Key/value contents of one browser session
pub type SessionData = serde_json::Map<String, Value>;

/// A live session as held by a [`SessionStore`]
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub data: SessionData,
    /// Unix seconds
    pub expires_at: i64,
}

// =============================================================================
// Store
// =============================================================================

/// Backing storage for session contents
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a live session. Expired or unknown ids yield `None`.
    async fn load(&self, id: &str) -> Result<Option<StoredSession>, AppError>;

    /// Insert or replace a session, valid until `expires_at` (unix seconds).
    async fn save(&self, id: &str, data: &SessionData, expires_at: i64) -> Result<(), AppError>;

    async fn delete(&self, id: &str) -> Result<(), AppError>;

    /// Drop expired sessions, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, AppError>;
}

/// Sessions persisted in the `sessions` table
pub struct SqliteSessionStore {
    db: Arc<Database>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, id: &str) -> Result<Option<StoredSession>, AppError> {
        let Some(record) = self.db.load_session(id).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<SessionData>(&record.data) {
            Ok(data) => Ok(Some(StoredSession {
                data,
                expires_at: record.expires_at,
            })),
            Err(error) => {
                tracing::warn!(%error, "Discarding unreadable session row");
                Ok(None)
            }
        }
    }

    async fn save(&self, id: &str, data: &SessionData, expires_at: i64) -> Result<(), AppError> {
        let data =
            serde_json::to_string(data).map_err(|e| AppError::Session(e.to_string()))?;
        self.db
            .store_session(&SessionRecord {
                id: id.to_string(),
                data,
                expires_at,
            })
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.db.delete_session(id).await
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        self.db.purge_expired_sessions(Utc::now().timestamp()).await
    }
}

/// Sessions held in process memory. Lost on restart.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, (SessionData, i64)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<StoredSession>, AppError> {
        let now = Utc::now().timestamp();
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(data, expires_at)| StoredSession {
                data: data.clone(),
                expires_at: *expires_at,
            }))
    }

    async fn save(&self, id: &str, data: &SessionData, expires_at: i64) -> Result<(), AppError> {
        self.sessions
            .write()
            .await
            .insert(id.to_string(), (data.clone(), expires_at));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let now = Utc::now().timestamp();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - sessions.len()) as u64)
    }
}

// =============================================================================
// Request-scoped handle
// =============================================================================

/// The current browser session
///
/// Cloning shares the same underlying state. Changes are written back to the
/// store once the handler has produced its response, and only if something
/// changed.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

struct SessionInner {
    id: Option<String>,
    data: SessionData,
    /// Expiry of the stored copy, if there is one
    expires_at: Option<i64>,
    modified: bool,
    renew: bool,
}

/// What happened when a session was written back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommit {
    /// Nothing changed; no store write and no cookie update.
    Unchanged,
    /// Stored under `id`.
    Saved { id: String, persistent: bool },
    /// The session became empty and was deleted.
    Removed,
}

impl Session {
    /// Wrap loaded session contents. `id` is `None` for a fresh session.
    pub fn new(id: Option<String>, data: SessionData) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                id,
                data,
                expires_at: None,
                modified: false,
                renew: false,
            })),
        }
    }

    /// Wrap a session loaded from the store under `id`.
    pub fn restore(id: String, stored: StoredSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                id: Some(id),
                data: stored.data,
                expires_at: Some(stored.expires_at),
                modified: false,
                renew: false,
            })),
        }
    }

    /// An empty session that has never been stored.
    pub fn fresh() -> Self {
        Self::new(None, SessionData::new())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let inner = self.inner.lock().await;
        inner
            .data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.data.contains_key(key)
    }

    pub async fn insert<T: Serialize>(&self, key: &str, value: T) -> Result<(), AppError> {
        let value = serde_json::to_value(value).map_err(|e| AppError::Session(e.to_string()))?;
        let mut inner = self.inner.lock().await;
        inner.data.insert(key.to_string(), value);
        inner.modified = true;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        let removed = inner.data.remove(key);
        if removed.is_some() {
            inner.modified = true;
        }
        removed
    }

    /// Drop every key
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.data.is_empty() {
            inner.data.clear();
            inner.modified = true;
        }
    }

    /// Issue a new session id on the next write, discarding the old one.
    ///
    /// Called whenever the privilege level of the session changes.
    pub async fn renew(&self) {
        let mut inner = self.inner.lock().await;
        inner.renew = true;
        inner.modified = true;
    }

    pub async fn is_modified(&self) -> bool {
        self.inner.lock().await.modified
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.data.is_empty()
    }

    /// Write the session back to `store` if it changed, or if less than half
    /// of its lifetime is left.
    ///
    /// # Arguments
    /// * `store` - Backing store
    /// * `max_age` - Lifetime in seconds from now
    pub async fn commit(
        &self,
        store: &dyn SessionStore,
        max_age: i64,
    ) -> Result<SessionCommit, AppError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let aging = inner.id.is_some()
            && inner
                .expires_at
                .is_some_and(|expires_at| expires_at - now.timestamp() < max_age / 2);
        if !inner.modified && !aging {
            return Ok(SessionCommit::Unchanged);
        }

        if inner.renew {
            if let Some(old_id) = inner.id.take() {
                store.delete(&old_id).await?;
            }
        }

        if inner.data.is_empty() {
            let existed = match inner.id.take() {
                Some(id) => {
                    store.delete(&id).await?;
                    true
                }
                None => inner.renew,
            };
            inner.modified = false;
            inner.renew = false;
            return Ok(if existed {
                SessionCommit::Removed
            } else {
                SessionCommit::Unchanged
            });
        }

        let id = match &inner.id {
            Some(id) => id.clone(),
            None => generate_session_id(),
        };
        let expires_at = (now + Duration::seconds(max_age)).timestamp();
        store.save(&id, &inner.data, expires_at).await?;

        let persistent = inner
            .data
            .get(keys::REMEMBER)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        inner.id = Some(id.clone());
        inner.expires_at = Some(expires_at);
        inner.modified = false;
        inner.renew = false;

        Ok(SessionCommit::Saved { id, persistent })
    }
}

// =============================================================================
// Cookie tokens
// =============================================================================

/// Generate a random, URL-safe session id
pub fn generate_session_id() -> String {
    random_token()
}

/// 32 random bytes, base64url encoded
pub(crate) fn random_token() -> String {
    use base64::{Engine as _, engine::general_purpose};
    use rand::RngCore;

    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Create a signed session cookie value
///
/// Token format: id.base64(hmac_sha256(id))
///
/// # Arguments
/// * `session_id` - Session id to sign
/// * `secret` - HMAC secret key
///
/// # Returns
/// Signed token string
pub fn create_session_token(session_id: &str, secret: &str) -> Result<String, AppError> {
    use base64::{Engine as _, engine::general_purpose};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Encryption(e.to_string()))?;
    mac.update(session_id.as_bytes());
    let signature = mac.finalize().into_bytes();
    let signature_b64 = general_purpose::URL_SAFE_NO_PAD.encode(signature);

    Ok(format!("{}.{}", session_id, signature_b64))
}

/// Verify a signed session cookie value
///
/// # Returns
/// The session id if the signature is valid
///
/// # Errors
/// Returns `Unauthorized` if the token is malformed or the signature is invalid
pub fn verify_session_token(token: &str, secret: &str) -> Result<String, AppError> {
    use base64::{Engine as _, engine::general_purpose};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let Some((session_id, signature_b64)) = token.split_once('.') else {
        return Err(AppError::Unauthorized);
    };
    if session_id.is_empty() || signature_b64.contains('.') {
        return Err(AppError::Unauthorized);
    }

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Encryption(e.to_string()))?;
    mac.update(session_id.as_bytes());

    let signature = general_purpose::URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AppError::Unauthorized)?;

    mac.verify_slice(&signature)
        .map_err(|_| AppError::Unauthorized)?;

    Ok(session_id.to_string())
}
