//! Serializable cache of tokens issued by the external identity provider
//!
//! The cache lives in the browser session as an opaque JSON blob. It tracks
//! whether it changed since it was loaded so callers can skip rewriting the
//! session when nothing was added.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::identity::{Claims, TokenSet};

/// Account entry derived from id token claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedAccount {
    home_account_id: String,
    username: Option<String>,
    name: Option<String>,
    tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAccessToken {
    home_account_id: String,
    secret: String,
    scopes: Vec<String>,
    /// Unix seconds; `None` when the provider did not say
    expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSecret {
    secret: String,
}

/// Tokens issued to this browser session
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    accounts: BTreeMap<String, CachedAccount>,
    #[serde(default)]
    access_tokens: Vec<CachedAccessToken>,
    #[serde(default)]
    refresh_tokens: BTreeMap<String, CachedSecret>,
    #[serde(default)]
    id_tokens: BTreeMap<String, CachedSecret>,
    #[serde(skip)]
    state_changed: bool,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a cache from its serialized form. The result reports no change.
    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }

    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Whether tokens were added or removed since load
    pub fn has_state_changed(&self) -> bool {
        self.state_changed
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Record a freshly issued token set
    ///
    /// Replaces any access token for the same account whose scopes overlap.
    pub fn add(&mut self, tokens: &TokenSet) {
        let home_account_id = home_account_id(&tokens.id_token_claims);
        let now = Utc::now().timestamp();

        self.accounts.insert(
            home_account_id.clone(),
            CachedAccount {
                home_account_id: home_account_id.clone(),
                username: claim_str(&tokens.id_token_claims, "preferred_username"),
                name: claim_str(&tokens.id_token_claims, "name"),
                tenant_id: claim_str(&tokens.id_token_claims, "tid"),
            },
        );

        let scopes = normalize_scopes(&tokens.scopes);
        self.access_tokens.retain(|token| {
            token.home_account_id != home_account_id
                || !token.scopes.iter().any(|scope| scopes.contains(scope))
        });
        self.access_tokens.push(CachedAccessToken {
            home_account_id: home_account_id.clone(),
            secret: tokens.access_token.clone(),
            scopes,
            expires_at: tokens
                .expires_in
                .map(|seconds| now.saturating_add(seconds as i64)),
        });

        if let Some(refresh_token) = &tokens.refresh_token {
            self.refresh_tokens.insert(
                home_account_id.clone(),
                CachedSecret {
                    secret: refresh_token.clone(),
                },
            );
        }
        if let Some(id_token) = &tokens.id_token {
            self.id_tokens.insert(
                home_account_id,
                CachedSecret {
                    secret: id_token.clone(),
                },
            );
        }

        self.state_changed = true;
    }

    /// A cached access token for the account that covers every requested
    /// scope and has not expired.
    pub fn access_token_for(&self, home_account_id: &str, scopes: &[String]) -> Option<&str> {
        let wanted = normalize_scopes(scopes);
        let now = Utc::now().timestamp();
        self.access_tokens
            .iter()
            .filter(|token| token.home_account_id == home_account_id)
            .filter(|token| token.expires_at.is_none_or(|expires_at| expires_at > now))
            .find(|token| wanted.iter().all(|scope| token.scopes.contains(scope)))
            .map(|token| token.secret.as_str())
    }
}

/// Stable account key: `oid.tid` when the provider sends both, else `sub`.
fn home_account_id(claims: &Claims) -> String {
    match (claim_str(claims, "oid"), claim_str(claims, "tid")) {
        (Some(oid), Some(tid)) => format!("{}.{}", oid, tid),
        _ => claim_str(claims, "sub").unwrap_or_else(|| "anonymous".to_string()),
    }
}

fn claim_str(claims: &Claims, key: &str) -> Option<String> {
    claims
        .get(key)
        .and_then(|value| value.as_str())
        .map(ToOwned::to_owned)
}

fn normalize_scopes(scopes: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = scopes
        .iter()
        .map(|scope| scope.trim().to_ascii_lowercase())
        .filter(|scope| !scope.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_set(access_token: &str, scopes: &[&str]) -> TokenSet {
        let claims = json!({
            "oid": "object-1",
            "tid": "tenant-1",
            "preferred_username": "ada@example.com",
            "name": "Ada",
        })
        .as_object()
        .cloned()
        .unwrap();

        TokenSet {
            access_token: access_token.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            id_token: Some("header.payload.signature".to_string()),
            id_token_claims: claims,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            expires_in: Some(3600),
        }
    }

    #[test]
    fn new_cache_reports_no_change() {
        let cache = TokenCache::new();
        assert!(!cache.has_state_changed());
        assert!(cache.is_empty());
    }

    #[test]
    fn add_marks_changed_and_indexes_account() {
        let mut cache = TokenCache::new();
        cache.add(&token_set("at-1", &["User.Read", "openid"]));

        assert!(cache.has_state_changed());
        let account = cache.accounts.values().next().unwrap();
        assert_eq!(account.home_account_id, "object-1.tenant-1");
        assert_eq!(account.username.as_deref(), Some("ada@example.com"));

        let scopes = vec!["user.read".to_string()];
        assert_eq!(
            cache.access_token_for("object-1.tenant-1", &scopes),
            Some("at-1")
        );
        assert_eq!(
            cache.refresh_tokens["object-1.tenant-1"].secret,
            "refresh-1"
        );
        assert!(cache.access_token_for("someone-else", &scopes).is_none());
    }

    #[test]
    fn reloaded_cache_starts_unchanged() {
        let mut cache = TokenCache::new();
        cache.add(&token_set("at-1", &["User.Read"]));
        let blob = cache.to_blob().unwrap();

        let reloaded = TokenCache::from_blob(&blob).unwrap();
        assert!(!reloaded.has_state_changed());
        assert_eq!(
            reloaded.access_token_for("object-1.tenant-1", &["User.Read".to_string()]),
            Some("at-1")
        );
    }

    #[test]
    fn overlapping_scopes_replace_previous_access_token() {
        let mut cache = TokenCache::new();
        cache.add(&token_set("at-1", &["User.Read"]));
        cache.add(&token_set("at-2", &["User.Read", "Mail.Read"]));

        assert_eq!(
            cache.access_token_for("object-1.tenant-1", &["User.Read".to_string()]),
            Some("at-2")
        );
    }

    #[test]
    fn home_account_id_falls_back_to_subject() {
        let claims = json!({"sub": "subject-9"}).as_object().cloned().unwrap();
        assert_eq!(home_account_id(&claims), "subject-9");
    }
}
