//! Authentication
//!
//! Handles:
//! - Local username/password sign-in
//! - External OAuth 2.0 authorization code flow and its token cache
//! - Server-side sessions and the extractors built on them

mod identity;
mod middleware;
mod oauth;
pub mod password;
pub mod session;
mod token_cache;

pub use identity::{
    Claims, ConfidentialClient, IdentityError, IdentityProvider, ProviderError, TokenExchange,
    TokenSet, decode_id_token_claims, load_cache, save_cache,
};
pub use middleware::{CurrentUser, MaybeUser, is_safe_next, login_redirect, session_layer};
pub use oauth::auth_router;
pub use session::{
    MemorySessionStore, Session, SessionStore, SqliteSessionStore, StoredSession,
    create_session_token, verify_session_token,
};
pub use token_cache::TokenCache;
