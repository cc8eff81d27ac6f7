//! Photoboard - a small photo-sharing web application
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Web Layer (Axum)                         │
//! │  - Feed / post pages                                         │
//! │  - Local and external sign-in                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Session + Identity                          │
//! │  - Server-side sessions (signed id cookie)                   │
//! │  - OAuth 2.0 confidential client and token cache             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                             │
//! │  - Image storage (local directory or S3)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `web`: HTML pages for the feed and post editing
//! - `auth`: sessions, sign-in flows, identity provider client
//! - `data`: Database layer
//! - `storage`: Image blob storage
//! - `config`: Configuration management
//! - `error`: Error types

pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod web;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and service clients.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Server-side session contents
    pub sessions: Arc<dyn auth::SessionStore>,

    /// Image blob storage
    pub storage: Arc<storage::ImageStorage>,

    /// External identity provider client
    pub identity: Arc<dyn auth::IdentityProvider>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Select the session store
    /// 3. Initialize image storage
    /// 4. Build the identity provider client
    /// 5. Seed the admin account
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Session store
        let sessions: Arc<dyn auth::SessionStore> = match config.auth.session.store {
            config::SessionStoreKind::Sqlite => {
                Arc::new(auth::SqliteSessionStore::new(db.clone()))
            }
            config::SessionStoreKind::Memory => Arc::new(auth::MemorySessionStore::new()),
        };
        tracing::info!(store = ?config.auth.session.store, "Session store initialized");

        // 3. Image storage
        let storage = storage::ImageStorage::new(&config.storage).await?;
        tracing::info!("Image storage initialized");

        // 4. Identity provider client
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Photoboard/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let identity = auth::ConfidentialClient::new(&config, http_client)
            .map_err(|e| error::AppError::Config(e.to_string()))?;

        // 5. Admin account
        Self::ensure_admin_user(&db, &config).await?;

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            sessions,
            storage: Arc::new(storage),
            identity: Arc::new(identity),
        })
    }

    /// Assemble state from already-built parts
    pub fn from_parts(
        config: config::AppConfig,
        db: data::Database,
        sessions: Arc<dyn auth::SessionStore>,
        storage: storage::ImageStorage,
        identity: Arc<dyn auth::IdentityProvider>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db: Arc::new(db),
            sessions,
            storage: Arc::new(storage),
            identity,
        }
    }

    /// Ensure the admin account exists with the configured password
    ///
    /// Does nothing when `admin.password` is not set.
    async fn ensure_admin_user(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<(), error::AppError> {
        let Some(password) = config.admin.password.as_deref() else {
            tracing::debug!("admin.password not set; skipping admin account seeding");
            return Ok(());
        };

        if let Some(account) = db.get_user_by_username(&config.admin.username).await? {
            if auth::password::verify_password(password, &account.password_hash) {
                tracing::info!(username = %account.username, "Admin account exists");
            } else {
                let hash = auth::password::hash_password(password)?;
                db.update_password_hash(account.id, &hash).await?;
                tracing::info!(username = %account.username, "Admin account password updated");
            }
            return Ok(());
        }

        let hash = auth::password::hash_password(password)?;
        let account = db.insert_user(&config.admin.username, &hash).await?;
        tracing::info!(username = %account.username, "Admin account created");

        Ok(())
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, middleware, routing::get};
    use tower_http::{compression::CompressionLayer, services::ServeDir, trace::TraceLayer};

    let mut router = Router::new()
        .route("/health", get(health_check))
        .merge(auth::auth_router(&state.config.auth.external.redirect_path))
        .merge(web::content_router())
        .merge(web::metrics_router());

    if let Some(root) = state.storage.local_root() {
        router = router.nest_service("/images", ServeDir::new(root));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::session_layer,
        ))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
