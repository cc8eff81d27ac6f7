//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Paths owned by the application router. The external callback path must not
/// shadow any of them.
const RESERVED_PATHS: &[&str] = &[
    "/",
    "/home",
    "/new_post",
    "/login",
    "/logout",
    "/health",
    "/metrics",
    "/images",
];

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "photos.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://photos.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Absolute URL for a path on this instance, using the configured protocol.
    pub fn external_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Absolute `https` URL for a path on this instance.
    ///
    /// Identity providers only accept TLS redirect URIs for confidential
    /// clients, so the callback URL is always built with `https` even when the
    /// server itself sits behind a TLS-terminating proxy.
    pub fn external_https_url(&self, path: &str) -> String {
        format!("https://{}{}", self.domain, path)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Image storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Which backend stores uploaded images
    #[serde(default)]
    pub backend: StorageBackend,
    /// Public URL prefix for stored images
    /// e.g., "https://images.example.com" or "/images"
    pub public_url: String,
    #[serde(default)]
    pub filesystem: FilesystemStorageConfig,
    #[serde(default)]
    pub s3: S3StorageConfig,
}

/// Image storage backend selector
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Filesystem,
    S3,
}

/// Local directory storage, served by the application under `/images`
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemStorageConfig {
    pub root: PathBuf,
}

impl Default for FilesystemStorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/images"),
        }
    }
}

/// S3-compatible object storage
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3StorageConfig {
    /// Endpoint URL (e.g. "http://localhost:9000" for MinIO)
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    /// Region name, "auto" when omitted
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Session cookie signing key (32+ bytes)
    pub session_secret: String,
    /// Session max age in seconds (default: 604800 = 7 days)
    pub session_max_age: i64,
    pub session: SessionConfig,
    pub external: ExternalAuthConfig,
}

/// Server-side session storage
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub store: SessionStoreKind,
    /// How often expired sessions are purged (default: 3600)
    pub purge_interval_seconds: u64,
}

/// Session backing store selector
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    #[default]
    Sqlite,
    Memory,
}

/// External identity provider (OAuth2 authorization-code flow)
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Authority base URL, e.g. "https://login.microsoftonline.com/common"
    pub authority: String,
    /// Callback path registered with the provider (default: "/getAToken")
    pub redirect_path: String,
    /// Scopes requested in addition to the reserved OIDC scopes
    pub scopes: Vec<String>,
    /// Local account every external sign-in is mapped to (default: "admin")
    pub designated_account: String,
}

/// Admin user configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Admin username (default: "admin")
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Initial password. The admin account is only created when this is set.
    pub password: Option<String>,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (PHOTOBOARD__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/photoboard.db")?
            .set_default("storage.backend", "filesystem")?
            .set_default("storage.public_url", "/images")?
            .set_default("storage.filesystem.root", "data/images")?
            .set_default("auth.session_max_age", 604800)?
            .set_default("auth.session.store", "sqlite")?
            .set_default("auth.session.purge_interval_seconds", 3600)?
            .set_default(
                "auth.external.authority",
                "https://login.microsoftonline.com/common",
            )?
            .set_default("auth.external.redirect_path", "/getAToken")?
            .set_default("auth.external.scopes", vec!["User.Read"])?
            .set_default("auth.external.designated_account", "admin")?
            .set_default("admin.username", "admin")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (PHOTOBOARD__*)
            .add_source(
                Environment::with_prefix("PHOTOBOARD")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("auth.external.scopes")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn should_use_secure_cookies(&self) -> bool {
        self.server.protocol.eq_ignore_ascii_case("https")
            || !is_local_server_domain(&self.server.domain)
    }

    /// Absolute URL the identity provider redirects back to.
    pub fn external_redirect_uri(&self) -> String {
        self.server
            .external_https_url(&self.auth.external.redirect_path)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_SESSION_SECRET_BYTES: usize = 32;

        if self.auth.session_secret.as_bytes().len() < MIN_SESSION_SECRET_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "auth.session_secret must be at least {} bytes",
                MIN_SESSION_SECRET_BYTES
            )));
        }

        if self.auth.session_max_age <= 0 {
            return Err(crate::error::AppError::Config(
                "auth.session_max_age must be greater than 0".to_string(),
            ));
        }

        let redirect_path = self.auth.external.redirect_path.as_str();
        if !redirect_path.starts_with('/') || redirect_path.starts_with("//") {
            return Err(crate::error::AppError::Config(
                "auth.external.redirect_path must be an absolute path".to_string(),
            ));
        }
        if RESERVED_PATHS.contains(&redirect_path)
            || redirect_path.starts_with("/post/")
            || redirect_path.starts_with("/images/")
        {
            return Err(crate::error::AppError::Config(format!(
                "auth.external.redirect_path `{}` collides with an application route",
                redirect_path
            )));
        }

        if self.auth.external.designated_account.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "auth.external.designated_account must not be empty".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::S3 {
            let s3 = &self.storage.s3;
            let missing = [
                ("storage.s3.endpoint", s3.endpoint.is_none()),
                ("storage.s3.bucket", s3.bucket.is_none()),
                ("storage.s3.access_key_id", s3.access_key_id.is_none()),
                ("storage.s3.secret_access_key", s3.secret_access_key.is_none()),
            ];
            if let Some((key, _)) = missing.iter().find(|(_, absent)| *absent) {
                return Err(crate::error::AppError::Config(format!(
                    "{} is required when storage.backend=s3",
                    key
                )));
            }
        }

        if !self.should_use_secure_cookies() {
            let host = normalized_server_host(&self.server.domain);
            tracing::warn!(
                host = %host,
                protocol = %self.server.protocol,
                "Using insecure session cookies for local development"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
