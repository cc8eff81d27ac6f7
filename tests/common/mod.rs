//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{Form, Json, Router, extract::State, http::StatusCode, response::IntoResponse};
use base64::{Engine as _, engine::general_purpose};
use photoboard::{AppState, config};
use std::collections::HashMap;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ADMIN_PASSWORD: &str = "admin-password";
/// Authorization code the stub provider redeems
pub const GOOD_CODE: &str = "good-code";
/// Authorization code the stub provider rejects with `invalid_grant`
pub const BAD_CODE: &str = "bad-code";

static METRICS: std::sync::Once = std::sync::Once::new();

/// Token requests received by the stub identity provider
pub type TokenRequests = Arc<Mutex<Vec<HashMap<String, String>>>>;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub provider: StubProvider,
}

/// Minimal OAuth 2.0 token endpoint
pub struct StubProvider {
    /// Authority base URL handed to the app
    pub authority: String,
    pub token_requests: TokenRequests,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_designated_account("admin").await
    }

    pub async fn with_designated_account(designated_account: &str) -> Self {
        METRICS.call_once(photoboard::metrics::init_metrics);
        let temp_dir = TempDir::new().unwrap();
        let provider = StubProvider::start().await;

        // Create test configuration
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: temp_dir.path().join("test.db"),
            },
            storage: config::StorageConfig {
                backend: config::StorageBackend::Filesystem,
                public_url: "/images".to_string(),
                filesystem: config::FilesystemStorageConfig {
                    root: temp_dir.path().join("images"),
                },
                s3: config::S3StorageConfig::default(),
            },
            auth: config::AuthConfig {
                session_secret: "test-secret-key-32-bytes-long!!!".to_string(),
                session_max_age: 604800,
                session: config::SessionConfig {
                    store: config::SessionStoreKind::Sqlite,
                    purge_interval_seconds: 3600,
                },
                external: config::ExternalAuthConfig {
                    client_id: "test-client-id".to_string(),
                    client_secret: "test-client-secret".to_string(),
                    authority: provider.authority.clone(),
                    redirect_path: "/getAToken".to_string(),
                    scopes: vec!["User.Read".to_string()],
                    designated_account: designated_account.to_string(),
                },
            },
            admin: config::AdminConfig {
                username: "admin".to_string(),
                password: Some(ADMIN_PASSWORD.to_string()),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let app = photoboard::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            _temp_dir: temp_dir,
            provider,
        }
    }

    /// Get base URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// A fresh browser with no cookies
    pub fn browser(&self) -> Browser {
        Browser::new(&self.addr)
    }

    /// Browser already signed in as the admin account
    pub async fn signed_in_browser(&self) -> Browser {
        let browser = self.browser();
        let response = browser
            .post_form("/login", &[("username", "admin"), ("password", ADMIN_PASSWORD)])
            .await;
        assert_eq!(response.status(), 303, "admin sign-in should redirect");
        browser
    }

    pub fn image_dir(&self) -> std::path::PathBuf {
        self._temp_dir.path().join("images")
    }

    /// File names currently in the image directory
    pub fn image_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.image_dir()) else {
            return Vec::new();
        };
        entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    /// Make every `INSERT` or `UPDATE` on `posts` fail from now on
    pub async fn break_post_writes(&self, operation: &str) {
        let url = format!("sqlite:{}", self.state.config.database.path.display());
        let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER reject_post_{op} BEFORE {op} ON posts \
             BEGIN SELECT RAISE(ABORT, 'posts are read-only'); END",
            op = operation
        ))
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }
}

impl StubProvider {
    async fn start() -> Self {
        let token_requests: TokenRequests = Arc::default();

        let app = Router::new()
            .route(
                "/tenant/oauth2/v2.0/token",
                axum::routing::post(stub_token_endpoint),
            )
            .with_state(token_requests.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = format!("http://{}/tenant", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            authority,
            token_requests,
        }
    }

    pub fn token_request_count(&self) -> usize {
        self.token_requests.lock().unwrap().len()
    }

    pub fn last_token_request(&self) -> Option<HashMap<String, String>> {
        self.token_requests.lock().unwrap().last().cloned()
    }
}

async fn stub_token_endpoint(
    State(requests): State<TokenRequests>,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let code = params.get("code").cloned().unwrap_or_default();
    requests.lock().unwrap().push(params);

    if code != GOOD_CODE {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "The authorization code is invalid or has expired.",
                "error_codes": [70008],
                "trace_id": "trace-123",
            })),
        );
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "token_type": "Bearer",
            "scope": "User.Read openid profile offline_access",
            "expires_in": 3599,
            "access_token": "stub-access-token",
            "refresh_token": "stub-refresh-token",
            "id_token": fake_id_token(),
        })),
    )
}

/// JWT with a dummy signature for an external identity unrelated to any local account
pub fn fake_id_token() -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "name": "Grace External",
        "preferred_username": "grace@partner.example",
        "oid": "object-42",
        "tid": "tenant-7",
        "sub": "subject-42",
    });
    let payload = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}

/// HTTP client that keeps the session cookie and never follows redirects
pub struct Browser {
    addr: String,
    client: reqwest::Client,
    session_cookie: Mutex<Option<String>>,
}

impl Browser {
    fn new(addr: &str) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: addr.to_string(),
            client,
            session_cookie: Mutex::new(None),
        }
    }

    pub fn has_session_cookie(&self) -> bool {
        self.session_cookie.lock().unwrap().is_some()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        let request = self.client.get(format!("{}{}", self.addr, path));
        self.send(request).await
    }

    pub async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> reqwest::Response {
        let request = self.client.post(format!("{}{}", self.addr, path)).form(form);
        self.send(request).await
    }

    pub async fn post_multipart(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> reqwest::Response {
        let request = self
            .client
            .post(format!("{}{}", self.addr, path))
            .multipart(form);
        self.send(request).await
    }

    async fn send(&self, mut request: reqwest::RequestBuilder) -> reqwest::Response {
        let cookie = self.session_cookie.lock().unwrap().clone();
        if let Some(cookie) = cookie {
            request = request.header("cookie", format!("session={}", cookie));
        }

        let response = request.send().await.unwrap();
        for header in response.headers().get_all("set-cookie") {
            let header = header.to_str().unwrap();
            let Some(rest) = header.strip_prefix("session=") else {
                continue;
            };
            let value = rest.split(';').next().unwrap_or("").to_string();
            *self.session_cookie.lock().unwrap() = if value.is_empty() {
                None
            } else {
                Some(value)
            };
        }
        response
    }
}

/// Location header of a redirect
pub fn location(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .expect("location header")
        .to_string()
}

/// `state` parameter of the external sign-in link on the login page
pub fn state_from_login_page(body: &str) -> String {
    let marker = r#"id="external-login" href=""#;
    let start = body.find(marker).expect("external sign-in link") + marker.len();
    let href = &body[start..];
    let href = &href[..href.find('"').unwrap()];
    let href = href.replace("&amp;", "&");

    url::Url::parse(&href)
        .unwrap()
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .expect("state parameter")
}

/// Multipart post form with an optional image part
pub fn post_form(
    title: &str,
    author: &str,
    body: &str,
    image: Option<(&str, &[u8])>,
) -> reqwest::multipart::Form {
    let form = reqwest::multipart::Form::new()
        .text("title", title.to_string())
        .text("author", author.to_string())
        .text("body", body.to_string());

    match image {
        Some((filename, bytes)) => form.part(
            "image_path",
            reqwest::multipart::Part::bytes(bytes.to_vec())
                .file_name(filename.to_string())
                .mime_str("image/png")
                .unwrap(),
        ),
        None => form,
    }
}
