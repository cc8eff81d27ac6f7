//! Sign-in flows
//!
//! Local username/password login and the external OAuth 2.0 authorization
//! code flow both end in the same session state: a local account id under
//! [`keys::USER_ID`].

use std::collections::BTreeMap;

use axum::{
    Form, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;

use super::identity::{Claims, ProviderError, TokenExchange, load_cache, save_cache};
use super::middleware::{MaybeUser, is_safe_next};
use super::password::verify_login;
use super::session::{Session, keys, random_token};
use crate::AppState;
use crate::data::User;
use crate::error::AppError;
use crate::metrics::{HTTP_REQUESTS_TOTAL, LOGIN_ATTEMPTS_TOTAL, TOKEN_EXCHANGES_TOTAL};
use crate::web::forms::{FieldError, LoginForm};
use crate::web::views::{self, AuthFailure, LoginView};

const INVALID_CREDENTIALS: &str = "Invalid username or password";

/// Create authentication router
///
/// Routes:
/// - GET/POST /login - Login page and local sign-in
/// - GET {redirect_path} - OAuth callback
/// - GET /logout - Logout
pub fn auth_router(redirect_path: &str) -> Router<AppState> {
    Router::new()
        .route("/login", get(login_page).post(login_submit))
        .route(redirect_path, get(authorized))
        .route("/logout", get(logout))
}

#[derive(Debug, Default, Deserialize)]
struct NextQuery {
    next: Option<String>,
}

// =============================================================================
// Login
// =============================================================================

/// GET /login
async fn login_page(
    State(state): State<AppState>,
    session: Session,
    MaybeUser(user): MaybeUser,
    Query(query): Query<NextQuery>,
) -> Result<Response, AppError> {
    HTTP_REQUESTS_TOTAL.with_label_values(&["GET", "/login"]).inc();

    if user.is_some() {
        return Ok(Redirect::to("/home").into_response());
    }

    render_login(&state, &session, "", &[], None, query.next.as_deref()).await
}

/// POST /login
///
/// # Steps
/// 1. Validate the form
/// 2. Look up the account and verify the password
/// 3. Renew the session and attach the account
/// 4. Redirect to `next` when it is a local path, else to the feed
async fn login_submit(
    State(state): State<AppState>,
    session: Session,
    MaybeUser(user): MaybeUser,
    Query(query): Query<NextQuery>,
    Form(form): Form<LoginForm>,
) -> Result<Response, AppError> {
    HTTP_REQUESTS_TOTAL.with_label_values(&["POST", "/login"]).inc();

    if user.is_some() {
        return Ok(Redirect::to("/home").into_response());
    }
    let next = query.next.as_deref();

    let credentials = match form.validate() {
        Ok(credentials) => credentials,
        Err(errors) => {
            return render_login(&state, &session, &form.username, &errors, None, next).await;
        }
    };

    let account = state
        .db
        .get_user_by_username(&credentials.username)
        .await?;
    let stored_hash = account.as_ref().map(|account| account.password_hash.clone());
    let verified = verify_login(credentials.password.clone(), stored_hash).await;
    let account = account.filter(|_| verified);

    let Some(account) = account else {
        LOGIN_ATTEMPTS_TOTAL
            .with_label_values(&["local", "failure"])
            .inc();
        tracing::info!(username = %credentials.username, "Local sign-in rejected");
        return render_login(
            &state,
            &session,
            &credentials.username,
            &[],
            Some(INVALID_CREDENTIALS),
            next,
        )
        .await;
    };

    sign_in(&session, &account, credentials.remember_me).await?;
    LOGIN_ATTEMPTS_TOTAL
        .with_label_values(&["local", "success"])
        .inc();
    tracing::info!(user_id = account.id, username = %account.username, "Local sign-in");

    let target = next.filter(|next| is_safe_next(next)).unwrap_or("/home");
    Ok(Redirect::to(target).into_response())
}

/// Render the login page with a fresh state nonce bound to the session
async fn render_login(
    state: &AppState,
    session: &Session,
    username: &str,
    errors: &[FieldError],
    message: Option<&str>,
    next: Option<&str>,
) -> Result<Response, AppError> {
    let nonce = random_token();
    session.insert(keys::STATE, &nonce).await?;

    let auth_url = state
        .identity
        .build_authorization_url(&state.config.auth.external.scopes, &nonce)
        .map_err(|e| AppError::Config(e.to_string()))?;

    let page = views::login_page(&LoginView {
        username,
        errors,
        message,
        auth_url: &auth_url,
        next,
    });
    Ok(Html(page).into_response())
}

/// Attach a local account to the session under a new session id
async fn sign_in(session: &Session, account: &User, remember: bool) -> Result<(), AppError> {
    session.renew().await;
    session.insert(keys::USER_ID, account.id).await?;
    if remember {
        session.insert(keys::REMEMBER, true).await?;
    } else {
        session.remove(keys::REMEMBER).await;
    }
    Ok(())
}

// =============================================================================
// OAuth callback
// =============================================================================

/// GET {redirect_path}
///
/// # Steps
/// 1. Check `state` against the session nonce (and consume it)
/// 2. Show provider-reported errors
/// 3. Exchange `code` for tokens
/// 4. Attach the designated local account
async fn authorized(
    State(state): State<AppState>,
    session: Session,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response, AppError> {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", state.config.auth.external.redirect_path.as_str()])
        .inc();

    let expected = session.get::<String>(keys::STATE).await;
    let matches = matches!(
        (expected.as_deref(), params.get("state")),
        (Some(expected), Some(returned)) if expected == returned.as_str()
    );
    if !matches {
        tracing::warn!("OAuth callback state mismatch");
        LOGIN_ATTEMPTS_TOTAL
            .with_label_values(&["external", "failure"])
            .inc();
        return Ok(Redirect::to("/login").into_response());
    }
    session.remove(keys::STATE).await;

    if let Some(error) = params.get("error") {
        tracing::info!(%error, "Identity provider returned an error to the callback");
        LOGIN_ATTEMPTS_TOTAL
            .with_label_values(&["external", "failure"])
            .inc();
        return Ok(auth_error(StatusCode::BAD_REQUEST, failure_from_params(&params)));
    }

    let Some(code) = params.get("code") else {
        return Ok(Redirect::to("/home").into_response());
    };

    let mut cache = load_cache(&session).await;
    let exchange = state
        .identity
        .exchange_code_for_tokens(
            code,
            &state.config.auth.external.scopes,
            &state.config.external_redirect_uri(),
            &mut cache,
        )
        .await;

    let tokens = match exchange {
        Ok(TokenExchange::Issued(tokens)) => {
            TOKEN_EXCHANGES_TOTAL.with_label_values(&["issued"]).inc();
            tokens
        }
        Ok(TokenExchange::Rejected(error)) => {
            TOKEN_EXCHANGES_TOTAL.with_label_values(&["rejected"]).inc();
            LOGIN_ATTEMPTS_TOTAL
                .with_label_values(&["external", "failure"])
                .inc();
            return Ok(auth_error(StatusCode::BAD_REQUEST, failure_from_provider(error)));
        }
        Err(error) => {
            TOKEN_EXCHANGES_TOTAL.with_label_values(&["failed"]).inc();
            LOGIN_ATTEMPTS_TOTAL
                .with_label_values(&["external", "failure"])
                .inc();
            tracing::error!(%error, "Authorization code exchange failed");
            return Ok(auth_error(
                StatusCode::BAD_GATEWAY,
                AuthFailure {
                    error: "sign_in_failed".to_string(),
                    description: Some(
                        "The identity provider could not be reached. Please try again."
                            .to_string(),
                    ),
                    details: Vec::new(),
                },
            ));
        }
    };

    let designated = &state.config.auth.external.designated_account;
    let Some(account) = state.db.get_user_by_username(designated).await? else {
        tracing::error!(
            account = %designated,
            "Designated account for external sign-in does not exist"
        );
        return Ok(auth_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            AuthFailure {
                error: "configuration_error".to_string(),
                description: Some(
                    "External sign-in is not mapped to an existing account.".to_string(),
                ),
                details: Vec::new(),
            },
        ));
    };

    session.insert(keys::USER_CLAIMS, &tokens.id_token_claims).await?;
    sign_in(&session, &account, false).await?;
    save_cache(&session, &cache).await?;

    LOGIN_ATTEMPTS_TOTAL
        .with_label_values(&["external", "success"])
        .inc();
    tracing::info!(
        user_id = account.id,
        subject = ?tokens.id_token_claims.get("preferred_username"),
        "External sign-in"
    );

    Ok(Redirect::to("/home").into_response())
}

fn auth_error(status: StatusCode, failure: AuthFailure) -> Response {
    (status, Html(views::auth_error_page(&failure))).into_response()
}

fn failure_from_params(params: &BTreeMap<String, String>) -> AuthFailure {
    AuthFailure {
        error: params.get("error").cloned().unwrap_or_default(),
        description: params.get("error_description").cloned(),
        details: params
            .iter()
            .filter(|(key, _)| {
                !matches!(
                    key.as_str(),
                    "error" | "error_description" | "state" | "code"
                )
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

fn failure_from_provider(error: ProviderError) -> AuthFailure {
    AuthFailure {
        error: error.error,
        description: error.error_description,
        details: error
            .details
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect(),
    }
}

// =============================================================================
// Logout
// =============================================================================

/// GET /logout
///
/// Externally signed-in sessions are cleared and sent through the provider's
/// sign-out page, which returns the browser to `/login`.
async fn logout(State(state): State<AppState>, session: Session) -> Result<Response, AppError> {
    HTTP_REQUESTS_TOTAL.with_label_values(&["GET", "/logout"]).inc();

    session.remove(keys::USER_ID).await;
    session.remove(keys::REMEMBER).await;

    if has_external_claims(&session).await {
        session.clear().await;
        let login_url = state.config.server.external_url("/login");
        let logout_url = state
            .identity
            .logout_url(&login_url)
            .map_err(|e| AppError::Config(e.to_string()))?;
        tracing::info!("Signed out; redirecting to identity provider");
        return Ok(Redirect::to(&logout_url).into_response());
    }

    tracing::info!("Signed out");
    Ok(Redirect::to("/login").into_response())
}

/// Whether the session holds claims from an external sign-in
async fn has_external_claims(session: &Session) -> bool {
    session
        .get::<Claims>(keys::USER_CLAIMS)
        .await
        .is_some_and(|claims| !claims.is_empty())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::header::LOCATION;
    use serde_json::json;

    use super::*;
    use crate::auth::identity::{IdentityError, MockIdentityProvider, TokenSet};
    use crate::auth::password::hash_password;
    use crate::auth::session::MemorySessionStore;
    use crate::config::{AppConfig, FilesystemStorageConfig};
    use crate::data::Database;
    use crate::storage::ImageStorage;

    struct Harness {
        state: AppState,
        _dir: tempfile::TempDir,
    }

    async fn harness(provider: MockIdentityProvider) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config: AppConfig = crate::config::tests::valid_config();
        config.database.path = dir.path().join("test.db");
        config.storage.filesystem = FilesystemStorageConfig {
            root: dir.path().join("images"),
        };

        let db = Database::connect(&config.database.path).await.unwrap();
        db.insert_user("admin", &hash_password("secret-pw").unwrap())
            .await
            .unwrap();
        let storage = ImageStorage::new(&config.storage).await.unwrap();

        let state = AppState::from_parts(
            config,
            db,
            Arc::new(MemorySessionStore::new()),
            storage,
            Arc::new(provider),
        );
        Harness { state, _dir: dir }
    }

    fn params(pairs: &[(&str, &str)]) -> Query<BTreeMap<String, String>> {
        Query(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn location(response: &Response) -> &str {
        response.headers()[LOCATION].to_str().unwrap()
    }

    fn issued() -> TokenExchange {
        TokenExchange::Issued(TokenSet {
            access_token: "at".to_string(),
            refresh_token: None,
            id_token: None,
            id_token_claims: json!({"name": "Someone Else", "oid": "o", "tid": "t"})
                .as_object()
                .cloned()
                .unwrap(),
            scopes: vec!["User.Read".to_string()],
            expires_in: Some(3600),
        })
    }

    async fn session_with_state(nonce: &str) -> Session {
        let session = Session::fresh();
        session.insert(keys::STATE, nonce).await.unwrap();
        session
    }

    #[tokio::test]
    async fn login_page_stores_a_fresh_nonce_in_the_authorization_url() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_build_authorization_url()
            .times(2)
            .returning(|_, state| Ok(format!("https://idp.example/authorize?state={}", state)));
        let h = harness(provider).await;
        let session = Session::fresh();

        let first = login_page(
            State(h.state.clone()),
            session.clone(),
            MaybeUser(None),
            Query(NextQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first_nonce: String = session.get(keys::STATE).await.unwrap();

        login_page(
            State(h.state.clone()),
            session.clone(),
            MaybeUser(None),
            Query(NextQuery::default()),
        )
        .await
        .unwrap();
        let second_nonce: String = session.get(keys::STATE).await.unwrap();
        assert_ne!(first_nonce, second_nonce);
    }

    #[tokio::test]
    async fn wrong_password_keeps_identity_detached() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_build_authorization_url()
            .returning(|_, _| Ok("https://idp.example/authorize".to_string()));
        let h = harness(provider).await;
        let session = Session::fresh();

        let response = login_submit(
            State(h.state.clone()),
            session.clone(),
            MaybeUser(None),
            Query(NextQuery::default()),
            Form(LoginForm {
                username: "admin".to_string(),
                password: "wrong".to_string(),
                remember_me: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!session.contains(keys::USER_ID).await);
        assert!(session.contains(keys::STATE).await);
    }

    #[tokio::test]
    async fn local_login_honors_only_local_next() {
        let provider = MockIdentityProvider::new();
        let h = harness(provider).await;

        for (next, expected) in [
            (Some("/post/5"), "/post/5"),
            (Some("https://evil.example/x"), "/home"),
            (Some("//evil.example"), "/home"),
            (None, "/home"),
        ] {
            let session = Session::fresh();
            let response = login_submit(
                State(h.state.clone()),
                session.clone(),
                MaybeUser(None),
                Query(NextQuery {
                    next: next.map(str::to_string),
                }),
                Form(LoginForm {
                    username: "admin".to_string(),
                    password: "secret-pw".to_string(),
                    remember_me: Some("y".to_string()),
                }),
            )
            .await
            .unwrap();

            assert_eq!(location(&response), expected);
            let admin = h.state.db.get_user_by_username("admin").await.unwrap().unwrap();
            assert_eq!(session.get::<i64>(keys::USER_ID).await, Some(admin.id));
            assert_eq!(session.get::<bool>(keys::REMEMBER).await, Some(true));
        }
    }

    #[tokio::test]
    async fn state_mismatch_redirects_without_exchange() {
        let mut provider = MockIdentityProvider::new();
        provider.expect_exchange_code_for_tokens().never();
        let h = harness(provider).await;

        let session = session_with_state("expected").await;
        let response = authorized(
            State(h.state.clone()),
            session.clone(),
            params(&[("state", "forged"), ("code", "c")]),
        )
        .await
        .unwrap();
        assert_eq!(location(&response), "/login");
        assert!(!session.contains(keys::USER_ID).await);

        let response = authorized(
            State(h.state.clone()),
            Session::fresh(),
            params(&[("code", "c")]),
        )
        .await
        .unwrap();
        assert_eq!(location(&response), "/login");
    }

    #[tokio::test]
    async fn provider_error_parameter_renders_error_view() {
        let mut provider = MockIdentityProvider::new();
        provider.expect_exchange_code_for_tokens().never();
        let h = harness(provider).await;

        let session = session_with_state("n").await;
        let response = authorized(
            State(h.state.clone()),
            session.clone(),
            params(&[
                ("state", "n"),
                ("error", "access_denied"),
                ("error_description", "User declined"),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!session.contains(keys::STATE).await);
        assert!(!session.contains(keys::USER_ID).await);
    }

    #[tokio::test]
    async fn successful_exchange_attaches_designated_account() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code_for_tokens()
            .withf(|code, _, redirect_uri, _| {
                code == "auth-code" && redirect_uri == "https://localhost/getAToken"
            })
            .times(1)
            .returning(|_, _, _, cache| {
                let exchange = issued();
                if let TokenExchange::Issued(tokens) = &exchange {
                    cache.add(tokens);
                }
                Ok(exchange)
            });
        let h = harness(provider).await;

        let session = session_with_state("n").await;
        let response = authorized(
            State(h.state.clone()),
            session.clone(),
            params(&[("state", "n"), ("code", "auth-code")]),
        )
        .await
        .unwrap();

        assert_eq!(location(&response), "/home");
        let admin = h.state.db.get_user_by_username("admin").await.unwrap().unwrap();
        assert_eq!(session.get::<i64>(keys::USER_ID).await, Some(admin.id));
        let claims: Claims = session.get(keys::USER_CLAIMS).await.unwrap();
        assert_eq!(claims["name"], "Someone Else");
        assert!(session.contains(keys::TOKEN_CACHE).await);
        assert!(!session.contains(keys::STATE).await);
    }

    #[tokio::test]
    async fn rejected_exchange_renders_provider_payload() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code_for_tokens()
            .returning(|_, _, _, _| {
                Ok(TokenExchange::Rejected(ProviderError {
                    error: "invalid_grant".to_string(),
                    error_description: Some("Code expired".to_string()),
                    details: serde_json::Map::new(),
                }))
            });
        let h = harness(provider).await;

        let session = session_with_state("n").await;
        let response = authorized(
            State(h.state.clone()),
            session.clone(),
            params(&[("state", "n"), ("code", "c")]),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!session.contains(keys::USER_ID).await);
        assert!(!session.contains(keys::TOKEN_CACHE).await);
    }

    #[tokio::test]
    async fn transport_failure_is_contained() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code_for_tokens()
            .returning(|_, _, _, _| {
                Err(IdentityError::InvalidResponse("boom".to_string()))
            });
        let h = harness(provider).await;

        let response = authorized(
            State(h.state.clone()),
            session_with_state("n").await,
            params(&[("state", "n"), ("code", "c")]),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn missing_designated_account_leaves_session_untouched() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_exchange_code_for_tokens()
            .returning(|_, _, _, _| Ok(issued()));
        let mut h = harness(provider).await;
        let mut config = (*h.state.config).clone();
        config.auth.external.designated_account = "nobody".to_string();
        h.state.config = Arc::new(config);

        let session = session_with_state("n").await;
        let response = authorized(
            State(h.state.clone()),
            session.clone(),
            params(&[("state", "n"), ("code", "c")]),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!session.contains(keys::USER_ID).await);
        assert!(!session.contains(keys::USER_CLAIMS).await);
    }

    #[tokio::test]
    async fn logout_without_claims_goes_to_login() {
        let mut provider = MockIdentityProvider::new();
        provider.expect_logout_url().never();
        let h = harness(provider).await;

        let session = Session::fresh();
        session.insert(keys::USER_ID, 1).await.unwrap();
        let response = logout(State(h.state.clone()), session.clone()).await.unwrap();

        assert_eq!(location(&response), "/login");
        assert!(!session.contains(keys::USER_ID).await);
    }

    #[tokio::test]
    async fn logout_with_claims_clears_session_and_uses_provider_logout() {
        let mut provider = MockIdentityProvider::new();
        provider
            .expect_logout_url()
            .withf(|uri| uri == "http://localhost/login")
            .times(1)
            .returning(|uri| {
                Ok(format!(
                    "https://idp.example/logout?post_logout_redirect_uri={}",
                    uri
                ))
            });
        let h = harness(provider).await;

        let session = Session::fresh();
        session.insert(keys::USER_ID, 1).await.unwrap();
        session
            .insert(keys::USER_CLAIMS, json!({"name": "Ada"}))
            .await
            .unwrap();
        session.insert(keys::TOKEN_CACHE, "{}").await.unwrap();

        let response = logout(State(h.state.clone()), session.clone()).await.unwrap();

        assert!(location(&response).starts_with("https://idp.example/logout"));
        assert!(session.is_empty().await);
    }
}
