//! Session and authentication middleware
//!
//! `session_layer` loads the browser session before every handler and writes
//! it back afterwards. The extractors below read the attached identity out of
//! that session.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};

use super::session::{
    SESSION_COOKIE, Session, SessionCommit, create_session_token, keys, verify_session_token,
};
use crate::AppState;
use crate::data::User;
use crate::error::AppError;

/// Middleware that provides a [`Session`] to every handler
///
/// # Steps
/// 1. Verify the signed session cookie, if any
/// 2. Load the session contents from the store (unknown ids start fresh)
/// 3. Run the handler
/// 4. Persist changes and update the cookie
pub async fn session_layer(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let secret = &state.config.auth.session_secret;
    let session_id = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| verify_session_token(cookie.value(), secret).ok());

    let session = match session_id {
        Some(id) => match state.sessions.load(&id).await? {
            Some(stored) => Session::restore(id, stored),
            None => Session::fresh(),
        },
        None => Session::fresh(),
    };

    request.extensions_mut().insert(session.clone());
    let response = next.run(request).await;

    let max_age = state.config.auth.session_max_age;
    let secure = state.config.should_use_secure_cookies();
    let jar = match session.commit(state.sessions.as_ref(), max_age).await? {
        SessionCommit::Unchanged => return Ok(response),
        SessionCommit::Saved { id, persistent } => {
            let token = create_session_token(&id, secret)?;
            jar.add(build_session_cookie(token, secure, persistent.then_some(max_age)))
        }
        SessionCommit::Removed => jar.add(clear_session_cookie()),
    };

    Ok((jar, response).into_response())
}

fn build_session_cookie(token: String, secure: bool, max_age: Option<i64>) -> Cookie<'static> {
    let mut cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .build();
    if let Some(seconds) = max_age {
        cookie.set_max_age(time::Duration::seconds(seconds));
    }
    cookie
}

fn clear_session_cookie() -> Cookie<'static> {
    let mut cookie = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .build();
    cookie.make_removal();
    cookie
}

#[async_trait]
impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or_else(|| AppError::Session("session layer is not installed".to_string()))
    }
}

/// Local account attached to the session, if any
async fn attached_user(session: &Session, state: &AppState) -> Result<Option<User>, AppError> {
    let Some(user_id) = session.get::<i64>(keys::USER_ID).await else {
        return Ok(None);
    };

    let user = state.db.get_user(user_id).await?;
    if user.is_none() {
        tracing::warn!(user_id, "Session refers to a missing account; detaching");
        session.remove(keys::USER_ID).await;
    }
    Ok(user)
}

/// Extractor for the signed-in account
///
/// Unauthenticated requests are redirected to `/login?next=<path>`.
///
/// # Usage
/// ```ignore
/// async fn handler(CurrentUser(user): CurrentUser) -> impl IntoResponse {
///     format!("Hello, {}", user.username)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<User>().cloned() {
            return Ok(CurrentUser(user));
        }

        let app_state = AppState::from_ref(state);
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;

        match attached_user(&session, &app_state).await {
            Ok(Some(user)) => {
                parts.extensions.insert(user.clone());
                Ok(CurrentUser(user))
            }
            Ok(None) => {
                let next = parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                Err(login_redirect(next).into_response())
            }
            Err(error) => Err(error.into_response()),
        }
    }
}

/// Optional current user extractor
///
/// Returns None if not authenticated, instead of redirecting.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<User>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<User>().cloned() {
            return Ok(MaybeUser(Some(user)));
        }

        let app_state = AppState::from_ref(state);
        let session = Session::from_request_parts(parts, state).await?;
        let user = attached_user(&session, &app_state).await?;
        if let Some(user) = &user {
            parts.extensions.insert(user.clone());
        }

        Ok(MaybeUser(user))
    }
}

/// Redirect to the login page, remembering where the user was headed
pub fn login_redirect(next: &str) -> Redirect {
    if next == "/" {
        return Redirect::to("/login");
    }
    Redirect::to(&format!("/login?next={}", urlencoding::encode(next)))
}

/// Whether `next` is safe to redirect to after sign-in
///
/// Only same-origin relative paths qualify: a single leading `/`, no scheme,
/// no host, no backslashes or control characters.
pub fn is_safe_next(next: &str) -> bool {
    if !next.starts_with('/') || next.starts_with("//") {
        return false;
    }
    if next.contains('\\') || next.chars().any(char::is_control) {
        return false;
    }

    match url::Url::parse("http://placeholder.invalid").and_then(|base| base.join(next)) {
        Ok(joined) => joined.host_str() == Some("placeholder.invalid"),
        Err(_) => false,
    }
}
