//! Server-rendered HTML pages
//!
//! Every dynamic value passes through `html_escape` before it reaches the
//! markup.

use axum::http::StatusCode;
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};

use super::forms::{FieldError, PostForm, errors_for};
use crate::data::{Post, User};

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; max-width: 52rem; margin: 0 auto; padding: 1rem; }
nav { display: flex; gap: 1rem; align-items: center; border-bottom: 1px solid #ddd; padding-bottom: .5rem; }
nav .who { margin-left: auto; color: #555; }
.post { border-bottom: 1px solid #eee; padding: 1rem 0; }
.post img { max-width: 100%; }
.errors { color: #b00020; margin: .25rem 0; }
.flash { background: #fff3cd; padding: .5rem; }
label { display: block; margin-top: .75rem; }
"#;

/// Wrap page content in the shared document shell
fn layout(title: &str, user: Option<&User>, content: &str) -> String {
    let nav = match user {
        Some(user) => format!(
            r#"<nav><a href="/home">Home</a><a href="/new_post">New Post</a><span class="who">{}</span><a href="/logout">Logout</a></nav>"#,
            text(&user.username)
        ),
        None => r#"<nav><a href="/login">Login</a></nav>"#.to_string(),
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title} - Photoboard</title>
<style>{STYLE}</style>
</head>
<body>
{nav}
<main>
{content}
</main>
</body>
</html>
"#,
        title = text(title),
    )
}

fn field_errors(errors: &[FieldError], field: &str) -> String {
    errors_for(errors, field)
        .map(|message| format!(r#"<p class="errors">{}</p>"#, text(message)))
        .collect()
}

// =============================================================================
// Login
// =============================================================================

/// Everything the login page shows
pub struct LoginView<'a> {
    /// Previously submitted username, echoed back into the form
    pub username: &'a str,
    pub errors: &'a [FieldError],
    /// General failure message shown above the form
    pub message: Option<&'a str>,
    /// Authorization request URL for the external sign-in link
    pub auth_url: &'a str,
    pub next: Option<&'a str>,
}

pub fn login_page(view: &LoginView<'_>) -> String {
    let action = match view.next {
        Some(next) => format!("/login?next={}", urlencoding::encode(next)),
        None => "/login".to_string(),
    };
    let message = view
        .message
        .map(|message| format!(r#"<p class="flash">{}</p>"#, text(message)))
        .unwrap_or_default();

    let content = format!(
        r#"<h1>Sign In</h1>
{message}
<form method="post" action="{action}">
<label for="username">Username</label>
<input id="username" name="username" type="text" value="{username}">
{username_errors}
<label for="password">Password</label>
<input id="password" name="password" type="password">
{password_errors}
<label><input name="remember_me" type="checkbox" value="y"> Remember Me</label>
<p><button type="submit">Sign In</button></p>
</form>
<p><a id="external-login" href="{auth_url}">Sign in with your organization account</a></p>
"#,
        action = attr(&action),
        username = attr(view.username),
        username_errors = field_errors(view.errors, "username"),
        password_errors = field_errors(view.errors, "password"),
        auth_url = attr(view.auth_url),
    );

    layout("Sign In", None, &content)
}

// =============================================================================
// Posts
// =============================================================================

/// Feed of every post, newest first
pub fn index_page(user: &User, posts: &[Post], image_url: impl Fn(&str) -> String) -> String {
    let mut content = String::from("<h1>Posts</h1>\n");
    if posts.is_empty() {
        content.push_str("<p>No posts yet.</p>\n");
    }

    for post in posts {
        let image = post
            .image_path
            .as_deref()
            .map(|name| {
                format!(
                    r#"<img src="{}" alt="{}">"#,
                    attr(&image_url(name)),
                    attr(&post.title)
                )
            })
            .unwrap_or_default();

        content.push_str(&format!(
            r#"<article class="post">
<h2><a href="/post/{id}">{title}</a></h2>
<p>By {author} on {timestamp}</p>
{image}
<p>{body}</p>
</article>
"#,
            id = post.id,
            title = text(&post.title),
            author = text(&post.author),
            timestamp = post.timestamp.format("%Y-%m-%d %H:%M UTC"),
            body = text(&post.body),
        ));
    }

    layout("Home", Some(user), &content)
}

/// Create or edit form for a post
pub struct PostView<'a> {
    pub heading: &'a str,
    pub action: &'a str,
    pub form: &'a PostForm,
    pub errors: &'a [FieldError],
    /// Public URL of the image currently attached to the post
    pub current_image: Option<String>,
}

pub fn post_page(user: &User, view: &PostView<'_>) -> String {
    let current_image = view
        .current_image
        .as_deref()
        .map(|url| format!(r#"<p><img src="{}" alt="Current image"></p>"#, attr(url)))
        .unwrap_or_default();

    let content = format!(
        r#"<h1>{heading}</h1>
<form method="post" action="{action}" enctype="multipart/form-data">
<label for="title">Title</label>
<input id="title" name="title" type="text" value="{title}">
{title_errors}
<label for="author">Author</label>
<input id="author" name="author" type="text" value="{author}">
{author_errors}
<label for="body">Body</label>
<textarea id="body" name="body" rows="6">{body}</textarea>
{body_errors}
{current_image}
<label for="image_path">Image</label>
<input id="image_path" name="image_path" type="file" accept="image/*">
{image_errors}
<p><button type="submit">Save</button></p>
</form>
"#,
        heading = text(view.heading),
        action = attr(view.action),
        title = attr(&view.form.title),
        title_errors = field_errors(view.errors, "title"),
        author = attr(&view.form.author),
        author_errors = field_errors(view.errors, "author"),
        body = text(&view.form.body),
        body_errors = field_errors(view.errors, "body"),
        image_errors = field_errors(view.errors, "image_path"),
    );

    layout(view.heading, Some(user), &content)
}

// =============================================================================
// Errors
// =============================================================================

/// Failed external sign-in, as reported to the user
#[derive(Debug, Clone, Default)]
pub struct AuthFailure {
    pub error: String,
    pub description: Option<String>,
    /// Extra provider fields (trace ids, error codes)
    pub details: Vec<(String, String)>,
}

pub fn auth_error_page(failure: &AuthFailure) -> String {
    let description = failure
        .description
        .as_deref()
        .map(|description| format!("<p>{}</p>", text(description)))
        .unwrap_or_default();
    let details: String = failure
        .details
        .iter()
        .map(|(key, value)| format!("<dt>{}</dt><dd>{}</dd>", text(key), text(value)))
        .collect();

    let content = format!(
        r#"<h1>Sign-in failed</h1>
<h2 id="auth-error">{error}</h2>
{description}
<dl>{details}</dl>
<p><a href="/login">Back to sign in</a></p>
"#,
        error = text(&failure.error),
    );

    layout("Sign-in failed", None, &content)
}

pub fn error_page(status: StatusCode, message: &str) -> String {
    let content = format!(
        "<h1>{}</h1>\n<p>{}</p>\n<p><a href=\"/home\">Home</a></p>\n",
        status.as_u16(),
        text(message)
    );
    layout(status.canonical_reason().unwrap_or("Error"), None, &content)
}
