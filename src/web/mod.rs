//! Browser-facing pages
//!
//! - `posts`: feed, create and edit handlers
//! - `forms`: typed form submissions and validation
//! - `views`: HTML rendering
//! - `metrics`: Prometheus exposition

pub mod forms;
mod metrics;
mod posts;
pub mod views;

use axum::{Router, extract::DefaultBodyLimit, routing::get};

use crate::AppState;

pub use metrics::metrics_router;
pub use posts::MAX_IMAGE_UPLOAD_BYTES;

/// Create the content router
///
/// Routes (all require a signed-in account):
/// - GET / and GET /home - Feed
/// - GET/POST /new_post - Create a post
/// - GET/POST /post/:id - Edit a post
pub fn content_router() -> Router<AppState> {
    Router::new()
        .route("/", get(posts::index))
        .route("/home", get(posts::index))
        .route(
            "/new_post",
            get(posts::new_post_page).post(posts::create_post),
        )
        .route(
            "/post/:id",
            get(posts::edit_post_page).post(posts::update_post),
        )
        .layer(DefaultBodyLimit::max(MAX_IMAGE_UPLOAD_BYTES * 2))
}
