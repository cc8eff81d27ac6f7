//! Feed and post editing handlers

use axum::{
    extract::{Multipart, Path, State},
    response::{Html, IntoResponse, Redirect, Response},
};

use super::forms::{FieldError, ImageUpload, PostForm, ValidPost};
use super::views::{self, PostView};
use crate::AppState;
use crate::auth::CurrentUser;
use crate::data::{NewPost, Post, User};
use crate::error::AppError;
use crate::metrics::{HTTP_REQUESTS_TOTAL, POSTS_TOTAL};
use crate::storage::blob_name;

/// Largest accepted image upload
pub const MAX_IMAGE_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

// =============================================================================
// Feed
// =============================================================================

/// GET / and GET /home
pub async fn index(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Html<String>, AppError> {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/home"])
        .inc();

    let posts = state.db.list_posts().await?;
    let page = views::index_page(&user, &posts, |name| state.storage.public_url(name));
    Ok(Html(page))
}

// =============================================================================
// Create
// =============================================================================

/// GET /new_post
pub async fn new_post_page(CurrentUser(user): CurrentUser) -> Html<String> {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/new_post"])
        .inc();

    Html(render_form(&user, None, &PostForm::default(), &[], None))
}

/// POST /new_post
pub async fn create_post(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    multipart: Multipart,
) -> Result<Response, AppError> {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/new_post"])
        .inc();

    let form = read_post_form(multipart).await?;
    let valid = match form.validate() {
        Ok(valid) => valid,
        Err(errors) => {
            return Ok(Html(render_form(&user, None, &form, &errors, None)).into_response());
        }
    };

    let image_path = match &valid.image {
        Some(image) => Some(store_image(&state, image).await?),
        None => None,
    };

    let new_post = NewPost {
        title: valid.title,
        author: valid.author,
        body: valid.body,
        image_path,
        user_id: user.id,
    };
    let post = match state.db.insert_post(&new_post).await {
        Ok(post) => post,
        Err(error) => {
            discard_upload(&state, new_post.image_path.as_deref()).await;
            return Err(error);
        }
    };
    refresh_post_count(&state).await;

    tracing::info!(post_id = post.id, user_id = user.id, "Post created");
    Ok(Redirect::to("/home").into_response())
}

// =============================================================================
// Edit
// =============================================================================

/// GET /post/:id
pub async fn edit_post_page(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Html<String>, AppError> {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/post/:id"])
        .inc();

    let post = state.db.get_post(id).await?.ok_or(AppError::NotFound)?;
    let current_image = post
        .image_path
        .as_deref()
        .map(|name| state.storage.public_url(name));

    Ok(Html(render_form(
        &user,
        Some(&post),
        &PostForm::from_post(&post),
        &[],
        current_image,
    )))
}

/// POST /post/:id
///
/// # Steps
/// 1. Load the post (404 if absent)
/// 2. Validate the submission; re-render on errors
/// 3. Upload a replacement image, if one was sent
/// 4. Save, then delete the replaced blob
pub async fn update_post(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/post/:id"])
        .inc();

    let mut post = state.db.get_post(id).await?.ok_or(AppError::NotFound)?;

    let form = read_post_form(multipart).await?;
    let valid = match form.validate() {
        Ok(valid) => valid,
        Err(errors) => {
            let current_image = post
                .image_path
                .as_deref()
                .map(|name| state.storage.public_url(name));
            let page = render_form(&user, Some(&post), &form, &errors, current_image);
            return Ok(Html(page).into_response());
        }
    };

    let uploaded = valid.image.is_some();
    let replaced = apply_edit(&state, &mut post, valid, user.id).await?;
    if let Err(error) = state.db.update_post(&post).await {
        if uploaded {
            discard_upload(&state, post.image_path.as_deref()).await;
        }
        return Err(error);
    }

    if let Some(old) = replaced {
        if let Err(error) = state.storage.delete(&old).await {
            tracing::warn!(%error, key = %old, "Failed to delete replaced image");
        }
    }

    tracing::info!(post_id = post.id, user_id = user.id, "Post updated");
    Ok(Redirect::to("/home").into_response())
}

/// Copy validated fields onto `post`, uploading a new image if present
///
/// # Returns
/// Blob name of the image that was replaced
async fn apply_edit(
    state: &AppState,
    post: &mut Post,
    valid: ValidPost,
    user_id: i64,
) -> Result<Option<String>, AppError> {
    post.title = valid.title;
    post.author = valid.author;
    post.body = valid.body;
    post.user_id = user_id;

    let Some(image) = &valid.image else {
        return Ok(None);
    };
    let name = store_image(state, image).await?;
    Ok(post.image_path.replace(name))
}

// =============================================================================
// Helpers
// =============================================================================

fn render_form(
    user: &User,
    post: Option<&Post>,
    form: &PostForm,
    errors: &[FieldError],
    current_image: Option<String>,
) -> String {
    let (heading, action) = match post {
        Some(post) => ("Edit Post", format!("/post/{}", post.id)),
        None => ("New Post", "/new_post".to_string()),
    };

    views::post_page(
        user,
        &PostView {
            heading,
            action: &action,
            form,
            errors,
            current_image,
        },
    )
}

/// Upload under a fresh random name, returning the blob name
async fn store_image(state: &AppState, image: &ImageUpload) -> Result<String, AppError> {
    let name = blob_name(image.extension().as_deref());
    state
        .storage
        .upload(&name, image.bytes.clone(), &image.content_type)
        .await?;
    Ok(name)
}

/// Remove an image uploaded for a row that was never saved
async fn discard_upload(state: &AppState, name: Option<&str>) {
    let Some(name) = name else {
        return;
    };
    if let Err(error) = state.storage.delete(name).await {
        tracing::warn!(%error, key = %name, "Failed to delete orphaned image");
    }
}

async fn refresh_post_count(state: &AppState) {
    match state.db.count_posts().await {
        Ok(count) => POSTS_TOTAL.set(count),
        Err(error) => tracing::warn!(%error, "Failed to count posts"),
    }
}

/// Read the multipart post form
///
/// A file input left empty arrives as a part with an empty file name; it is
/// treated as no upload.
async fn read_post_form(mut multipart: Multipart) -> Result<PostForm, AppError> {
    let mut form = PostForm::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Failed to parse multipart: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "title" | "author" | "body" => {
                let value = field.text().await.map_err(|e| {
                    AppError::Validation(format!("Failed to read {}: {}", field_name, e))
                })?;
                match field_name.as_str() {
                    "title" => form.title = value,
                    "author" => form.author = value,
                    _ => form.body = value,
                }
            }
            "image_path" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();

                let mut bytes = Vec::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::Validation(format!("Failed to read file: {}", e)))?
                {
                    if bytes.len() + chunk.len() > MAX_IMAGE_UPLOAD_BYTES {
                        form.image_too_large = true;
                        break;
                    }
                    bytes.extend_from_slice(&chunk);
                }

                if !form.image_too_large && !filename.is_empty() && !bytes.is_empty() {
                    form.image = Some(ImageUpload {
                        filename,
                        content_type,
                        bytes,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(form)
}
