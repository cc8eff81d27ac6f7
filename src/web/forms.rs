//! Typed form submissions and their validation
//!
//! Every form validates into either a cleaned value or a list of field
//! errors that the page re-renders next to the inputs.

use serde::Deserialize;

/// Longest accepted post title
pub const MAX_TITLE_CHARS: usize = 150;
/// Longest accepted author name
pub const MAX_AUTHOR_CHARS: usize = 75;
/// File extensions accepted for post images
pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// A validation failure tied to one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Messages for one field, in order
pub fn errors_for<'a>(errors: &'a [FieldError], field: &str) -> impl Iterator<Item = &'a str> {
    errors
        .iter()
        .filter(move |error| error.field == field)
        .map(|error| error.message.as_str())
}

fn require(errors: &mut Vec<FieldError>, field: &'static str, value: &str) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "This field is required."));
    }
}

fn limit(errors: &mut Vec<FieldError>, field: &'static str, value: &str, max: usize) {
    if value.chars().count() > max {
        errors.push(FieldError::new(
            field,
            format!("Field cannot be longer than {} characters.", max),
        ));
    }
}

// =============================================================================
// Login
// =============================================================================

/// `POST /login` body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Checkbox; present (any value) when ticked
    #[serde(default)]
    pub remember_me: Option<String>,
}

/// Validated login submission
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub remember_me: bool,
}

impl LoginForm {
    pub fn validate(&self) -> Result<Credentials, Vec<FieldError>> {
        let mut errors = Vec::new();
        require(&mut errors, "username", &self.username);
        require(&mut errors, "password", &self.password);
        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Credentials {
            username: self.username.trim().to_string(),
            password: self.password.clone(),
            remember_me: self.remember_me.is_some(),
        })
    }
}

// =============================================================================
// Post
// =============================================================================

/// An uploaded image file
#[derive(Debug, Clone)]
pub struct ImageUpload {
    /// Client-supplied file name
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    /// Lowercased extension of the client file name, if any
    pub fn extension(&self) -> Option<String> {
        let (_, extension) = self.filename.rsplit_once('.')?;
        let extension = extension.trim().to_ascii_lowercase();
        (!extension.is_empty()).then_some(extension)
    }
}

/// Text fields of the post form plus the optional image
#[derive(Debug, Clone, Default)]
pub struct PostForm {
    pub title: String,
    pub author: String,
    pub body: String,
    pub image: Option<ImageUpload>,
    /// Set while reading the upload when it exceeded the size limit
    pub image_too_large: bool,
}

/// Validated post submission
#[derive(Debug, Clone)]
pub struct ValidPost {
    pub title: String,
    pub author: String,
    pub body: String,
    pub image: Option<ImageUpload>,
}

impl PostForm {
    /// Prefill from a stored post for editing
    pub fn from_post(post: &crate::data::Post) -> Self {
        Self {
            title: post.title.clone(),
            author: post.author.clone(),
            body: post.body.clone(),
            image: None,
            image_too_large: false,
        }
    }

    pub fn validate(&self) -> Result<ValidPost, Vec<FieldError>> {
        let mut errors = Vec::new();
        require(&mut errors, "title", &self.title);
        limit(&mut errors, "title", &self.title, MAX_TITLE_CHARS);
        require(&mut errors, "author", &self.author);
        limit(&mut errors, "author", &self.author, MAX_AUTHOR_CHARS);
        require(&mut errors, "body", &self.body);

        if self.image_too_large {
            errors.push(FieldError::new("image_path", "Image is too large."));
        } else if let Some(image) = &self.image {
            let allowed = image
                .extension()
                .is_some_and(|ext| ALLOWED_IMAGE_EXTENSIONS.contains(&ext.as_str()));
            if !allowed {
                errors.push(FieldError::new("image_path", "Images only!"));
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ValidPost {
            title: self.title.trim().to_string(),
            author: self.author.trim().to_string(),
            body: self.body.clone(),
            image: self.image.clone(),
        })
    }
}
