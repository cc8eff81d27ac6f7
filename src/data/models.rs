//! Data models
//!
//! Rust structs representing database entities.
//! Integer IDs are SQLite rowids; timestamps use chrono.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// User
// =============================================================================

/// A local account that can sign in with username and password
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Argon2 hash in PHC string format
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Post
// =============================================================================

/// A photo post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub body: String,
    /// Blob name of the attached image, relative to the storage public URL
    pub image_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Account that last saved the post
    pub user_id: i64,
}

/// Fields for a post that has not been stored yet
#[derive(Debug, Clone)]
pub struct NewPost {
    pub title: String,
    pub author: String,
    pub body: String,
    pub image_path: Option<String>,
    pub user_id: i64,
}

// =============================================================================
// Session
// =============================================================================

/// Persisted browser session
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: String,
    /// JSON object of session keys
    pub data: String,
    /// Unix timestamp (seconds)
    pub expires_at: i64,
}
