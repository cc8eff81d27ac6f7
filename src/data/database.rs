//! SQLite database operations
//!
//! All database access goes through this module.

use chrono::Utc;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Get a user by row id
    pub async fn get_user(&self, id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Get a user by exact username
    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Create a user
    ///
    /// # Arguments
    /// * `username` - Unique username
    /// * `password_hash` - Already-hashed password (PHC string)
    ///
    /// # Errors
    /// Fails with a database error when the username is taken
    pub async fn insert_user(&self, username: &str, password_hash: &str) -> Result<User, AppError> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(username)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now,
        })
    }

    /// Replace a user's password hash
    pub async fn update_password_hash(&self, id: i64, password_hash: &str) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        Ok(())
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// All posts, newest first
    pub async fn list_posts(&self) -> Result<Vec<Post>, AppError> {
        let posts = sqlx::query_as::<_, Post>("SELECT * FROM posts ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;

        Ok(posts)
    }

    pub async fn get_post(&self, id: i64) -> Result<Option<Post>, AppError> {
        let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(post)
    }

    pub async fn count_posts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Store a new post and return it with its assigned id
    pub async fn insert_post(&self, post: &NewPost) -> Result<Post, AppError> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"
            INSERT INTO posts (title, author, body, image_path, timestamp, user_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.title)
        .bind(&post.author)
        .bind(&post.body)
        .bind(&post.image_path)
        .bind(now)
        .bind(post.user_id)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Post {
            id,
            title: post.title.clone(),
            author: post.author.clone(),
            body: post.body.clone(),
            image_path: post.image_path.clone(),
            timestamp: now,
            user_id: post.user_id,
        })
    }

    /// Overwrite the editable fields of an existing post
    ///
    /// # Errors
    /// Returns `NotFound` if the post no longer exists
    pub async fn update_post(&self, post: &Post) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET title = ?, author = ?, body = ?, image_path = ?, user_id = ?
            WHERE id = ?
            "#,
        )
        .bind(&post.title)
        .bind(&post.author)
        .bind(&post.body)
        .bind(&post.image_path)
        .bind(post.user_id)
        .bind(post.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Load a session that has not expired yet
    pub async fn load_session(&self, id: &str) -> Result<Option<SessionRecord>, AppError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions WHERE id = ? AND expires_at > ?",
        )
        .bind(id)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Insert or replace a session row
    pub async fn store_session(&self, record: &SessionRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, data, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data, expires_at = excluded.expires_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.data)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove every session that expired before `now` (unix seconds)
    ///
    /// # Returns
    /// Number of removed sessions
    pub async fn purge_expired_sessions(&self, now: i64) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
