//! Image blob storage
//!
//! Uploaded post images live either in a local directory (served by the app
//! under `/images`) or in an S3-compatible bucket fronted by a public URL.
//! Posts only store the blob name; URLs are built on render.

use std::path::{Path, PathBuf};

use aws_sdk_s3::Client as S3Client;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::AppError;
use crate::metrics::{IMAGE_BYTES_UPLOADED, IMAGE_UPLOADS_TOTAL};

/// Image storage service
pub enum ImageStorage {
    /// Blobs written under a local directory
    Filesystem { root: PathBuf, public_url: String },
    /// Blobs in an S3-compatible bucket
    S3 {
        client: S3Client,
        bucket: String,
        public_url: String,
    },
}

impl ImageStorage {
    /// Create the configured storage backend
    ///
    /// # Errors
    /// Returns error if the local directory cannot be created or S3 settings
    /// are incomplete
    pub async fn new(config: &StorageConfig) -> Result<Self, AppError> {
        let public_url = config.public_url.trim_end_matches('/').to_string();

        match config.backend {
            StorageBackend::Filesystem => {
                let root = config.filesystem.root.clone();
                tokio::fs::create_dir_all(&root).await.map_err(|e| {
                    AppError::Storage(format!(
                        "failed to create image directory {}: {}",
                        root.display(),
                        e
                    ))
                })?;
                tracing::info!(root = %root.display(), "Using filesystem image storage");
                Ok(Self::Filesystem { root, public_url })
            }
            StorageBackend::S3 => {
                use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

                let s3 = &config.s3;
                let required = |value: &Option<String>, key: &str| {
                    value
                        .clone()
                        .ok_or_else(|| AppError::Config(format!("{} is required", key)))
                };
                let endpoint = required(&s3.endpoint, "storage.s3.endpoint")?;
                let bucket = required(&s3.bucket, "storage.s3.bucket")?;
                let access_key_id = required(&s3.access_key_id, "storage.s3.access_key_id")?;
                let secret_access_key =
                    required(&s3.secret_access_key, "storage.s3.secret_access_key")?;

                let credentials =
                    Credentials::new(access_key_id, secret_access_key, None, None, "photoboard");

                let s3_config = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .http_client(super::build_s3_http_client())
                    .region(Region::new(
                        s3.region.clone().unwrap_or_else(|| "auto".to_string()),
                    ))
                    .endpoint_url(&endpoint)
                    .force_path_style(true)
                    .credentials_provider(credentials)
                    .build();

                tracing::info!(%endpoint, %bucket, "Using S3 image storage");
                Ok(Self::S3 {
                    client: S3Client::from_conf(s3_config),
                    bucket,
                    public_url,
                })
            }
        }
    }

    /// Directory to serve under `/images`, for the filesystem backend
    pub fn local_root(&self) -> Option<&Path> {
        match self {
            Self::Filesystem { root, .. } => Some(root),
            Self::S3 { .. } => None,
        }
    }

    /// Store an image blob
    ///
    /// # Returns
    /// Public URL for the stored blob
    pub async fn upload(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, AppError> {
        validate_key(key)?;
        let size = data.len();

        match self {
            Self::Filesystem { root, .. } => {
                tokio::fs::write(root.join(key), data).await.map_err(|e| {
                    AppError::Storage(format!("failed to write image {}: {}", key, e))
                })?;
            }
            Self::S3 { client, bucket, .. } => {
                use aws_sdk_s3::primitives::ByteStream;

                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .content_type(content_type)
                    .cache_control("public, max-age=31536000")
                    .send()
                    .await
                    .map_err(|e| AppError::Storage(format!("S3 upload failed: {}", e)))?;
            }
        }

        IMAGE_UPLOADS_TOTAL.inc();
        IMAGE_BYTES_UPLOADED.inc_by(size as f64);
        tracing::info!(key, size, "Image stored");

        Ok(self.public_url(key))
    }

    /// Remove an image blob. Deleting a missing blob is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), AppError> {
        validate_key(key)?;

        match self {
            Self::Filesystem { root, .. } => match tokio::fs::remove_file(root.join(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AppError::Storage(format!(
                    "failed to delete image {}: {}",
                    key, e
                ))),
            },
            Self::S3 { client, bucket, .. } => {
                client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| AppError::Storage(format!("S3 delete failed: {}", e)))?;
                Ok(())
            }
        }
    }

    /// Public URL for a blob name
    pub fn public_url(&self, key: &str) -> String {
        let base = match self {
            Self::Filesystem { public_url, .. } | Self::S3 { public_url, .. } => public_url,
        };
        format!("{}/{}", base, key)
    }
}

/// Blob names are flat file names; anything that could escape the storage
/// root is rejected.
fn validate_key(key: &str) -> Result<(), AppError> {
    let invalid = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.chars().any(char::is_control);
    if invalid {
        return Err(AppError::Storage(format!("invalid image key `{}`", key)));
    }
    Ok(())
}

/// Random blob name that keeps the uploaded file's extension
pub fn blob_name(extension: Option<&str>) -> String {
    let id = ulid::Ulid::new().to_string().to_lowercase();
    match extension {
        Some(extension) => format!("{}.{}", id, extension),
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilesystemStorageConfig, S3StorageConfig};

    async fn filesystem_storage(dir: &tempfile::TempDir) -> ImageStorage {
        ImageStorage::new(&StorageConfig {
            backend: StorageBackend::Filesystem,
            public_url: "/images/".to_string(),
            filesystem: FilesystemStorageConfig {
                root: dir.path().join("images"),
            },
            s3: S3StorageConfig::default(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn filesystem_upload_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = filesystem_storage(&dir).await;

        let url = storage
            .upload("abc.png", b"png-bytes".to_vec(), "image/png")
            .await
            .unwrap();
        assert_eq!(url, "/images/abc.png");

        let path = dir.path().join("images").join("abc.png");
        assert_eq!(std::fs::read(&path).unwrap(), b"png-bytes");

        storage.delete("abc.png").await.unwrap();
        assert!(!path.exists());
        storage.delete("abc.png").await.unwrap();
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = filesystem_storage(&dir).await;

        for key in ["../secret", "a/b.png", "..", "", ".hidden"] {
            assert!(
                storage.upload(key, vec![1], "image/png").await.is_err(),
                "{key:?} must be rejected"
            );
        }
    }

    #[tokio::test]
    async fn s3_backend_requires_bucket_settings() {
        let result = ImageStorage::new(&StorageConfig {
            backend: StorageBackend::S3,
            public_url: "https://img.example.com".to_string(),
            filesystem: FilesystemStorageConfig::default(),
            s3: S3StorageConfig {
                endpoint: Some("https://s3.example.com".to_string()),
                ..S3StorageConfig::default()
            },
        })
        .await;

        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn blob_names_are_unique_and_keep_extension() {
        let first = blob_name(Some("png"));
        let second = blob_name(Some("png"));
        assert!(first.ends_with(".png"));
        assert_ne!(first, second);
        assert!(!blob_name(None).contains('.'));
    }
}
