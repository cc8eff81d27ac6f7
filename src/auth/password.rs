//! Local password hashing (Argon2id, PHC string format)

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use lazy_static::lazy_static;

use crate::error::AppError;

lazy_static! {
    /// Checked in place of a missing account's hash
    static ref DUMMY_HASH: String =
        hash_password("photoboard-unknown-account").unwrap_or_default();
}

/// Hash a password with a fresh random salt
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Encryption(format!("password hashing failed: {}", e)))
}

/// Check a password against a stored hash
///
/// A malformed stored hash never verifies.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(password_hash) else {
        tracing::warn!("Stored password hash is not a valid PHC string");
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Verify a sign-in attempt off the async runtime
///
/// An unknown account (`None`) still pays for one Argon2 verification and
/// never succeeds.
pub async fn verify_login(password: String, password_hash: Option<String>) -> bool {
    tokio::task::spawn_blocking(move || match password_hash {
        Some(hash) => verify_password(&password, &hash),
        None => {
            let _ = verify_password(&password, &DUMMY_HASH);
            false
        }
    })
    .await
    .unwrap_or_else(|error| {
        tracing::error!(%error, "Password verification task failed");
        false
    })
}
