//! Password hashing.
//!
//! bcrypt is CPU-bound, so both directions run on the blocking pool.

use anyhow::{Context, Result};

/// Hash a password at the given bcrypt cost.
///
/// # Errors
///
/// Returns an error if hashing fails or the blocking task panics.
pub async fn hash_password(password: String, cost: u32) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("Password hashing task failed")?
        .context("Failed to hash password")
}

/// Check a password against a stored bcrypt hash.
///
/// # Errors
///
/// Returns an error if the hash is malformed or the blocking task panics.
pub async fn verify_password(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .context("Password verification task failed")?
        .context("Failed to verify password")
}
