//! Credential checks for signup and login.
//!
//! Failures that could reveal whether an account exists all collapse into
//! [`AppError::InvalidCredentials`] or [`AppError::UsernameUnavailable`].

use std::sync::OnceLock;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use log::{error, info, warn};

use crate::error::{AppError, StoreError};
use crate::store::Store;

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 20;
pub const PASSWORD_MIN: usize = 6;
pub const PASSWORD_MAX: usize = 128;

pub fn validate_username(username: &str) -> Result<(), AppError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(AppError::InvalidInput(format!(
            "Username must be {USERNAME_MIN}-{USERNAME_MAX} characters."
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::InvalidInput(
            "Username may only contain letters, digits and underscores.".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), AppError> {
    let len = password.chars().count();
    if len < PASSWORD_MIN {
        return Err(AppError::InvalidInput(format!(
            "Password must be at least {PASSWORD_MIN} characters."
        )));
    }
    if len > PASSWORD_MAX {
        return Err(AppError::InvalidInput(format!(
            "Password must be at most {PASSWORD_MAX} characters."
        )));
    }
    Ok(())
}

fn hash_blocking(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("Argon2 hashing failed: {e}");
            AppError::Hashing
        })
}

fn verify_blocking(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is unreadable: {e}");
            false
        }
    }
}

/// Hash used to burn the same verification time when the user does not exist.
fn decoy_hash() -> &'static str {
    static DECOY: OnceLock<String> = OnceLock::new();
    DECOY.get_or_init(|| hash_blocking("decoy-password").unwrap_or_default())
}

pub async fn hash_password(password: String) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || hash_blocking(&password))
        .await
        .map_err(|e| {
            error!("Hashing task failed: {e}");
            AppError::Hashing
        })?
}

pub async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    tokio::task::spawn_blocking(move || verify_blocking(&password, &hash))
        .await
        .map_err(|e| {
            error!("Verification task failed: {e}");
            AppError::Hashing
        })
}

pub async fn signup(store: &dyn Store, username: &str, password: &str) -> Result<(), AppError> {
    validate_username(username)?;
    validate_password(password)?;

    if store.username_taken(username).await? {
        info!("Signup rejected: username unavailable");
        return Err(AppError::UsernameUnavailable);
    }

    let hash = hash_password(password.to_string()).await?;
    match store.create_user(username, &hash).await {
        Ok(id) => {
            info!("New user registered with id {id}");
            Ok(())
        }
        Err(StoreError::Duplicate) => Err(AppError::UsernameUnavailable),
        Err(e) => Err(e.into()),
    }
}

/// Returns the canonical username on success.
pub async fn login(store: &dyn Store, username: &str, password: &str) -> Result<String, AppError> {
    if username.is_empty() || password.is_empty() {
        return Err(AppError::InvalidInput(
            "Username or password is missing.".to_string(),
        ));
    }

    let Some(user) = store.find_user(username).await? else {
        let password = password.to_string();
        tokio::task::spawn_blocking(move || verify_blocking(&password, decoy_hash()))
            .await
            .map_err(|e| {
                error!("Verification task failed: {e}");
                AppError::Hashing
            })?;
        return Err(AppError::InvalidCredentials);
    };

    if verify_password(password.to_string(), user.password_hash).await? {
        info!("Successful login for user id {}", user.id);
        Ok(user.username)
    } else {
        info!("Failed login for user id {}", user.id);
        Err(AppError::InvalidCredentials)
    }
}
