use anyhow::Context;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, warn};

use crate::{
    auth::{
        password::{hash_password, verify_password},
        repo_types::User,
    },
    config::HashConfig,
    error::{AppError, AppResult},
    state::AppState,
};

pub const MIN_PASSWORD_LEN: usize = 6;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub(crate) fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    email.len() <= 255 && EMAIL_RE.is_match(email)
}

async fn hash_offloaded(plain: &str, cfg: &HashConfig) -> AppResult<String> {
    let plain = plain.to_owned();
    let cfg = cfg.clone();
    let hash = tokio::task::spawn_blocking(move || hash_password(&plain, &cfg)).await??;
    Ok(hash)
}

async fn verify_offloaded(plain: &str, hash: impl AsRef<str> + Send + 'static) -> AppResult<bool> {
    let plain = plain.to_owned();
    let ok = tokio::task::spawn_blocking(move || verify_password(&plain, hash.as_ref())).await??;
    Ok(ok)
}

/// Creates a user for `email`, which is normalized first.
///
/// The lookup before the insert only saves a hash computation in the common
/// case; the unique index decides races between concurrent registrations.
pub async fn register(state: &AppState, email: &str, password: &str) -> AppResult<User> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(AppError::Validation("Invalid email".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    if state.users.find_by_email(&email).await?.is_some() {
        warn!(%email, "email already registered");
        return Err(AppError::Conflict);
    }

    let hash = hash_offloaded(password, &state.config.password).await?;
    let user = state.users.create(&email, &hash).await.map_err(|e| {
        warn!(%email, error = %e, "create user failed");
        AppError::from(e)
    })?;

    info!(user_id = user.id, email = %user.email, "user registered");
    Ok(user)
}

/// Checks a login attempt and stamps `last_login_at` on success.
pub async fn authenticate(state: &AppState, email: &str, password: &str) -> AppResult<User> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(AppError::Validation("Invalid email".into()));
    }
    if password.is_empty() {
        return Err(AppError::Validation("Password is required".into()));
    }

    let Some(user) = state.users.find_by_email(&email).await? else {
        // Spend one verification so this path costs what a wrong password does.
        match verify_offloaded(password, state.decoy_hash.clone()).await {
            Ok(false) => {}
            Ok(true) => warn!("decoy hash unexpectedly matched a login password"),
            Err(e) => error!(error = %e, "decoy hash verification failed"),
        }
        warn!(%email, "login unknown email");
        return Err(AppError::InvalidCredentials);
    };

    if !verify_offloaded(password, user.password_hash.clone()).await? {
        warn!(%email, user_id = user.id, "login invalid password");
        return Err(AppError::InvalidCredentials);
    }

    let user = state
        .users
        .touch_last_login(user.id)
        .await
        .context("update last_login_at")?;

    info!(user_id = user.id, email = %user.email, "user logged in");
    Ok(user)
}

pub async fn find_by_id(state: &AppState, id: i64) -> AppResult<User> {
    state.users.find_by_id(id).await?.ok_or(AppError::NotFound)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::password::params_of;

    #[test]
    fn email_shape() {
        assert!(is_valid_email("u@x.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("invalid-email"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@x.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn normalization_trims_and_lowercases() {
        assert_eq!(normalize_email("  A@X.Com "), "a@x.com");
    }

    #[tokio::test]
    async fn register_conflicts_regardless_of_casing() {
        let state = AppState::fake();
        let user = register(&state, "A@x.com", "secret1").await.expect("first register");
        assert_eq!(user.email, "a@x.com");
        assert!(user.last_login_at.is_none());

        let err = register(&state, "a@x.com", "secret1").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict));
    }

    #[tokio::test]
    async fn register_validates_input() {
        let state = AppState::fake();
        let err = register(&state, "invalid-email", "secret1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = register(&state, "u@x.com", "12345").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        register(&state, "u@x.com", "123456").await.expect("six chars is enough");
    }

    #[tokio::test]
    async fn register_never_stores_the_raw_password() {
        let state = AppState::fake();
        let user = register(&state, "u@x.com", "secret1").await.unwrap();
        assert_ne!(user.password_hash, "secret1");
        assert!(verify_password("secret1", &user.password_hash).unwrap());
    }

    #[tokio::test]
    async fn bad_password_and_unknown_email_look_the_same() {
        let state = AppState::fake();
        register(&state, "u@x.com", "secret1").await.unwrap();

        let wrong_password = authenticate(&state, "u@x.com", "nope-nope").await.unwrap_err();
        let unknown_email = authenticate(&state, "ghost@x.com", "secret1").await.unwrap_err();

        assert!(matches!(wrong_password, AppError::InvalidCredentials));
        assert!(matches!(unknown_email, AppError::InvalidCredentials));
        assert_eq!(wrong_password.to_string(), unknown_email.to_string());
        assert_eq!(wrong_password.status(), unknown_email.status());
    }

    #[tokio::test]
    async fn decoy_hash_costs_the_same_as_a_real_one() {
        let state = AppState::fake();
        let user = register(&state, "u@x.com", "secret1").await.unwrap();
        assert_eq!(params_of(&state.decoy_hash), params_of(&user.password_hash));
        assert_eq!(
            params_of(&state.decoy_hash).m_cost(),
            state.config.password.memory_kib
        );
    }

    #[tokio::test]
    async fn authenticate_stamps_last_login_monotonically() {
        let state = AppState::fake();
        register(&state, "u@x.com", "secret1").await.unwrap();

        let first = authenticate(&state, "U@X.COM", "secret1").await.unwrap();
        let first_at = first.last_login_at.expect("stamped on login");
        let second = authenticate(&state, "u@x.com", "secret1").await.unwrap();
        let second_at = second.last_login_at.expect("stamped on login");
        assert!(second_at >= first_at);

        let stored = find_by_id(&state, first.id).await.unwrap();
        assert_eq!(stored.last_login_at, Some(second_at));
    }

    #[tokio::test]
    async fn find_by_id_reports_not_found() {
        let state = AppState::fake();
        let err = find_by_id(&state, 999).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_has_one_winner() {
        let state = Arc::new(AppState::fake());
        let attempts = 8;

        let handles: Vec<_> = (0..attempts)
            .map(|i| {
                let state = state.clone();
                // Vary casing so normalization is part of the race.
                let email = if i % 2 == 0 { "race@x.com" } else { "RACE@x.com" };
                tokio::spawn(async move { register(&state, email, "secret1").await })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.expect("task panicked") {
                Ok(_) => ok += 1,
                Err(AppError::Conflict) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, attempts - 1);
    }
}
