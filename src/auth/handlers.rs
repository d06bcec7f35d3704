use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{AuthResponse, LoginRequest, MessageResponse, ProfileResponse, RegisterRequest},
        extractors::AuthUser,
        jwt::JwtKeys,
        repo_types::User,
        services,
    },
    error::{AppError, AppResult},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/profile", get(profile))
        .route("/auth/logout", post(logout))
}

/// Malformed or missing JSON is a client error like any other bad input.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload.map(|Json(p)| p).map_err(|e| {
        warn!(error = %e, "rejected request body");
        AppError::Validation(e.body_text())
    })
}

fn token_response(state: &AppState, user: User) -> AppResult<Json<AuthResponse>> {
    let issued = JwtKeys::from_ref(state).issue(user.id)?;
    Ok(Json(AuthResponse {
        token: issued.token,
        email: user.email,
        expires_at: issued.expires_at,
    }))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<Json<AuthResponse>> {
    let payload = body(payload)?;
    let user = services::register(&state, &payload.email, &payload.password).await?;
    token_response(&state, user)
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<Json<AuthResponse>> {
    let payload = body(payload)?;
    let user = services::authenticate(&state, &payload.email, &payload.password).await?;
    token_response(&state, user)
}

#[instrument(skip(state))]
pub async fn profile(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<ProfileResponse>> {
    let user = services::find_by_id(&state, user_id).await.map_err(|e| {
        warn!(user_id, error = %e, "profile lookup failed");
        e
    })?;
    Ok(Json(user.into()))
}

/// Tokens are stateless; the client discards its copy.
#[instrument]
pub async fn logout(AuthUser(user_id): AuthUser) -> Json<MessageResponse> {
    info!(user_id, "user logged out");
    Json(MessageResponse {
        message: "Logged out successfully",
    })
}
