use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::{
        dto::{AuthResponse, LoginRequest, RegisterRequest, UserResponse},
        extractors::AuthUser,
    },
    error::AppError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/verify", get(verify))
        .route("/profile", get(profile))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    let Json(payload) = payload?;
    let resp = state.auth.register(payload).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AppError> {
    let Json(payload) = payload?;
    Ok(Json(state.auth.login(payload).await?))
}

pub async fn verify(AuthUser(who): AuthUser) -> Json<UserResponse> {
    Json(UserResponse { user: who.into() })
}

#[instrument(skip(state, who), fields(user_id = %who.id))]
pub async fn profile(
    State(state): State<AppState>,
    AuthUser(who): AuthUser,
) -> Result<Json<UserResponse>, AppError> {
    let user = state.auth.profile(who.id).await?;
    Ok(Json(UserResponse { user }))
}
