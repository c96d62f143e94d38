use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::Value;
use tracing::{info, instrument};

use crate::{
    auth::extractors::AuthUser,
    error::AppError,
    ledger::{
        dto::{AccountDeleted, BackupCreated, BackupSummary, DeleteAccountRequest, LedgerInput},
        repo_types::LedgerSnapshot,
    },
    state::AppState,
};

pub fn ledger_routes() -> Router<AppState> {
    Router::new()
        .route("/ledger", get(get_ledger).post(save_ledger))
        .route("/backup", post(create_backup))
        .route("/backups", get(list_backups))
        // ids from the local and s3 backends contain `/`
        .route("/restore/*backupId", post(restore_backup))
}

pub fn account_routes() -> Router<AppState> {
    Router::new().route("/account", delete(delete_account))
}

#[instrument(skip(state, who), fields(user_id = %who.id))]
pub async fn get_ledger(
    State(state): State<AppState>,
    AuthUser(who): AuthUser,
) -> Result<Json<LedgerSnapshot>, AppError> {
    Ok(Json(state.ledger.get_snapshot(who.id).await?))
}

#[instrument(skip(state, who, payload), fields(user_id = %who.id))]
pub async fn save_ledger(
    State(state): State<AppState>,
    AuthUser(who): AuthUser,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<LedgerSnapshot>, AppError> {
    let Json(body) = payload?;
    let input = LedgerInput::from_json(body)?;
    Ok(Json(state.ledger.save_snapshot(who.id, input).await?))
}

#[instrument(skip(state, who), fields(user_id = %who.id))]
pub async fn create_backup(
    State(state): State<AppState>,
    AuthUser(who): AuthUser,
) -> Result<Json<BackupCreated>, AppError> {
    Ok(Json(state.ledger.create_backup(who.id).await?))
}

#[instrument(skip(state, who), fields(user_id = %who.id))]
pub async fn list_backups(
    State(state): State<AppState>,
    AuthUser(who): AuthUser,
) -> Result<Json<Vec<BackupSummary>>, AppError> {
    Ok(Json(state.ledger.list_backups(who.id).await?))
}

#[instrument(skip(state, who), fields(user_id = %who.id))]
pub async fn restore_backup(
    State(state): State<AppState>,
    AuthUser(who): AuthUser,
    Path(backup_id): Path<String>,
) -> Result<Json<LedgerSnapshot>, AppError> {
    Ok(Json(state.ledger.restore_backup(who.id, &backup_id).await?))
}

#[instrument(skip(state, who, payload), fields(user_id = %who.id))]
pub async fn delete_account(
    State(state): State<AppState>,
    AuthUser(who): AuthUser,
    payload: Result<Json<DeleteAccountRequest>, JsonRejection>,
) -> Result<Json<AccountDeleted>, AppError> {
    let Json(req) = payload?;
    state.auth.confirm_password(who.id, &req.password).await?;
    let report = state.ledger.delete_all_user_data(who.id).await?;
    info!(user_id = %who.id, "account deleted");
    Ok(Json(report.into()))
}
