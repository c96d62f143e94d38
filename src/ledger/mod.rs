pub mod dto;
pub mod handlers;
pub mod repo;
pub mod repo_types;
pub mod services;

use crate::state::AppState;
use axum::Router;

/// Routes mounted under `/api/user-data`.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::ledger_routes())
        .merge(handlers::account_routes())
}
