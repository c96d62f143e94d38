use std::sync::Arc;

use anyhow::Context;

use crate::{
    auth::{jwt::JwtKeys, services::AuthService},
    config::AppConfig,
    ledger::services::LedgerService,
    records::RecordStore,
    storage,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: AuthService,
    pub ledger: LedgerService,
}

impl AppState {
    /// Loads configuration, connects the file store and resolves the
    /// container. Nothing is served until this returns.
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;
        let files = storage::connect(&config.storage).await?;
        let records = RecordStore::open(
            files,
            &config.storage.container,
            config.storage.op_timeout,
        )
        .await
        .context("failed to open record store")?;
        tracing::info!(container = %records.container(), "record store ready");
        Ok(Self::from_parts(Arc::new(config), Arc::new(records)))
    }

    pub fn from_parts(config: Arc<AppConfig>, records: Arc<RecordStore>) -> Self {
        let auth = AuthService::new(
            records.clone(),
            JwtKeys::from_config(&config.jwt),
            config.password,
        );
        let ledger = LedgerService::new(records);
        Self {
            config,
            auth,
            ledger,
        }
    }
}
