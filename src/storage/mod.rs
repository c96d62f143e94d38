//! Remote file-store transport.
//!
//! Everything the record layer persists goes through [`FileStore`]: a flat,
//! non-indexed set of named items grouped under containers. Backends only
//! have to offer listing by name, whole-item reads and writes, deletes and
//! metadata lookups.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;

pub mod container;
pub mod credentials;
pub mod drive;
pub mod local;
pub mod memory;
pub mod s3;

use crate::config::{StorageBackend, StorageConfig};

/// Listing metadata for one stored item (or container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMeta {
    pub id: String,
    pub name: String,
    pub created_at: OffsetDateTime,
    pub size: Option<u64>,
}

/// Name predicate applied by [`FileStore::list_items`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFilter {
    Exact(String),
    Prefix(String),
    Contains(String),
}

impl NameFilter {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::Exact(n) => name == n,
            NameFilter::Prefix(p) => name.starts_with(p.as_str()),
            NameFilter::Contains(s) => name.contains(s.as_str()),
        }
    }
}

/// Raw item content as returned by a backend.
///
/// Some transports hand back text (already decoded by the HTTP layer), others
/// plain bytes. Callers go through [`ItemBody::into_text`] and never care which.
#[derive(Debug, Clone)]
pub enum ItemBody {
    Binary(Bytes),
    Text(String),
}

impl ItemBody {
    pub fn into_text(self, name: &str) -> StorageResult<String> {
        let text = match self {
            ItemBody::Text(s) => s,
            ItemBody::Binary(b) => {
                String::from_utf8(b.to_vec()).map_err(|e| StorageError::Corrupt {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?
            }
        };
        match text.strip_prefix('\u{feff}') {
            Some(rest) => Ok(rest.to_string()),
            None => Ok(text),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage call `{0}` timed out")]
    Timeout(&'static str),
    #[error("storage credentials rejected: {0}")]
    Credentials(String),
    #[error("storage rejected request: {0}")]
    Rejected(String),
    #[error("corrupt document {name}: {reason}")]
    Corrupt { name: String, reason: String },
    #[error("invalid storage configuration: {0}")]
    Config(String),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Items directly inside `container` whose name satisfies `filter`.
    /// Implementations page through the full listing.
    async fn list_items(&self, container: &str, filter: &NameFilter)
        -> StorageResult<Vec<ItemMeta>>;
    async fn create_item(&self, container: &str, name: &str, body: Bytes)
        -> StorageResult<ItemMeta>;
    async fn get_item_content(&self, id: &str) -> StorageResult<ItemBody>;
    async fn update_item_content(&self, id: &str, body: Bytes) -> StorageResult<()>;
    async fn delete_item(&self, id: &str) -> StorageResult<()>;
    async fn get_item_metadata(&self, id: &str) -> StorageResult<ItemMeta>;

    /// `Ok(None)` when the container does not exist or is not accessible.
    async fn get_container(&self, id: &str) -> StorageResult<Option<ItemMeta>>;
    async fn find_containers(&self, name: &str) -> StorageResult<Vec<ItemMeta>>;
    async fn create_container(&self, name: &str) -> StorageResult<ItemMeta>;

    fn backend_name(&self) -> &'static str;
}

/// Builds the configured backend. Remote backends verify their credentials
/// here so a bad deployment fails at boot rather than on the first request.
pub async fn connect(cfg: &StorageConfig) -> anyhow::Result<Arc<dyn FileStore>> {
    let store: Arc<dyn FileStore> = match &cfg.backend {
        StorageBackend::Memory => Arc::new(memory::MemoryStore::new()),
        StorageBackend::Local { root } => {
            Arc::new(local::LocalStore::open(PathBuf::from(root)).await?)
        }
        StorageBackend::S3 {
            endpoint,
            bucket,
            access_key,
            secret_key,
            region,
        } => Arc::new(s3::S3Store::new(endpoint, bucket, access_key, secret_key, region).await?),
        StorageBackend::Drive {
            client_id,
            client_secret,
            refresh_token,
        } => {
            let tokens = credentials::TokenSource::new(credentials::OAuthClient {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                refresh_token: refresh_token.clone(),
                token_url: credentials::GOOGLE_TOKEN_URL.to_string(),
            });
            tokens.refresh().await?;
            Arc::new(drive::DriveStore::new(Arc::new(tokens)))
        }
    };
    tracing::info!(backend = store.backend_name(), "file store connected");
    Ok(store)
}
