use std::fmt;

use tracing::{info, warn};

use super::{FileStore, StorageError, StorageResult};

pub const DEFAULT_CONTAINER_NAME: &str = "Ledger-Cashbook-Data";

#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Pinned container id. When set and inaccessible, startup fails unless
    /// `recreate_missing` is on.
    pub id: Option<String>,
    pub name: String,
    pub recreate_missing: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            id: None,
            name: DEFAULT_CONTAINER_NAME.to_string(),
            recreate_missing: false,
        }
    }
}

/// Id of the folder every record of this deployment lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves the deployment container, creating it when none exists yet.
///
/// A pinned id that has gone missing is a configuration error: silently
/// creating a fresh container would orphan every record under the old one.
/// Transport failures propagate and never lead to a create.
pub async fn ensure_container(
    files: &dyn FileStore,
    opts: &ContainerOptions,
) -> StorageResult<ContainerId> {
    if let Some(id) = opts.id.as_deref().filter(|id| !id.is_empty()) {
        if let Some(meta) = files.get_container(id).await? {
            info!(container = %meta.id, name = %meta.name, "using configured container");
            return Ok(ContainerId(meta.id));
        }
        if !opts.recreate_missing {
            return Err(StorageError::Config(format!(
                "container {id} is missing or not accessible; fix STORAGE_CONTAINER_ID \
                 or set STORAGE_CONTAINER_RECREATE=true to start a new, empty container"
            )));
        }
        let created = files.create_container(&opts.name).await?;
        warn!(
            old = %id,
            new = %created.id,
            "configured container inaccessible, created a new one; records under the old id are not migrated"
        );
        return Ok(ContainerId(created.id));
    }

    let existing = files.find_containers(&opts.name).await?;
    if existing.len() > 1 {
        warn!(
            name = %opts.name,
            count = existing.len(),
            "several containers share the configured name; using the oldest"
        );
    }
    if let Some(meta) = existing.into_iter().next() {
        info!(container = %meta.id, "found container by name; pin it with STORAGE_CONTAINER_ID");
        return Ok(ContainerId(meta.id));
    }

    let created = files.create_container(&opts.name).await?;
    info!(
        container = %created.id,
        name = %opts.name,
        "created container; pin it with STORAGE_CONTAINER_ID"
    );
    Ok(ContainerId(created.id))
}
