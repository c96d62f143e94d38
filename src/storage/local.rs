use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use super::{FileStore, ItemBody, ItemMeta, NameFilter, StorageError, StorageResult};

/// Marker file that turns a directory under the root into a container.
const MARKER: &str = ".container";

/// Directory-backed file store. One sub-directory per container, one file per
/// item; an item id is `<container>/<name>`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub async fn open(root: PathBuf) -> StorageResult<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn container_dir(&self, id: &str) -> StorageResult<PathBuf> {
        check_segment(id)?;
        Ok(self.root.join(id))
    }

    fn item_path(&self, id: &str) -> StorageResult<(PathBuf, String)> {
        let (container, name) = id
            .split_once('/')
            .ok_or_else(|| StorageError::NotFound(format!("item {id}")))?;
        check_segment(name)?;
        Ok((self.container_dir(container)?.join(name), name.to_string()))
    }
}

fn check_segment(segment: &str) -> StorageResult<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment == MARKER
        || segment.contains(['/', '\\'])
    {
        return Err(StorageError::Rejected(format!("invalid name segment {segment:?}")));
    }
    Ok(())
}

fn map_io(err: std::io::Error, what: impl Into<String>) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(what.into())
    } else {
        StorageError::Io(err)
    }
}

async fn meta_for(path: &Path, id: String, name: String) -> StorageResult<ItemMeta> {
    let md = fs::metadata(path).await.map_err(|e| map_io(e, format!("item {id}")))?;
    let created = md.created().or_else(|_| md.modified())?;
    Ok(ItemMeta {
        id,
        name,
        created_at: OffsetDateTime::from(created),
        size: Some(md.len()),
    })
}

#[async_trait]
impl FileStore for LocalStore {
    async fn list_items(
        &self,
        container: &str,
        filter: &NameFilter,
    ) -> StorageResult<Vec<ItemMeta>> {
        let dir = self.container_dir(container)?;
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| map_io(e, format!("container {container}")))?;

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name == MARKER || name.starts_with('.') || !filter.matches(&name) {
                continue;
            }
            match meta_for(&entry.path(), format!("{container}/{name}"), name.clone()).await {
                Ok(meta) => out.push(meta),
                // deleted between read_dir and stat
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn create_item(
        &self,
        container: &str,
        name: &str,
        body: Bytes,
    ) -> StorageResult<ItemMeta> {
        check_segment(name)?;
        let dir = self.container_dir(container)?;
        if !fs::try_exists(dir.join(MARKER)).await? {
            return Err(StorageError::NotFound(format!("container {container}")));
        }
        let path = dir.join(name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    StorageError::Rejected(format!("item {container}/{name} already exists"))
                }
                _ => StorageError::Io(e),
            })?;
        file.write_all(&body).await?;
        file.flush().await?;
        meta_for(&path, format!("{container}/{name}"), name.to_string()).await
    }

    async fn get_item_content(&self, id: &str) -> StorageResult<ItemBody> {
        let (path, _) = self.item_path(id)?;
        let bytes = fs::read(&path).await.map_err(|e| map_io(e, format!("item {id}")))?;
        Ok(ItemBody::Binary(Bytes::from(bytes)))
    }

    async fn update_item_content(&self, id: &str, body: Bytes) -> StorageResult<()> {
        let (path, _) = self.item_path(id)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| map_io(e, format!("item {id}")))?;
        file.write_all(&body).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> StorageResult<()> {
        let (path, _) = self.item_path(id)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_io(e, format!("item {id}")))
    }

    async fn get_item_metadata(&self, id: &str) -> StorageResult<ItemMeta> {
        let (path, name) = self.item_path(id)?;
        meta_for(&path, id.to_string(), name).await
    }

    async fn get_container(&self, id: &str) -> StorageResult<Option<ItemMeta>> {
        let dir = match self.container_dir(id) {
            Ok(d) => d,
            Err(StorageError::Rejected(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let marker = dir.join(MARKER);
        let name = match fs::read_to_string(&marker).await {
            Ok(n) => n.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let mut meta = meta_for(&marker, id.to_string(), name).await?;
        meta.size = None;
        Ok(Some(meta))
    }

    async fn find_containers(&self, name: &str) -> StorageResult<Vec<ItemMeta>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            match self.get_container(&id).await {
                Ok(Some(meta)) if meta.name == name => out.push(meta),
                Ok(_) => {}
                Err(e) => warn!(error = %e, container = %id, "skipping unreadable container"),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn create_container(&self, name: &str) -> StorageResult<ItemMeta> {
        let id = Uuid::new_v4().simple().to_string();
        let dir = self.root.join(&id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(MARKER), name.as_bytes()).await?;
        self.get_container(&id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("container {id}")))
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_list_read_update_delete() {
        let (_dir, store) = store().await;
        let c = store.create_container("Ledger-Cashbook-Data").await.unwrap();

        let item = store
            .create_item(&c.id, "ledger_u1.json", Bytes::from_static(b"{\"v\":1}"))
            .await
            .unwrap();
        assert_eq!(item.id, format!("{}/ledger_u1.json", c.id));

        let listed = store
            .list_items(&c.id, &NameFilter::Exact("ledger_u1.json".into()))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        store
            .update_item_content(&item.id, Bytes::from_static(b"{\"v\":2}"))
            .await
            .unwrap();
        let body = store.get_item_content(&item.id).await.unwrap();
        assert_eq!(body.into_text("ledger_u1.json").unwrap(), "{\"v\":2}");

        store.delete_item(&item.id).await.unwrap();
        assert!(matches!(
            store.get_item_content(&item.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn marker_file_is_not_listed() {
        let (_dir, store) = store().await;
        let c = store.create_container("data").await.unwrap();
        let all = store
            .list_items(&c.id, &NameFilter::Prefix(String::new()))
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn containers_are_found_by_name() {
        let (_dir, store) = store().await;
        let c = store.create_container("data").await.unwrap();
        store.create_container("other").await.unwrap();

        let found = store.find_containers("data").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, c.id);
        assert!(store.get_container("does-not-exist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let (_dir, store) = store().await;
        let c = store.create_container("data").await.unwrap();
        let err = store
            .create_item(&c.id, "../escape.json", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
        assert!(store.get_container("..").await.unwrap().is_none());
    }
}
