use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{FileStore, ItemBody, ItemMeta, NameFilter, StorageError, StorageResult};

/// Process-local file store.
///
/// Used by tests and throwaway dev runs. Reads and writes can be made to fail
/// independently to exercise the outage paths of the layers above.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, ItemMeta>,
    items: HashMap<String, Entry>,
}

struct Entry {
    container: String,
    meta: ItemMeta,
    body: Bytes,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned map is still structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_read(&self, op: &str) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{op}: injected read failure")));
        }
        Ok(())
    }

    fn check_write(&self, op: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{op}: injected write failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn list_items(
        &self,
        container: &str,
        filter: &NameFilter,
    ) -> StorageResult<Vec<ItemMeta>> {
        self.check_read("list_items")?;
        let inner = self.lock();
        let mut out: Vec<ItemMeta> = inner
            .items
            .values()
            .filter(|e| e.container == container && filter.matches(&e.meta.name))
            .map(|e| e.meta.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn create_item(
        &self,
        container: &str,
        name: &str,
        body: Bytes,
    ) -> StorageResult<ItemMeta> {
        self.check_write("create_item")?;
        let mut inner = self.lock();
        if !inner.containers.contains_key(container) {
            return Err(StorageError::NotFound(format!("container {container}")));
        }
        let meta = ItemMeta {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
            size: Some(body.len() as u64),
        };
        inner.items.insert(
            meta.id.clone(),
            Entry {
                container: container.to_string(),
                meta: meta.clone(),
                body,
            },
        );
        Ok(meta)
    }

    async fn get_item_content(&self, id: &str) -> StorageResult<ItemBody> {
        self.check_read("get_item_content")?;
        let inner = self.lock();
        inner
            .items
            .get(id)
            .map(|e| ItemBody::Binary(e.body.clone()))
            .ok_or_else(|| StorageError::NotFound(format!("item {id}")))
    }

    async fn update_item_content(&self, id: &str, body: Bytes) -> StorageResult<()> {
        self.check_write("update_item_content")?;
        let mut inner = self.lock();
        let entry = inner
            .items
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("item {id}")))?;
        entry.meta.size = Some(body.len() as u64);
        entry.body = body;
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> StorageResult<()> {
        self.check_write("delete_item")?;
        let mut inner = self.lock();
        inner
            .items
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("item {id}")))
    }

    async fn get_item_metadata(&self, id: &str) -> StorageResult<ItemMeta> {
        self.check_read("get_item_metadata")?;
        let inner = self.lock();
        inner
            .items
            .get(id)
            .map(|e| e.meta.clone())
            .ok_or_else(|| StorageError::NotFound(format!("item {id}")))
    }

    async fn get_container(&self, id: &str) -> StorageResult<Option<ItemMeta>> {
        self.check_read("get_container")?;
        Ok(self.lock().containers.get(id).cloned())
    }

    async fn find_containers(&self, name: &str) -> StorageResult<Vec<ItemMeta>> {
        self.check_read("find_containers")?;
        let inner = self.lock();
        let mut out: Vec<ItemMeta> = inner
            .containers
            .values()
            .filter(|c| c.name == name)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn create_container(&self, name: &str) -> StorageResult<ItemMeta> {
        self.check_write("create_container")?;
        let meta = ItemMeta {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
            size: None,
        };
        self.lock().containers.insert(meta.id.clone(), meta.clone());
        Ok(meta)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_are_scoped_to_their_container() {
        let store = MemoryStore::new();
        let a = store.create_container("a").await.unwrap();
        let b = store.create_container("b").await.unwrap();
        store
            .create_item(&a.id, "user_1.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
            .create_item(&b.id, "user_2.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let in_a = store
            .list_items(&a.id, &NameFilter::Prefix("user_".into()))
            .await
            .unwrap();
        assert_eq!(in_a.len(), 1);
        assert_eq!(in_a[0].name, "user_1.json");
    }

    #[tokio::test]
    async fn create_in_unknown_container_fails() {
        let store = MemoryStore::new();
        let err = store
            .create_item("nope", "x.json", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let store = MemoryStore::new();
        let c = store.create_container("c").await.unwrap();

        store.set_fail_writes(true);
        let err = store
            .create_item(&c.id, "x.json", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        store.set_fail_writes(false);

        store.set_fail_reads(true);
        let err = store.list_items(&c.id, &NameFilter::Prefix(String::new())).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_items() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_item_content("missing", Bytes::new()).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_item("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
