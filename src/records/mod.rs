//! Record store on top of a flat [`FileStore`] container.
//!
//! Each record is one pretty-printed JSON document whose item name is derived
//! from its kind and natural key. There is no index: `find_by_field` lists
//! every item of a kind and decodes them one by one, so it is O(n) in the
//! number of records of that kind. Nothing here is transactional; the last
//! writer wins.

use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, instrument, warn};

use crate::storage::{
    container::{ensure_container, ContainerId, ContainerOptions},
    FileStore, ItemMeta, NameFilter, StorageError, StorageResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    User,
    Ledger,
    Backup,
}

impl RecordKind {
    pub fn prefix(self) -> &'static str {
        match self {
            RecordKind::User => "user_",
            RecordKind::Ledger => "ledger_",
            RecordKind::Backup => "backup_",
        }
    }

    /// Item name for a natural key, e.g. `user_<id>.json`.
    pub fn item_name(self, natural_key: &str) -> String {
        format!("{}{}.json", self.prefix(), natural_key)
    }
}

/// Timestamp usable inside an item name: RFC 3339 UTC with `:` and `.`
/// replaced, so names sort chronologically.
pub fn name_timestamp(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
        .replace([':', '.'], "-")
}

/// A decoded document together with the item that backs it.
#[derive(Debug, Clone)]
pub struct Record<T> {
    pub item: ItemMeta,
    pub value: T,
}

/// Outcome of a best-effort bulk delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeleteReport {
    pub attempted: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct RecordStore {
    files: Arc<dyn FileStore>,
    container: ContainerId,
    op_timeout: Duration,
}

impl RecordStore {
    /// Resolves the container once; every record operation is scoped to it.
    pub async fn open(
        files: Arc<dyn FileStore>,
        container: &ContainerOptions,
        op_timeout: Duration,
    ) -> StorageResult<Self> {
        let container = ensure_container(files.as_ref(), container).await?;
        Ok(Self {
            files,
            container,
            op_timeout,
        })
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                warn!(op, timeout = ?self.op_timeout, "storage call timed out");
                Err(StorageError::Timeout(op))
            }
        }
    }

    async fn list(&self, filter: NameFilter) -> StorageResult<Vec<ItemMeta>> {
        self.call(
            "list_items",
            self.files.list_items(self.container.as_str(), &filter),
        )
        .await
    }

    async fn fetch_text(&self, item: &ItemMeta) -> StorageResult<String> {
        self.call("get_item_content", self.files.get_item_content(&item.id))
            .await?
            .into_text(&item.name)
    }

    async fn fetch<T: DeserializeOwned>(&self, item: ItemMeta) -> StorageResult<Record<T>> {
        let text = self.fetch_text(&item).await?;
        let value = decode(&item.name, &text)?;
        Ok(Record { item, value })
    }

    /// Writes a new item for `kind`/`natural_key`. No existence check.
    #[instrument(skip(self, payload))]
    pub async fn create_record<T: Serialize>(
        &self,
        kind: RecordKind,
        natural_key: &str,
        payload: &T,
    ) -> StorageResult<ItemMeta> {
        let name = kind.item_name(natural_key);
        let body = encode(&name, payload)?;
        let item = self
            .call(
                "create_item",
                self.files.create_item(self.container.as_str(), &name, body),
            )
            .await?;
        debug!(item_id = %item.id, %name, "record created");
        Ok(item)
    }

    /// Linear scan: first record of `kind` whose top-level `field` equals
    /// `value`. Undecodable documents are skipped; transport errors abort.
    #[instrument(skip(self, value))]
    pub async fn find_by_field<T: DeserializeOwned>(
        &self,
        kind: RecordKind,
        field: &str,
        value: &serde_json::Value,
    ) -> StorageResult<Option<Record<T>>> {
        let items = self.list(NameFilter::Prefix(kind.prefix().to_string())).await?;
        debug!(candidates = items.len(), "scanning records");
        for item in items {
            let text = match self.fetch_text(&item).await {
                Ok(t) => t,
                // listed, then deleted before we got to it
                Err(StorageError::NotFound(_)) => continue,
                Err(StorageError::Corrupt { name, reason }) => {
                    warn!(%name, %reason, "skipping unreadable record");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let doc: serde_json::Value = match serde_json::from_str(&text) {
                Ok(d) => d,
                Err(e) => {
                    warn!(name = %item.name, error = %e, "skipping unparsable record");
                    continue;
                }
            };
            if doc.get(field) != Some(value) {
                continue;
            }
            match serde_json::from_value::<T>(doc) {
                Ok(v) => return Ok(Some(Record { item, value: v })),
                Err(e) => {
                    warn!(name = %item.name, error = %e, "matching record has unexpected shape");
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Exact-name lookup.
    #[instrument(skip(self))]
    pub async fn find_by_natural_key<T: DeserializeOwned>(
        &self,
        kind: RecordKind,
        natural_key: &str,
    ) -> StorageResult<Option<Record<T>>> {
        let mut items = self.list(NameFilter::Exact(kind.item_name(natural_key))).await?;
        if items.len() > 1 {
            warn!(count = items.len(), "duplicate items for natural key; using the oldest");
        }
        if items.is_empty() {
            return Ok(None);
        }
        match self.fetch(items.swap_remove(0)).await {
            Ok(r) => Ok(Some(r)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Metadata of the item `item_id`, or `None` when it is gone. Nothing is
    /// downloaded, so callers can vet the name before decoding.
    pub async fn item_metadata(&self, item_id: &str) -> StorageResult<Option<ItemMeta>> {
        match self
            .call("get_item_metadata", self.files.get_item_metadata(item_id))
            .await
        {
            Ok(m) => Ok(Some(m)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Downloads and decodes `item`, returning `None` when it vanished since
    /// it was listed.
    pub async fn read_record<T: DeserializeOwned>(
        &self,
        item: ItemMeta,
    ) -> StorageResult<Option<Record<T>>> {
        match self.fetch(item).await {
            Ok(r) => Ok(Some(r)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replaces the content of an existing item.
    pub async fn overwrite_item<T: Serialize>(
        &self,
        item: &ItemMeta,
        payload: &T,
    ) -> StorageResult<()> {
        let body = encode(&item.name, payload)?;
        self.call(
            "update_item_content",
            self.files.update_item_content(&item.id, body),
        )
        .await
    }

    /// Overwrites the single item named by `kind`/`natural_key`, creating it
    /// if absent.
    #[instrument(skip(self, payload))]
    pub async fn upsert<T: Serialize>(
        &self,
        kind: RecordKind,
        natural_key: &str,
        payload: &T,
    ) -> StorageResult<ItemMeta> {
        let name = kind.item_name(natural_key);
        let existing = self.list(NameFilter::Exact(name.clone())).await?;
        match existing.into_iter().next() {
            Some(item) => {
                self.overwrite_item(&item, payload).await?;
                debug!(item_id = %item.id, %name, "record overwritten");
                Ok(item)
            }
            None => self.create_record(kind, natural_key, payload).await,
        }
    }

    /// Metadata of every record of `kind` whose natural key starts with
    /// `key_prefix`, in backend order.
    pub async fn list_records(
        &self,
        kind: RecordKind,
        key_prefix: &str,
    ) -> StorageResult<Vec<ItemMeta>> {
        self.list(NameFilter::Prefix(format!("{}{}", kind.prefix(), key_prefix)))
            .await
    }

    /// Deletes every item whose name contains `needle`, concurrently. Partial
    /// failure is reported, not rolled back or retried.
    #[instrument(skip(self))]
    pub async fn delete_all_matching(&self, needle: &str) -> StorageResult<DeleteReport> {
        if needle.is_empty() {
            return Err(StorageError::Rejected("refusing to delete with an empty match".into()));
        }
        let items = self.list(NameFilter::Contains(needle.to_string())).await?;
        let results = join_all(items.iter().map(|item| async move {
            let res = self
                .call("delete_item", self.files.delete_item(&item.id))
                .await;
            (item, res)
        }))
        .await;

        let mut report = DeleteReport {
            attempted: results.len(),
            ..Default::default()
        };
        for (item, res) in results {
            match res {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(name = %item.name, error = %e, "delete failed");
                    report.failed += 1;
                }
            }
        }
        debug!(?report, "bulk delete finished");
        Ok(report)
    }
}

fn encode<T: Serialize>(name: &str, payload: &T) -> StorageResult<Bytes> {
    serde_json::to_vec_pretty(payload)
        .map(Bytes::from)
        .map_err(|e| StorageError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn decode<T: DeserializeOwned>(name: &str, text: &str) -> StorageResult<T> {
    serde_json::from_str(text).map_err(|e| StorageError::Corrupt {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;
    use time::macros::datetime;

    pub(crate) async fn open_memory() -> (Arc<MemoryStore>, RecordStore) {
        let mem = Arc::new(MemoryStore::new());
        let store = RecordStore::open(
            mem.clone(),
            &ContainerOptions::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (mem, store)
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        id: String,
        email: String,
    }

    #[test]
    fn item_names_follow_kind_prefix() {
        assert_eq!(RecordKind::User.item_name("u1"), "user_u1.json");
        assert_eq!(RecordKind::Ledger.item_name("u1"), "ledger_u1.json");
        assert_eq!(RecordKind::Backup.item_name("u1_t"), "backup_u1_t.json");
    }

    #[test]
    fn name_timestamp_has_no_colons_or_dots() {
        let ts = name_timestamp(datetime!(2024-05-01 12:30:45 UTC));
        assert_eq!(ts, "2024-05-01T12-30-45Z");
    }

    #[tokio::test]
    async fn find_by_field_scans_kind() {
        let (_mem, store) = open_memory().await;
        for (id, email) in [("1", "a@x.com"), ("2", "b@x.com")] {
            store
                .create_record(RecordKind::User, id, &Doc { id: id.into(), email: email.into() })
                .await
                .unwrap();
        }
        // same field, different kind: must not match
        store
            .create_record(RecordKind::Ledger, "3", &json!({"email": "c@x.com"}))
            .await
            .unwrap();

        let hit: Record<Doc> = store
            .find_by_field(RecordKind::User, "email", &json!("b@x.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.value.id, "2");
        assert_eq!(hit.item.name, "user_2.json");

        let miss: Option<Record<Doc>> = store
            .find_by_field(RecordKind::User, "email", &json!("c@x.com"))
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn find_by_field_skips_corrupt_documents() {
        let (mem, store) = open_memory().await;
        mem.create_item(
            store.container().as_str(),
            "user_bad.json",
            Bytes::from_static(b"not json"),
        )
        .await
        .unwrap();
        store
            .create_record(RecordKind::User, "ok", &Doc { id: "ok".into(), email: "a@x.com".into() })
            .await
            .unwrap();

        let hit: Option<Record<Doc>> = store
            .find_by_field(RecordKind::User, "email", &json!("a@x.com"))
            .await
            .unwrap();
        assert_eq!(hit.unwrap().value.id, "ok");
    }

    #[tokio::test]
    async fn find_by_field_propagates_outage() {
        let (mem, store) = open_memory().await;
        mem.set_fail_reads(true);
        let res: StorageResult<Option<Record<Doc>>> = store
            .find_by_field(RecordKind::User, "email", &json!("a@x.com"))
            .await;
        assert!(matches!(res, Err(StorageError::Unavailable(_))));
    }

    #[tokio::test]
    async fn upsert_keeps_a_single_item() {
        let (mem, store) = open_memory().await;
        store
            .upsert(RecordKind::Ledger, "u1", &json!({"v": 1}))
            .await
            .unwrap();
        store
            .upsert(RecordKind::Ledger, "u1", &json!({"v": 2}))
            .await
            .unwrap();

        let items = mem
            .list_items(
                store.container().as_str(),
                &NameFilter::Exact("ledger_u1.json".into()),
            )
            .await
            .unwrap();
        assert_eq!(items.len(), 1);

        let rec: Record<serde_json::Value> = store
            .find_by_natural_key(RecordKind::Ledger, "u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.value, json!({"v": 2}));
    }

    #[tokio::test]
    async fn find_by_natural_key_distinguishes_absence_from_failure() {
        let (mem, store) = open_memory().await;
        let none: Option<Record<serde_json::Value>> = store
            .find_by_natural_key(RecordKind::Ledger, "nobody")
            .await
            .unwrap();
        assert!(none.is_none());

        mem.set_fail_reads(true);
        let err = store
            .find_by_natural_key::<serde_json::Value>(RecordKind::Ledger, "nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }

    #[tokio::test]
    async fn item_metadata_returns_none_for_unknown_id() {
        let (_mem, store) = open_memory().await;
        assert!(store.item_metadata("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_record_returns_none_once_item_is_deleted() {
        let (mem, store) = open_memory().await;
        let item = store
            .create_record(RecordKind::Ledger, "u1", &serde_json::json!({"books": []}))
            .await
            .unwrap();
        let meta = store.item_metadata(&item.id).await.unwrap().unwrap();
        assert_eq!(meta.name, "ledger_u1.json");

        mem.delete_item(&item.id).await.unwrap();
        let rec: Option<Record<serde_json::Value>> = store.read_record(meta).await.unwrap();
        assert!(rec.is_none());
    }

    #[tokio::test]
    async fn delete_all_matching_reports_counts() {
        let (mem, store) = open_memory().await;
        store.create_record(RecordKind::User, "u1", &json!({})).await.unwrap();
        store.create_record(RecordKind::Ledger, "u1", &json!({})).await.unwrap();
        store
            .create_record(RecordKind::Backup, "u1_2024", &json!({}))
            .await
            .unwrap();
        store.create_record(RecordKind::User, "u2", &json!({})).await.unwrap();

        let report = store.delete_all_matching("u1").await.unwrap();
        assert_eq!(
            report,
            DeleteReport {
                attempted: 3,
                removed: 3,
                failed: 0
            }
        );

        let left = mem
            .list_items(store.container().as_str(), &NameFilter::Prefix(String::new()))
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "user_u2.json");
    }

    #[tokio::test]
    async fn delete_all_matching_reports_partial_failure() {
        let (mem, store) = open_memory().await;
        store.create_record(RecordKind::User, "u1", &json!({})).await.unwrap();
        store.create_record(RecordKind::Ledger, "u1", &json!({})).await.unwrap();

        mem.set_fail_writes(true);
        let report = store.delete_all_matching("u1").await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.removed, 0);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn delete_all_matching_refuses_empty_needle() {
        let (_mem, store) = open_memory().await;
        assert!(store.delete_all_matching("").await.is_err());
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        use async_trait::async_trait;
        use crate::storage::ItemBody;

        struct Stalled(MemoryStore);

        #[async_trait]
        impl FileStore for Stalled {
            async fn list_items(&self, _: &str, _: &NameFilter) -> StorageResult<Vec<ItemMeta>> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(vec![])
            }
            async fn create_item(&self, c: &str, n: &str, b: Bytes) -> StorageResult<ItemMeta> {
                self.0.create_item(c, n, b).await
            }
            async fn get_item_content(&self, id: &str) -> StorageResult<ItemBody> {
                self.0.get_item_content(id).await
            }
            async fn update_item_content(&self, id: &str, b: Bytes) -> StorageResult<()> {
                self.0.update_item_content(id, b).await
            }
            async fn delete_item(&self, id: &str) -> StorageResult<()> {
                self.0.delete_item(id).await
            }
            async fn get_item_metadata(&self, id: &str) -> StorageResult<ItemMeta> {
                self.0.get_item_metadata(id).await
            }
            async fn get_container(&self, id: &str) -> StorageResult<Option<ItemMeta>> {
                self.0.get_container(id).await
            }
            async fn find_containers(&self, name: &str) -> StorageResult<Vec<ItemMeta>> {
                self.0.find_containers(name).await
            }
            async fn create_container(&self, name: &str) -> StorageResult<ItemMeta> {
                self.0.create_container(name).await
            }
            fn backend_name(&self) -> &'static str {
                "stalled"
            }
        }

        let store = RecordStore::open(
            Arc::new(Stalled(MemoryStore::new())),
            &ContainerOptions::default(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let err = store
            .find_by_natural_key::<serde_json::Value>(RecordKind::Ledger, "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Timeout("list_items")));
    }
}
