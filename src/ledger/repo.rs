use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::{
    ledger::repo_types::{BackupDocument, LedgerSnapshot},
    records::{name_timestamp, Record, RecordKind, RecordStore},
    storage::{ItemMeta, StorageResult},
};

impl LedgerSnapshot {
    pub async fn load(
        records: &RecordStore,
        user_id: Uuid,
    ) -> StorageResult<Option<LedgerSnapshot>> {
        Ok(records
            .find_by_natural_key::<LedgerSnapshot>(RecordKind::Ledger, &user_id.to_string())
            .await?
            .map(|r| r.value))
    }

    /// One backing item per user: overwritten if present, created otherwise.
    pub async fn store(&self, records: &RecordStore, user_id: Uuid) -> StorageResult<ItemMeta> {
        records
            .upsert(RecordKind::Ledger, &user_id.to_string(), self)
            .await
    }
}

/// Item-name prefix shared by every backup of `user_id`.
pub fn backup_key_prefix(user_id: Uuid) -> String {
    format!("{user_id}_")
}

impl BackupDocument {
    pub async fn create(&self, records: &RecordStore) -> StorageResult<ItemMeta> {
        let key = format!(
            "{}{}",
            backup_key_prefix(self.original_user_id),
            name_timestamp(self.backup_created_at)
        );
        records.create_record(RecordKind::Backup, &key, self).await
    }

    /// Newest first.
    pub async fn list_for(records: &RecordStore, user_id: Uuid) -> StorageResult<Vec<ItemMeta>> {
        let mut items = records
            .list_records(RecordKind::Backup, &backup_key_prefix(user_id))
            .await?;
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(items)
    }

    /// Looks up `item_id` and decodes it only when its name marks it as one
    /// of `user_id`'s backups. Foreign and non-backup items read as absent.
    pub async fn read_owned(
        records: &RecordStore,
        item_id: &str,
        user_id: Uuid,
    ) -> StorageResult<Option<Record<BackupDocument>>> {
        let Some(item) = records.item_metadata(item_id).await? else {
            return Ok(None);
        };
        if !Self::owned_by(&item, user_id) {
            warn!(%user_id, item = %item.name, "restore of foreign or non-backup item refused");
            return Ok(None);
        }
        records.read_record(item).await
    }

    /// Ownership is encoded in the item name.
    pub fn owned_by(item: &ItemMeta, user_id: Uuid) -> bool {
        let prefix = format!(
            "{}{}",
            RecordKind::Backup.prefix(),
            backup_key_prefix(user_id)
        );
        item.name.starts_with(&prefix)
    }
}

pub(crate) fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
