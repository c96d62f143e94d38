use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::repo_types::User,
    records::{Record, RecordKind, RecordStore},
    storage::{ItemMeta, StorageResult},
};

impl User {
    /// Linear scan over every user document.
    pub async fn find_by_email(
        records: &RecordStore,
        email: &str,
    ) -> StorageResult<Option<Record<User>>> {
        records
            .find_by_field(RecordKind::User, "email", &Value::String(email.to_string()))
            .await
    }

    pub async fn find_by_id(
        records: &RecordStore,
        id: Uuid,
    ) -> StorageResult<Option<Record<User>>> {
        records
            .find_by_natural_key(RecordKind::User, &id.to_string())
            .await
    }

    /// Writes a new user document. Email uniqueness is the caller's check.
    pub async fn create(records: &RecordStore, user: &User) -> StorageResult<ItemMeta> {
        records
            .create_record(RecordKind::User, &user.id.to_string(), user)
            .await
    }

    /// Stamps `lastLogin` on the item the record was read from.
    pub async fn touch_last_login(
        records: &RecordStore,
        record: &Record<User>,
        at: OffsetDateTime,
    ) -> StorageResult<()> {
        let mut user = record.value.clone();
        user.last_login = Some(at);
        records.overwrite_item(&record.item, &user).await
    }
}
