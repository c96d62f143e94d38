use std::sync::Arc;

use axum::extract::FromRef;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    ledger::{
        dto::{BackupCreated, BackupSummary, LedgerInput},
        repo::now,
        repo_types::{BackupDocument, LedgerSnapshot},
    },
    records::{DeleteReport, RecordStore},
    state::AppState,
    storage::StorageError,
};

/// Per-user ledger snapshot and backup management.
#[derive(Clone)]
pub struct LedgerService {
    records: Arc<RecordStore>,
}

impl FromRef<AppState> for LedgerService {
    fn from_ref(state: &AppState) -> Self {
        state.ledger.clone()
    }
}

impl LedgerService {
    pub fn new(records: Arc<RecordStore>) -> Self {
        Self { records }
    }

    /// First-time users get the empty ledger, not an error.
    #[instrument(skip(self))]
    pub async fn get_snapshot(&self, user_id: Uuid) -> Result<LedgerSnapshot, AppError> {
        Ok(LedgerSnapshot::load(&self.records, user_id)
            .await?
            .unwrap_or_default())
    }

    /// Last writer wins; concurrent saves for one user are not detected.
    #[instrument(skip(self, input), fields(books = input.books.len(), transactions = input.transactions.len()))]
    pub async fn save_snapshot(
        &self,
        user_id: Uuid,
        input: LedgerInput,
    ) -> Result<LedgerSnapshot, AppError> {
        let snapshot = LedgerSnapshot {
            user_id: None,
            books: input.books,
            transactions: input.transactions,
            selected_book_id: input.selected_book_id,
            last_modified: None,
        };
        self.write(user_id, snapshot).await
    }

    async fn write(
        &self,
        user_id: Uuid,
        mut snapshot: LedgerSnapshot,
    ) -> Result<LedgerSnapshot, AppError> {
        let pruned = snapshot.prune_orphans();
        if pruned > 0 {
            warn!(%user_id, pruned, "dropped transactions of deleted books");
        }
        snapshot.user_id = Some(user_id);
        snapshot.last_modified = Some(now());
        snapshot.store(&self.records, user_id).await?;
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    pub async fn create_backup(&self, user_id: Uuid) -> Result<BackupCreated, AppError> {
        let snapshot = LedgerSnapshot::load(&self.records, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("No ledger data found to backup".into()))?;
        let doc = BackupDocument {
            snapshot,
            backup_created_at: now(),
            original_user_id: user_id,
        };
        let item = doc.create(&self.records).await?;
        info!(%user_id, backup = %item.name, "backup created");
        Ok(BackupCreated {
            backup_id: item.id,
            name: item.name,
            created_at: item.created_at,
        })
    }

    #[instrument(skip(self))]
    pub async fn list_backups(&self, user_id: Uuid) -> Result<Vec<BackupSummary>, AppError> {
        let items = BackupDocument::list_for(&self.records, user_id).await?;
        Ok(items.into_iter().map(BackupSummary::from).collect())
    }

    /// Replaces the current snapshot with the backup's content. Backups of
    /// other users answer exactly like missing ones.
    #[instrument(skip(self))]
    pub async fn restore_backup(
        &self,
        user_id: Uuid,
        backup_id: &str,
    ) -> Result<LedgerSnapshot, AppError> {
        let record = match BackupDocument::read_owned(&self.records, backup_id, user_id).await {
            Ok(r) => r,
            // ids the backend cannot even address
            Err(StorageError::Rejected(reason)) => {
                warn!(%user_id, %reason, "malformed backup id");
                None
            }
            Err(e) => return Err(e.into()),
        }
        .ok_or_else(|| AppError::NotFound("Backup not found".into()))?;
        let restored = self.write(user_id, record.value.snapshot).await?;
        info!(%user_id, backup = %record.item.name, "backup restored");
        Ok(restored)
    }

    /// Removes every record whose name carries the user id. Call only after
    /// the user's password has been re-checked.
    #[instrument(skip(self))]
    pub async fn delete_all_user_data(&self, user_id: Uuid) -> Result<DeleteReport, AppError> {
        let report = self
            .records
            .delete_all_matching(&user_id.to_string())
            .await?;
        if report.failed > 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "account data partially deleted: removed {} of {} items",
                report.removed,
                report.attempted
            )));
        }
        info!(%user_id, removed = report.removed, "user data deleted");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{
            dto::LoginRequest,
            repo_types::User,
            services::tests::{register_req, service},
        },
        ledger::repo_types::{Book, Transaction, TxKind},
        records::RecordKind,
        storage::memory::MemoryStore,
    };
    use serde_json::json;

    async fn ledger() -> (Arc<MemoryStore>, Arc<RecordStore>, LedgerService) {
        let (mem, records, _auth) = service().await;
        (mem, records.clone(), LedgerService::new(records))
    }

    fn main_book() -> LedgerInput {
        LedgerInput {
            books: vec![Book {
                id: "b1".into(),
                name: "Main".into(),
                created_at: None,
            }],
            transactions: vec![],
            selected_book_id: Some("b1".into()),
        }
    }

    fn with_tx(mut input: LedgerInput, id: &str, amount: f64) -> LedgerInput {
        input.transactions.push(Transaction {
            id: id.into(),
            book_id: "b1".into(),
            date: "2024-05-01".into(),
            description: "salary".into(),
            amount,
            kind: TxKind::Income,
        });
        input
    }

    #[tokio::test]
    async fn new_user_gets_empty_ledger() {
        let (_mem, _records, ledger) = ledger().await;
        let snap = ledger.get_snapshot(Uuid::new_v4()).await.unwrap();
        assert_eq!(
            serde_json::to_value(&snap).unwrap(),
            json!({"books": [], "transactions": [], "selectedBookId": null})
        );
    }

    #[tokio::test]
    async fn read_outage_is_not_empty_ledger() {
        let (mem, _records, ledger) = ledger().await;
        mem.set_fail_reads(true);
        let err = ledger.get_snapshot(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));
    }

    #[tokio::test]
    async fn save_then_get_roundtrips_and_is_idempotent() {
        let (_mem, records, ledger) = ledger().await;
        let user = Uuid::new_v4();
        let input = with_tx(main_book(), "t1", 100.0);

        ledger.save_snapshot(user, input.clone()).await.unwrap();
        ledger.save_snapshot(user, input.clone()).await.unwrap();
        let snap = ledger.get_snapshot(user).await.unwrap();
        assert_eq!(snap.books, input.books);
        assert_eq!(snap.transactions, input.transactions);
        assert_eq!(snap.selected_book_id.as_deref(), Some("b1"));
        assert_eq!(snap.user_id, Some(user));
        assert!(snap.last_modified.is_some());

        let items = records
            .list_records(RecordKind::Ledger, &user.to_string())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn save_prunes_orphan_transactions() {
        let (_mem, _records, ledger) = ledger().await;
        let user = Uuid::new_v4();
        let mut input = with_tx(main_book(), "t1", 1.0);
        input.transactions[0].book_id = "deleted".into();
        input.selected_book_id = Some(String::new());

        let saved = ledger.save_snapshot(user, input).await.unwrap();
        assert!(saved.transactions.is_empty());
        assert_eq!(saved.selected_book_id, None);
    }

    #[tokio::test]
    async fn backup_requires_existing_ledger() {
        let (_mem, _records, ledger) = ledger().await;
        let err = ledger.create_backup(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn restore_brings_back_state_at_backup_time() {
        let (_mem, _records, ledger) = ledger().await;
        let user = Uuid::new_v4();
        ledger
            .save_snapshot(user, with_tx(main_book(), "t1", 10.0))
            .await
            .unwrap();
        let backup = ledger.create_backup(user).await.unwrap();
        assert!(backup.name.starts_with(&format!("backup_{user}_")));

        ledger
            .save_snapshot(user, with_tx(with_tx(main_book(), "t1", 10.0), "t2", 20.0))
            .await
            .unwrap();
        assert_eq!(ledger.get_snapshot(user).await.unwrap().transactions.len(), 2);

        let restored = ledger.restore_backup(user, &backup.backup_id).await.unwrap();
        assert_eq!(restored.transactions.len(), 1);
        let current = ledger.get_snapshot(user).await.unwrap();
        assert_eq!(current.transactions.len(), 1);
        assert_eq!(current.transactions[0].id, "t1");

        let stored = serde_json::to_value(&current).unwrap();
        assert!(stored.get("backupCreatedAt").is_none());
    }

    #[tokio::test]
    async fn backups_list_newest_first_and_per_user() {
        let (_mem, _records, ledger) = ledger().await;
        let (ann, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.save_snapshot(ann, main_book()).await.unwrap();
        ledger.save_snapshot(bob, main_book()).await.unwrap();

        let first = ledger.create_backup(ann).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = ledger.create_backup(ann).await.unwrap();
        ledger.create_backup(bob).await.unwrap();

        let list = ledger.list_backups(ann).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.backup_id);
        assert_eq!(list[1].id, first.backup_id);
    }

    #[tokio::test]
    async fn restore_refuses_foreign_or_missing_backup() {
        let (_mem, _records, ledger) = ledger().await;
        let (ann, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.save_snapshot(ann, main_book()).await.unwrap();
        let backup = ledger.create_backup(ann).await.unwrap();

        let err = ledger.restore_backup(bob, &backup.backup_id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(ledger.get_snapshot(bob).await.unwrap().books.is_empty());

        let err = ledger.restore_backup(ann, "missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn restore_of_non_backup_item_is_not_found() {
        let (_mem, records, auth) = service().await;
        let ledger = LedgerService::new(records.clone());
        let reg = auth.register(register_req("a@x.com")).await.unwrap();
        let user = reg.user.id;
        ledger.save_snapshot(user, main_book()).await.unwrap();

        let user_item = User::find_by_email(&records, "a@x.com")
            .await
            .unwrap()
            .unwrap()
            .item;
        let ledger_item = records
            .find_by_natural_key::<serde_json::Value>(RecordKind::Ledger, &user.to_string())
            .await
            .unwrap()
            .unwrap()
            .item;

        for id in [&user_item.id, &ledger_item.id] {
            let err = ledger.restore_backup(user, id).await.unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)), "{id}: {err:?}");
        }
        assert_eq!(ledger.get_snapshot(user).await.unwrap().books.len(), 1);
    }

    #[tokio::test]
    async fn delete_all_user_data_cascades() {
        let (_mem, records, auth) = service().await;
        let ledger = LedgerService::new(records.clone());
        let reg = auth.register(register_req("a@x.com")).await.unwrap();
        let other = auth.register(register_req("b@x.com")).await.unwrap();
        let user = reg.user.id;
        ledger.save_snapshot(user, main_book()).await.unwrap();
        ledger.create_backup(user).await.unwrap();

        let report = ledger.delete_all_user_data(user).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.removed, 3);

        assert!(User::find_by_email(&records, "a@x.com").await.unwrap().is_none());
        assert!(ledger.list_backups(user).await.unwrap().is_empty());
        assert!(ledger.get_snapshot(user).await.unwrap().books.is_empty());
        assert!(auth
            .login(LoginRequest {
                email: "a@x.com".into(),
                password: "Passw0rd".into(),
            })
            .await
            .is_err());
        assert!(User::find_by_id(&records, other.user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_delete_is_internal_error() {
        let (mem, _records, ledger) = ledger().await;
        let user = Uuid::new_v4();
        ledger.save_snapshot(user, main_book()).await.unwrap();
        mem.set_fail_writes(true);
        let err = ledger.delete_all_user_data(user).await.unwrap_err();
        match err {
            AppError::Internal(e) => assert!(e.to_string().contains("removed 0 of 1")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
