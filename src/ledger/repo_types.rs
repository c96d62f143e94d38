use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Income,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub book_id: String,
    pub date: String,
    #[serde(default)]
    pub description: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: TxKind,
}

/// Current ledger state of one user, stored as `ledger_<userId>.json` and
/// overwritten wholesale on every save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub books: Vec<Book>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub selected_book_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_modified: Option<OffsetDateTime>,
}

impl LedgerSnapshot {
    /// Drops transactions whose book is gone and clears a selection that
    /// points nowhere. Returns the number of transactions removed.
    pub fn prune_orphans(&mut self) -> usize {
        let ids: HashSet<&str> = self.books.iter().map(|b| b.id.as_str()).collect();
        let before = self.transactions.len();
        self.transactions
            .retain(|t| ids.contains(t.book_id.as_str()));
        let dangling = self
            .selected_book_id
            .as_deref()
            .map_or(false, |id| !ids.contains(id));
        if dangling {
            self.selected_book_id = None;
        }
        before - self.transactions.len()
    }
}

/// Frozen copy of a snapshot, stored as `backup_<userId>_<timestamp>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    #[serde(flatten)]
    pub snapshot: LedgerSnapshot,
    #[serde(with = "time::serde::rfc3339")]
    pub backup_created_at: OffsetDateTime,
    pub original_user_id: Uuid,
}
