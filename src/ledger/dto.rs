use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
    error::AppError,
    ledger::repo_types::{Book, Transaction},
    records::DeleteReport,
    storage::ItemMeta,
};

/// Body of `POST /ledger`, checked field by field so clients get a precise
/// message instead of a generic decode error.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerInput {
    pub books: Vec<Book>,
    pub transactions: Vec<Transaction>,
    pub selected_book_id: Option<String>,
}

impl LedgerInput {
    pub fn from_json(body: Value) -> Result<Self, AppError> {
        let Value::Object(mut obj) = body else {
            return Err(AppError::Validation("Request body must be a JSON object".into()));
        };
        let books = decode_array(&mut obj, "books", "Books must be an array")?;
        let transactions =
            decode_array(&mut obj, "transactions", "Transactions must be an array")?;
        let selected_book_id = match obj.remove("selectedBookId") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => {
                return Err(AppError::Validation(
                    "Selected book ID must be a string".into(),
                ))
            }
        };
        Ok(Self {
            books,
            transactions,
            selected_book_id,
        })
    }
}

fn decode_array<T: DeserializeOwned>(
    obj: &mut Map<String, Value>,
    field: &str,
    not_array: &str,
) -> Result<Vec<T>, AppError> {
    let Some(Value::Array(items)) = obj.remove(field) else {
        return Err(AppError::Validation(not_array.to_string()));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value(v)
                .map_err(|e| AppError::Validation(format!("{field}[{i}]: {e}")))
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCreated {
    pub backup_id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub size: Option<u64>,
}

impl From<ItemMeta> for BackupSummary {
    fn from(m: ItemMeta) -> Self {
        Self {
            id: m.id,
            name: m.name,
            created_at: m.created_at,
            size: m.size,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteAccountRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AccountDeleted {
    pub attempted: usize,
    pub removed: usize,
}

impl From<DeleteReport> for AccountDeleted {
    fn from(r: DeleteReport) -> Self {
        Self {
            attempted: r.attempted,
            removed: r.removed,
        }
    }
}
