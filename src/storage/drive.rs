use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    credentials::TokenSource, FileStore, ItemBody, ItemMeta, NameFilter, StorageError,
    StorageResult,
};

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const JSON: &str = "application/json";
const FILE_FIELDS: &str = "id,name,createdTime,size,mimeType,trashed";
const PAGE_SIZE: &str = "1000";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_time: Option<OffsetDateTime>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    trashed: bool,
}

impl From<DriveFile> for ItemMeta {
    fn from(f: DriveFile) -> Self {
        ItemMeta {
            id: f.id,
            name: f.name,
            created_at: f.created_time.unwrap_or_else(OffsetDateTime::now_utc),
            size: f.size.and_then(|s| s.parse().ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Google Drive v3 backed file store. A container is a Drive folder.
pub struct DriveStore {
    http: Client,
    tokens: Arc<TokenSource>,
    api_base: String,
    upload_base: String,
}

impl DriveStore {
    pub fn new(tokens: Arc<TokenSource>) -> Self {
        Self::with_endpoints(tokens, API_BASE, UPLOAD_BASE)
    }

    pub fn with_endpoints(tokens: Arc<TokenSource>, api_base: &str, upload_base: &str) -> Self {
        Self {
            http: Client::new(),
            tokens,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
        }
    }

    /// Sends an authorized request. A 401 drops the cached access token and
    /// retries once with a fresh one.
    async fn send<F>(&self, op: &'static str, build: F) -> StorageResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        let resp = build(&self.http)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport(op, e))?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!(op, "drive answered 401, refreshing access token");
            self.tokens.invalidate().await;
            let token = self.tokens.access_token().await?;
            let retry = build(&self.http)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| transport(op, e))?;
            return check(op, retry).await;
        }
        check(op, resp).await
    }

    async fn query(&self, q: String) -> StorageResult<Vec<DriveFile>> {
        let url = format!("{}/files", self.api_base);
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let current = page_token.take();
            let resp = self
                .send("drive files.list", |c| {
                    let mut params = vec![
                        ("q", q.as_str()),
                        ("fields", fields.as_str()),
                        ("pageSize", PAGE_SIZE),
                        ("orderBy", "createdTime"),
                    ];
                    if let Some(t) = current.as_deref() {
                        params.push(("pageToken", t));
                    }
                    c.get(&url).query(&params)
                })
                .await?;
            let page: FileList = resp
                .json()
                .await
                .map_err(|e| StorageError::Rejected(format!("drive files.list body: {e}")))?;
            out.extend(page.files.into_iter().filter(|f| !f.trashed));
            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn metadata(&self, id: &str) -> StorageResult<DriveFile> {
        let url = file_url(&self.api_base, id)?;
        let resp = self
            .send("drive files.get", |c| c.get(&url).query(&[("fields", FILE_FIELDS)]))
            .await?;
        resp.json()
            .await
            .map_err(|e| StorageError::Rejected(format!("drive files.get body: {e}")))
    }
}

/// Drive file ids are URL-safe base64-ish tokens; anything else could
/// rewrite the request path or query.
fn file_url(base: &str, id: &str) -> StorageResult<String> {
    let valid = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(StorageError::Rejected(format!("invalid drive file id {id:?}")));
    }
    Ok(format!("{base}/files/{id}"))
}

/// Escapes a literal for use inside a Drive query string.
fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn transport(op: &str, err: reqwest::Error) -> StorageError {
    StorageError::Unavailable(format!("{op}: {err}"))
}

async fn check(op: &'static str, resp: Response) -> StorageResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let err = match status.as_u16() {
        404 => StorageError::NotFound(op.to_string()),
        429 | 500..=599 => StorageError::Unavailable(format!("{op}: {status}")),
        403 if body.contains("ateLimitExceeded") || body.contains("quota") => {
            StorageError::Unavailable(format!("{op}: quota exhausted"))
        }
        401 => StorageError::Credentials(format!("{op}: access token rejected")),
        _ => StorageError::Rejected(format!("{op}: {status}: {body}")),
    };
    warn!(op, %status, "drive request failed");
    Err(err)
}

/// Builds a `multipart/related` upload body: JSON metadata part, then media.
fn multipart_body(boundary: &str, metadata: &serde_json::Value, media: &[u8]) -> Bytes {
    let mut body = Vec::with_capacity(media.len() + 256);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: {JSON}\r\n\r\n").as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--").as_bytes());
    Bytes::from(body)
}

#[async_trait]
impl FileStore for DriveStore {
    async fn list_items(
        &self,
        container: &str,
        filter: &NameFilter,
    ) -> StorageResult<Vec<ItemMeta>> {
        // Drive's `contains` operator only matches name-token prefixes, so only
        // exact lookups are pushed down; the rest is filtered here.
        let mut q = format!("'{}' in parents and trashed = false", quote(container));
        if let NameFilter::Exact(name) = filter {
            q.push_str(&format!(" and name = '{}'", quote(name)));
        }
        let mut items: Vec<ItemMeta> = self
            .query(q)
            .await?
            .into_iter()
            .filter(|f| f.mime_type.as_deref() != Some(FOLDER_MIME) && filter.matches(&f.name))
            .map(ItemMeta::from)
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(items)
    }

    async fn create_item(
        &self,
        container: &str,
        name: &str,
        body: Bytes,
    ) -> StorageResult<ItemMeta> {
        let url = format!("{}/files", self.upload_base);
        let boundary = format!("ledgerbook-{}", Uuid::new_v4().simple());
        let metadata = serde_json::json!({
            "name": name,
            "parents": [container],
            "mimeType": JSON,
        });
        let payload = multipart_body(&boundary, &metadata, &body);
        let content_type = format!("multipart/related; boundary={boundary}");

        let resp = self
            .send("drive files.create", |c| {
                c.post(&url)
                    .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(payload.clone())
            })
            .await?;
        let file: DriveFile = resp
            .json()
            .await
            .map_err(|e| StorageError::Rejected(format!("drive files.create body: {e}")))?;
        debug!(id = %file.id, %name, "drive file created");
        Ok(file.into())
    }

    async fn get_item_content(&self, id: &str) -> StorageResult<ItemBody> {
        let url = file_url(&self.api_base, id)?;
        let resp = self
            .send("drive files.get media", |c| c.get(&url).query(&[("alt", "media")]))
            .await?;
        let textual = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with(JSON) || ct.starts_with("text/"))
            .unwrap_or(false);
        if textual {
            let text = resp
                .text()
                .await
                .map_err(|e| StorageError::Unavailable(format!("drive media body: {e}")))?;
            Ok(ItemBody::Text(text))
        } else {
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| StorageError::Unavailable(format!("drive media body: {e}")))?;
            Ok(ItemBody::Binary(bytes))
        }
    }

    async fn update_item_content(&self, id: &str, body: Bytes) -> StorageResult<()> {
        let url = file_url(&self.upload_base, id)?;
        self.send("drive files.update", |c| {
            c.patch(&url)
                .query(&[("uploadType", "media")])
                .header(CONTENT_TYPE, JSON)
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> StorageResult<()> {
        let url = file_url(&self.api_base, id)?;
        self.send("drive files.delete", |c| c.delete(&url)).await?;
        Ok(())
    }

    async fn get_item_metadata(&self, id: &str) -> StorageResult<ItemMeta> {
        let file = self.metadata(id).await?;
        if file.trashed {
            return Err(StorageError::NotFound(format!("file {id}")));
        }
        Ok(file.into())
    }

    async fn get_container(&self, id: &str) -> StorageResult<Option<ItemMeta>> {
        match self.metadata(id).await {
            Ok(f) if !f.trashed && f.mime_type.as_deref() == Some(FOLDER_MIME) => {
                Ok(Some(f.into()))
            }
            Ok(_) => Ok(None),
            Err(StorageError::NotFound(_) | StorageError::Rejected(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_containers(&self, name: &str) -> StorageResult<Vec<ItemMeta>> {
        let q = format!(
            "name = '{}' and mimeType = '{FOLDER_MIME}' and trashed = false",
            quote(name)
        );
        Ok(self.query(q).await?.into_iter().map(ItemMeta::from).collect())
    }

    async fn create_container(&self, name: &str) -> StorageResult<ItemMeta> {
        let url = format!("{}/files", self.api_base);
        let body = serde_json::json!({ "name": name, "mimeType": FOLDER_MIME });
        let resp = self
            .send("drive folders.create", |c| {
                c.post(&url).query(&[("fields", FILE_FIELDS)]).json(&body)
            })
            .await?;
        let folder: DriveFile = resp
            .json()
            .await
            .map_err(|e| StorageError::Rejected(format!("drive folders.create body: {e}")))?;
        Ok(folder.into())
    }

    fn backend_name(&self) -> &'static str {
        "drive"
    }
}
