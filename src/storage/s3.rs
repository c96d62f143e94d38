use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    error::{DisplayErrorContext, SdkError},
    Client,
};
use aws_smithy_types::{byte_stream::ByteStream, DateTime};
use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{FileStore, ItemBody, ItemMeta, NameFilter, StorageError, StorageResult};

const MARKER: &str = ".container";
const JSON: &str = "application/json";

/// S3 / MinIO backed file store.
///
/// A container is a key prefix `<id>/` holding a `.container` marker object
/// whose body is the container name. Item ids are full object keys.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
        region: &str,
    ) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "static",
            ))
            .endpoint_url(endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: bucket.to_string(),
        })
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<ItemMeta>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| classify("s3 list_objects_v2", e))?;

            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                let Some((_, name)) = key.split_once('/') else { continue };
                if name == MARKER || name.contains('/') {
                    continue;
                }
                out.push(ItemMeta {
                    id: key.to_string(),
                    name: name.to_string(),
                    created_at: to_offset(obj.last_modified()),
                    size: obj.size().map(|s| s.max(0) as u64),
                });
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(out)
    }

    async fn get_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                    StorageError::NotFound(format!("object {key}"))
                } else {
                    classify("s3 get_object", e)
                }
            })?;
        let body = out
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(format!("s3 read body {key}: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(JSON)
            .send()
            .await
            .map_err(|e| classify("s3 put_object", e))?;
        Ok(())
    }
}

fn to_offset(dt: Option<&DateTime>) -> OffsetDateTime {
    dt.and_then(|d| OffsetDateTime::from_unix_timestamp_nanos(d.as_nanos()).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
}

fn classify<E>(op: &str, err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let detail = format!("{op}: {}", DisplayErrorContext(&err));
    match (&err, status) {
        (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_), _) => {
            StorageError::Unavailable(detail)
        }
        (_, Some(s)) if s == 429 || s >= 500 => StorageError::Unavailable(detail),
        _ => StorageError::Rejected(detail),
    }
}

#[async_trait]
impl FileStore for S3Store {
    async fn list_items(
        &self,
        container: &str,
        filter: &NameFilter,
    ) -> StorageResult<Vec<ItemMeta>> {
        // S3 only filters by prefix server-side.
        let prefix = match filter {
            NameFilter::Exact(n) | NameFilter::Prefix(n) => format!("{container}/{n}"),
            NameFilter::Contains(_) => format!("{container}/"),
        };
        let mut items = self.list_keys(&prefix).await?;
        items.retain(|m| filter.matches(&m.name));
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(items)
    }

    async fn create_item(
        &self,
        container: &str,
        name: &str,
        body: Bytes,
    ) -> StorageResult<ItemMeta> {
        let key = format!("{container}/{name}");
        let size = body.len() as u64;
        self.put(&key, body).await?;
        debug!(%key, size, "s3 object created");
        Ok(ItemMeta {
            id: key,
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
            size: Some(size),
        })
    }

    async fn get_item_content(&self, id: &str) -> StorageResult<ItemBody> {
        Ok(ItemBody::Binary(self.get_bytes(id).await?))
    }

    async fn update_item_content(&self, id: &str, body: Bytes) -> StorageResult<()> {
        // put_object would silently create a missing key
        self.get_item_metadata(id).await?;
        self.put(id, body).await
    }

    async fn delete_item(&self, id: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .map_err(|e| classify("s3 delete_object", e))?;
        Ok(())
    }

    async fn get_item_metadata(&self, id: &str) -> StorageResult<ItemMeta> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) {
                    StorageError::NotFound(format!("object {id}"))
                } else {
                    classify("s3 head_object", e)
                }
            })?;
        let name = id.split_once('/').map(|(_, n)| n).unwrap_or(id);
        Ok(ItemMeta {
            id: id.to_string(),
            name: name.to_string(),
            created_at: to_offset(head.last_modified()),
            size: head.content_length().map(|s| s.max(0) as u64),
        })
    }

    async fn get_container(&self, id: &str) -> StorageResult<Option<ItemMeta>> {
        if id.is_empty() || id.contains('/') {
            return Ok(None);
        }
        let marker = format!("{id}/{MARKER}");
        let meta = match self.get_item_metadata(&marker).await {
            Ok(m) => m,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let name = String::from_utf8_lossy(&self.get_bytes(&marker).await?)
            .trim()
            .to_string();
        Ok(Some(ItemMeta {
            id: id.to_string(),
            name,
            created_at: meta.created_at,
            size: None,
        }))
    }

    async fn find_containers(&self, name: &str) -> StorageResult<Vec<ItemMeta>> {
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .delimiter("/")
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| classify("s3 list_objects_v2", e))?;
            prefixes.extend(
                page.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix())
                    .map(|p| p.trim_end_matches('/').to_string()),
            );
            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }

        let mut out = Vec::new();
        for id in prefixes {
            if let Some(meta) = self.get_container(&id).await? {
                if meta.name == name {
                    out.push(meta);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn create_container(&self, name: &str) -> StorageResult<ItemMeta> {
        let id = Uuid::new_v4().simple().to_string();
        self.put(&format!("{id}/{MARKER}"), Bytes::from(name.to_string()))
            .await?;
        Ok(ItemMeta {
            id,
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
            size: None,
        })
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
