//! RestBackend: a thin `RemoteBackend` over a PostgREST-style HTTP API.
//!
//! Each entity family maps to one table. Reads filter by the owner column
//! and, for child collections, the parent column. Entity fields are sent
//! as-is; column naming is the caller's concern.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{RemoteError, RemoteErrorKind};
use crate::types::{CollectionScope, Entity, EntityId};

use super::{BlobStore, PresignRequest, PresignedUpload, RemoteBackend};

/// How one family is stored remotely.
#[derive(Debug, Clone)]
pub struct TableMapping {
    pub table: String,
    pub owner_column: Option<String>,
    pub parent_column: Option<String>,
}

impl TableMapping {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            owner_column: Some("user_id".to_string()),
            parent_column: None,
        }
    }

    pub fn with_parent(mut self, column: impl Into<String>) -> Self {
        self.parent_column = Some(column.into());
        self
    }

    pub fn without_owner(mut self) -> Self {
        self.owner_column = None;
        self
    }
}

pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    tables: HashMap<String, TableMapping>,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RemoteError::with_kind(e.to_string(), RemoteErrorKind::Permanent))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
            tables: HashMap::new(),
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_table(mut self, family: impl Into<String>, mapping: TableMapping) -> Self {
        self.tables.insert(family.into(), mapping);
        self
    }

    fn mapping(&self, scope: &CollectionScope) -> Result<&TableMapping, RemoteError> {
        self.tables.get(&scope.family).ok_or_else(|| {
            RemoteError::with_kind(
                format!("no table mapped for family \"{}\"", scope.family),
                RemoteErrorKind::Permanent,
            )
        })
    }

    fn url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    /// Filters selecting the scope's rows, plus `id` when given.
    fn filters(
        mapping: &TableMapping,
        scope: &CollectionScope,
        id: Option<&EntityId>,
    ) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(col) = &mapping.owner_column {
            query.push((col.clone(), format!("eq.{}", scope.owner_id)));
        }
        if let (Some(col), Some(parent)) = (&mapping.parent_column, &scope.parent_id) {
            query.push((col.clone(), format!("eq.{parent}")));
        }
        if let Some(id) = id {
            query.push(("id".to_string(), format!("eq.{id}")));
        }
        query
    }

    /// Scope columns written on insert.
    fn scope_columns(
        mapping: &TableMapping,
        scope: &CollectionScope,
        fields: &mut Map<String, Value>,
    ) {
        if let Some(col) = &mapping.owner_column {
            fields
                .entry(col.clone())
                .or_insert_with(|| Value::String(scope.owner_id.clone()));
        }
        if let (Some(col), Some(parent)) = (&mapping.parent_column, &scope.parent_id) {
            fields
                .entry(col.clone())
                .or_insert_with(|| Value::String(parent.clone()));
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let resp = builder.send().await.map_err(map_transport_error)?;
        check_status(resp).await
    }
}

/// Map a non-success status to an error kind: 404 is `NotFound`, other 4xx
/// except 429 are `Permanent`, everything else is `Transient`.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let kind = if status == reqwest::StatusCode::NOT_FOUND {
        RemoteErrorKind::NotFound
    } else if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        RemoteErrorKind::Permanent
    } else {
        RemoteErrorKind::Transient
    };
    Err(RemoteError::with_kind(format!("HTTP {status}: {body}"), kind))
}

fn map_transport_error(e: reqwest::Error) -> RemoteError {
    let kind = if e.is_connect() {
        RemoteErrorKind::Offline
    } else {
        RemoteErrorKind::Transient
    };
    RemoteError::with_kind(e.to_string(), kind)
}

fn decode_error(e: reqwest::Error) -> RemoteError {
    RemoteError::with_kind(format!("undecodable response: {e}"), RemoteErrorKind::Permanent)
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn fetch_all(&self, scope: &CollectionScope) -> Result<Vec<Entity>, RemoteError> {
        let mapping = self.mapping(scope)?;
        let mut query = Self::filters(mapping, scope, None);
        query.push(("select".to_string(), "*".to_string()));
        let resp = self
            .send(self.request(reqwest::Method::GET, &self.url(&mapping.table)).query(&query))
            .await?;
        resp.json::<Vec<Entity>>().await.map_err(decode_error)
    }

    async fn create(
        &self,
        scope: &CollectionScope,
        id: Option<&EntityId>,
        fields: &Map<String, Value>,
    ) -> Result<Entity, RemoteError> {
        let mapping = self.mapping(scope)?;
        let mut body = fields.clone();
        Self::scope_columns(mapping, scope, &mut body);
        match id {
            Some(id) => {
                body.insert("id".to_string(), Value::String(id.to_string()));
            }
            None => {
                body.remove("id");
            }
        }
        let resp = self
            .send(
                self.request(reqwest::Method::POST, &self.url(&mapping.table))
                    .header("Prefer", "return=representation")
                    .json(&Value::Object(body)),
            )
            .await?;
        let mut rows = resp.json::<Vec<Entity>>().await.map_err(decode_error)?;
        rows.pop().ok_or_else(|| {
            RemoteError::with_kind("insert returned no row", RemoteErrorKind::Permanent)
        })
    }

    async fn update(
        &self,
        scope: &CollectionScope,
        id: &EntityId,
        patch: &Map<String, Value>,
    ) -> Result<(), RemoteError> {
        let mapping = self.mapping(scope)?;
        let query = Self::filters(mapping, scope, Some(id));
        self.send(
            self.request(reqwest::Method::PATCH, &self.url(&mapping.table))
                .query(&query)
                .json(&Value::Object(patch.clone())),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, scope: &CollectionScope, id: &EntityId) -> Result<(), RemoteError> {
        let mapping = self.mapping(scope)?;
        let query = Self::filters(mapping, scope, Some(id));
        self.send(self.request(reqwest::Method::DELETE, &self.url(&mapping.table)).query(&query))
            .await?;
        Ok(())
    }
}

// ============================================================================
// HttpBlobStore
// ============================================================================

/// Presigned uploads through an app endpoint (`POST {base}/upload/presign`)
/// followed by a `PUT` of the bytes to the returned URL.
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| RemoteError::with_kind(e.to_string(), RemoteErrorKind::Permanent))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn presign(&self, request: &PresignRequest) -> Result<PresignedUpload, RemoteError> {
        let mut builder = self
            .client
            .post(format!("{}/upload/presign", self.base_url))
            .json(request);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await.map_err(map_transport_error)?;
        let resp = check_status(resp).await?;
        resp.json::<PresignedUpload>().await.map_err(decode_error)
    }

    async fn put(
        &self,
        upload: &PresignedUpload,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<(), RemoteError> {
        let resp = self
            .client
            .put(&upload.upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(resp).await?;
        Ok(())
    }
}
