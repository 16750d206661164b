//! src/services/metadata_index.rs
//!
//! Searchable document catalog. `MetadataIndex` is the capability the dedup
//! engine needs: named indices of JSON documents with exact-term search on
//! dotted field paths. `SqliteMetadataIndex` keeps documents as JSON text in
//! SQLite and answers term queries with `json_extract`, backed by an
//! expression index for every `keyword` field in the index mapping.
//!
//! Search hits come back in insertion order, so "first match" is always the
//! earliest-indexed document.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index `{0}` not found")]
    IndexNotFound(String),
    #[error("index name `{0}` invalid: use lowercase letters, digits and underscores")]
    InvalidIndexName(String),
    #[error("document `{id}` not found in index `{index}`")]
    DocumentNotFound { index: String, id: String },
    #[error("field path `{0}` invalid")]
    InvalidField(String),
    #[error("documents must be JSON objects")]
    NotAnObject,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// A stored document and its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Create `index` with `mapping` unless it already exists. Returns
    /// whether it was created.
    async fn ensure_index(&self, index: &str, mapping: &Value) -> IndexResult<bool>;

    /// Store `document`, replacing any document with the same id. A fresh id
    /// is generated when none is given. Returns the id.
    async fn index_document(
        &self,
        index: &str,
        document: &Value,
        id: Option<&str>,
    ) -> IndexResult<String>;

    /// Store many documents atomically under generated ids.
    async fn bulk_index(&self, index: &str, documents: &[Value]) -> IndexResult<Vec<String>>;

    async fn get_document(&self, index: &str, id: &str) -> IndexResult<Option<Hit>>;

    /// Documents whose value at `field` equals `value` exactly.
    async fn search_term(&self, index: &str, field: &str, value: &str) -> IndexResult<Vec<Hit>>;

    /// Deep-merge `partial` into the stored document.
    async fn update_document(&self, index: &str, id: &str, partial: &Value) -> IndexResult<()>;

    /// Remove a document. Returns whether it existed.
    async fn delete_document(&self, index: &str, id: &str) -> IndexResult<bool>;

    /// Make prior writes visible to search.
    async fn refresh(&self, index: &str) -> IndexResult<()>;
}

#[derive(Clone)]
pub struct SqliteMetadataIndex {
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn require_index(&self, index: &str) -> IndexResult<()> {
        ensure_index_name(index)?;
        let found: Option<String> =
            sqlx::query_scalar("SELECT name FROM index_catalog WHERE name = ?")
                .bind(index)
                .fetch_optional(&*self.db)
                .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(IndexError::IndexNotFound(index.to_string())),
        }
    }

    async fn create_keyword_indexes(&self, index: &str, mapping: &Value) -> IndexResult<()> {
        let mut fields = Vec::new();
        collect_keyword_fields(mapping, "", &mut fields);

        for field in fields {
            let path = json_path(&field)?;
            let name = format!(
                "idx_doc_{}_{}",
                index,
                field.replace(|c: char| !c.is_ascii_alphanumeric(), "_")
            );
            let stmt = format!(
                "CREATE INDEX IF NOT EXISTS \"{}\" ON index_documents(index_name, json_extract(body, '{}'))",
                name, path
            );
            debug!("Executing index SQL: {}", stmt);
            sqlx::query(&stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn ensure_index(&self, index: &str, mapping: &Value) -> IndexResult<bool> {
        ensure_index_name(index)?;
        let inserted = sqlx::query(
            "INSERT INTO index_catalog (name, mapping, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(index)
        .bind(serde_json::to_string(mapping)?)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(index, "index already exists");
            return Ok(false);
        }

        self.create_keyword_indexes(index, mapping).await?;
        info!(index, "created index");
        Ok(true)
    }

    async fn index_document(
        &self,
        index: &str,
        document: &Value,
        id: Option<&str>,
    ) -> IndexResult<String> {
        self.require_index(index).await?;
        if !document.is_object() {
            return Err(IndexError::NotAnObject);
        }
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        sqlx::query(
            "INSERT INTO index_documents (index_name, doc_id, body) VALUES (?, ?, ?)
             ON CONFLICT(index_name, doc_id) DO UPDATE SET body = excluded.body",
        )
        .bind(index)
        .bind(&id)
        .bind(serde_json::to_string(document)?)
        .execute(&*self.db)
        .await?;

        debug!(index, id = %id, "indexed document");
        Ok(id)
    }

    async fn bulk_index(&self, index: &str, documents: &[Value]) -> IndexResult<Vec<String>> {
        self.require_index(index).await?;
        if documents.iter().any(|doc| !doc.is_object()) {
            return Err(IndexError::NotAnObject);
        }

        let mut tx = self.db.begin().await?;
        let mut ids = Vec::with_capacity(documents.len());
        for document in documents {
            let id = Uuid::new_v4().to_string();
            sqlx::query("INSERT INTO index_documents (index_name, doc_id, body) VALUES (?, ?, ?)")
                .bind(index)
                .bind(&id)
                .bind(serde_json::to_string(document)?)
                .execute(&mut *tx)
                .await?;
            ids.push(id);
        }
        tx.commit().await?;

        info!(index, count = ids.len(), "bulk indexed documents");
        Ok(ids)
    }

    async fn get_document(&self, index: &str, id: &str) -> IndexResult<Option<Hit>> {
        self.require_index(index).await?;
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM index_documents WHERE index_name = ? AND doc_id = ?",
        )
        .bind(index)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match body {
            Some(body) => Ok(Some(Hit {
                id: id.to_string(),
                source: serde_json::from_str(&body)?,
            })),
            None => Ok(None),
        }
    }

    async fn search_term(&self, index: &str, field: &str, value: &str) -> IndexResult<Vec<Hit>> {
        self.require_index(index).await?;
        let path = json_path(field)?;
        let sql = format!(
            "SELECT doc_id, body FROM index_documents
             WHERE index_name = ? AND json_extract(body, '{}') = ?
             ORDER BY seq ASC",
            path
        );

        let rows = sqlx::query(&sql)
            .bind(index)
            .bind(value)
            .fetch_all(&*self.db)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            hits.push(Hit {
                id: row.try_get("doc_id")?,
                source: serde_json::from_str(&body)?,
            });
        }

        debug!(index, field, value, hits = hits.len(), "term search");
        Ok(hits)
    }

    async fn update_document(&self, index: &str, id: &str, partial: &Value) -> IndexResult<()> {
        self.require_index(index).await?;
        if !partial.is_object() {
            return Err(IndexError::NotAnObject);
        }

        let mut tx = self.db.begin().await?;
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM index_documents WHERE index_name = ? AND doc_id = ?",
        )
        .bind(index)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut document: Value = match body {
            Some(body) => serde_json::from_str(&body)?,
            None => {
                return Err(IndexError::DocumentNotFound {
                    index: index.to_string(),
                    id: id.to_string(),
                });
            }
        };
        merge_into(&mut document, partial);

        sqlx::query("UPDATE index_documents SET body = ? WHERE index_name = ? AND doc_id = ?")
            .bind(serde_json::to_string(&document)?)
            .bind(index)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(index, id, "updated document");
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: &str) -> IndexResult<bool> {
        self.require_index(index).await?;
        let result = sqlx::query("DELETE FROM index_documents WHERE index_name = ? AND doc_id = ?")
            .bind(index)
            .bind(id)
            .execute(&*self.db)
            .await?;

        let existed = result.rows_affected() > 0;
        if !existed {
            debug!(index, id, "document already absent");
        }
        Ok(existed)
    }

    async fn refresh(&self, index: &str) -> IndexResult<()> {
        // Committed SQLite writes are visible to every reader already.
        self.require_index(index).await
    }
}

fn ensure_index_name(index: &str) -> IndexResult<()> {
    if !index.is_empty()
        && index
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
    {
        Ok(())
    } else {
        Err(IndexError::InvalidIndexName(index.to_string()))
    }
}

/// SQLite JSON path for a dotted field, each segment quoted:
/// `metadata.original-key` → `$."metadata"."original-key"`.
fn json_path(field: &str) -> IndexResult<String> {
    let segments: Vec<&str> = field.split('.').collect();
    let valid = segments.iter().all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    });
    if !valid {
        return Err(IndexError::InvalidField(field.to_string()));
    }

    let mut path = String::from("$");
    for segment in segments {
        path.push_str(".\"");
        path.push_str(segment);
        path.push('"');
    }
    Ok(path)
}

/// Dotted paths of every `keyword` field under `mapping.properties`.
fn collect_keyword_fields(mapping: &Value, prefix: &str, out: &mut Vec<String>) {
    let Some(properties) = mapping.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (name, spec) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        if spec.get("type").and_then(Value::as_str) == Some("keyword") {
            out.push(path.clone());
        }
        collect_keyword_fields(spec, &path, out);
    }
}

/// Merge `patch` into `target`: objects merge key by key, anything else
/// (including `null`) replaces the target value.
fn merge_into(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => merge_maps(target, patch),
        (target, patch) => *target = patch.clone(),
    }
}

fn merge_maps(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match target.get_mut(key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                merge_into(existing, value)
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
