//! Document store collaborator
//!
//! Player records, conversation turns and summaries all live in schemaless
//! collections reached through the `DocumentStore` primitives. Filters use a
//! Mongo-style JSON dialect evaluated by [`filter`].

use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub mod filter;
pub mod memory;
pub mod postgres;

pub use memory::InMemoryDocumentStore;
pub use postgres::PgDocumentStore;

/// A single schemaless document.
pub type Document = serde_json::Map<String, Value>;

/// Field names that are storage bookkeeping rather than record data.
pub const INTERNAL_FIELDS: &[&str] = &["_id", "__v", ""];

/// Filter + sort + limit for `DocumentStore::find`.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub filter: Value,
    pub sort: Value,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(filter: Value) -> Self {
        Self {
            filter,
            sort: json!({}),
            limit: None,
        }
    }

    pub fn sort(mut self, sort: Value) -> Self {
        self.sort = sort;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Default for FindQuery {
    fn default() -> Self {
        Self::new(json!({}))
    }
}

/// Storage primitives the pipeline and memory subsystem depend on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Document>>;

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>>;

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64>;

    /// Insert a document, assigning `_id` when absent. Returns the `_id`.
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String>;

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize> {
        let mut inserted = 0;
        for doc in docs {
            self.insert_one(collection, doc).await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Set `fields` on the first document matching `key`, or insert
    /// `key`'s equality fields plus `fields` as a new document.
    async fn upsert_one(&self, collection: &str, key: &Value, fields: Document) -> Result<()>;

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64>;

    /// Field names of one representative document, `None` for an empty collection.
    async fn sample_field_names(&self, collection: &str) -> Result<Option<Vec<String>>> {
        let doc = self.find_one(collection, &json!({})).await?;
        Ok(doc.map(|d| {
            d.keys()
                .filter(|k| !INTERNAL_FIELDS.contains(&k.as_str()))
                .cloned()
                .collect()
        }))
    }
}

/// Assign a fresh `_id` unless the document already carries one.
pub(crate) fn ensure_id(doc: &mut Document) -> String {
    match doc.get("_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.insert("_id".to_string(), Value::String(id.clone()));
            id
        }
    }
}

/// Document to insert when an upsert key matches nothing: the plain
/// equality fields of the key followed by the update fields.
pub(crate) fn upsert_seed(key: &Value, fields: Document) -> Document {
    let mut doc = Document::new();
    if let Some(obj) = key.as_object() {
        for (k, v) in obj {
            if !k.starts_with('$') && !filter::is_operator_object(v) {
                doc.insert(k.clone(), v.clone());
            }
        }
    }
    doc.extend(fields);
    doc
}

/// Pick the postgres backend when a URL is configured, otherwise in-memory.
pub fn build_store(database_url: Option<&str>) -> Arc<dyn DocumentStore> {
    if let Some(url) = database_url {
        match PgDocumentStore::connect_lazy(url) {
            Ok(store) => {
                info!("Document store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres document store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Document store backend: in-memory");
    Arc::new(InMemoryDocumentStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_seed_keeps_equality_fields_only() {
        let key = json!({"userId": "u1", "updatedAt": {"$exists": true}});
        let mut fields = Document::new();
        fields.insert("summary".into(), json!("text"));

        let doc = upsert_seed(&key, fields);
        assert_eq!(doc.get("userId"), Some(&json!("u1")));
        assert_eq!(doc.get("summary"), Some(&json!("text")));
        assert!(doc.get("updatedAt").is_none());
    }

    #[test]
    fn test_ensure_id_preserves_existing() {
        let mut doc = Document::new();
        doc.insert("_id".into(), json!("fixed"));
        assert_eq!(ensure_id(&mut doc), "fixed");

        let mut fresh = Document::new();
        let id = ensure_id(&mut fresh);
        assert_eq!(fresh.get("_id"), Some(&json!(id)));
    }
}
