//! In-memory document store for development and tests

use super::filter::{apply_query, matches};
use super::{ensure_id, upsert_seed, Document, DocumentStore, FindQuery};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Collections keyed by name; each document carries its insertion sequence.
pub struct InMemoryDocumentStore {
    collections: Arc<RwLock<HashMap<String, Vec<(u64, Document)>>>>,
    next_seq: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
        }
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Document>> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(None);
        };

        for (_, doc) in docs {
            if matches(doc, filter)? {
                return Ok(Some(doc.clone()));
            }
        }
        Ok(None)
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>> {
        let docs = {
            let collections = self.collections.read().await;
            collections.get(collection).cloned().unwrap_or_default()
        };
        apply_query(docs, query)
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64> {
        let collections = self.collections.read().await;
        let mut total = 0;
        for (_, doc) in collections.get(collection).into_iter().flatten() {
            if matches(doc, filter)? {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<String> {
        let id = ensure_id(&mut doc);
        let seq = self.seq();

        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_insert_with(Vec::new)
            .push((seq, doc));
        Ok(id)
    }

    async fn upsert_one(&self, collection: &str, key: &Value, fields: Document) -> Result<()> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_insert_with(Vec::new);

        for (_, doc) in docs.iter_mut() {
            if matches(doc, key)? {
                doc.extend(fields);
                return Ok(());
            }
        }

        let mut doc = upsert_seed(key, fields);
        ensure_id(&mut doc);
        docs.push((self.seq(), doc));
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };

        // Evaluate every filter first so a bad filter leaves the collection intact.
        let mut doomed = Vec::with_capacity(docs.len());
        for (_, doc) in docs.iter() {
            doomed.push(matches(doc, filter)?);
        }

        let removed = doomed.iter().filter(|d| **d).count() as u64;
        let mut flags = doomed.into_iter();
        docs.retain(|_| !flags.next().unwrap_or(false));
        Ok(removed)
    }
}
