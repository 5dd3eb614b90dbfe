//! Postgres-backed document store
//!
//! Every collection shares one JSONB table. Top-level scalar equality terms
//! of a filter run in SQL; whatever remains is evaluated with the same
//! matcher the in-memory store uses, which keeps query semantics identical
//! across backends.

use super::filter::{apply_query, matches};
use super::{ensure_id, upsert_seed, Document, DocumentStore, FindQuery};
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct PgDocumentStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgDocumentStore {
    /// Build a lazily-connecting pool; nothing touches the network until first use.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)?;

        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS documents (
                      seq BIGSERIAL PRIMARY KEY,
                      collection TEXT NOT NULL,
                      doc_id TEXT NOT NULL,
                      body JSONB NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_documents_collection_seq
                    ON documents (collection, seq);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_collection_doc_id
                    ON documents (collection, doc_id);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                PipelineError::DatabaseError(format!(
                    "Failed to initialize document store schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

/// The part of a filter SQL can evaluate: top-level equality on scalar
/// values, written as `body -> key @> value`. That form also holds for an
/// array field containing the value, as the document matcher does.
#[derive(Debug, Default, PartialEq)]
struct Pushdown {
    terms: Vec<(String, Value)>,
    /// The terms are the whole filter, so SQL alone decides a match.
    exact: bool,
}

impl Pushdown {
    fn of(filter: &Value) -> Self {
        let Some(conditions) = filter.as_object() else {
            return Self::default();
        };

        let mut pushdown = Self {
            terms: Vec::new(),
            exact: true,
        };
        for (key, cond) in conditions {
            let scalar = matches!(cond, Value::String(_) | Value::Number(_) | Value::Bool(_));
            if scalar && !key.starts_with('$') && !key.contains('.') {
                pushdown.terms.push((key.clone(), cond.clone()));
            } else {
                pushdown.exact = false;
            }
        }
        pushdown
    }

    fn push_where<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>, collection: &'a str) {
        builder.push(" WHERE collection = ").push_bind(collection);
        for (key, value) in &self.terms {
            builder
                .push(" AND body -> ")
                .push_bind(key.as_str())
                .push(" @> ")
                .push_bind(Json(value));
        }
    }
}

/// Advisory lock name serializing upserts of one key in one collection.
fn upsert_lock_key(collection: &str, key: &Value) -> String {
    format!("{}:{}", collection, key)
}

/// Candidate rows in insertion order.
async fn select<'e, E>(
    executor: E,
    collection: &str,
    pushdown: &Pushdown,
    limit: Option<i64>,
    for_update: bool,
) -> Result<Vec<(u64, Document)>>
where
    E: PgExecutor<'e>,
{
    let mut builder = QueryBuilder::new("SELECT seq, body FROM documents");
    pushdown.push_where(&mut builder, collection);
    builder.push(" ORDER BY seq ASC");
    if let Some(limit) = limit {
        builder.push(" LIMIT ").push_bind(limit);
    }
    if for_update {
        builder.push(" FOR UPDATE");
    }

    let rows = builder.build().fetch_all(executor).await.map_err(|e| {
        PipelineError::DatabaseError(format!("Failed to load collection {}: {}", collection, e))
    })?;

    decode_rows(rows)
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<(u64, Document)>> {
    rows.into_iter()
        .map(|row| {
            let seq: i64 = row.try_get("seq")?;
            let Json(body): Json<Document> = row.try_get("body")?;
            Ok((seq as u64, body))
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        .map_err(PipelineError::from)
}

async fn insert_with<'e, E>(executor: E, collection: &str, mut doc: Document) -> Result<String>
where
    E: PgExecutor<'e>,
{
    let id = ensure_id(&mut doc);

    sqlx::query("INSERT INTO documents (collection, doc_id, body) VALUES ($1, $2, $3)")
        .bind(collection)
        .bind(&id)
        .bind(Json(&doc))
        .execute(executor)
        .await
        .map_err(|e| PipelineError::DatabaseError(format!("Failed to insert document: {}", e)))?;

    Ok(id)
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Document>> {
        self.ensure_schema().await?;
        let pushdown = Pushdown::of(filter);
        let limit = pushdown.exact.then_some(1);

        for (_, doc) in select(&self.pool, collection, &pushdown, limit, false).await? {
            if matches(&doc, filter)? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>> {
        self.ensure_schema().await?;
        let pushdown = Pushdown::of(&query.filter);
        let docs = select(&self.pool, collection, &pushdown, None, false).await?;
        apply_query(docs, query)
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64> {
        self.ensure_schema().await?;
        let pushdown = Pushdown::of(filter);

        if pushdown.exact {
            let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM documents");
            pushdown.push_where(&mut builder, collection);
            let total: i64 = builder
                .build_query_scalar::<i64>()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    PipelineError::DatabaseError(format!("Failed to count documents: {}", e))
                })?;
            return Ok(total as u64);
        }

        let mut total = 0;
        for (_, doc) in select(&self.pool, collection, &pushdown, None, false).await? {
            if matches(&doc, filter)? {
                total += 1;
            }
        }
        Ok(total)
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String> {
        self.ensure_schema().await?;
        insert_with(&self.pool, collection, doc).await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<usize> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            PipelineError::DatabaseError(format!("Failed to begin insert transaction: {}", e))
        })?;

        let total = docs.len();
        for doc in docs {
            insert_with(&mut *tx, collection, doc).await?;
        }

        tx.commit().await.map_err(|e| {
            PipelineError::DatabaseError(format!("Failed to commit insert transaction: {}", e))
        })?;

        Ok(total)
    }

    /// Runs in one transaction holding an advisory lock on the key, so
    /// concurrent upserts of the same key never both insert.
    async fn upsert_one(&self, collection: &str, key: &Value, fields: Document) -> Result<()> {
        self.ensure_schema().await?;
        let pushdown = Pushdown::of(key);

        let mut tx = self.pool.begin().await.map_err(|e| {
            PipelineError::DatabaseError(format!("Failed to begin upsert transaction: {}", e))
        })?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(upsert_lock_key(collection, key))
            .execute(&mut *tx)
            .await
            .map_err(|e| PipelineError::DatabaseError(format!("Failed to lock upsert key: {}", e)))?;

        let mut existing = None;
        for (seq, doc) in select(&mut *tx, collection, &pushdown, None, true).await? {
            if matches(&doc, key)? {
                existing = Some((seq, doc));
                break;
            }
        }

        match existing {
            Some((seq, mut doc)) => {
                doc.extend(fields);
                sqlx::query("UPDATE documents SET body = $1 WHERE seq = $2")
                    .bind(Json(&doc))
                    .bind(seq as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        PipelineError::DatabaseError(format!("Failed to update document: {}", e))
                    })?;
            }
            None => {
                insert_with(&mut *tx, collection, upsert_seed(key, fields)).await?;
            }
        }

        tx.commit().await.map_err(|e| {
            PipelineError::DatabaseError(format!("Failed to commit upsert transaction: {}", e))
        })?;

        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<u64> {
        self.ensure_schema().await?;
        let pushdown = Pushdown::of(filter);

        if pushdown.exact {
            let mut builder = QueryBuilder::new("DELETE FROM documents");
            pushdown.push_where(&mut builder, collection);
            let result = builder.build().execute(&self.pool).await.map_err(|e| {
                PipelineError::DatabaseError(format!("Failed to delete documents: {}", e))
            })?;
            return Ok(result.rows_affected());
        }

        let mut doomed: Vec<i64> = Vec::new();
        for (seq, doc) in select(&self.pool, collection, &pushdown, None, false).await? {
            if matches(&doc, filter)? {
                doomed.push(seq as i64);
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM documents WHERE seq = ANY($1)")
            .bind(&doomed)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                PipelineError::DatabaseError(format!("Failed to delete documents: {}", e))
            })?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    /// Set TEST_DATABASE_URL to run the store against a live postgres.
    fn live_store() -> Option<Arc<PgDocumentStore>> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        PgDocumentStore::connect_lazy(&url).ok().map(Arc::new)
    }

    #[test]
    fn test_pushdown_takes_scalar_equality_only() {
        let pushdown = Pushdown::of(&json!({"userId": "u1", "Runs": 100, "active": true}));
        assert!(pushdown.exact);
        assert_eq!(
            pushdown.terms,
            vec![
                ("userId".to_string(), json!("u1")),
                ("Runs".to_string(), json!(100)),
                ("active".to_string(), json!(true)),
            ]
        );

        let pushdown = Pushdown::of(&json!({
            "userId": "u1",
            "_id": {"$nin": ["a", "b"]},
            "stats.runs": 5,
            "team": null
        }));
        assert!(!pushdown.exact);
        assert_eq!(pushdown.terms, vec![("userId".to_string(), json!("u1"))]);
    }

    #[test]
    fn test_pushdown_of_empty_and_logical_filters() {
        let all = Pushdown::of(&json!({}));
        assert!(all.exact);
        assert!(all.terms.is_empty());

        let logical = Pushdown::of(&json!({"$or": [{"Player": "A"}, {"Player": "B"}]}));
        assert!(!logical.exact);
        assert!(logical.terms.is_empty());

        assert_eq!(Pushdown::of(&json!("not a filter")), Pushdown::default());
    }

    #[test]
    fn test_upsert_lock_key_is_stable() {
        let key = json!({"userId": "u1"});
        assert_eq!(upsert_lock_key("summaries", &key), r#"summaries:{"userId":"u1"}"#);
        assert_ne!(
            upsert_lock_key("summaries", &key),
            upsert_lock_key("summaries", &json!({"userId": "u2"}))
        );
    }

    #[tokio::test]
    async fn test_concurrent_upserts_leave_one_document() {
        let Some(store) = live_store() else {
            return;
        };
        let collection = format!("summaries_{}", uuid::Uuid::new_v4().simple());
        let key = json!({"userId": "u1"});

        let writes = (0..8).map(|n| {
            let store = store.clone();
            let collection = collection.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .upsert_one(&collection, &key, doc(json!({"summary": format!("v{}", n)})))
                    .await
            })
        });
        for handle in futures::future::join_all(writes).await {
            handle.unwrap().unwrap();
        }

        assert_eq!(store.count(&collection, &json!({})).await.unwrap(), 1);
        assert_eq!(store.count(&collection, &key).await.unwrap(), 1);
        store.delete_many(&collection, &json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_filters_agree_with_in_memory_store() {
        let Some(store) = live_store() else {
            return;
        };
        let collection = format!("players_{}", uuid::Uuid::new_v4().simple());
        let memory = InMemoryDocumentStore::new();
        let rows = [
            json!({"Player": "A", "Runs": 100, "Teams": ["INDIA", "ASIA"]}),
            json!({"Player": "B", "Runs": 100.0, "Teams": ["AUS"]}),
            json!({"Player": "C", "Runs": 50, "Teams": "INDIA"}),
        ];
        for row in rows {
            store.insert_one(&collection, doc(row.clone())).await.unwrap();
            memory.insert_one(&collection, doc(row)).await.unwrap();
        }

        for filter in [
            json!({}),
            json!({"Runs": 100}),
            json!({"Teams": "INDIA"}),
            json!({"Teams": "INDIA", "Runs": {"$lt": 80}}),
            json!({"Player": {"$regex": "^[ab]$", "$options": "i"}}),
        ] {
            assert_eq!(
                store.count(&collection, &filter).await.unwrap(),
                memory.count(&collection, &filter).await.unwrap(),
                "count of {}",
                filter
            );
            let first = |d: Option<Document>| d.map(|d| d["Player"].clone());
            assert_eq!(
                first(store.find_one(&collection, &filter).await.unwrap()),
                first(memory.find_one(&collection, &filter).await.unwrap()),
                "find_one of {}",
                filter
            );
        }

        assert_eq!(store.delete_many(&collection, &json!({"Runs": 100})).await.unwrap(), 2);
        assert_eq!(store.count(&collection, &json!({})).await.unwrap(), 1);
        store.delete_many(&collection, &json!({})).await.unwrap();
    }
}
