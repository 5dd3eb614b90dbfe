//! Player data seeding
//!
//! Loads `test_players.csv`, `odi_players.csv` and `t20_players.csv` into
//! the three stats collections. Each collection is cleared before its file
//! is loaded.

use crate::models::Collection;
use crate::store::{Document, DocumentStore};
use crate::Result;
use serde::Serialize;
use serde_json::{json, Number, Value};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum SeedStatus {
    Success,
    NoData,
    FileNotFound,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeedReport {
    pub collection: Collection,
    pub status: SeedStatus,
    pub count: usize,
}

pub fn file_name(collection: Collection) -> String {
    format!("{}_players.csv", collection.as_str())
}

/// Seed every collection from `dir`. A missing file is reported, not an error.
pub async fn seed_collections(store: &dyn DocumentStore, dir: &Path) -> Result<Vec<SeedReport>> {
    let mut reports = Vec::with_capacity(Collection::ALL.len());

    for collection in Collection::ALL {
        let path = dir.join(file_name(collection));
        if !path.exists() {
            warn!("File not found: {}", path.display());
            reports.push(SeedReport {
                collection,
                status: SeedStatus::FileNotFound,
                count: 0,
            });
            continue;
        }

        info!("Seeding {} data from {}...", collection, path.display());
        let raw = tokio::fs::read_to_string(&path).await?;
        let rows = parse_rows(&raw)?;

        store.delete_many(collection.as_str(), &json!({})).await?;

        let count = if rows.is_empty() {
            warn!("No data found in {}", path.display());
            0
        } else {
            store.insert_many(collection.as_str(), rows).await?
        };

        info!("Seeded {} rows for {}", count, collection);
        reports.push(SeedReport {
            collection,
            status: if count > 0 {
                SeedStatus::Success
            } else {
                SeedStatus::NoData
            },
            count,
        });
    }

    Ok(reports)
}

/// One document per CSV record, keyed by the header row.
fn parse_rows(raw: &str) -> Result<Vec<Document>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(raw.as_bytes());
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Document = headers
            .iter()
            .zip(record.iter())
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect();
        rows.push(clean_row(row));
    }

    Ok(rows)
}

/// Drop empty keys and turn numeric-looking strings into numbers.
fn clean_row(row: Document) -> Document {
    row.into_iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key, numeric(value)))
        .collect()
}

fn numeric(value: Value) -> Value {
    let Value::String(s) = &value else {
        return value;
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return value;
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) => Value::Number(n),
        None => value,
    }
}
