//! Mongo-style filter and sort evaluation over JSON documents
//!
//! Shared by every `DocumentStore` backend so that a query means the same
//! thing whether it runs in memory or against postgres.

use super::{Document, FindQuery};
use crate::error::PipelineError;
use crate::Result;
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;

/// Sort key selecting insertion order.
pub const NATURAL: &str = "$natural";

/// True when `value` is an object whose keys are all `$operators`.
pub fn is_operator_object(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')),
        None => false,
    }
}

/// Evaluate `filter` against `doc`.
pub fn matches(doc: &Document, filter: &Value) -> Result<bool> {
    let conditions = filter.as_object().ok_or_else(|| {
        PipelineError::InvalidQuery(format!("filter must be an object, got {}", filter))
    })?;

    for (key, cond) in conditions {
        let ok = match key.as_str() {
            "$and" => logical_list(cond, key)?
                .iter()
                .try_fold(true, |acc, f| Ok::<_, PipelineError>(acc && matches(doc, f)?))?,
            "$or" => {
                let mut any = false;
                for f in logical_list(cond, key)? {
                    if matches(doc, f)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for f in logical_list(cond, key)? {
                    if matches(doc, f)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(PipelineError::InvalidQuery(format!(
                    "unsupported top-level operator {}",
                    op
                )))
            }
            path => field_matches(lookup(doc, path), cond)?,
        };

        if !ok {
            return Ok(false);
        }
    }

    Ok(true)
}

fn logical_list<'a>(cond: &'a Value, op: &str) -> Result<&'a Vec<Value>> {
    cond.as_array()
        .ok_or_else(|| PipelineError::InvalidQuery(format!("{} expects an array", op)))
}

/// Resolve a dotted path such as `stats.runs`.
fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn field_matches(value: Option<&Value>, cond: &Value) -> Result<bool> {
    let Some(ops) = cond.as_object().filter(|_| is_operator_object(cond)) else {
        return Ok(equals_or_contains(value, cond));
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_or_contains(value, arg),
            "$ne" => !equals_or_contains(value, arg),
            "$gt" => compare_with(value, arg, &|o| o == Ordering::Greater),
            "$gte" => compare_with(value, arg, &|o| o != Ordering::Less),
            "$lt" => compare_with(value, arg, &|o| o == Ordering::Less),
            "$lte" => compare_with(value, arg, &|o| o != Ordering::Greater),
            "$in" => in_list(value, arg, op)?,
            "$nin" => !in_list(value, arg, op)?,
            "$exists" => value.is_some() == truthy(arg),
            "$regex" => regex_matches(value, arg, ops.get("$options"))?,
            "$options" => true,
            "$not" => !field_matches(value, arg)?,
            other => {
                return Err(PipelineError::InvalidQuery(format!(
                    "unsupported operator {}",
                    other
                )))
            }
        };

        if !ok {
            return Ok(false);
        }
    }

    Ok(true)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Equality that also matches any element of an array-valued field.
fn equals_or_contains(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
    }
}

fn in_list(value: Option<&Value>, arg: &Value, op: &str) -> Result<bool> {
    let candidates = arg
        .as_array()
        .ok_or_else(|| PipelineError::InvalidQuery(format!("{} expects an array", op)))?;
    Ok(candidates.iter().any(|c| equals_or_contains(value, c)))
}

/// Ordered comparison only between values of the same kind.
fn compare_with(value: Option<&Value>, arg: &Value, pred: &dyn Fn(Ordering) -> bool) -> bool {
    let Some(value) = value else {
        return false;
    };

    let ord = match (value, arg) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Array(items), _) => {
            return items.iter().any(|item| compare_with(Some(item), arg, pred));
        }
        _ => None,
    };

    ord.map(|o| pred(o)).unwrap_or(false)
}

fn regex_matches(value: Option<&Value>, pattern: &Value, options: Option<&Value>) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| PipelineError::InvalidQuery("$regex expects a string".to_string()))?;
    let options = options.and_then(Value::as_str).unwrap_or("");

    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| PipelineError::InvalidQuery(format!("invalid $regex '{}': {}", pattern, e)))?;

    Ok(match value {
        Some(Value::String(s)) => re.is_match(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|s| re.is_match(s)),
        _ => false,
    })
}

//
// ================= Sorting =================
//

/// Parse `{field: 1 | -1}` into ordered (field, ascending) pairs.
fn sort_keys(sort: &Value) -> Result<Vec<(String, bool)>> {
    let Some(obj) = sort.as_object() else {
        if sort.is_null() {
            return Ok(Vec::new());
        }
        return Err(PipelineError::InvalidQuery(format!(
            "sort must be an object, got {}",
            sort
        )));
    };

    obj.iter()
        .map(|(field, dir)| {
            let ascending = match dir {
                Value::Number(n) if n.as_f64() == Some(1.0) => true,
                Value::Number(n) if n.as_f64() == Some(-1.0) => false,
                Value::String(s) if matches!(s.to_lowercase().as_str(), "asc" | "ascending") => true,
                Value::String(s) if matches!(s.to_lowercase().as_str(), "desc" | "descending") => false,
                other => {
                    return Err(PipelineError::InvalidQuery(format!(
                        "invalid sort direction for {}: {}",
                        field, other
                    )))
                }
            };
            Ok((field.clone(), ascending))
        })
        .collect()
}

/// Mongo's cross-type ordering: null < numbers < strings < objects < arrays < booleans.
fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Filter, sort and limit documents given in insertion order as `(seq, doc)`.
pub fn apply_query(docs: Vec<(u64, Document)>, query: &FindQuery) -> Result<Vec<Document>> {
    let keys = sort_keys(&query.sort)?;

    let mut selected = Vec::new();
    for (seq, doc) in docs {
        if matches(&doc, &query.filter)? {
            selected.push((seq, doc));
        }
    }

    if !keys.is_empty() {
        selected.sort_by(|(seq_a, a), (seq_b, b)| {
            for (field, ascending) in &keys {
                let ord = if field == NATURAL {
                    seq_a.cmp(seq_b)
                } else {
                    compare_values(lookup(a, field), lookup(b, field))
                };
                let ord = if *ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let limit = query.limit.unwrap_or(usize::MAX);
    Ok(selected.into_iter().take(limit).map(|(_, d)| d).collect())
}
