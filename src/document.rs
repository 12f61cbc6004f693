//! Hierarchical export/import of the KV namespace
//!
//! The document is YAML. Nested mapping keys join with `:` into flat KV keys
//! on import and split back into nesting on export:
//!
//! ```yaml
//! _anchors:
//!   counters: &counters
//!     ok: 0
//!     error: 0
//! redirect:
//!   gh: https://github.com/x
//! metrics:
//!   redirect:
//!     gh:
//!       <<: *counters
//!       ok: 12
//! ```
//!
//! The top-level `_anchors` section only holds templates. Merge keys and
//! aliases are resolved first, then the section is dropped before anything
//! is written. A node that is both a value and a parent keeps its own value
//! under `_value`.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::error::{AppError, KvError};
use crate::kv::KvStore;

pub const ANCHORS_KEY: &str = "_anchors";
pub const VALUE_KEY: &str = "_value";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("document root must be a mapping")]
    NotAMapping,

    #[error("unsupported {kind} value at '{key}'")]
    Unsupported { key: String, kind: &'static str },

    #[error("invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl From<DocumentError> for AppError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Kv(kv) => AppError::Storage(kv),
            other => AppError::Validation(other.to_string()),
        }
    }
}

/// Keys selected by any of a set of regexes; no patterns selects everything
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    patterns: Vec<Regex>,
}

impl KeyFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, DocumentError> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(key))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub written: usize,
    pub skipped: usize,
}

fn segment_string(key: &Value) -> Result<String, DocumentError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(DocumentError::Unsupported {
            key: format!("{:?}", key),
            kind: "non-scalar key",
        }),
    }
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}:{}", prefix, segment)
    }
}

fn flatten_into(
    prefix: &str,
    value: &Value,
    out: &mut BTreeMap<String, String>,
) -> Result<(), DocumentError> {
    let scalar = match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let segment = segment_string(key)?;
                if segment == VALUE_KEY {
                    flatten_into(prefix, child, out)?;
                } else {
                    flatten_into(&join(prefix, &segment), child, out)?;
                }
            }
            return Ok(());
        }
        Value::Tagged(tagged) => return flatten_into(prefix, &tagged.value, out),
        // Empty leaves carry nothing to store.
        Value::Null => return Ok(()),
        Value::Sequence(_) => {
            return Err(DocumentError::Unsupported {
                key: prefix.to_string(),
                kind: "sequence",
            })
        }
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
    };

    if prefix.is_empty() {
        return Err(DocumentError::NotAMapping);
    }
    out.insert(prefix.to_string(), scalar);
    Ok(())
}

/// Flat `key -> scalar` view of an already-parsed document
pub fn flatten(document: &Value) -> Result<BTreeMap<String, String>, DocumentError> {
    let mut out = BTreeMap::new();
    flatten_into("", document, &mut out)?;
    Ok(out)
}

/// Parses YAML text, expands anchors and merge keys, drops `_anchors` and flattens
pub fn parse_document(text: &str) -> Result<BTreeMap<String, String>, DocumentError> {
    let mut document: Value = serde_yaml::from_str(text)?;
    document.apply_merge()?;

    match &mut document {
        Value::Mapping(root) => {
            root.remove(ANCHORS_KEY);
        }
        Value::Null => return Ok(BTreeMap::new()),
        _ => return Err(DocumentError::NotAMapping),
    }

    flatten(&document)
}

/// Canonical decimal integers become native integers, everything else stays text
fn scalar_value(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(n) if n.to_string() == raw => Value::Number(n.into()),
        _ => Value::String(raw.to_string()),
    }
}

fn insert_path(node: &mut Mapping, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let key = Value::String((*first).to_string());

    if rest.is_empty() {
        match node.get_mut(&key) {
            Some(Value::Mapping(existing)) => {
                existing.insert(Value::String(VALUE_KEY.to_string()), value);
            }
            _ => {
                node.insert(key, value);
            }
        }
        return;
    }

    let child = node
        .entry(key)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !child.is_mapping() {
        let own = std::mem::replace(child, Value::Mapping(Mapping::new()));
        if let Value::Mapping(map) = child {
            map.insert(Value::String(VALUE_KEY.to_string()), own);
        }
    }
    if let Value::Mapping(map) = child {
        insert_path(map, rest, value);
    }
}

/// Builds the nested document for a set of flat entries
pub fn explode<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut root = Mapping::new();
    for (key, raw) in entries {
        let segments: Vec<&str> = key.split(':').collect();
        insert_path(&mut root, &segments, scalar_value(&raw));
    }
    Value::Mapping(root)
}

pub async fn export_document(kv: &dyn KvStore, filter: &KeyFilter) -> Result<Value, DocumentError> {
    let entries = kv
        .list("")
        .await?
        .into_iter()
        .filter(|(key, _)| filter.matches(key));
    Ok(explode(entries))
}

pub async fn import_document(
    kv: &dyn KvStore,
    text: &str,
    filter: &KeyFilter,
) -> Result<ImportSummary, DocumentError> {
    let entries = parse_document(text)?;
    let mut summary = ImportSummary::default();

    for (key, value) in entries {
        if !filter.matches(&key) {
            summary.skipped += 1;
            continue;
        }
        kv.put(&key, &value).await?;
        summary.written += 1;
    }

    tracing::info!(
        written = summary.written,
        skipped = summary.skipped,
        "kv document imported"
    );
    Ok(summary)
}

pub fn to_yaml(document: &Value) -> Result<String, DocumentError> {
    Ok(serde_yaml::to_string(document)?)
}
