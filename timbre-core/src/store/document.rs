//! Document store over JSON objects.
//!
//! Filters are top-level equality matches (`{"id": "m1"}`); patches are
//! `$set`-style top-level assignments. Every stored document carries a
//! numeric `revision` that starts at 1 and increments on each update. An
//! update may name the revision it read; a mismatch is a `RevisionConflict`
//! instead of a silent overwrite.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{Result, TimbreError};

pub const REVISION_FIELD: &str = "revision";

pub trait DocumentStore: Send + Sync + 'static {
    /// First document in `collection` matching every field of `filter`.
    fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>>;

    /// Apply `patch` to the first match and return the new revision.
    ///
    /// # Errors
    /// `NotFound` when nothing matches, `RevisionConflict` when
    /// `expected_revision` is set and differs from the stored one.
    fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        patch: &Value,
        expected_revision: Option<u64>,
    ) -> Result<u64>;

    /// Store a new document at revision 1.
    fn insert_one(&self, collection: &str, doc: Value) -> Result<()>;
}

/// `true` when every field of `filter` equals the same field of `doc`.
pub fn matches_filter(doc: &Value, filter: &Value) -> bool {
    match (doc, filter) {
        (Value::Object(d), Value::Object(f)) => f.iter().all(|(k, v)| d.get(k) == Some(v)),
        (_, Value::Null) => true,
        _ => false,
    }
}

pub fn revision_of(doc: &Value) -> u64 {
    doc.get(REVISION_FIELD).and_then(Value::as_u64).unwrap_or(0)
}

/// Assign every field of `patch` onto `doc` and bump its revision.
///
/// A `revision` field inside the patch is ignored.
pub fn apply_patch(doc: &mut Value, patch: &Value) -> Result<u64> {
    let Value::Object(fields) = patch else {
        return Err(TimbreError::InvalidJob("document patch must be an object".into()));
    };
    let next = revision_of(doc) + 1;
    let Value::Object(target) = doc else {
        return Err(TimbreError::InvalidJob("stored document is not an object".into()));
    };
    for (k, v) in fields {
        if k != REVISION_FIELD {
            target.insert(k.clone(), v.clone());
        }
    }
    target.insert(REVISION_FIELD.into(), Value::from(next));
    Ok(next)
}

/// Check `expected` against the stored revision.
pub fn check_revision(collection: &str, doc: &Value, expected: Option<u64>) -> Result<()> {
    match expected {
        Some(expected) if revision_of(doc) != expected => Err(TimbreError::RevisionConflict {
            collection: collection.to_string(),
            expected,
            found: revision_of(doc),
        }),
        _ => Ok(()),
    }
}

/// Prepare a document for insertion: must be an object, revision reset to 1.
pub fn prepare_insert(doc: Value) -> Result<Value> {
    let Value::Object(mut map) = doc else {
        return Err(TimbreError::InvalidJob("document must be a JSON object".into()));
    };
    map.insert(REVISION_FIELD.into(), Value::from(1u64));
    Ok(Value::Object(map))
}

pub fn not_found(collection: &str, filter: &Value) -> TimbreError {
    TimbreError::NotFound {
        collection: collection.to_string(),
        key: filter.to_string(),
    }
}

/// Process-local store used by tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Every document in `collection`, in insertion order.
    pub fn all(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| matches_filter(d, filter)))
            .cloned())
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        patch: &Value,
        expected_revision: Option<u64>,
    ) -> Result<u64> {
        let mut collections = self.collections.write();
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| matches_filter(d, filter)))
            .ok_or_else(|| not_found(collection, filter))?;
        check_revision(collection, doc, expected_revision)?;
        apply_patch(doc, patch)
    }

    fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        let doc = prepare_insert(doc)?;
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }
}

/// Build a single-field equality filter.
pub fn by(field: &str, value: impl Into<Value>) -> Value {
    let mut m = Map::new();
    m.insert(field.to_string(), value.into());
    Value::Object(m)
}
