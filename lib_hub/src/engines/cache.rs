//! # Snapshot Cache
//!
//! The materialized current state of one feed. Rows are keyed by the value of a
//! configured key column, so a later row for the same key replaces the earlier
//! one. The cache is bounded: once `limit` keys are held, inserting a new key
//! evicts the oldest inserted key.
//!
//! Keys are typed: the number `42` and the string `"42"` are different keys.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

/// The cache key of a row: the key column's value, kept apart by JSON type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Text(String),
    /// A number, by its JSON text.
    Number(String),
    Bool(bool),
}

impl RowKey {
    /// Strings (non-empty), numbers and booleans are keys; anything else is not.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self::Text(s.clone())),
            Value::Number(n) => Some(Self::Number(n.to_string())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }
}

/// What happened to one row handed to [`SnapshotCache::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Inserted, and the oldest key was dropped to stay within the limit.
    InsertedWithEviction,
    /// The row has no usable key and was not cached.
    MissingKey,
}

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    key_column: String,
    limit: usize,
    rows: HashMap<RowKey, Value>,
    order: VecDeque<RowKey>,
}

impl SnapshotCache {
    pub fn new(key_column: &str, limit: usize) -> Self {
        Self {
            key_column: key_column.to_string(),
            limit: limit.max(1),
            rows: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Extracts the cache key of `row`.
    pub fn key_of(&self, row: &Value) -> Option<RowKey> {
        RowKey::from_value(row.get(&self.key_column)?)
    }

    pub fn upsert(&mut self, row: Value) -> UpsertOutcome {
        let Some(key) = self.key_of(&row) else {
            return UpsertOutcome::MissingKey;
        };

        if let Some(slot) = self.rows.get_mut(&key) {
            *slot = row;
            return UpsertOutcome::Updated;
        }

        let mut outcome = UpsertOutcome::Inserted;
        if self.rows.len() >= self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.rows.remove(&oldest);
                outcome = UpsertOutcome::InsertedWithEviction;
            }
        }
        self.order.push_back(key.clone());
        self.rows.insert(key, row);
        outcome
    }

    /// The cached row whose key column equals `key`.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.rows.get(&RowKey::from_value(key)?)
    }

    /// All cached rows, oldest key first.
    pub fn rows(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|key| self.rows.get(key).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.order.clear();
    }
}
