//! Secondary index collaborator.
//!
//! An [`IndexProvider`] holds any number of index stores, each a set of
//! documents made of typed fields. The graph engine wires a provider next to
//! the [`crate::StoreManager`]; the storage adapter itself never calls it.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

/// Value type a field is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Text,
    Integer,
    Float,
    Boolean,
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl IndexValue {
    pub fn data_type(&self) -> DataType {
        match self {
            IndexValue::Text(_) => DataType::Text,
            IndexValue::Integer(_) => DataType::Integer,
            IndexValue::Float(_) => DataType::Float,
            IndexValue::Boolean(_) => DataType::Boolean,
        }
    }
}

/// One field of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub field: String,
    pub value: IndexValue,
}

impl IndexEntry {
    pub fn new(field: impl Into<String>, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

/// Changes to one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexMutation {
    /// Fields to set.
    pub additions: Vec<IndexEntry>,
    /// Field names to remove.
    pub deletions: Vec<String>,
    /// Remove the whole document before applying additions.
    pub delete_document: bool,
}

impl IndexMutation {
    pub fn new(additions: Vec<IndexEntry>, deletions: Vec<String>) -> Self {
        Self {
            additions,
            deletions,
            delete_document: false,
        }
    }

    /// Drop the document entirely.
    pub fn delete_document() -> Self {
        Self {
            delete_document: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty() && !self.delete_document
    }
}

/// Index store -> document id -> mutation.
pub type IndexMutations = BTreeMap<String, BTreeMap<String, IndexMutation>>;

/// Condition over a document's fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(String, IndexValue),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Evaluate against a document's fields.
    pub fn matches(&self, fields: &BTreeMap<String, IndexValue>) -> bool {
        match self {
            Predicate::Equals(field, value) => fields.get(field) == Some(value),
            Predicate::And(all) => all.iter().all(|p| p.matches(fields)),
            Predicate::Or(any) => any.iter().any(|p| p.matches(fields)),
            Predicate::Not(inner) => !inner.matches(fields),
        }
    }
}

/// A query against one index store.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub store: String,
    pub predicate: Predicate,
    pub limit: Option<usize>,
}

impl IndexQuery {
    pub fn new(store: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            store: store.into(),
            predicate,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Transaction handle issued by an index provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTransaction {
    id: Uuid,
    started_at: Instant,
}

impl IndexTransaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl Default for IndexTransaction {
    fn default() -> Self {
        Self::new()
    }
}

/// External index used for field queries.
#[async_trait]
pub trait IndexProvider: Send + Sync {
    /// Declare the type of `key` in `store` before it is used in documents.
    async fn register(
        &self,
        store: &str,
        key: &str,
        data_type: DataType,
        tx: &IndexTransaction,
    ) -> Result<()>;

    /// Apply document changes, grouped by store and document id.
    async fn mutate(&self, mutations: &IndexMutations, tx: &IndexTransaction) -> Result<()>;

    /// Ids of all documents matching the query.
    async fn query(&self, query: &IndexQuery, tx: &IndexTransaction) -> Result<Vec<String>>;

    async fn begin_transaction(&self) -> Result<IndexTransaction>;

    async fn close(&self) -> Result<()>;

    /// Remove every entry in every store.
    async fn clear_storage(&self) -> Result<()>;
}
