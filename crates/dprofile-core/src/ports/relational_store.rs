//! Relational store port (driven/secondary port)
//!
//! This module defines the row-level interface the trust ledger uses to
//! persist its four tables.
//!
//! ## Design Notes
//!
//! - Statements are expressed as table name + column values + a `WHERE`
//!   fragment with positional `?` arguments, so the ledger never builds
//!   values into SQL text.
//! - Implementations detect corruption themselves and retry once after
//!   restoring from backup; callers only see the final outcome.
//! - Errors are classified ([`StorageError`]) because the ledger maps them
//!   onto its own taxonomy.

use std::collections::BTreeMap;

use crate::domain::StorageError;

/// A single column value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

/// Column name to value, ordered for deterministic SQL
pub type ValuesBucket = BTreeMap<String, Value>;

/// One result row keyed by column name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(columns: BTreeMap<String, Value>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Integer column; missing, NULL or text columns read as 0
    pub fn get_i64(&self, column: &str) -> i64 {
        match self.columns.get(column) {
            Some(Value::Integer(v)) => *v,
            Some(Value::Text(s)) => s.parse().unwrap_or_default(),
            _ => 0,
        }
    }

    pub fn get_i32(&self, column: &str) -> i32 {
        i32::try_from(self.get_i64(column)).unwrap_or_default()
    }

    pub fn get_u32(&self, column: &str) -> u32 {
        u32::try_from(self.get_i64(column)).unwrap_or_default()
    }

    /// Text column; missing or NULL columns read as empty
    pub fn get_string(&self, column: &str) -> String {
        match self.columns.get(column) {
            Some(Value::Text(s)) => s.clone(),
            Some(Value::Integer(v)) => v.to_string(),
            _ => String::new(),
        }
    }
}

/// Port for row-level access to the relational store
///
/// ## Implementation Notes
///
/// - Every method fails with [`StorageError::Unavailable`] before `init`
///   and after `uninit`.
/// - A corruption error triggers one `restore` and one retry of the same
///   statement. A failed restore surfaces [`StorageError::RestoreFailed`].
#[async_trait::async_trait]
pub trait IRelationalStore: Send + Sync {
    /// Opens the store and applies the schema
    async fn init(&self) -> Result<(), StorageError>;

    /// Closes the store
    async fn uninit(&self) -> Result<(), StorageError>;

    /// Inserts a row and returns its row id
    async fn put(&self, table: &str, values: &ValuesBucket) -> Result<i64, StorageError>;

    /// Deletes matching rows and returns how many were removed
    async fn delete(
        &self,
        table: &str,
        where_clause: &str,
        args: &[Value],
    ) -> Result<u64, StorageError>;

    /// Updates matching rows and returns how many changed
    async fn update(
        &self,
        table: &str,
        values: &ValuesBucket,
        where_clause: &str,
        args: &[Value],
    ) -> Result<u64, StorageError>;

    /// Runs a read-only statement
    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, StorageError>;

    /// Writes a backup used by `restore`
    async fn backup(&self) -> Result<(), StorageError>;

    /// Replaces the store with the last backup and reopens it
    async fn restore(&self) -> Result<(), StorageError>;
}
