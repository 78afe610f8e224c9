//! Interface to the relational engine backing a registry.
//!
//! The registry only needs a handful of primitives: idempotent table
//! creation, row queries with equality filters, plain inserts/deletes, and
//! the atomic insert-or-verify `sync` that makes concurrent registration
//! safe without explicit locks. Table layouts are described as data
//! (`TableSpec`) so dynamic per-dimension-group tables can be created on
//! demand and reopened by name.

mod memory;

pub use memory::MemoryDatabase;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    String,
    Bool,
    /// ISO-8601 string; ordering comparisons happen above the engine.
    Timestamp,
    /// Free-form JSON value.
    Json,
}

impl FieldType {
    pub(crate) fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::Int => value.as_i64().is_some(),
            FieldType::String | FieldType::Timestamp => value.is_string(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub dtype: FieldType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub autoincrement: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, dtype: FieldType) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable: false,
            autoincrement: false,
            primary_key: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Integer primary key filled in by the engine when absent.
    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self.primary_key = true;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    Restrict,
    Cascade,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    pub table: String,
    pub source: Vec<String>,
    pub target: Vec<String>,
    #[serde(default)]
    pub on_delete: OnDelete,
}

impl ForeignKeySpec {
    pub fn new(table: impl Into<String>, source: &[&str], target: &[&str]) -> Self {
        Self {
            table: table.into(),
            source: source.iter().map(|s| s.to_string()).collect(),
            target: target.iter().map(|s| s.to_string()).collect(),
            on_delete: OnDelete::Restrict,
        }
    }

    pub fn cascade(mut self) -> Self {
        self.on_delete = OnDelete::Cascade;
        self
    }
}

/// Declarative description of a table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeySpec>,
}

impl TableSpec {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            unique: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn with_unique(mut self, columns: &[&str]) -> Self {
        self.unique
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKeySpec) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name.clone())
            .collect()
    }
}

/// Handle to a table known to exist in the database.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table {
    name: String,
}

impl Table {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Predicate {
    pub(crate) fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Eq(column, value) => row.get(column).unwrap_or(&Value::Null) == value,
            Predicate::In(column, values) => {
                let cell = row.get(column).unwrap_or(&Value::Null);
                values.iter().any(|v| v == cell)
            }
        }
    }
}

/// Row selection over a single table with conjunctive filters.
#[derive(Clone, Debug)]
pub struct Select {
    pub table: Table,
    pub filter: Vec<Predicate>,
}

impl Select {
    pub fn from(table: &Table) -> Self {
        Self {
            table: table.clone(),
            filter: Vec::new(),
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filter.push(Predicate::Eq(column.to_string(), value.into()));
        self
    }

    pub fn within(mut self, column: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.filter
            .push(Predicate::In(column.to_string(), values.into_iter().collect()));
        self
    }
}

/// Relational engine used by the registry managers.
///
/// Implementations must make `sync` atomic: concurrent callers racing to
/// register the same key observe exactly one insert and the same returned
/// row.
pub trait Database: Send + Sync {
    /// Create the table if missing; an existing table must match `spec`.
    fn ensure_table_exists(&self, name: &str, spec: &TableSpec) -> Result<Table>;

    /// Open a table created earlier, or `None` when it does not exist.
    fn get_existing_table(&self, name: &str, spec: &TableSpec) -> Result<Option<Table>>;

    /// Insert `keys ∪ compared` if no row matches `keys`; otherwise verify
    /// the existing row's `compared` columns. Returns the `returning`
    /// columns of the authoritative row and whether an insert happened.
    fn sync(&self, table: &Table, keys: Row, compared: Row, returning: &[&str])
    -> Result<(Row, bool)>;

    /// Insert rows atomically; returns the stored rows with generated keys.
    fn insert(&self, table: &Table, rows: Vec<Row>) -> Result<Vec<Row>>;

    fn query(&self, select: &Select) -> Result<Vec<Row>>;

    /// Set `values` on every row matching `filter`; returns the row count.
    fn update(&self, table: &Table, filter: &[Predicate], values: Row) -> Result<usize>;

    /// Delete matching rows, honoring foreign-key `on_delete` rules.
    fn delete(&self, table: &Table, filter: &[Predicate]) -> Result<usize>;
}

/// Build a row from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Read an integer column, reporting a typed error when it is absent.
pub fn int_column(row: &Row, column: &str) -> Result<i64> {
    row.get(column).and_then(Value::as_i64).ok_or_else(|| {
        crate::error::RegistryError::Internal(format!("row is missing integer column '{column}'"))
    })
}

/// Read a string column, reporting a typed error when it is absent.
pub fn str_column<'a>(row: &'a Row, column: &str) -> Result<&'a str> {
    row.get(column).and_then(Value::as_str).ok_or_else(|| {
        crate::error::RegistryError::Internal(format!("row is missing string column '{column}'"))
    })
}
