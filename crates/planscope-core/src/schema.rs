//! Schema metadata collaborator contract
//!
//! Index recommendations are only trustworthy when the recommender knows
//! which columns a table actually has and which indexes already exist. That
//! knowledge lives outside the analysis core (a live connection, a cache, a
//! catalog dump), so the core asks for it through `SchemaMetadataProvider`.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a table, optionally schema-qualified
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    /// Creates an unqualified table reference
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }

    /// Sets the schema name
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Returns true if `other` names the same table
    ///
    /// Names compare case-insensitively. A missing schema on either side
    /// matches any schema.
    pub fn matches(&self, other: &TableRef) -> bool {
        if !self.table.eq_ignore_ascii_case(&other.table) {
            return false;
        }
        match (&self.schema, &other.schema) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => true,
        }
    }

    /// Lower-cased `schema.table` key used for grouping
    pub fn key(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema.to_lowercase(), self.table.to_lowercase()),
            None => self.table.to_lowercase(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

/// Existing index on a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    /// Key columns, in index order
    pub columns: Vec<String>,
    /// Non-key columns carried at the leaf level
    #[serde(default)]
    pub included_columns: Vec<String>,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_primary: bool,
}

impl IndexMetadata {
    /// Creates an index description from its key columns
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            included_columns: Vec::new(),
            is_unique: false,
            is_primary: false,
        }
    }

    /// Marks the index as the primary key
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.is_unique = true;
        self
    }

    /// Sets the included (non-key) columns
    pub fn with_included_columns(mut self, columns: Vec<String>) -> Self {
        self.included_columns = columns;
        self
    }
}

/// Columns and indexes of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table: TableRef,
    pub columns: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexMetadata>,
}

impl TableMetadata {
    pub fn new(table: TableRef, columns: Vec<String>) -> Self {
        Self {
            table,
            columns,
            indexes: Vec::new(),
        }
    }

    /// Adds an existing index
    pub fn with_index(mut self, index: IndexMetadata) -> Self {
        self.indexes.push(index);
        self
    }

    /// Returns true if the table has a column with this name (case-insensitive)
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Point-in-time view of the metadata for a set of tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: Vec<TableMetadata>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableMetadata>) -> Self {
        Self { tables }
    }

    /// Adds a table
    pub fn with_table(mut self, table: TableMetadata) -> Self {
        self.tables.push(table);
        self
    }

    /// Finds the metadata for a table
    pub fn table(&self, table: &TableRef) -> Option<&TableMetadata> {
        self.tables.iter().find(|t| t.table.matches(table))
    }

    /// Returns all tables in the snapshot
    pub fn tables(&self) -> &[TableMetadata] {
        &self.tables
    }

    /// Returns true if the snapshot describes no tables
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Outcome of a metadata lookup
///
/// Providers never fail into the caller: an error becomes `Unavailable`.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaLookup {
    Available(SchemaSnapshot),
    Unavailable { reason: String },
}

impl SchemaLookup {
    /// Creates an unavailable signal
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Returns the snapshot if metadata is available
    pub fn snapshot(&self) -> Option<&SchemaSnapshot> {
        match self {
            Self::Available(snapshot) => Some(snapshot),
            Self::Unavailable { .. } => None,
        }
    }

    /// Returns true if metadata is available
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

impl From<Result<SchemaSnapshot>> for SchemaLookup {
    fn from(result: Result<SchemaSnapshot>) -> Self {
        match result {
            Ok(snapshot) => Self::Available(snapshot),
            Err(e) => {
                tracing::debug!("Schema metadata lookup failed: {}", e);
                Self::unavailable(e.to_string())
            }
        }
    }
}

/// Source of table and index metadata for recommendation synthesis
#[async_trait]
pub trait SchemaMetadataProvider: Send + Sync {
    /// Looks up metadata for the given tables
    ///
    /// Tables unknown to the provider are simply absent from the snapshot.
    async fn lookup(&self, tables: &[TableRef]) -> SchemaLookup;
}

/// Provider that serves a fixed snapshot
///
/// Useful when the caller already holds the metadata (for example from a
/// schema cache) and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaProvider {
    snapshot: SchemaSnapshot,
}

impl StaticSchemaProvider {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SchemaMetadataProvider for StaticSchemaProvider {
    async fn lookup(&self, tables: &[TableRef]) -> SchemaLookup {
        let matched = self
            .snapshot
            .tables()
            .iter()
            .filter(|meta| tables.iter().any(|t| meta.table.matches(t)))
            .cloned()
            .collect();
        SchemaLookup::Available(SchemaSnapshot::new(matched))
    }
}
