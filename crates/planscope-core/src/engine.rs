//! Source engine identities
//!
//! Every plan document is produced by some database engine. The engine
//! decides which adapter parses the document and how identifiers are quoted
//! in generated DDL.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Database engine that produced an execution-plan document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceEngine {
    /// SQL Server showplan XML
    SqlServer,
    /// PostgreSQL EXPLAIN (FORMAT JSON or text)
    Postgres,
    /// MySQL EXPLAIN FORMAT=JSON
    MySql,
    /// planscope's own canonical JSON rendering of a normalized plan
    Native,
}

impl SourceEngine {
    /// All engines, in declaration order
    pub const ALL: [SourceEngine; 4] = [
        SourceEngine::SqlServer,
        SourceEngine::Postgres,
        SourceEngine::MySql,
        SourceEngine::Native,
    ];

    /// Resolves a caller-supplied engine hint
    ///
    /// Hints are matched case-insensitively against the canonical id and the
    /// common aliases. Returns `None` for engines with no registered grammar.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "sqlserver" | "sql server" | "mssql" | "tsql" | "t-sql" => Some(Self::SqlServer),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "native" | "planscope" => Some(Self::Native),
            _ => None,
        }
    }

    /// Canonical id, the form `from_hint` always accepts
    pub fn id(&self) -> &'static str {
        match self {
            Self::SqlServer => "sqlserver",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Native => "native",
        }
    }

    /// Display name for this engine
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::SqlServer => "SQL Server",
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Native => "planscope",
        }
    }

    /// Quotes an identifier the way this engine expects in DDL
    pub fn quote_identifier(&self, ident: &str) -> String {
        match self {
            Self::SqlServer => format!("[{}]", ident.replace(']', "]]")),
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Postgres | Self::Native => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Returns true if this engine supports `INCLUDE (...)` columns on indexes
    pub fn supports_included_columns(&self) -> bool {
        matches!(self, Self::SqlServer | Self::Postgres)
    }
}

impl fmt::Display for SourceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
