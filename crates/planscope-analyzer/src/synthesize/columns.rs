//! Column extraction from raw predicate text (best effort)
//!
//! Predicates arrive in each engine's own notation:
//! `[dbo].[Orders].[CustomerId] = (42)`, `((status)::text = 'x'::text)`,
//! `` (`shop`.`users`.`email` = 'a') ``. Each conjunct is split at its first
//! comparison operator and the left-hand side is kept when it reduces to a
//! plain column reference.

use regex::Regex;
use std::sync::LazyLock;

static CONNECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(and|or)\s+").expect("valid regex"));

static CAST_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"::[A-Za-z_ ]+(\[\])?").expect("valid regex"));

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("valid regex"));

/// Comparison operators, longest first so `>=` wins over `>`
const OPERATORS: &[(&str, ColumnUse)] = &[
    ("<>", ColumnUse::Range),
    ("!=", ColumnUse::Range),
    (">=", ColumnUse::Range),
    ("<=", ColumnUse::Range),
    ("=", ColumnUse::Equality),
    (">", ColumnUse::Range),
    ("<", ColumnUse::Range),
    (" ~~", ColumnUse::Range),
    (" LIKE ", ColumnUse::Range),
    (" BETWEEN ", ColumnUse::Range),
    (" IN ", ColumnUse::Equality),
    (" IN(", ColumnUse::Equality),
    (" IS ", ColumnUse::Equality),
];

/// How a predicate uses a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnUse {
    /// `=`, `IN`, `IS NULL`: can lead an index
    Equality,
    /// Ranges and pattern matches: belong after the equality columns
    Range,
}

/// Columns referenced by a set of predicates, split by use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredicateColumns {
    pub equality: Vec<String>,
    pub range: Vec<String>,
}

impl PredicateColumns {
    /// Adds a column unless it is already present (case-insensitive)
    ///
    /// A column seen in an equality after a range moves to the equality list.
    pub fn add(&mut self, column: String, usage: ColumnUse) {
        if contains_column(&self.equality, &column) {
            return;
        }
        match usage {
            ColumnUse::Equality => {
                self.range.retain(|c| !c.eq_ignore_ascii_case(&column));
                self.equality.push(column);
            }
            ColumnUse::Range => {
                if !contains_column(&self.range, &column) {
                    self.range.push(column);
                }
            }
        }
    }

    /// Adds every column referenced by a predicate
    pub fn add_predicate(&mut self, predicate: &str) {
        for (column, usage) in extract_columns(predicate) {
            self.add(column, usage);
        }
    }

    /// Equality columns first, then range columns
    pub fn index_order(&self) -> Vec<String> {
        self.equality.iter().chain(&self.range).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.equality.is_empty() && self.range.is_empty()
    }
}

/// Returns true if `columns` holds `column`, ignoring case
pub fn contains_column(columns: &[String], column: &str) -> bool {
    columns.iter().any(|c| c.eq_ignore_ascii_case(column))
}

/// Extracts `(column, use)` pairs from one predicate, in order of appearance
pub fn extract_columns(predicate: &str) -> Vec<(String, ColumnUse)> {
    let mut columns: Vec<(String, ColumnUse)> = Vec::new();

    for part in CONNECTIVE.split(predicate) {
        let upper = part.to_ascii_uppercase();

        // The earliest operator splits the conjunct; on a tie the longer
        // operator comes first in the table
        let first = OPERATORS
            .iter()
            .filter_map(|(op, usage)| upper.find(op).map(|idx| (idx, *usage)))
            .min_by_key(|(idx, _)| *idx);

        if let Some((idx, usage)) = first
            && let Some(column) = column_name(&part[..idx])
            && !columns.iter().any(|(c, _)| c.eq_ignore_ascii_case(&column))
        {
            columns.push((column, usage));
        }
    }

    columns
}

/// Reduces a left-hand side to a bare column name
///
/// Returns `None` for literals, parameters, and anything wrapped in a
/// function call, since an index on the raw column would not help those.
pub fn column_name(expression: &str) -> Option<String> {
    let without_casts = CAST_SUFFIX.replace_all(expression, "");
    let trimmed = without_casts
        .trim()
        .trim_start_matches(['(', ' '])
        .trim_end_matches([')', ' ']);
    if trimmed.contains('(') || trimmed.contains(')') {
        return None;
    }

    let last = trimmed.rsplit('.').next().unwrap_or(trimmed);
    let clean = last
        .trim()
        .trim_start_matches(['[', '`', '"'])
        .trim_end_matches([']', '`', '"']);

    IDENTIFIER.is_match(clean).then(|| clean.to_string())
}
