//! String heuristics for predicates that cannot use an index seek
//!
//! These are pattern matches over the raw predicate text each engine prints,
//! not a SQL parser. They catch the common shapes (a function applied to a
//! column, `LIKE '%...'`, implicit conversions) and will miss anything more
//! unusual.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Functions that hide a column from the optimizer when wrapped around it
///
/// The trailing group captures a quote right after the first word, which
/// marks a literal such as `N'abc'` rather than a column.
static FUNCTION_WRAPPED_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(upper|lower|trim|ltrim|rtrim|substring|substr|left|right|year|month|day|date|date_trunc|cast|convert|coalesce|isnull|ifnull|nvl|abs|round|floor|ceiling|length|len|concat)\s*\(\s*\(*\s*[\[`"]?[a-z_][a-z0-9_]*('?)"#,
    )
    .expect("valid regex")
});

static LEADING_WILDCARD_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(\blike\b|~~\*?)\s*\(*\s*[EN]?'%"#)
        .expect("valid regex")
});

static CONVERT_IMPLICIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCONVERT_IMPLICIT\s*\(\s*([a-z]+)")
        .expect("valid regex")
});

/// PostgreSQL `column::type` cast; literals (`'x'::date`) are not matched
static COLUMN_CAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z_][a-z0-9_.]*)\)?::([a-z_]+)")
        .expect("valid regex")
});

/// Casts Postgres adds to string comparisons; these do not block index use
const BENIGN_CASTS: &[&str] = &["text", "character", "bpchar", "varchar", "name"];

/// Why a predicate is not SARGable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SargabilityIssue {
    /// A function is applied to a column, e.g. `UPPER(email) = 'X'`
    FunctionWrappedColumn { function: String },
    /// `LIKE` pattern starting with `%`
    LeadingWildcardLike,
    /// The engine converts the column's type before comparing
    ImplicitConversion { target_type: String },
}

impl SargabilityIssue {
    /// Short description of the problem
    pub fn description(&self) -> String {
        match self {
            Self::FunctionWrappedColumn { function } => {
                format!("column is wrapped in {}()", function.to_uppercase())
            }
            Self::LeadingWildcardLike => "LIKE pattern starts with a wildcard".to_string(),
            Self::ImplicitConversion { target_type } => {
                format!("column is implicitly converted to {}", target_type)
            }
        }
    }

    /// How to rewrite the predicate so an index can be used
    pub fn fix_hint(&self) -> &'static str {
        match self {
            Self::FunctionWrappedColumn { .. } => {
                "compare the bare column against a transformed value, or index the expression"
            }
            Self::LeadingWildcardLike => {
                "anchor the pattern at the start, or use a full-text or trigram index"
            }
            Self::ImplicitConversion { .. } => {
                "pass parameters with the column's declared type so no conversion is needed"
            }
        }
    }
}

/// Returns every issue found in a predicate, in a fixed order
pub fn find_issues(predicate: &str) -> Vec<SargabilityIssue> {
    let mut issues = Vec::new();

    if let Some(caps) = FUNCTION_WRAPPED_COLUMN
        .captures_iter(predicate)
        .find(|caps| caps[2].is_empty())
    {
        issues.push(SargabilityIssue::FunctionWrappedColumn {
            function: caps[1].to_lowercase(),
        });
    }

    if LEADING_WILDCARD_LIKE.is_match(predicate) {
        issues.push(SargabilityIssue::LeadingWildcardLike);
    }

    if let Some(caps) = CONVERT_IMPLICIT.captures(predicate) {
        issues.push(SargabilityIssue::ImplicitConversion {
            target_type: caps[1].to_lowercase(),
        });
    } else if let Some(target) = COLUMN_CAST
        .captures_iter(predicate)
        .map(|caps| caps[2].to_lowercase())
        .find(|target| !BENIGN_CASTS.contains(&target.as_str()))
    {
        issues.push(SargabilityIssue::ImplicitConversion {
            target_type: target,
        });
    }

    issues
}

/// Returns true if the predicate shows any non-SARGable pattern
pub fn is_non_sargable(predicate: &str) -> bool {
    !find_issues(predicate).is_empty()
}
