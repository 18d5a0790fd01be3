//! Recommendation Synthesizer
//!
//! Turns classified bottlenecks into ranked recommendations:
//!
//! - Scan, key lookup and spilling-sort bottlenecks become `CreateIndex`
//!   candidates per table, built from the columns their predicates reference.
//!   Candidates whose column lists are prefixes of one another are merged;
//!   any other overlap is kept and flagged for manual review.
//! - With schema metadata, candidates already served by an existing index are
//!   dropped, and candidates that extend an existing index become
//!   `SchemaChange` recommendations.
//! - Non-SARGable predicates and row estimation skew become `RewriteQuery`
//!   recommendations, which need no schema metadata.
//!
//! Impact is the summed cost share of the supporting nodes, capped at 90%.

pub mod columns;
pub mod ddl;

use crate::cancel::Deadline;
use crate::classify::{Bottleneck, BottleneckCategory, BottleneckRef, SargabilityIssue, Severity};
use crate::plan::NodeId;
use columns::{ColumnUse, PredicateColumns, contains_column};
use planscope_core::{IndexMetadata, SchemaLookup, SchemaSnapshot, SourceEngine, TableMetadata, TableRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Upper bound for `impact_estimate`; no single change removes all cost
pub const MAX_IMPACT_PERCENT: f64 = 90.0;

/// Kind of recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    CreateIndex,
    RewriteQuery,
    SchemaChange,
}

/// Confidence in a recommendation, ordered `Low < Medium < High`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::High => Self::High,
            Severity::Medium => Self::Medium,
            Severity::Low => Self::Low,
        }
    }

    /// One step lower, saturating at `Low`
    pub fn lowered(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

/// A synthesized suggestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub target_object: Option<TableRef>,
    pub title: String,
    pub description: String,
    /// Index key columns, in key order
    pub columns: Vec<String>,
    /// Non-key columns carried at the index leaf level
    pub include_columns: Vec<String>,
    /// Generated DDL for index and schema recommendations
    pub script: Option<String>,
    /// Predicate to rewrite, for `RewriteQuery`
    pub predicate: Option<String>,
    /// Heuristic improvement estimate in percent, within 0-90
    pub impact_estimate: f64,
    pub confidence: Confidence,
    pub supporting_bottlenecks: Vec<BottleneckRef>,
    /// Set when another index candidate on the same table overlaps this one
    /// in a way that could not be merged automatically
    pub needs_manual_review: bool,
}

impl Recommendation {
    /// Returns true if this recommendation proposes DDL
    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }
}

/// Non-fatal synthesis issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SynthesisWarning {
    /// No schema metadata; index and schema recommendations were omitted
    SchemaUnavailable { reason: String },
    /// Candidate columns the table does not have were left out
    UnknownColumnsDropped { table: String, columns: Vec<String> },
    /// A candidate was dropped because an existing index already serves it
    CoveredByExistingIndex { table: String, index: String },
}

impl fmt::Display for SynthesisWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaUnavailable { reason } => write!(
                f,
                "schema metadata unavailable ({}); index recommendations omitted",
                reason
            ),
            Self::UnknownColumnsDropped { table, columns } => write!(
                f,
                "columns not found on {}: {}",
                table,
                columns.join(", ")
            ),
            Self::CoveredByExistingIndex { table, index } => {
                write!(f, "index candidate on {} is already served by {}", table, index)
            }
        }
    }
}

/// Output of a synthesis pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisOutcome {
    /// Ranked recommendations
    pub recommendations: Vec<Recommendation>,
    pub warnings: Vec<SynthesisWarning>,
    /// True when the deadline stopped synthesis early
    pub interrupted: bool,
}

/// An index proposal before consolidation
#[derive(Debug, Clone)]
struct IndexCandidate {
    table: TableRef,
    columns: Vec<String>,
    include: Vec<String>,
    severity: Severity,
    supporting: Vec<BottleneckRef>,
    nodes: Vec<(NodeId, Option<f64>)>,
    /// Input position of the first supporting bottleneck
    order: usize,
}

impl IndexCandidate {
    fn absorb(&mut self, other: IndexCandidate) {
        if other.columns.len() > self.columns.len() {
            self.columns = other.columns;
        }
        for column in other.include {
            if !contains_column(&self.include, &column) {
                self.include.push(column);
            }
        }
        self.include.retain(|c| !contains_column(&self.columns, c));
        self.severity = self.severity.max(other.severity);
        self.supporting.extend(other.supporting);
        self.nodes.extend(other.nodes);
        self.order = self.order.min(other.order);
    }
}

/// Returns true if `prefix` leads `columns` (case-insensitive)
fn is_prefix(prefix: &[String], columns: &[String]) -> bool {
    prefix.len() <= columns.len()
        && prefix
            .iter()
            .zip(columns)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

fn prefix_related(a: &[String], b: &[String]) -> bool {
    is_prefix(a, b) || is_prefix(b, a)
}

/// Summed cost share of distinct nodes, clamped to `0..=MAX_IMPACT_PERCENT`
pub fn impact_estimate(nodes: &[(NodeId, Option<f64>)]) -> f64 {
    let mut seen: Vec<NodeId> = Vec::new();
    let mut total = 0.0_f64;
    for (id, cost) in nodes {
        if seen.contains(id) {
            continue;
        }
        seen.push(*id);
        total += cost.unwrap_or(0.0);
    }
    total.clamp(0.0, MAX_IMPACT_PERCENT)
}

/// Ranks recommendations: impact desc, confidence desc, then discovery order
fn rank(ranked: &mut [(usize, Recommendation)]) {
    ranked.sort_by(|(oa, a), (ob, b)| {
        b.impact_estimate
            .partial_cmp(&a.impact_estimate)
            .unwrap_or(Ordering::Equal)
            .then(b.confidence.cmp(&a.confidence))
            .then(oa.cmp(ob))
    });
}

/// Builds recommendations for one engine's plans
#[derive(Debug, Clone)]
pub struct Synthesizer {
    engine: SourceEngine,
}

impl Synthesizer {
    pub fn new(engine: SourceEngine) -> Self {
        Self { engine }
    }

    /// Synthesizes ranked recommendations from `bottlenecks`
    ///
    /// The deadline is checked before each bottleneck and before each index
    /// candidate; recommendations finished before expiry are kept.
    pub fn synthesize(
        &self,
        bottlenecks: &[Bottleneck],
        schema: &SchemaLookup,
        deadline: &Deadline,
    ) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::default();
        let mut ranked: Vec<(usize, Recommendation)> = Vec::new();
        let mut candidates: Vec<IndexCandidate> = Vec::new();

        for (order, bottleneck) in bottlenecks.iter().enumerate() {
            if deadline.is_expired() {
                outcome.interrupted = true;
                break;
            }
            match bottleneck.category {
                BottleneckCategory::NonSargablePredicate => {
                    ranked.extend(self.rewrite_predicate(bottleneck).map(|r| (order, r)));
                }
                BottleneckCategory::RowEstimationSkew => {
                    ranked.push((order, self.address_skew(bottleneck)));
                }
                category if category.is_index_candidate() => {
                    candidates.extend(self.index_candidate(bottleneck, order));
                }
                _ => {}
            }
        }

        match schema {
            SchemaLookup::Available(snapshot) if !outcome.interrupted => {
                // Unknown columns go first so consolidation sees the final lists
                let known: Vec<IndexCandidate> = candidates
                    .into_iter()
                    .filter_map(|c| drop_unknown_columns(c, snapshot, &mut outcome.warnings))
                    .collect();
                let merged = consolidate(known);
                let overlapping = overlapping_tables(&merged);
                for candidate in merged {
                    if deadline.is_expired() {
                        outcome.interrupted = true;
                        break;
                    }
                    let review = overlapping.iter().any(|t| t.key() == candidate.table.key());
                    ranked.extend(
                        self.index_recommendation(candidate, snapshot, review, &mut outcome.warnings),
                    );
                }
            }
            SchemaLookup::Available(_) => {}
            SchemaLookup::Unavailable { reason } => {
                tracing::warn!(reason = %reason, "Schema metadata unavailable, omitting index recommendations");
                outcome.warnings.push(SynthesisWarning::SchemaUnavailable {
                    reason: reason.clone(),
                });
            }
        }

        rank(&mut ranked);
        outcome.recommendations = ranked.into_iter().map(|(_, r)| r).collect();

        tracing::debug!(
            recommendations = outcome.recommendations.len(),
            warnings = outcome.warnings.len(),
            interrupted = outcome.interrupted,
            "Synthesized recommendations"
        );
        outcome
    }

    fn rewrite_predicate(&self, bottleneck: &Bottleneck) -> Option<Recommendation> {
        let predicate = bottleneck.predicates.first()?;
        let issues = crate::classify::sargability::find_issues(predicate);

        let mut description = format!("Rewrite `{}` so it can use an index seek:", predicate);
        for issue in &issues {
            description.push_str(&format!("\n- {}: {}", issue.description(), issue.fix_hint()));
        }
        if bottleneck.predicates.len() > 1 {
            description.push_str(&format!(
                "\n{} more predicate(s) on this operator show the same problem.",
                bottleneck.predicates.len() - 1
            ));
        }

        let title = match issues.first() {
            Some(SargabilityIssue::LeadingWildcardLike) => "Avoid leading wildcard in LIKE",
            Some(SargabilityIssue::ImplicitConversion { .. }) => "Remove implicit conversion",
            _ => "Unwrap function-wrapped column",
        };

        Some(Recommendation {
            kind: RecommendationKind::RewriteQuery,
            target_object: bottleneck.object.as_ref().map(|o| o.table_ref()),
            title: title.to_string(),
            description,
            columns: Vec::new(),
            include_columns: Vec::new(),
            script: None,
            predicate: Some(predicate.clone()),
            impact_estimate: impact_estimate(&[(bottleneck.node_id, bottleneck.cost_percent)]),
            confidence: Confidence::Medium,
            supporting_bottlenecks: vec![bottleneck.reference()],
            needs_manual_review: false,
        })
    }

    fn address_skew(&self, bottleneck: &Bottleneck) -> Recommendation {
        let hint = match self.engine {
            SourceEngine::SqlServer => {
                "update statistics on the tables involved; if the plan was compiled for an atypical parameter, consider OPTION (RECOMPILE) or OPTIMIZE FOR"
            }
            SourceEngine::Postgres => {
                "run ANALYZE on the tables involved, or raise the statistics target for skewed columns"
            }
            SourceEngine::MySql => {
                "run ANALYZE TABLE on the tables involved, or add histograms for skewed columns"
            }
            SourceEngine::Native => "refresh the optimizer statistics on the tables involved",
        };

        Recommendation {
            kind: RecommendationKind::RewriteQuery,
            target_object: bottleneck.object.as_ref().map(|o| o.table_ref()),
            title: "Investigate row estimation skew".to_string(),
            description: format!(
                "{}. This can indicate stale statistics or parameter sniffing: {}.",
                bottleneck.evidence.message, hint
            ),
            columns: Vec::new(),
            include_columns: Vec::new(),
            script: None,
            predicate: bottleneck.predicates.first().cloned(),
            impact_estimate: impact_estimate(&[(bottleneck.node_id, bottleneck.cost_percent)]),
            confidence: Confidence::Low,
            supporting_bottlenecks: vec![bottleneck.reference()],
            needs_manual_review: false,
        }
    }

    fn index_candidate(&self, bottleneck: &Bottleneck, order: usize) -> Option<IndexCandidate> {
        let table = bottleneck.object.as_ref()?.table_ref();

        let mut referenced = PredicateColumns::default();
        for predicate in &bottleneck.predicates {
            referenced.add_predicate(predicate);
        }
        for key in &bottleneck.sort_keys {
            if let Some(column) = columns::column_name(sort_key_column(key)) {
                referenced.add(column, ColumnUse::Range);
            }
        }
        if referenced.is_empty() {
            tracing::debug!(table = %table, node = %bottleneck.node_id, "No columns to index");
            return None;
        }
        let key_columns = referenced.index_order();

        let include = if bottleneck.category == BottleneckCategory::KeyLookup
            && self.engine.supports_included_columns()
        {
            bottleneck
                .output_columns
                .iter()
                .filter_map(|c| columns::column_name(c))
                .filter(|c| !contains_column(&key_columns, c))
                .fold(Vec::new(), |mut acc, c| {
                    if !contains_column(&acc, &c) {
                        acc.push(c);
                    }
                    acc
                })
        } else {
            Vec::new()
        };

        Some(IndexCandidate {
            table,
            columns: key_columns,
            include,
            severity: bottleneck.severity,
            supporting: vec![bottleneck.reference()],
            nodes: vec![(bottleneck.node_id, bottleneck.cost_percent)],
            order,
        })
    }

    fn index_recommendation(
        &self,
        mut candidate: IndexCandidate,
        snapshot: &SchemaSnapshot,
        needs_manual_review: bool,
        warnings: &mut Vec<SynthesisWarning>,
    ) -> Option<(usize, Recommendation)> {
        let table_name = candidate.table.to_string();
        let metadata = snapshot.table(&candidate.table);

        let mut confidence = Confidence::from_severity(candidate.severity);
        match metadata {
            // Prefer the schema's spelling of the table
            Some(meta) => candidate.table = merge_table_ref(&candidate.table, &meta.table),
            None => confidence = confidence.lowered(),
        }

        if let Some(meta) = metadata {
            match existing_index_fit(meta, &candidate.columns, &candidate.include) {
                IndexFit::Covered(index) => {
                    tracing::debug!(table = %table_name, index = %index.name, "Index candidate already covered");
                    warnings.push(SynthesisWarning::CoveredByExistingIndex {
                        table: table_name,
                        index: index.name.clone(),
                    });
                    return None;
                }
                IndexFit::Widen {
                    index,
                    columns,
                    include,
                } => {
                    let script = ddl::widen_index(self.engine, &candidate.table, index, &columns, &include);
                    let recommendation = Recommendation {
                        kind: RecommendationKind::SchemaChange,
                        target_object: Some(candidate.table.clone()),
                        title: format!("Widen index {} on {}", index.name, table_name),
                        description: format!(
                            "Extend existing index {} ({}) to ({}){} instead of adding a new one",
                            index.name,
                            index.columns.join(", "),
                            columns.join(", "),
                            describe_include(&include)
                        ),
                        columns,
                        include_columns: include,
                        script: Some(script),
                        predicate: None,
                        impact_estimate: impact_estimate(&candidate.nodes),
                        confidence: Confidence::Medium,
                        supporting_bottlenecks: candidate.supporting,
                        needs_manual_review,
                    };
                    return Some((candidate.order, recommendation));
                }
                IndexFit::New => {}
            }
        }

        let script = ddl::create_index(self.engine, &candidate.table, &candidate.columns, &candidate.include);
        let include = if self.engine.supports_included_columns() {
            candidate.include
        } else {
            Vec::new()
        };
        let recommendation = Recommendation {
            kind: RecommendationKind::CreateIndex,
            target_object: Some(candidate.table.clone()),
            title: format!("Create index on {} ({})", table_name, candidate.columns.join(", ")),
            description: format!(
                "Index {} on ({}){} to serve {} bottleneck(s)",
                table_name,
                candidate.columns.join(", "),
                describe_include(&include),
                candidate.supporting.len()
            ),
            columns: candidate.columns,
            include_columns: include,
            script: Some(script),
            predicate: None,
            impact_estimate: impact_estimate(&candidate.nodes),
            confidence,
            supporting_bottlenecks: candidate.supporting,
            needs_manual_review,
        };
        Some((candidate.order, recommendation))
    }
}

/// Strips columns the table's metadata does not list, and clustering-key
/// columns from the leaf columns
///
/// Returns `None` when no key column survives. Tables missing from the
/// snapshot pass through unchanged. Dropped names are reported once per table.
fn drop_unknown_columns(
    mut candidate: IndexCandidate,
    snapshot: &SchemaSnapshot,
    warnings: &mut Vec<SynthesisWarning>,
) -> Option<IndexCandidate> {
    let Some(meta) = snapshot.table(&candidate.table) else {
        return Some(candidate);
    };

    let unknown: Vec<String> = candidate
        .columns
        .iter()
        .chain(&candidate.include)
        .filter(|c| !meta.has_column(c))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        candidate.columns.retain(|c| meta.has_column(c));
        candidate.include.retain(|c| meta.has_column(c));

        let table_name = candidate.table.to_string();
        let existing = warnings.iter_mut().find_map(|w| match w {
            SynthesisWarning::UnknownColumnsDropped { table, columns } if *table == table_name => {
                Some(columns)
            }
            _ => None,
        });
        match existing {
            Some(columns) => {
                for column in unknown {
                    if !contains_column(columns, &column) {
                        columns.push(column);
                    }
                }
            }
            None => warnings.push(SynthesisWarning::UnknownColumnsDropped {
                table: table_name,
                columns: unknown,
            }),
        }
    }

    if candidate.columns.is_empty() {
        tracing::debug!(table = %candidate.table, "No known columns left to index");
        return None;
    }

    // Every secondary index already carries the clustering key
    candidate.include.retain(|c| {
        !meta
            .indexes
            .iter()
            .any(|index| index.is_primary && contains_column(&index.columns, c))
    });
    Some(candidate)
}

fn describe_include(include: &[String]) -> String {
    if include.is_empty() {
        String::new()
    } else {
        format!(" including ({})", include.join(", "))
    }
}

/// Column part of a sort key such as `CreatedAt DESC` or `o.total NULLS LAST`
fn sort_key_column(key: &str) -> &str {
    key.split_whitespace().next().unwrap_or(key)
}

fn merge_table_ref(candidate: &TableRef, known: &TableRef) -> TableRef {
    TableRef {
        schema: candidate.schema.clone().or_else(|| known.schema.clone()),
        table: known.table.clone(),
    }
}

/// Merges candidates on the same table whose column lists are prefix-related
///
/// Repeats until no pair merges, so chains like `{A}`, `{A,B}`, `{A,B,C}`
/// collapse into one. Output keeps first-discovery order.
fn consolidate(candidates: Vec<IndexCandidate>) -> Vec<IndexCandidate> {
    let mut merged: Vec<IndexCandidate> = Vec::new();
    for candidate in candidates {
        merge_into(&mut merged, candidate);
    }

    loop {
        let pair = (0..merged.len()).find_map(|i| {
            ((i + 1)..merged.len())
                .find(|&j| {
                    merged[i].table.key() == merged[j].table.key()
                        && prefix_related(&merged[i].columns, &merged[j].columns)
                })
                .map(|j| (i, j))
        });
        let Some((i, j)) = pair else {
            break;
        };
        let other = merged.remove(j);
        merged[i].absorb(other);
    }

    merged.sort_by_key(|c| c.order);
    merged
}

fn merge_into(merged: &mut Vec<IndexCandidate>, candidate: IndexCandidate) {
    match merged.iter_mut().find(|m| {
        m.table.key() == candidate.table.key() && prefix_related(&m.columns, &candidate.columns)
    }) {
        Some(existing) => existing.absorb(candidate),
        None => merged.push(candidate),
    }
}

/// Tables left with more than one candidate after consolidation
fn overlapping_tables(candidates: &[IndexCandidate]) -> Vec<TableRef> {
    let mut tables: Vec<TableRef> = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        let key = candidate.table.key();
        if candidates[i + 1..].iter().any(|c| c.table.key() == key)
            && !tables.iter().any(|t| t.key() == key)
        {
            tables.push(candidate.table.clone());
        }
    }
    tables
}

enum IndexFit<'a> {
    /// An existing index already leads with the candidate's columns
    Covered(&'a IndexMetadata),
    /// An existing non-unique index can be extended to serve the candidate
    Widen {
        index: &'a IndexMetadata,
        columns: Vec<String>,
        include: Vec<String>,
    },
    New,
}

fn existing_index_fit<'a>(meta: &'a TableMetadata, columns: &[String], include: &[String]) -> IndexFit<'a> {
    let covers_include = |index: &IndexMetadata| {
        include.iter().all(|c| {
            contains_column(&index.columns, c) || contains_column(&index.included_columns, c)
        })
    };

    if let Some(index) = meta
        .indexes
        .iter()
        .find(|index| is_prefix(columns, &index.columns) && covers_include(index))
    {
        return IndexFit::Covered(index);
    }

    // Unique and primary indexes are never redefined
    let widenable = meta
        .indexes
        .iter()
        .filter(|index| !index.is_unique && !index.is_primary);
    for index in widenable {
        if is_prefix(columns, &index.columns) {
            // Same keys, missing leaf columns
            let mut wider_include = index.included_columns.clone();
            for column in include {
                if !contains_column(&wider_include, column) && !contains_column(&index.columns, column) {
                    wider_include.push(column.clone());
                }
            }
            return IndexFit::Widen {
                index,
                columns: index.columns.clone(),
                include: wider_include,
            };
        }
        if index.columns.len() < columns.len() && is_prefix(&index.columns, columns) {
            let mut wider_include = index.included_columns.clone();
            wider_include.retain(|c| !contains_column(columns, c));
            for column in include {
                if !contains_column(&wider_include, column) {
                    wider_include.push(column.clone());
                }
            }
            return IndexFit::Widen {
                index,
                columns: columns.to_vec(),
                include: wider_include,
            };
        }
    }

    IndexFit::New
}
