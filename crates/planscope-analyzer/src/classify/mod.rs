//! Bottleneck Classifier
//!
//! Tags plan nodes with bottleneck categories. The rule set is the `RULES`
//! table: each entry looks at one node (plus its parent and immediate
//! children) and emits at most one `Bottleneck` for it. Rules never see each
//! other's output, so the result depends only on the plan and the
//! thresholds.

pub mod sargability;

use crate::cancel::{Deadline, Interrupted};
use crate::metrics::row_estimation_error;
use crate::plan::{NodeId, NormalizedPlan, ObjectReference, OperatorNode, OperatorType};
use crate::synthesize::columns::{contains_column, extract_columns};
use crate::walk::{NodeContext, walk_preorder};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use sargability::SargabilityIssue;

/// Severity of a bottleneck, ordered `Low < Medium < High`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Returns the severity level as a display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Tier for a cost percentage
    pub fn from_cost_percent(percent: f64, thresholds: &ClassifierThresholds) -> Self {
        if percent > thresholds.high_cost_percent {
            Self::High
        } else if percent > thresholds.medium_cost_percent {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of bottleneck, in tie-break order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckCategory {
    /// Full table or index scan carrying a large share of the cost
    TableScan,
    /// Key lookup executed once per row of a large outer input
    KeyLookup,
    /// Sort that spilled to disk
    ExpensiveSort,
    /// Hash join or aggregate that spilled to disk
    HashSpill,
    /// Predicate that prevents an index seek
    NonSargablePredicate,
    /// Actual rows far from the estimate (possible parameter sniffing)
    RowEstimationSkew,
}

impl BottleneckCategory {
    /// Returns a human-readable description of this category
    pub fn description(&self) -> &'static str {
        match self {
            Self::TableScan => "Scan without a selective predicate",
            Self::KeyLookup => "Key lookup fan-out (missing covering index)",
            Self::ExpensiveSort => "Expensive sort spilling to disk",
            Self::HashSpill => "Hash operation spilling to disk",
            Self::NonSargablePredicate => "Non-SARGable predicate",
            Self::RowEstimationSkew => "Row estimation skew (possible parameter sniffing)",
        }
    }

    /// Returns true for categories an index can fix
    pub fn is_index_candidate(&self) -> bool {
        matches!(self, Self::TableScan | Self::KeyLookup | Self::ExpensiveSort)
    }
}

/// A named number that contributed to a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetric {
    pub name: String,
    pub value: f64,
}

/// Why a bottleneck was raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub message: String,
    pub metrics: Vec<EvidenceMetric>,
}

impl Evidence {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            metrics: Vec::new(),
        }
    }

    /// Adds a triggering metric
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.push(EvidenceMetric {
            name: name.into(),
            value,
        });
        self
    }

    /// Value of a named metric
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|m| m.name == name).map(|m| m.value)
    }
}

/// Identity of a bottleneck: at most one per node and category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BottleneckRef {
    pub node_id: NodeId,
    pub category: BottleneckCategory,
}

/// A finding attached to one operator node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub category: BottleneckCategory,
    pub severity: Severity,
    pub node_id: NodeId,
    /// Pre-order position of the node, used for ordering
    pub position: usize,
    pub operator_type: OperatorType,
    /// Table (and index) the finding concerns
    pub object: Option<ObjectReference>,
    pub cost_percent: Option<f64>,
    /// Predicates relevant to the finding, raw engine text
    pub predicates: Vec<String>,
    /// Columns the operator had to produce (covering candidates)
    pub output_columns: Vec<String>,
    pub sort_keys: Vec<String>,
    pub evidence: Evidence,
}

impl Bottleneck {
    /// Creates a bottleneck for the node in `ctx`, copying its local facts
    pub fn at(
        ctx: &NodeContext<'_>,
        category: BottleneckCategory,
        severity: Severity,
        evidence: Evidence,
    ) -> Self {
        let node = ctx.node;
        Self {
            category,
            severity,
            node_id: node.id,
            position: ctx.position,
            operator_type: node.operator_type,
            object: node.object.clone(),
            cost_percent: node.estimated_cost_percent,
            predicates: node.predicates.clone(),
            output_columns: node.output_columns.clone(),
            sort_keys: node.sort_keys.clone(),
            evidence,
        }
    }

    /// Identity of this bottleneck
    pub fn reference(&self) -> BottleneckRef {
        BottleneckRef {
            node_id: self.node_id,
            category: self.category,
        }
    }

    /// Display name of the table concerned
    pub fn table_name(&self) -> Option<String> {
        self.object.as_ref().map(|o| o.table_ref().to_string())
    }
}

/// Sorts bottlenecks by severity (high first), then plan position, then category
pub fn sort_bottlenecks(bottlenecks: &mut [Bottleneck]) {
    bottlenecks.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.position.cmp(&b.position))
            .then(a.category.cmp(&b.category))
    });
}

/// Effective thresholds for the rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierThresholds {
    /// Scans below this cost share are not reported
    pub scan_cost_percent: f64,
    /// Parent row count above which a key lookup is reported
    pub key_lookup_parent_rows: f64,
    /// Sorts below this cost share are not reported
    pub sort_cost_percent: f64,
    /// Row estimation error above which skew is reported
    pub row_estimation_ratio: f64,
    pub high_cost_percent: f64,
    pub medium_cost_percent: f64,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            scan_cost_percent: 20.0,
            key_lookup_parent_rows: 100.0,
            sort_cost_percent: 20.0,
            row_estimation_ratio: 10.0,
            high_cost_percent: 50.0,
            medium_cost_percent: 20.0,
        }
    }
}

/// Caller-supplied threshold overrides; unset fields keep the default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdOverrides {
    pub scan_cost_percent: Option<f64>,
    pub key_lookup_parent_rows: Option<f64>,
    pub sort_cost_percent: Option<f64>,
    pub row_estimation_ratio: Option<f64>,
    pub high_cost_percent: Option<f64>,
    pub medium_cost_percent: Option<f64>,
}

impl ThresholdOverrides {
    /// Applies the overrides on top of the defaults
    ///
    /// Out-of-range values are replaced by the default and reported.
    pub fn resolve(&self) -> (ClassifierThresholds, Vec<ClassificationWarning>) {
        let defaults = ClassifierThresholds::default();
        let mut warnings = Vec::new();

        let cost_range = |v: f64| v > 0.0 && v <= 100.0;
        let mut pick = |name: &'static str, value: Option<f64>, default: f64, valid: &dyn Fn(f64) -> bool| {
            match value {
                Some(v) if v.is_finite() && valid(v) => v,
                Some(v) => {
                    tracing::warn!(threshold = name, value = v, default, "Threshold out of range, using default");
                    warnings.push(ClassificationWarning::ThresholdOutOfRange {
                        name: name.to_string(),
                        value: v,
                        default,
                    });
                    default
                }
                None => default,
            }
        };

        let thresholds = ClassifierThresholds {
            scan_cost_percent: pick(
                "scan_cost_percent",
                self.scan_cost_percent,
                defaults.scan_cost_percent,
                &cost_range,
            ),
            key_lookup_parent_rows: pick(
                "key_lookup_parent_rows",
                self.key_lookup_parent_rows,
                defaults.key_lookup_parent_rows,
                &|v| v > 0.0,
            ),
            sort_cost_percent: pick(
                "sort_cost_percent",
                self.sort_cost_percent,
                defaults.sort_cost_percent,
                &cost_range,
            ),
            row_estimation_ratio: pick(
                "row_estimation_ratio",
                self.row_estimation_ratio,
                defaults.row_estimation_ratio,
                &|v| v >= 1.0,
            ),
            high_cost_percent: pick(
                "high_cost_percent",
                self.high_cost_percent,
                defaults.high_cost_percent,
                &cost_range,
            ),
            medium_cost_percent: pick(
                "medium_cost_percent",
                self.medium_cost_percent,
                defaults.medium_cost_percent,
                &cost_range,
            ),
        };

        (thresholds, warnings)
    }
}

/// Non-fatal classifier issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ClassificationWarning {
    /// An override was outside its valid range and the default was used
    ThresholdOutOfRange {
        name: String,
        value: f64,
        default: f64,
    },
}

impl fmt::Display for ClassificationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdOutOfRange {
                name,
                value,
                default,
            } => write!(
                f,
                "threshold {} = {} is out of range; using default {}",
                name, value, default
            ),
        }
    }
}

/// One entry of the rule table
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub category: BottleneckCategory,
    pub evaluate: fn(&NodeContext<'_>, &ClassifierThresholds) -> Option<Bottleneck>,
}

/// The classification rules, evaluated in order for every node
pub static RULES: &[Rule] = &[
    Rule {
        category: BottleneckCategory::TableScan,
        evaluate: scan_rule,
    },
    Rule {
        category: BottleneckCategory::KeyLookup,
        evaluate: key_lookup_rule,
    },
    Rule {
        category: BottleneckCategory::ExpensiveSort,
        evaluate: sort_rule,
    },
    Rule {
        category: BottleneckCategory::HashSpill,
        evaluate: hash_spill_rule,
    },
    Rule {
        category: BottleneckCategory::NonSargablePredicate,
        evaluate: non_sargable_rule,
    },
    Rule {
        category: BottleneckCategory::RowEstimationSkew,
        evaluate: row_skew_rule,
    },
];

fn describe_object(node: &OperatorNode) -> String {
    node.table_ref()
        .map(|t| format!(" on '{}'", t))
        .unwrap_or_default()
}

fn is_spilled(node: &OperatorNode) -> bool {
    node.metrics.is_some_and(|m| m.spilled) || node.has_spill_marker()
}

fn scan_rule(ctx: &NodeContext<'_>, thresholds: &ClassifierThresholds) -> Option<Bottleneck> {
    let node = ctx.node;
    if !node.operator_type.is_scan() {
        return None;
    }
    let cost = node.estimated_cost_percent?;
    if cost <= thresholds.scan_cost_percent {
        return None;
    }

    let kind = match node.operator_type {
        OperatorType::IndexScan => "Index scan",
        _ => "Table scan",
    };
    let mut evidence = Evidence::new(format!(
        "{}{} accounts for {:.1}% of plan cost",
        kind,
        describe_object(node),
        cost
    ))
    .with_metric("cost_percent", cost);
    if let Some(rows) = node.estimated_rows {
        evidence = evidence.with_metric("estimated_rows", rows);
    }

    Some(Bottleneck::at(
        ctx,
        BottleneckCategory::TableScan,
        Severity::from_cost_percent(cost, thresholds),
        evidence,
    ))
}

fn key_lookup_rule(ctx: &NodeContext<'_>, thresholds: &ClassifierThresholds) -> Option<Bottleneck> {
    let node = ctx.node;
    if node.operator_type != OperatorType::KeyLookup {
        return None;
    }
    let parent = ctx.parent?;
    let parent_rows = parent.estimated_rows.or(parent.actual_rows)?;
    if parent_rows <= thresholds.key_lookup_parent_rows {
        return None;
    }

    let severity = if parent_rows > thresholds.key_lookup_parent_rows * 10.0 {
        Severity::High
    } else {
        Severity::Medium
    };
    let evidence = Evidence::new(format!(
        "Key lookup{} runs for ~{:.0} outer rows (threshold {:.0})",
        describe_object(node),
        parent_rows,
        thresholds.key_lookup_parent_rows
    ))
    .with_metric("parent_rows", parent_rows);

    let mut bottleneck = Bottleneck::at(ctx, BottleneckCategory::KeyLookup, severity, evidence);

    // The lookup seeks on the clustering key, so its own predicates never
    // lead the index; their columns only need to be carried at the leaf.
    // The filter that drives the lookup sits on the sibling access.
    for predicate in std::mem::take(&mut bottleneck.predicates) {
        for (column, _) in extract_columns(&predicate) {
            if !contains_column(&bottleneck.output_columns, &column) {
                bottleneck.output_columns.push(column);
            }
        }
    }
    let table = node.table_ref();
    for sibling in &parent.children {
        if sibling.id != node.id
            && sibling.operator_type.is_access()
            && table.as_ref().zip(sibling.table_ref()).is_some_and(|(a, b)| a.matches(&b))
        {
            bottleneck.predicates.extend(sibling.predicates.iter().cloned());
        }
    }
    Some(bottleneck)
}

fn sort_rule(ctx: &NodeContext<'_>, thresholds: &ClassifierThresholds) -> Option<Bottleneck> {
    let node = ctx.node;
    if node.operator_type != OperatorType::Sort || !is_spilled(node) {
        return None;
    }
    let cost = node.estimated_cost_percent?;
    if cost <= thresholds.sort_cost_percent {
        return None;
    }

    let mut evidence = Evidence::new(format!(
        "Sort at {:.1}% of plan cost spilled to disk",
        cost
    ))
    .with_metric("cost_percent", cost);
    if let Some(kb) = node.memory_grant_kb {
        evidence = evidence.with_metric("memory_grant_kb", kb as f64);
    }

    let severity = Severity::from_cost_percent(cost, thresholds).max(Severity::Medium);
    let mut bottleneck = Bottleneck::at(ctx, BottleneckCategory::ExpensiveSort, severity, evidence);

    // A sort directly over a single table access can be served by an index
    // leading with the access's filter columns and then the sort keys
    if let [child] = ctx.children()
        && child.operator_type.is_access()
    {
        bottleneck.object = child.object.clone();
        bottleneck.predicates.extend(child.predicates.iter().cloned());
    }
    Some(bottleneck)
}

fn hash_spill_rule(ctx: &NodeContext<'_>, thresholds: &ClassifierThresholds) -> Option<Bottleneck> {
    let node = ctx.node;
    if !node.operator_type.is_hash() || !is_spilled(node) {
        return None;
    }

    let mut evidence = Evidence::new(format!(
        "{} spilled to disk",
        match node.operator_type {
            OperatorType::HashAggregate => "Hash aggregate",
            _ => "Hash match",
        }
    ));
    let severity = match node.estimated_cost_percent {
        Some(cost) => {
            evidence = evidence.with_metric("cost_percent", cost);
            Severity::from_cost_percent(cost, thresholds).max(Severity::Medium)
        }
        None => Severity::Medium,
    };
    if let Some(kb) = node.memory_grant_kb {
        evidence = evidence.with_metric("memory_grant_kb", kb as f64);
    }

    Some(Bottleneck::at(ctx, BottleneckCategory::HashSpill, severity, evidence))
}

fn non_sargable_rule(
    ctx: &NodeContext<'_>,
    thresholds: &ClassifierThresholds,
) -> Option<Bottleneck> {
    let node = ctx.node;
    if !node.operator_type.is_access() {
        return None;
    }

    let flagged: Vec<(&String, Vec<SargabilityIssue>)> = node
        .predicates
        .iter()
        .map(|p| (p, sargability::find_issues(p)))
        .filter(|(_, issues)| !issues.is_empty())
        .collect();
    let (first, issues) = flagged.first()?;

    let descriptions: Vec<String> = issues.iter().map(SargabilityIssue::description).collect();
    let mut evidence = Evidence::new(format!(
        "Predicate `{}`{}: {}",
        first,
        describe_object(node),
        descriptions.join("; ")
    ))
    .with_metric("flagged_predicates", flagged.len() as f64);
    let severity = match node.estimated_cost_percent {
        Some(cost) => {
            evidence = evidence.with_metric("cost_percent", cost);
            Severity::from_cost_percent(cost, thresholds)
        }
        None => Severity::Medium,
    };

    let mut bottleneck = Bottleneck::at(
        ctx,
        BottleneckCategory::NonSargablePredicate,
        severity,
        evidence,
    );
    bottleneck.predicates = flagged.iter().map(|(p, _)| (*p).clone()).collect();
    Some(bottleneck)
}

fn row_skew_rule(ctx: &NodeContext<'_>, thresholds: &ClassifierThresholds) -> Option<Bottleneck> {
    let node = ctx.node;
    let error = node
        .metrics
        .and_then(|m| m.row_estimation_error)
        .or_else(|| row_estimation_error(node))?;
    if error <= thresholds.row_estimation_ratio {
        return None;
    }

    let evidence = Evidence::new(format!(
        "Estimated {:.0} rows but {:.0} were produced{} ({:.1}x off)",
        node.estimated_rows.unwrap_or_default(),
        node.actual_rows.unwrap_or_default(),
        describe_object(node),
        error
    ))
    .with_metric("row_estimation_error", error);

    Some(Bottleneck::at(
        ctx,
        BottleneckCategory::RowEstimationSkew,
        Severity::Low,
        evidence,
    ))
}

/// Result of a classification pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Findings in output order (see `sort_bottlenecks`)
    pub bottlenecks: Vec<Bottleneck>,
    /// True when the deadline stopped the walk before every node was seen
    pub interrupted: bool,
}

/// Applies `RULES`, then any added rules, to every node of a plan
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    thresholds: ClassifierThresholds,
    extra_rules: Vec<Rule>,
}

impl Classifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self {
            thresholds,
            extra_rules: Vec::new(),
        }
    }

    /// Adds a rule evaluated after the built-in ones
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.extra_rules.push(rule);
        self
    }

    /// Creates a classifier from overrides, returning any substitution warnings
    pub fn from_overrides(overrides: &ThresholdOverrides) -> (Self, Vec<ClassificationWarning>) {
        let (thresholds, warnings) = overrides.resolve();
        (Self::new(thresholds), warnings)
    }

    /// Returns the effective thresholds
    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }

    /// Classifies every node, stopping at the first node boundary past the deadline
    ///
    /// Nodes visited before the deadline are fully classified, so an
    /// interrupted result is a subset of the complete one.
    pub fn classify(&self, plan: &NormalizedPlan, deadline: &Deadline) -> Classification {
        let mut bottlenecks = Vec::new();

        let walked = walk_preorder(&plan.root, deadline, |ctx| {
            for rule in RULES.iter().chain(&self.extra_rules) {
                if let Some(found) = (rule.evaluate)(&ctx, &self.thresholds) {
                    debug_assert_eq!(found.category, rule.category);
                    tracing::trace!(node = %found.node_id, category = ?found.category, "Bottleneck found");
                    bottlenecks.push(found);
                }
            }
        });

        let interrupted = matches!(walked, Err(Interrupted));
        if interrupted {
            tracing::warn!(found = bottlenecks.len(), "Classification interrupted by deadline");
        }

        sort_bottlenecks(&mut bottlenecks);
        Classification {
            bottlenecks,
            interrupted,
        }
    }
}
