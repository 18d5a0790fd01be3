//! Plan Parser Module
//!
//! Converts raw execution-plan documents into a `NormalizedPlan`:
//! - SQL Server showplan XML
//! - PostgreSQL EXPLAIN (FORMAT JSON, and the default text format when hinted)
//! - MySQL EXPLAIN FORMAT=JSON
//! - planscope's own canonical JSON (see `native::render_native`)
//!
//! Each engine has one adapter behind the `PlanAdapter` trait. When no engine
//! hint is given the document is sniffed: a leading `<` means XML, a leading
//! `{` or `[` means JSON, and the adapters are asked in registration order
//! whether they recognize the document's shape.
//!
//! # Example
//!
//! ```
//! use planscope_analyzer::{Deadline, OperatorType, parse_plan};
//!
//! let json = r#"{"query_block": {"select_id": 1, "table": {"table_name": "users", "access_type": "ALL"}}}"#;
//! let plan = parse_plan(json, None, &Deadline::unbounded()).unwrap();
//! assert_eq!(plan.root.operator_type, OperatorType::TableScan);
//! ```

pub mod mysql;
pub mod native;
pub mod postgres;
pub mod sqlserver;

use crate::cancel::Deadline;
use crate::plan::{NodeId, NormalizedPlan, OperatorNode, ParseWarning, ParseWarningKind};
use planscope_core::SourceEngine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

pub use native::render_native;

/// Errors that abort parsing
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum ParseError {
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Unsupported engine: {0}")]
    UnsupportedEngine(String),

    #[error("Parsing exceeded the deadline")]
    Timeout,
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedDocument(format!("invalid JSON: {}", e))
    }
}

impl From<roxmltree::Error> for ParseError {
    fn from(e: roxmltree::Error) -> Self {
        Self::MalformedDocument(format!("invalid XML: {}", e))
    }
}

/// Result type for plan parsing
pub type Result<T> = std::result::Result<T, ParseError>;

/// Coarse shape of a document, used to route it to an adapter
#[derive(Debug, Clone, Copy)]
pub enum DocumentShape<'a> {
    /// XML document with the given root element name (namespace stripped)
    Xml { root: &'a str },
    /// Parsed JSON document
    Json(&'a Value),
}

/// Per-document parse state shared by adapters
///
/// Hands out node ids in the order nodes are entered, so adapters that build
/// their tree depth-first produce pre-order ids. It also collects warnings
/// and checks the deadline at every node boundary.
pub struct ParseContext<'d> {
    deadline: &'d Deadline,
    next_id: u32,
    warnings: Vec<ParseWarning>,
}

impl<'d> ParseContext<'d> {
    pub fn new(deadline: &'d Deadline) -> Self {
        Self {
            deadline,
            next_id: 0,
            warnings: Vec::new(),
        }
    }

    /// Claims the id for the next node, failing if the deadline has passed
    pub fn enter_node(&mut self) -> Result<NodeId> {
        self.deadline.check().map_err(|_| ParseError::Timeout)?;
        let id = NodeId(self.next_id);
        self.next_id += 1;
        Ok(id)
    }

    /// Records a non-fatal issue
    pub fn warn(&mut self, kind: ParseWarningKind, node_id: Option<NodeId>, message: impl Into<String>) {
        self.warnings.push(ParseWarning::new(kind, node_id, message));
    }

    /// Builds the childless `Other` stand-in for a subtree that cannot be read
    pub fn unparseable(
        &mut self,
        id: NodeId,
        physical_name: Option<String>,
        reason: impl Into<String>,
    ) -> OperatorNode {
        let reason = reason.into();
        tracing::debug!(node = %id, "Replacing unparseable subtree: {}", reason);
        self.warn(ParseWarningKind::UnparseableSubtree, Some(id), reason);
        let mut node = OperatorNode::placeholder(physical_name);
        node.id = id;
        node
    }

    /// Number of nodes entered so far
    pub fn nodes_entered(&self) -> usize {
        self.next_id as usize
    }

    /// Moves the collected warnings onto a finished plan
    pub fn finish(self, mut plan: NormalizedPlan) -> NormalizedPlan {
        plan.warnings.extend(self.warnings);
        plan
    }
}

/// Vendor-specific mapping from one document format to the normalized tree
pub trait PlanAdapter: Send + Sync {
    /// Engine this adapter handles
    fn engine(&self) -> SourceEngine;

    /// Returns true if a sniffed document looks like this adapter's format
    fn recognizes(&self, shape: &DocumentShape<'_>) -> bool;

    /// Parses a document known to belong to this adapter's engine
    fn parse(&self, document: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan>;
}

/// Set of adapters, one per engine
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn PlanAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    /// Registers an adapter, replacing any previous one for the same engine
    pub fn register(&mut self, adapter: Arc<dyn PlanAdapter>) {
        self.adapters.retain(|a| a.engine() != adapter.engine());
        self.adapters.push(adapter);
    }

    /// Gets the adapter for an engine
    pub fn get(&self, engine: SourceEngine) -> Option<&Arc<dyn PlanAdapter>> {
        self.adapters.iter().find(|a| a.engine() == engine)
    }

    /// Engines with a registered adapter, in registration order
    pub fn engines(&self) -> impl Iterator<Item = SourceEngine> + '_ {
        self.adapters.iter().map(|a| a.engine())
    }

    /// Parses a raw document, routing by hint or by sniffing
    pub fn parse(
        &self,
        document: &str,
        engine_hint: Option<&str>,
        deadline: &Deadline,
    ) -> Result<NormalizedPlan> {
        let trimmed = document.trim();
        if trimmed.is_empty() {
            return Err(ParseError::MalformedDocument("empty document".into()));
        }

        let adapter = match engine_hint {
            Some(hint) => {
                let engine = SourceEngine::from_hint(hint)
                    .ok_or_else(|| ParseError::UnsupportedEngine(hint.to_string()))?;
                self.get(engine)
                    .ok_or_else(|| ParseError::UnsupportedEngine(hint.to_string()))?
            }
            None => self.sniff(trimmed)?,
        };

        let mut ctx = ParseContext::new(deadline);
        let plan = adapter.parse(trimmed, &mut ctx)?;
        let plan = ctx.finish(plan);

        tracing::debug!(
            engine = %plan.engine,
            nodes = plan.node_count(),
            warnings = plan.warnings.len(),
            "Parsed execution plan"
        );
        Ok(plan)
    }

    /// Picks an adapter from the document's leading character and shape
    fn sniff(&self, trimmed: &str) -> Result<&Arc<dyn PlanAdapter>> {
        if trimmed.starts_with('<') {
            let root = xml_root_name(trimmed).ok_or_else(|| {
                ParseError::MalformedDocument("XML document has no root element".into())
            })?;
            let shape = DocumentShape::Xml { root };
            self.adapters
                .iter()
                .find(|a| a.recognizes(&shape))
                .ok_or_else(|| {
                    ParseError::UnsupportedEngine(format!("unrecognized XML plan root <{}>", root))
                })
        } else if trimmed.starts_with('{') || trimmed.starts_with('[') {
            let value: Value = serde_json::from_str(trimmed)?;
            let shape = DocumentShape::Json(&value);
            self.adapters
                .iter()
                .find(|a| a.recognizes(&shape))
                .ok_or_else(|| ParseError::UnsupportedEngine("unrecognized JSON plan".into()))
        } else {
            Err(ParseError::MalformedDocument(
                "document is neither XML nor JSON".into(),
            ))
        }
    }
}

impl Default for AdapterRegistry {
    /// Registry with every built-in adapter
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(sqlserver::SqlServerAdapter));
        registry.register(Arc::new(postgres::PostgresAdapter));
        registry.register(Arc::new(mysql::MySqlAdapter));
        registry.register(Arc::new(native::NativeAdapter));
        registry
    }
}

/// Global registry with the built-in adapters
pub static DEFAULT_ADAPTERS: LazyLock<Arc<AdapterRegistry>> =
    LazyLock::new(|| Arc::new(AdapterRegistry::default()));

/// Parses a raw plan document with the built-in adapters
pub fn parse_plan(
    document: &str,
    engine_hint: Option<&str>,
    deadline: &Deadline,
) -> Result<NormalizedPlan> {
    DEFAULT_ADAPTERS.parse(document, engine_hint, deadline)
}

/// Name of the first element in an XML document, skipping the prolog
fn xml_root_name(document: &str) -> Option<&str> {
    let mut rest = document;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let name = &rest[..end];
        // Strip a namespace prefix
        let name = name.rsplit(':').next().unwrap_or(name);
        return if name.is_empty() { None } else { Some(name) };
    }
}

/// Fills `estimated_cost_percent` from cumulative subtree costs
///
/// An operator's own cost is its subtree cost minus its children's subtree
/// costs, clamped at zero to absorb vendor rounding. Percentages are taken
/// against the root's subtree cost.
pub(crate) fn assign_cost_percentages(root: &mut OperatorNode, ctx: &mut ParseContext<'_>) {
    let Some(total) = root.subtree_cost else {
        ctx.warn(
            ParseWarningKind::MissingCostData,
            None,
            "plan carries no cost figures; cost percentages are unknown",
        );
        return;
    };

    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if let Some(subtree) = node.subtree_cost {
            let children: f64 = node.children.iter().filter_map(|c| c.subtree_cost).sum();
            let own = (subtree - children).max(0.0);
            node.estimated_cost_percent = Some(if total > 0.0 {
                (own / total * 100.0).min(100.0)
            } else {
                0.0
            });
        }
        stack.extend(node.children.iter_mut());
    }
}

/// Drops or clamps metric values that cannot be right
///
/// Row counts must be finite and non-negative. Cost percentages may drift
/// up to half a point outside 0-100 from vendor rounding; anything further
/// is clamped with a warning.
pub(crate) fn sanitize_metrics(node: &mut OperatorNode, ctx: &mut ParseContext<'_>) {
    for (label, value) in [
        ("estimated rows", &mut node.estimated_rows),
        ("actual rows", &mut node.actual_rows),
    ] {
        if let Some(v) = *value
            && (!v.is_finite() || v < 0.0)
        {
            ctx.warn(
                ParseWarningKind::InvalidMetric,
                Some(node.id),
                format!("dropped invalid {} value {}", label, v),
            );
            *value = None;
        }
    }

    if let Some(pct) = node.estimated_cost_percent {
        if !pct.is_finite() {
            ctx.warn(
                ParseWarningKind::InvalidMetric,
                Some(node.id),
                format!("dropped invalid cost percentage {}", pct),
            );
            node.estimated_cost_percent = None;
        } else if !(-0.5..=100.5).contains(&pct) {
            ctx.warn(
                ParseWarningKind::CostOutOfRange,
                Some(node.id),
                format!("cost percentage {} clamped to 0-100", pct),
            );
            node.estimated_cost_percent = Some(pct.clamp(0.0, 100.0));
        } else {
            node.estimated_cost_percent = Some(pct.clamp(0.0, 100.0));
        }
    }
}
