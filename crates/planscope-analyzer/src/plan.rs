//! Normalized Plan Model - engine-agnostic execution-plan tree
//!
//! Every adapter maps its vendor format onto these types. The tree is owned
//! top-down: each `OperatorNode` exclusively owns its children, so the plan is
//! a strict tree with one root, and node ids are unique across it.

use planscope_core::{SourceEngine, TableRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a node within one plan (pre-order sequence number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Normalized operator kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    TableScan,
    IndexSeek,
    IndexScan,
    KeyLookup,
    HashMatch,
    NestedLoop,
    MergeJoin,
    Sort,
    HashAggregate,
    StreamAggregate,
    Filter,
    ComputeScalar,
    Spool,
    Other,
}

impl OperatorType {
    /// Returns a human-readable description of this operator
    pub fn description(&self) -> &'static str {
        match self {
            Self::TableScan => "Table scan (reads every row of the table)",
            Self::IndexSeek => "Index seek (navigates the index to matching rows)",
            Self::IndexScan => "Index scan (reads every entry of an index)",
            Self::KeyLookup => "Key lookup (fetches missing columns from the base table)",
            Self::HashMatch => "Hash match (hash join or hash-based set operation)",
            Self::NestedLoop => "Nested loop join",
            Self::MergeJoin => "Merge join (sorted inputs)",
            Self::Sort => "Sort",
            Self::HashAggregate => "Hash aggregate (hash-based grouping)",
            Self::StreamAggregate => "Stream aggregate (grouping over sorted input)",
            Self::Filter => "Filter",
            Self::ComputeScalar => "Compute scalar (evaluates expressions)",
            Self::Spool => "Spool (stores intermediate results)",
            Self::Other => "Other operation",
        }
    }

    /// Returns true for full table or index scans
    pub fn is_scan(&self) -> bool {
        matches!(self, Self::TableScan | Self::IndexScan)
    }

    /// Returns true for operators that read a physical object by predicate
    pub fn is_access(&self) -> bool {
        matches!(self, Self::TableScan | Self::IndexScan | Self::IndexSeek)
    }

    /// Returns true for hash-based operators that need a memory grant
    pub fn is_hash(&self) -> bool {
        matches!(self, Self::HashMatch | Self::HashAggregate)
    }

    /// Returns true for join operators
    pub fn is_join(&self) -> bool {
        matches!(self, Self::HashMatch | Self::NestedLoop | Self::MergeJoin)
    }
}

/// Physical object touched by an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub schema: Option<String>,
    pub table: String,
    pub index: Option<String>,
}

impl ObjectReference {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
            index: None,
        }
    }

    /// Sets the schema name
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Sets the index name
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Returns the table this object belongs to
    pub fn table_ref(&self) -> TableRef {
        TableRef {
            schema: self.schema.clone(),
            table: self.table.clone(),
        }
    }
}

/// I/O figures for an operator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    /// Optimizer's I/O cost estimate
    pub estimated_io: Option<f64>,
    /// Logical page reads (actual plans only)
    pub logical_reads: Option<u64>,
    /// Physical page reads (actual plans only)
    pub physical_reads: Option<u64>,
}

/// CPU figures for an operator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Optimizer's CPU cost estimate
    pub estimated_cpu: Option<f64>,
    /// Measured CPU time (actual plans only)
    pub actual_cpu_ms: Option<f64>,
}

/// Vendor marker showing that an operator ran out of memory and spilled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SpillMarker {
    /// SQL Server `SpillToTempDb` warning
    SpillToTempDb { level: Option<u32> },
    /// SQL Server `HashSpillDetails` warning
    HashSpill,
    /// SQL Server `SortSpillDetails` warning
    SortSpill,
    /// PostgreSQL external sort method (e.g. "external merge")
    ExternalSort { method: String },
    /// PostgreSQL hash with more than one batch
    HashBatches { batches: u64 },
    /// PostgreSQL sort space on disk
    DiskSortSpace,
}

/// Values derived by the metric extractor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// `|actual - estimated| / max(estimated, 1)` when both row counts exist
    pub row_estimation_error: Option<f64>,
    /// True when any spill marker is present
    pub spilled: bool,
}

/// A single operator in the normalized plan tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNode {
    pub id: NodeId,
    pub operator_type: OperatorType,
    /// Vendor operator name as it appeared in the source document
    pub physical_name: Option<String>,
    pub estimated_rows: Option<f64>,
    /// Only present for executed ("actual") plans
    pub actual_rows: Option<f64>,
    /// Share of the whole plan's cost spent in this operator (0-100)
    pub estimated_cost_percent: Option<f64>,
    /// Vendor cumulative cost of this subtree
    pub subtree_cost: Option<f64>,
    pub io_stats: Option<IoStats>,
    pub cpu_stats: Option<CpuStats>,
    pub memory_grant_kb: Option<u64>,
    /// Raw predicate expressions, in document order
    pub predicates: Vec<String>,
    pub sort_keys: Vec<String>,
    pub output_columns: Vec<String>,
    pub object: Option<ObjectReference>,
    pub spill_markers: Vec<SpillMarker>,
    /// Populated by the metric extractor
    pub metrics: Option<NodeMetrics>,
    pub children: Vec<OperatorNode>,
}

impl OperatorNode {
    /// Creates a new node of the given type
    ///
    /// The id is a placeholder until the node is placed in a `NormalizedPlan`.
    pub fn new(operator_type: OperatorType) -> Self {
        Self {
            id: NodeId(0),
            operator_type,
            physical_name: None,
            estimated_rows: None,
            actual_rows: None,
            estimated_cost_percent: None,
            subtree_cost: None,
            io_stats: None,
            cpu_stats: None,
            memory_grant_kb: None,
            predicates: Vec::new(),
            sort_keys: Vec::new(),
            output_columns: Vec::new(),
            object: None,
            spill_markers: Vec::new(),
            metrics: None,
            children: Vec::new(),
        }
    }

    /// Creates an `Other` placeholder for a subtree that could not be parsed
    pub fn placeholder(physical_name: Option<String>) -> Self {
        let mut node = Self::new(OperatorType::Other);
        node.physical_name = physical_name;
        node
    }

    /// Sets the vendor operator name
    pub fn with_physical_name(mut self, name: impl Into<String>) -> Self {
        self.physical_name = Some(name.into());
        self
    }

    /// Sets the estimated row count
    pub fn with_estimated_rows(mut self, rows: f64) -> Self {
        self.estimated_rows = Some(rows);
        self
    }

    /// Sets the actual row count
    pub fn with_actual_rows(mut self, rows: f64) -> Self {
        self.actual_rows = Some(rows);
        self
    }

    /// Sets the cost percentage
    pub fn with_cost_percent(mut self, percent: f64) -> Self {
        self.estimated_cost_percent = Some(percent);
        self
    }

    /// Sets the memory grant
    pub fn with_memory_grant_kb(mut self, kb: u64) -> Self {
        self.memory_grant_kb = Some(kb);
        self
    }

    /// Adds a predicate expression
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicates.push(predicate.into());
        self
    }

    /// Adds a sort key
    pub fn with_sort_key(mut self, key: impl Into<String>) -> Self {
        self.sort_keys.push(key.into());
        self
    }

    /// Adds an output column
    pub fn with_output_column(mut self, column: impl Into<String>) -> Self {
        self.output_columns.push(column.into());
        self
    }

    /// Sets the physical object
    pub fn with_object(mut self, object: ObjectReference) -> Self {
        self.object = Some(object);
        self
    }

    /// Adds a spill marker
    pub fn with_spill(mut self, marker: SpillMarker) -> Self {
        self.spill_markers.push(marker);
        self
    }

    /// Adds a child node
    pub fn with_child(mut self, child: OperatorNode) -> Self {
        self.children.push(child);
        self
    }

    /// Returns the total number of nodes in this subtree (including self)
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Returns the maximum depth of this subtree
    pub fn depth(&self) -> usize {
        if self.children.is_empty() {
            1
        } else {
            1 + self.children.iter().map(|c| c.depth()).max().unwrap_or(0)
        }
    }

    /// Returns true if this is a leaf node (no children)
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns true if the source document carried any spill marker
    pub fn has_spill_marker(&self) -> bool {
        !self.spill_markers.is_empty()
    }

    /// Table touched by this operator, if any
    pub fn table_ref(&self) -> Option<TableRef> {
        self.object.as_ref().map(ObjectReference::table_ref)
    }
}

/// Category of a non-fatal parse issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseWarningKind {
    /// A subtree could not be interpreted and was replaced by an `Other` node
    UnparseableSubtree,
    /// The document carries no cost figures, so cost percentages are unknown
    MissingCostData,
    /// A cost percentage fell outside 0-100 beyond rounding drift and was clamped
    CostOutOfRange,
    /// A numeric field was negative or not finite and was dropped
    InvalidMetric,
    /// The vendor operator name has no normalized equivalent
    UnknownOperator,
}

/// Non-fatal issue found while parsing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub kind: ParseWarningKind,
    pub node_id: Option<NodeId>,
    pub message: String,
}

impl ParseWarning {
    pub fn new(kind: ParseWarningKind, node_id: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id,
            message: message.into(),
        }
    }
}

/// Plan-wide aggregates computed by the metric extractor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStatistics {
    pub node_count: usize,
    pub depth: usize,
    pub total_estimated_cost: Option<f64>,
    pub max_cost_percent: Option<f64>,
    pub max_cost_node: Option<NodeId>,
    pub operator_counts: BTreeMap<OperatorType, usize>,
    pub has_spill: bool,
    pub max_row_estimation_error: Option<f64>,
}

impl PlanStatistics {
    /// Number of operators of the given type
    pub fn count_of(&self, operator_type: OperatorType) -> usize {
        self.operator_counts.get(&operator_type).copied().unwrap_or(0)
    }
}

/// A parsed execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPlan {
    pub engine: SourceEngine,
    /// True when the plan carries runtime ("actual") figures
    pub is_actual: bool,
    /// Vendor total cost of the whole plan
    pub total_estimated_cost: Option<f64>,
    /// Statement text, when the document embeds it
    pub statement: Option<String>,
    pub warnings: Vec<ParseWarning>,
    /// Populated by the metric extractor
    pub statistics: Option<PlanStatistics>,
    pub root: OperatorNode,
}

impl NormalizedPlan {
    /// Creates a plan around `root`, assigning ids in pre-order
    pub fn new(engine: SourceEngine, root: OperatorNode) -> Self {
        let mut plan = Self {
            engine,
            is_actual: false,
            total_estimated_cost: root.subtree_cost,
            statement: None,
            warnings: Vec::new(),
            statistics: None,
            root,
        };
        plan.renumber();
        plan
    }

    /// Marks the plan as carrying runtime figures
    pub fn with_actuals(mut self, is_actual: bool) -> Self {
        self.is_actual = is_actual;
        self
    }

    /// Sets the total estimated cost
    pub fn with_total_cost(mut self, cost: f64) -> Self {
        self.total_estimated_cost = Some(cost);
        self
    }

    /// Reassigns node ids in pre-order, starting at zero
    pub fn renumber(&mut self) {
        let mut next = 0u32;
        let mut stack = vec![&mut self.root];
        while let Some(node) = stack.pop() {
            node.id = NodeId(next);
            next += 1;
            stack.extend(node.children.iter_mut().rev());
        }
    }

    /// Returns an iterator over all nodes in pre-order
    pub fn iter_nodes(&self) -> OperatorNodeIterator<'_> {
        OperatorNodeIterator::new(&self.root)
    }

    /// Finds a node by id
    pub fn node(&self, id: NodeId) -> Option<&OperatorNode> {
        self.iter_nodes().find(|n| n.id == id)
    }

    /// Finds all nodes of a specific type
    pub fn find_nodes_by_type(&self, operator_type: OperatorType) -> Vec<&OperatorNode> {
        self.iter_nodes()
            .filter(|n| n.operator_type == operator_type)
            .collect()
    }

    /// Returns the number of nodes in the tree
    pub fn node_count(&self) -> usize {
        self.iter_nodes().count()
    }

    /// Distinct tables referenced by the plan, in pre-order of first use
    pub fn tables(&self) -> Vec<TableRef> {
        let mut tables: Vec<TableRef> = Vec::new();
        for table in self.iter_nodes().filter_map(OperatorNode::table_ref) {
            if !tables.iter().any(|t| t.key() == table.key()) {
                tables.push(table);
            }
        }
        tables
    }

    /// Records a parse warning
    pub fn push_warning(&mut self, warning: ParseWarning) {
        self.warnings.push(warning);
    }
}

/// Iterator for traversing operator nodes in pre-order
pub struct OperatorNodeIterator<'a> {
    stack: Vec<&'a OperatorNode>,
}

impl<'a> OperatorNodeIterator<'a> {
    fn new(root: &'a OperatorNode) -> Self {
        Self { stack: vec![root] }
    }
}

impl<'a> Iterator for OperatorNodeIterator<'a> {
    type Item = &'a OperatorNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // Push children in reverse order so we visit them in order
        for child in node.children.iter().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}
