//! SQL Server Showplan Parser
//!
//! Parses the XML produced by `SET SHOWPLAN_XML ON` (estimated plans) and
//! `SET STATISTICS XML ON` (actual plans).
//!
//! Showplan nests operators as `RelOp` elements, but a child `RelOp` is not a
//! direct child of its parent: it sits inside an operator-specific element
//! such as `<Hash>` or `<NestedLoops>`. Everything between a `RelOp` and its
//! nearest descendant `RelOp`s belongs to that operator (predicates, object,
//! warnings, runtime counters).
//!
//! # Examples
//!
//! ```
//! use planscope_analyzer::{Deadline, OperatorType, parse_plan};
//!
//! let xml = r#"<ShowPlanXML xmlns="http://schemas.microsoft.com/sqlserver/2004/07/showplan">
//!   <BatchSequence><Batch><Statements>
//!     <StmtSimple StatementText="SELECT * FROM t" StatementSubTreeCost="0.5">
//!       <QueryPlan>
//!         <RelOp NodeId="0" PhysicalOp="Table Scan" LogicalOp="Table Scan"
//!                EstimateRows="1000" EstimatedTotalSubtreeCost="0.5">
//!           <TableScan><Object Schema="[dbo]" Table="[t]" /></TableScan>
//!         </RelOp>
//!       </QueryPlan>
//!     </StmtSimple>
//!   </Statements></Batch></BatchSequence>
//! </ShowPlanXML>"#;
//!
//! let plan = parse_plan(xml, None, &Deadline::unbounded()).unwrap();
//! assert_eq!(plan.root.operator_type, OperatorType::TableScan);
//! assert_eq!(plan.root.estimated_cost_percent, Some(100.0));
//! ```

use super::{DocumentShape, ParseContext, ParseError, PlanAdapter, Result};
use crate::plan::{
    CpuStats, IoStats, NormalizedPlan, ObjectReference, OperatorNode, OperatorType, SpillMarker,
};
use planscope_core::SourceEngine;
use roxmltree::{Document, Node};

/// Adapter for SQL Server showplan XML
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerAdapter;

impl PlanAdapter for SqlServerAdapter {
    fn engine(&self) -> SourceEngine {
        SourceEngine::SqlServer
    }

    fn recognizes(&self, shape: &DocumentShape<'_>) -> bool {
        matches!(shape, DocumentShape::Xml { root } if root.eq_ignore_ascii_case("ShowPlanXML"))
    }

    fn parse(&self, document: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
        parse_showplan(document, ctx)
    }
}

/// Parses a showplan XML document
///
/// When the batch holds several statements, the most expensive one with a
/// query plan is analyzed.
pub fn parse_showplan(xml: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if !root.has_tag_name("ShowPlanXML") {
        return Err(ParseError::MalformedDocument(format!(
            "expected <ShowPlanXML> root, found <{}>",
            root.tag_name().name()
        )));
    }

    let (statement, query_plan) = select_statement(root).ok_or_else(|| {
        ParseError::MalformedDocument("showplan contains no statement with a query plan".into())
    })?;

    let root_relop = element_child(query_plan, "RelOp").ok_or_else(|| {
        ParseError::MalformedDocument("query plan has no root RelOp".into())
    })?;

    let granted_kb = element_child(query_plan, "MemoryGrantInfo")
        .and_then(|info| attr_f64(info, "GrantedMemory"));

    let mut actuals = false;
    let mut root_node = parse_relop(root_relop, granted_kb, &mut actuals, ctx)?;
    super::assign_cost_percentages(&mut root_node, ctx);

    let mut plan = NormalizedPlan::new(SourceEngine::SqlServer, root_node).with_actuals(actuals);
    if let Some(cost) = attr_f64(statement, "StatementSubTreeCost") {
        plan.total_estimated_cost = Some(cost);
    }
    plan.statement = statement.attribute("StatementText").map(str::to_string);

    Ok(plan)
}

/// Picks the most expensive statement that carries a query plan
fn select_statement<'a, 'i>(root: Node<'a, 'i>) -> Option<(Node<'a, 'i>, Node<'a, 'i>)> {
    let mut best: Option<(Node<'a, 'i>, Node<'a, 'i>, f64)> = None;

    for stmt in root.descendants().filter(|n| n.has_tag_name("StmtSimple")) {
        let Some(query_plan) = element_child(stmt, "QueryPlan") else {
            continue;
        };
        let cost = attr_f64(stmt, "StatementSubTreeCost").unwrap_or(0.0);
        match &best {
            Some((_, _, best_cost)) if *best_cost >= cost => {}
            _ => best = Some((stmt, query_plan, cost)),
        }
    }

    best.map(|(stmt, query_plan, _)| (stmt, query_plan))
}

/// Parses one `RelOp` and, recursively, the `RelOp`s nested under it
fn parse_relop(
    relop: Node<'_, '_>,
    granted_kb: Option<f64>,
    actuals: &mut bool,
    ctx: &mut ParseContext<'_>,
) -> Result<OperatorNode> {
    let id = ctx.enter_node()?;

    let (own, child_relops) = split_relop_content(relop);
    let Some(physical) = relop.attribute("PhysicalOp") else {
        // Nested operators are still readable, keep them under the placeholder
        let mut node = ctx.unparseable(id, None, "RelOp without a PhysicalOp attribute");
        for child in child_relops {
            node.children.push(parse_relop(child, granted_kb, actuals, ctx)?);
        }
        return Ok(node);
    };
    let logical = relop.attribute("LogicalOp").unwrap_or_default();

    let is_lookup = own
        .iter()
        .any(|n| n.has_tag_name("IndexScan") && n.attribute("Lookup").is_some_and(is_true));

    let mut node = OperatorNode::new(map_operator(physical, logical, is_lookup));
    node.id = id;
    node.physical_name = Some(physical.to_string());
    node.estimated_rows = attr_f64(relop, "EstimateRows");
    node.subtree_cost = attr_f64(relop, "EstimatedTotalSubtreeCost");

    let estimated_io = attr_f64(relop, "EstimateIO");
    let estimated_cpu = attr_f64(relop, "EstimateCPU");
    let mut runtime = RuntimeTotals::default();
    let mut memory_fraction = None;

    for el in &own {
        match el.tag_name().name() {
            "Object" if node.object.is_none() => node.object = object_reference(*el),
            "Predicate" | "ProbeResidual" | "Residual" => {
                if let Some(text) = scalar_string(*el) {
                    node.predicates.push(text);
                }
            }
            "Prefix" | "StartRange" | "EndRange" => node.predicates.extend(seek_predicates(*el)),
            "OrderByColumn" => {
                if let Some(column) = element_child(*el, "ColumnReference").and_then(column_name) {
                    let descending = el.attribute("Ascending").is_some_and(|v| !is_true(v));
                    node.sort_keys.push(if descending {
                        format!("{} DESC", column)
                    } else {
                        column
                    });
                }
            }
            "SpillToTempDb" => node.spill_markers.push(SpillMarker::SpillToTempDb {
                level: el.attribute("SpillLevel").and_then(|v| v.parse().ok()),
            }),
            "HashSpillDetails" => node.spill_markers.push(SpillMarker::HashSpill),
            "SortSpillDetails" => node.spill_markers.push(SpillMarker::SortSpill),
            "RunTimeCountersPerThread" => runtime.add(*el),
            "MemoryFractions" => memory_fraction = attr_f64(*el, "Input"),
            _ => {}
        }
    }

    if let Some(output) = element_child(relop, "OutputList") {
        node.output_columns = output
            .children()
            .filter(|c| c.has_tag_name("ColumnReference"))
            .filter_map(column_name)
            .collect();
    }

    if runtime.seen {
        *actuals = true;
        node.actual_rows = runtime.rows;
    }

    if estimated_io.is_some() || runtime.logical_reads.is_some() || runtime.physical_reads.is_some()
    {
        node.io_stats = Some(IoStats {
            estimated_io,
            logical_reads: runtime.logical_reads,
            physical_reads: runtime.physical_reads,
        });
    }

    if estimated_cpu.is_some() || runtime.cpu_ms.is_some() {
        node.cpu_stats = Some(CpuStats {
            estimated_cpu,
            actual_cpu_ms: runtime.cpu_ms,
        });
    }

    if let (Some(granted), Some(fraction)) = (granted_kb, memory_fraction)
        && fraction > 0.0
    {
        node.memory_grant_kb = Some((granted * fraction).round() as u64);
    }

    super::sanitize_metrics(&mut node, ctx);

    for child in child_relops {
        node.children.push(parse_relop(child, granted_kb, actuals, ctx)?);
    }

    Ok(node)
}

/// Splits a `RelOp`'s descendants into its own elements and its child `RelOp`s
///
/// Both lists are in document order. The walk does not descend into child
/// `RelOp`s.
fn split_relop_content<'a, 'i>(relop: Node<'a, 'i>) -> (Vec<Node<'a, 'i>>, Vec<Node<'a, 'i>>) {
    let mut own = Vec::new();
    let mut children = Vec::new();
    let mut stack: Vec<Node<'a, 'i>> = relop.children().filter(Node::is_element).collect();
    stack.reverse();

    while let Some(el) = stack.pop() {
        if el.has_tag_name("RelOp") {
            children.push(el);
            continue;
        }
        own.push(el);
        let mut nested: Vec<_> = el.children().filter(Node::is_element).collect();
        nested.reverse();
        stack.extend(nested);
    }

    (own, children)
}

/// Sums the per-thread runtime counters of an actual plan
#[derive(Debug, Default)]
struct RuntimeTotals {
    seen: bool,
    rows: Option<f64>,
    logical_reads: Option<u64>,
    physical_reads: Option<u64>,
    cpu_ms: Option<f64>,
}

impl RuntimeTotals {
    fn add(&mut self, counters: Node<'_, '_>) {
        self.seen = true;
        if let Some(rows) = attr_f64(counters, "ActualRows") {
            *self.rows.get_or_insert(0.0) += rows;
        }
        if let Some(reads) = attr_u64(counters, "ActualLogicalReads") {
            *self.logical_reads.get_or_insert(0) += reads;
        }
        if let Some(reads) = attr_u64(counters, "ActualPhysicalReads") {
            *self.physical_reads.get_or_insert(0) += reads;
        }
        if let Some(cpu) = attr_f64(counters, "ActualCPUms") {
            *self.cpu_ms.get_or_insert(0.0) += cpu;
        }
    }
}

/// Maps a showplan PhysicalOp to the normalized operator
pub fn map_operator(physical: &str, logical: &str, is_lookup: bool) -> OperatorType {
    if is_lookup {
        return OperatorType::KeyLookup;
    }
    match physical {
        "Table Scan" => OperatorType::TableScan,
        "Clustered Index Scan" | "Index Scan" | "Columnstore Index Scan" => OperatorType::IndexScan,
        "Clustered Index Seek" | "Index Seek" => OperatorType::IndexSeek,
        "Key Lookup" | "RID Lookup" => OperatorType::KeyLookup,
        "Hash Match" => match logical {
            "Aggregate" | "Partial Aggregate" | "Flow Distinct" => OperatorType::HashAggregate,
            _ => OperatorType::HashMatch,
        },
        "Nested Loops" => OperatorType::NestedLoop,
        "Merge Join" => OperatorType::MergeJoin,
        "Sort" | "Top N Sort" => OperatorType::Sort,
        "Stream Aggregate" => OperatorType::StreamAggregate,
        "Filter" => OperatorType::Filter,
        "Compute Scalar" => OperatorType::ComputeScalar,
        "Table Spool" | "Index Spool" | "Row Count Spool" | "Window Spool" => OperatorType::Spool,
        _ => OperatorType::Other,
    }
}

/// Builds `column op expression` strings from a seek range element
fn seek_predicates(range: Node<'_, '_>) -> Vec<String> {
    let op = match range.attribute("ScanType").unwrap_or("EQ") {
        "LT" => "<",
        "LE" => "<=",
        "GT" => ">",
        "GE" => ">=",
        "NE" => "<>",
        "IS" => "IS",
        "IsNotNull" | "ISNOTNULL" => "IS NOT",
        _ => "=",
    };

    let columns: Vec<String> = element_child(range, "RangeColumns")
        .map(|rc| {
            rc.children()
                .filter(|c| c.has_tag_name("ColumnReference"))
                .filter_map(qualified_column)
                .collect()
        })
        .unwrap_or_default();

    let expressions: Vec<String> = element_child(range, "RangeExpressions")
        .map(|re| {
            re.children()
                .filter(|c| c.has_tag_name("ScalarOperator"))
                .map(|s| s.attribute("ScalarString").unwrap_or("?").to_string())
                .collect()
        })
        .unwrap_or_default();

    columns
        .into_iter()
        .enumerate()
        .map(|(i, column)| {
            let expr = expressions.get(i).map(String::as_str).unwrap_or("?");
            format!("{} {} {}", column, op, expr)
        })
        .collect()
}

/// First `ScalarString` below a predicate element
fn scalar_string(el: Node<'_, '_>) -> Option<String> {
    el.descendants()
        .find(|n| n.has_tag_name("ScalarOperator"))
        .and_then(|s| s.attribute("ScalarString"))
        .map(str::to_string)
}

fn object_reference(el: Node<'_, '_>) -> Option<ObjectReference> {
    let table = strip_brackets(el.attribute("Table")?);
    let mut object = ObjectReference::new(table);
    object.schema = el.attribute("Schema").map(strip_brackets);
    object.index = el.attribute("Index").map(strip_brackets);
    Some(object)
}

/// Bare column name of a `ColumnReference`
fn column_name(el: Node<'_, '_>) -> Option<String> {
    el.attribute("Column").map(strip_brackets)
}

/// `[Table].[Column]` form of a `ColumnReference`, as showplan prints it
fn qualified_column(el: Node<'_, '_>) -> Option<String> {
    let column = strip_brackets(el.attribute("Column")?);
    Some(match el.attribute("Table") {
        Some(table) => format!("[{}].[{}]", strip_brackets(table), column),
        None => format!("[{}]", column),
    })
}

fn element_child<'a, 'i>(parent: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    parent.children().find(|c| c.has_tag_name(name))
}

fn attr_f64(el: Node<'_, '_>, name: &str) -> Option<f64> {
    el.attribute(name).and_then(|v| v.trim().parse().ok())
}

fn attr_u64(el: Node<'_, '_>, name: &str) -> Option<u64> {
    el.attribute(name).and_then(|v| v.trim().parse().ok())
}

fn strip_brackets(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

fn is_true(value: &str) -> bool {
    matches!(value, "1" | "true" | "True")
}
