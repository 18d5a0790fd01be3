//! PostgreSQL EXPLAIN Parser
//!
//! Parses EXPLAIN output from PostgreSQL in two formats:
//! - JSON format (EXPLAIN (FORMAT JSON)), picked up by sniffing
//! - Text format (default EXPLAIN), only when the engine hint says postgres
//!
//! `Total Cost` is cumulative over a subtree, so per-operator cost shares are
//! derived by subtracting the children's totals.
//!
//! # Examples
//!
//! ```
//! use planscope_analyzer::{Deadline, OperatorType, parse_plan};
//!
//! let json_output = r#"[
//!   {
//!     "Plan": {
//!       "Node Type": "Seq Scan",
//!       "Relation Name": "users",
//!       "Startup Cost": 0.0,
//!       "Total Cost": 10.0,
//!       "Plan Rows": 100,
//!       "Plan Width": 36
//!     }
//!   }
//! ]"#;
//!
//! let plan = parse_plan(json_output, None, &Deadline::unbounded()).unwrap();
//! assert_eq!(plan.root.operator_type, OperatorType::TableScan);
//! ```

use super::{DocumentShape, ParseContext, ParseError, PlanAdapter, Result};
use crate::plan::{
    IoStats, NodeId, NormalizedPlan, ObjectReference, OperatorNode, OperatorType, ParseWarningKind,
    SpillMarker,
};
use planscope_core::SourceEngine;
use serde_json::Value;

/// Predicate-bearing keys, in the order they are attached to a node
const PREDICATE_KEYS: [&str; 6] = [
    "Filter",
    "Index Cond",
    "Recheck Cond",
    "Hash Cond",
    "Merge Cond",
    "Join Filter",
];

/// Adapter for PostgreSQL EXPLAIN output
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

impl PlanAdapter for PostgresAdapter {
    fn engine(&self) -> SourceEngine {
        SourceEngine::Postgres
    }

    fn recognizes(&self, shape: &DocumentShape<'_>) -> bool {
        match shape {
            DocumentShape::Json(value) => plan_object(value).is_some(),
            DocumentShape::Xml { .. } => false,
        }
    }

    fn parse(&self, document: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
        let trimmed = document.trim();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            parse_json_explain(trimmed, ctx)
        } else {
            parse_text_explain(trimmed, ctx)
        }
    }
}

/// Finds the `Plan` object in EXPLAIN JSON, which PostgreSQL wraps in an array
fn plan_object(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.first().and_then(|v| v.get("Plan")),
        Value::Object(_) => value.get("Plan"),
        _ => None,
    }
}

/// Parses PostgreSQL EXPLAIN (FORMAT JSON) output
pub fn parse_json_explain(json: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
    let value: Value = serde_json::from_str(json)?;
    let plan_obj = plan_object(&value).ok_or_else(|| {
        ParseError::MalformedDocument("missing Plan object in EXPLAIN output".into())
    })?;

    let mut actuals = false;
    let mut root = parse_plan_node(plan_obj, &mut actuals, ctx)?;
    super::assign_cost_percentages(&mut root, ctx);

    Ok(NormalizedPlan::new(SourceEngine::Postgres, root).with_actuals(actuals))
}

/// Parses a single plan node from JSON, then its `Plans` in order
fn parse_plan_node(
    value: &Value,
    actuals: &mut bool,
    ctx: &mut ParseContext<'_>,
) -> Result<OperatorNode> {
    let id = ctx.enter_node()?;

    if !value.is_object() {
        return Ok(ctx.unparseable(id, None, "plan entry is not a JSON object"));
    }
    let Some(node_type) = str_field(value, "Node Type") else {
        let mut node = ctx.unparseable(id, None, "plan node without a Node Type");
        if let Some(plans) = value.get("Plans").and_then(Value::as_array) {
            for child_value in plans {
                node.children.push(parse_plan_node(child_value, actuals, ctx)?);
            }
        }
        return Ok(node);
    };

    let has_index_cond = value.get("Index Cond").is_some();
    let strategy = str_field(value, "Strategy");
    let operator_type = match map_node_type(node_type, strategy, has_index_cond) {
        Some(operator_type) => operator_type,
        None => {
            ctx.warn(
                ParseWarningKind::UnknownOperator,
                Some(id),
                format!("unknown PostgreSQL node type '{}'", node_type),
            );
            OperatorType::Other
        }
    };

    let mut node = OperatorNode::new(operator_type).with_physical_name(node_type);
    node.id = id;

    if let Some(relation) = str_field(value, "Relation Name") {
        let mut object = ObjectReference::new(relation);
        object.schema = str_field(value, "Schema").map(str::to_string);
        object.index = str_field(value, "Index Name").map(str::to_string);
        node.object = Some(object);
    }

    node.subtree_cost = f64_field(value, "Total Cost");

    // Row counts are per loop; scale both sides so they stay comparable
    let loops = f64_field(value, "Actual Loops");
    let plan_rows = f64_field(value, "Plan Rows");
    if let Some(loops) = loops {
        *actuals = true;
        let loops = loops.max(1.0);
        node.estimated_rows = plan_rows.map(|r| r * loops);
        node.actual_rows = f64_field(value, "Actual Rows").map(|r| r * loops);
    } else {
        node.estimated_rows = plan_rows;
    }

    for key in PREDICATE_KEYS {
        if let Some(predicate) = str_field(value, key) {
            node.predicates.push(predicate.to_string());
        }
    }

    node.sort_keys = string_list(value, "Sort Key");
    if node.sort_keys.is_empty() {
        node.sort_keys = string_list(value, "Group Key");
    }
    node.output_columns = string_list(value, "Output");

    if let Some(method) = str_field(value, "Sort Method")
        && method.contains("external")
    {
        node.spill_markers.push(SpillMarker::ExternalSort {
            method: method.to_string(),
        });
    }
    if str_field(value, "Sort Space Type") == Some("Disk") {
        node.spill_markers.push(SpillMarker::DiskSortSpace);
    }
    if let Some(batches) = value.get("Hash Batches").and_then(Value::as_u64)
        && batches > 1
    {
        node.spill_markers.push(SpillMarker::HashBatches { batches });
    }

    node.memory_grant_kb = value
        .get("Peak Memory Usage")
        .and_then(Value::as_u64)
        .or_else(|| value.get("Sort Space Used").and_then(Value::as_u64));

    let hit = value.get("Shared Hit Blocks").and_then(Value::as_u64);
    let read = value.get("Shared Read Blocks").and_then(Value::as_u64);
    if hit.is_some() || read.is_some() {
        node.io_stats = Some(IoStats {
            estimated_io: None,
            logical_reads: Some(hit.unwrap_or(0) + read.unwrap_or(0)),
            physical_reads: read,
        });
    }

    super::sanitize_metrics(&mut node, ctx);

    if let Some(plans) = value.get("Plans").and_then(Value::as_array) {
        for child_value in plans {
            let child = parse_plan_node(child_value, actuals, ctx)?;
            node.children.push(child);
        }
    }

    Ok(node)
}

/// Maps a PostgreSQL node type to the normalized operator
///
/// Returns `None` for node types this parser does not know about.
pub fn map_node_type(
    node_type: &str,
    strategy: Option<&str>,
    has_index_cond: bool,
) -> Option<OperatorType> {
    let operator_type = match node_type {
        "Seq Scan" => OperatorType::TableScan,
        "Index Scan" | "Index Only Scan" => {
            if has_index_cond {
                OperatorType::IndexSeek
            } else {
                OperatorType::IndexScan
            }
        }
        "Bitmap Index Scan" | "Tid Scan" | "Tid Range Scan" => OperatorType::IndexSeek,
        "Bitmap Heap Scan" => OperatorType::IndexScan,
        "Hash" | "Hash Join" => OperatorType::HashMatch,
        "Nested Loop" => OperatorType::NestedLoop,
        "Merge Join" => OperatorType::MergeJoin,
        "Sort" | "Incremental Sort" => OperatorType::Sort,
        "Aggregate" => match strategy {
            Some("Hashed") | Some("Mixed") => OperatorType::HashAggregate,
            _ => OperatorType::StreamAggregate,
        },
        "HashAggregate" | "MixedAggregate" => OperatorType::HashAggregate,
        "GroupAggregate" | "Group" => OperatorType::StreamAggregate,
        "Materialize" | "Memoize" => OperatorType::Spool,
        "Result" | "ProjectSet" => OperatorType::ComputeScalar,
        "Limit" | "Append" | "Merge Append" | "Gather" | "Gather Merge" | "Unique"
        | "WindowAgg" | "SetOp" | "LockRows" | "Subquery Scan" | "CTE Scan"
        | "Function Scan" | "Values Scan" | "WorkTable Scan" | "Recursive Union"
        | "BitmapAnd" | "BitmapOr" | "ModifyTable" | "Foreign Scan" | "Custom Scan"
        | "Sample Scan" | "Named Tuplestore Scan" | "Table Function Scan" => OperatorType::Other,
        _ => return None,
    };
    Some(operator_type)
}

/// Parses PostgreSQL text-format EXPLAIN output
///
/// Node lines are the first plan line and every line starting with `->`;
/// a node's children are the node lines indented deeper than it. Other
/// indented lines (`Filter: ...`, `Sort Method: ...`) are properties of the
/// closest node line above them.
pub fn parse_text_explain(text: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
    let mut stack: Vec<(usize, OperatorNode)> = Vec::new();
    let mut actuals = false;

    for line in text.lines() {
        let content = line.trim();
        if is_noise_line(content) {
            continue;
        }

        let indent = count_indent(line);
        if stack.is_empty() || content.starts_with("->") {
            let id = ctx.enter_node()?;
            let mut node = parse_text_line(content, id, ctx);
            actuals |= node.actual_rows.is_some() || content.contains("never executed");
            super::sanitize_metrics(&mut node, ctx);

            attach_deeper(&mut stack, indent);
            stack.push((indent, node));
        } else if let Some((_, node)) = stack.last_mut() {
            apply_text_property(node, content);
        }
    }

    attach_deeper(&mut stack, 0);
    let (_, mut root) = stack.pop().ok_or_else(|| {
        ParseError::MalformedDocument("no plan nodes found in EXPLAIN text".into())
    })?;

    super::assign_cost_percentages(&mut root, ctx);
    Ok(NormalizedPlan::new(SourceEngine::Postgres, root).with_actuals(actuals))
}

/// Pops every node at `indent` or deeper into its parent's children
fn attach_deeper(stack: &mut Vec<(usize, OperatorNode)>, indent: usize) {
    while stack.len() > 1 && stack.last().is_some_and(|(i, _)| *i >= indent) {
        if let Some((_, child)) = stack.pop()
            && let Some((_, parent)) = stack.last_mut()
        {
            parent.children.push(child);
        }
    }
}

fn is_noise_line(content: &str) -> bool {
    content.is_empty()
        || content == "QUERY PLAN"
        || content.chars().all(|c| c == '-' || c == '+')
        || (content.starts_with('(') && (content.ends_with("rows)") || content.ends_with("row)")))
        || content.starts_with("Planning")
        || content.starts_with("Execution")
        || content.starts_with("JIT:")
}

/// Parses a single node line into an `OperatorNode`
///
/// Format: `Node Type on relation  (cost=X..Y rows=N width=W) (actual time=X..Y rows=N loops=L)`
fn parse_text_line(line: &str, id: NodeId, ctx: &mut ParseContext<'_>) -> OperatorNode {
    let content = line.trim_start_matches("->").trim();

    let (type_part, cost_part) = match content.find(" (cost=") {
        Some(idx) => (content[..idx].trim_end(), Some(&content[idx..])),
        None => match content.find(" (actual") {
            Some(idx) => (content[..idx].trim_end(), Some(&content[idx..])),
            None => (content, None),
        },
    };

    let (name, relation, index_name) = split_type_and_relation(type_part);
    let operator_type = match text_operator(name) {
        Some(operator_type) => operator_type,
        None => {
            ctx.warn(
                ParseWarningKind::UnknownOperator,
                Some(id),
                format!("unknown PostgreSQL node type '{}'", name),
            );
            OperatorType::Other
        }
    };

    let mut node = OperatorNode::new(operator_type).with_physical_name(name);
    node.id = id;
    if let Some(relation) = relation {
        let mut object = ObjectReference::new(relation);
        object.index = index_name;
        node.object = Some(object);
    }

    if let Some(cost_str) = cost_part {
        parse_cost_section(&mut node, cost_str);
    }

    node
}

/// Splits `Index Scan using idx on public.users u` into its parts
fn split_type_and_relation(text: &str) -> (&str, Option<String>, Option<String>) {
    let (head, relation) = match text.find(" on ") {
        Some(idx) => {
            let relation = text[idx + 4..].split_whitespace().next().map(str::to_string);
            (&text[..idx], relation)
        }
        None => (text, None),
    };

    let (name, index_name) = match head.find(" using ") {
        Some(idx) => {
            let index = head[idx + 7..].split_whitespace().next().map(str::to_string);
            (&head[..idx], index)
        }
        None => (head, None),
    };

    let name = name.trim().trim_start_matches("Parallel ").trim();
    (name, relation, index_name)
}

/// Maps a text-format node name, which carries join kinds inline
fn text_operator(name: &str) -> Option<OperatorType> {
    if name.contains("Join") {
        if name.starts_with("Hash") {
            return Some(OperatorType::HashMatch);
        }
        if name.starts_with("Merge") {
            return Some(OperatorType::MergeJoin);
        }
    }
    if name.starts_with("Nested Loop") {
        return Some(OperatorType::NestedLoop);
    }
    // Index Cond arrives on a later property line and upgrades the scan to a seek
    map_node_type(name, None, false)
}

/// Parses the cost section from text format
fn parse_cost_section(node: &mut OperatorNode, cost_str: &str) {
    // Estimated section: "(cost=0.00..10.00 rows=100 width=36)"
    if let Some(total) = extract_between(cost_str, "cost=", " rows=")
        .and_then(|range| range.split("..").nth(1))
        .and_then(|s| s.parse::<f64>().ok())
    {
        node.subtree_cost = Some(total);
    }

    let estimated = match cost_str.find("(actual") {
        Some(idx) => &cost_str[..idx],
        None => cost_str,
    };
    if let Some(rows) = extract_between(estimated, "rows=", " ").and_then(|s| s.parse::<f64>().ok())
    {
        node.estimated_rows = Some(rows);
    }

    // Actual section: "(actual time=0.01..0.05 rows=50 loops=1)"
    if let Some(idx) = cost_str.find("(actual") {
        let actual = &cost_str[idx..];
        let loops = extract_between(actual, "loops=", ")")
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(1.0)
            .max(1.0);
        if let Some(rows) = extract_between(actual, "rows=", " ").and_then(|s| s.parse::<f64>().ok())
        {
            node.actual_rows = Some(rows * loops);
            node.estimated_rows = node.estimated_rows.map(|r| r * loops);
        }
    }
}

/// Applies one `Key: value` property line to its node
fn apply_text_property(node: &mut OperatorNode, content: &str) {
    let Some((key, value)) = content.split_once(':') else {
        return;
    };
    let value = value.trim();

    match key.trim() {
        key if PREDICATE_KEYS.contains(&key) => {
            if key == "Index Cond"
                && node.operator_type == OperatorType::IndexScan
                && node.physical_name.as_deref() != Some("Bitmap Heap Scan")
            {
                node.operator_type = OperatorType::IndexSeek;
            }
            node.predicates.push(value.to_string());
        }
        "Sort Key" | "Group Key" if node.sort_keys.is_empty() => {
            node.sort_keys = split_list(value);
        }
        "Output" => node.output_columns = split_list(value),
        "Sort Method" => {
            // "external merge  Disk: 2048kB" or "quicksort  Memory: 25kB"
            let method = value.split("  ").next().unwrap_or(value).trim();
            if method.contains("external") {
                node.spill_markers.push(SpillMarker::ExternalSort {
                    method: method.to_string(),
                });
            }
            if let Some(kb) = extract_kb(value, "Disk:") {
                node.spill_markers.push(SpillMarker::DiskSortSpace);
                node.memory_grant_kb = Some(kb);
            } else if let Some(kb) = extract_kb(value, "Memory:") {
                node.memory_grant_kb = Some(kb);
            }
        }
        "Buckets" => {
            // "Buckets: 1024  Batches: 4  Memory Usage: 40kB"
            if let Some(batches) = extract_between(content, "Batches: ", " ")
                .or_else(|| content.split("Batches: ").nth(1))
                .and_then(|s| s.trim().parse::<u64>().ok())
                && batches > 1
            {
                node.spill_markers.push(SpillMarker::HashBatches { batches });
            }
            if let Some(kb) = extract_kb(content, "Memory Usage:") {
                node.memory_grant_kb = Some(kb);
            }
        }
        "Buffers" => {
            // "shared hit=4 read=2"
            let hit = extract_between(value, "hit=", " ")
                .or_else(|| value.split("hit=").nth(1))
                .and_then(|s| s.trim().parse::<u64>().ok());
            let read = extract_between(value, "read=", " ")
                .or_else(|| value.split("read=").nth(1))
                .and_then(|s| s.trim().parse::<u64>().ok());
            if hit.is_some() || read.is_some() {
                node.io_stats = Some(IoStats {
                    estimated_io: None,
                    logical_reads: Some(hit.unwrap_or(0) + read.unwrap_or(0)),
                    physical_reads: read,
                });
            }
        }
        _ => {}
    }
}

/// Splits a comma-separated key list, keeping commas inside parentheses
fn split_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in value.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

/// Reads `<marker> 2048kB`
fn extract_kb(s: &str, marker: &str) -> Option<u64> {
    let after = &s[s.find(marker)? + marker.len()..];
    let digits: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Helper to extract text between two markers
fn extract_between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_idx = s.find(start)? + start.len();
    let end_idx = s[start_idx..].find(end)? + start_idx;
    Some(&s[start_idx..end_idx])
}

/// Helper to count leading spaces (indentation)
fn count_indent(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn f64_field(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(Value::as_f64)
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|k| k.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests;
