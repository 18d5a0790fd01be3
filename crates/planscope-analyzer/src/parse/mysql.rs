//! MySQL EXPLAIN Parser
//!
//! Parses `EXPLAIN FORMAT=JSON` output from MySQL and MariaDB.
//!
//! MySQL EXPLAIN output is structured differently from PostgreSQL:
//! - Uses "access_type" instead of "Node Type"
//! - Costs are per table access, not cumulative per subtree
//! - Joins are a flat "nested_loop" array in join order
//! - It is always an estimate; there are no runtime counters
//!
//! # Examples
//!
//! ```
//! use planscope_analyzer::{Deadline, OperatorType, parse_plan};
//!
//! let json_output = r#"{
//!   "query_block": {
//!     "select_id": 1,
//!     "cost_info": {
//!       "query_cost": "1.00"
//!     },
//!     "table": {
//!       "table_name": "users",
//!       "access_type": "ALL",
//!       "rows_examined_per_scan": 100
//!     }
//!   }
//! }"#;
//!
//! let plan = parse_plan(json_output, Some("mysql"), &Deadline::unbounded()).unwrap();
//! assert_eq!(plan.root.operator_type, OperatorType::TableScan);
//! ```

use super::{DocumentShape, ParseContext, ParseError, PlanAdapter, Result};
use crate::plan::{NormalizedPlan, ObjectReference, OperatorNode, OperatorType, ParseWarningKind};
use planscope_core::SourceEngine;
use serde_json::Value;

/// Adapter for MySQL EXPLAIN FORMAT=JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAdapter;

impl PlanAdapter for MySqlAdapter {
    fn engine(&self) -> SourceEngine {
        SourceEngine::MySql
    }

    fn recognizes(&self, shape: &DocumentShape<'_>) -> bool {
        matches!(shape, DocumentShape::Json(value) if value.get("query_block").is_some())
    }

    fn parse(&self, document: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
        parse_json_explain(document, ctx)
    }
}

/// Parses MySQL EXPLAIN FORMAT=JSON output
pub fn parse_json_explain(json: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
    let value: Value = serde_json::from_str(json)?;

    // { "query_block": { "select_id": 1, ... } }
    let query_block = value.get("query_block").ok_or_else(|| {
        ParseError::MalformedDocument("missing query_block in EXPLAIN output".into())
    })?;

    let query_cost = query_block
        .get("cost_info")
        .and_then(|c| num_field(c, "query_cost"));
    if query_cost.is_none() {
        ctx.warn(
            ParseWarningKind::MissingCostData,
            None,
            "query_block carries no query_cost; cost percentages are unknown",
        );
    }

    let mut parser = BlockParser { query_cost, ctx };
    let root = parser.parse_query_block(query_block)?;

    let mut plan = NormalizedPlan::new(SourceEngine::MySql, root);
    plan.total_estimated_cost = query_cost;
    Ok(plan)
}

struct BlockParser<'c, 'd> {
    query_cost: Option<f64>,
    ctx: &'c mut ParseContext<'d>,
}

impl BlockParser<'_, '_> {
    /// Parses the operation a query_block (or an operation wrapper) contains
    ///
    /// A block holds one of:
    /// - "ordering_operation" - ORDER BY
    /// - "grouping_operation" - GROUP BY
    /// - "duplicates_removal" - DISTINCT
    /// - "nested_loop" - joined tables
    /// - "table" - a single table access
    /// - "union_result" - UNION members
    fn parse_query_block(&mut self, block: &Value) -> Result<OperatorNode> {
        if let Some(ordering) = block.get("ordering_operation") {
            return self.parse_ordering_operation(ordering);
        }
        if let Some(grouping) = block.get("grouping_operation") {
            return self.parse_grouping(grouping, "grouping_operation");
        }
        if let Some(distinct) = block.get("duplicates_removal") {
            return self.parse_grouping(distinct, "duplicates_removal");
        }
        if let Some(nested_loop) = block.get("nested_loop") {
            return self.parse_nested_loop(nested_loop);
        }
        if let Some(table) = block.get("table") {
            return self.parse_table_access(table);
        }
        if let Some(union_result) = block.get("union_result") {
            return self.parse_union_result(union_result);
        }

        // e.g. {"message": "No tables used"}
        let id = self.ctx.enter_node()?;
        let mut node = OperatorNode::new(OperatorType::Other);
        node.id = id;
        node.physical_name = block
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some("query_block".to_string()));
        Ok(node)
    }

    fn parse_ordering_operation(&mut self, ordering: &Value) -> Result<OperatorNode> {
        let id = self.ctx.enter_node()?;
        let filesort = bool_field(ordering, "using_filesort");

        let mut node = OperatorNode::new(OperatorType::Sort)
            .with_physical_name(if filesort { "filesort" } else { "ordering_operation" });
        node.id = id;
        node.estimated_cost_percent = ordering
            .get("cost_info")
            .and_then(|c| num_field(c, "sort_cost"))
            .and_then(|cost| self.percent_of_query(cost));
        super::sanitize_metrics(&mut node, self.ctx);

        node.children.push(self.parse_query_block(ordering)?);
        Ok(node)
    }

    /// GROUP BY and DISTINCT: hash-based when MySQL builds a temporary table
    fn parse_grouping(&mut self, grouping: &Value, name: &str) -> Result<OperatorNode> {
        let id = self.ctx.enter_node()?;
        let operator_type = if bool_field(grouping, "using_temporary_table") {
            OperatorType::HashAggregate
        } else {
            OperatorType::StreamAggregate
        };

        let mut node = OperatorNode::new(operator_type).with_physical_name(name);
        node.id = id;
        node.sort_keys = string_list(grouping, "group_by_columns");

        node.children.push(self.parse_query_block(grouping)?);
        Ok(node)
    }

    /// Builds a left-deep nested loop chain over the joined tables
    ///
    /// Join nodes are entered before the tables so ids stay in pre-order.
    fn parse_nested_loop(&mut self, nested_loop: &Value) -> Result<OperatorNode> {
        let entries = nested_loop.as_array().ok_or_else(|| {
            ParseError::MalformedDocument("nested_loop is not an array".into())
        })?;
        if entries.is_empty() {
            return Err(ParseError::MalformedDocument("empty nested_loop".into()));
        }

        let mut join_ids = Vec::with_capacity(entries.len() - 1);
        for _ in 1..entries.len() {
            join_ids.push(self.ctx.enter_node()?);
        }

        let mut tables = Vec::with_capacity(entries.len());
        for entry in entries {
            let table = match entry.get("table") {
                Some(table) => self.parse_table_access(table)?,
                None => {
                    let id = self.ctx.enter_node()?;
                    self.ctx
                        .unparseable(id, None, "nested_loop entry without a table")
                }
            };
            tables.push(table);
        }

        let mut tables = tables.into_iter();
        let Some(mut current) = tables.next() else {
            return Err(ParseError::MalformedDocument("empty nested_loop".into()));
        };

        // Innermost join was entered last
        for (table, id) in tables.zip(join_ids.into_iter().rev()) {
            let mut join = OperatorNode::new(OperatorType::NestedLoop)
                .with_physical_name("nested_loop")
                .with_child(current)
                .with_child(table);
            join.id = id;
            current = join;
        }

        Ok(current)
    }

    /// Parses a table access from MySQL JSON
    fn parse_table_access(&mut self, table: &Value) -> Result<OperatorNode> {
        let id = self.ctx.enter_node()?;

        let access_type = table
            .get("access_type")
            .and_then(Value::as_str)
            .unwrap_or("ALL");
        let operator_type = match access_type_to_operator(access_type) {
            Some(operator_type) => operator_type,
            None => {
                self.ctx.warn(
                    ParseWarningKind::UnknownOperator,
                    Some(id),
                    format!("unknown MySQL access type '{}'", access_type),
                );
                OperatorType::Other
            }
        };

        let mut node = OperatorNode::new(operator_type).with_physical_name(access_type);
        node.id = id;

        if let Some(name) = table.get("table_name").and_then(Value::as_str) {
            let mut object = ObjectReference::new(name);
            object.index = table
                .get("key")
                .and_then(Value::as_str)
                .filter(|key| *key != "null")
                .map(str::to_string);
            node.object = Some(object);
        }

        node.estimated_rows = num_field(table, "rows_examined_per_scan");

        if let Some(cost_info) = table.get("cost_info")
            && let Some(read_cost) = num_field(cost_info, "read_cost")
        {
            let eval_cost = num_field(cost_info, "eval_cost").unwrap_or(0.0);
            node.estimated_cost_percent = self.percent_of_query(read_cost + eval_cost);
        }

        // Index lookups: pair each used key part with the value it is compared to
        let key_parts = string_list(table, "used_key_parts");
        let refs = string_list(table, "ref");
        for (part, value) in key_parts.iter().zip(refs.iter()) {
            node.predicates.push(format!("{} = {}", part, value));
        }
        for key in ["index_condition", "attached_condition"] {
            if let Some(condition) = table.get(key).and_then(Value::as_str) {
                node.predicates.push(condition.to_string());
            }
        }

        node.output_columns = string_list(table, "used_columns");

        super::sanitize_metrics(&mut node, self.ctx);

        // Subqueries hang off the table access that evaluates them
        for key in ["attached_subqueries", "subqueries"] {
            if let Some(subqueries) = table.get(key).and_then(Value::as_array) {
                for subquery in subqueries {
                    let child = match subquery.get("query_block") {
                        Some(block) => self.parse_query_block(block)?,
                        None => {
                            let id = self.ctx.enter_node()?;
                            self.ctx.unparseable(id, None, "subquery without a query_block")
                        }
                    };
                    node.children.push(child);
                }
            }
        }

        Ok(node)
    }

    fn parse_union_result(&mut self, union: &Value) -> Result<OperatorNode> {
        let id = self.ctx.enter_node()?;
        let mut node = OperatorNode::new(OperatorType::Other).with_physical_name("union_result");
        node.id = id;

        if let Some(specs) = union.get("query_specifications").and_then(Value::as_array) {
            for spec in specs {
                let child = match spec.get("query_block") {
                    Some(block) => self.parse_query_block(block)?,
                    None => {
                        let id = self.ctx.enter_node()?;
                        self.ctx
                            .unparseable(id, None, "union member without a query_block")
                    }
                };
                node.children.push(child);
            }
        }

        Ok(node)
    }

    fn percent_of_query(&self, cost: f64) -> Option<f64> {
        match self.query_cost {
            Some(total) if total > 0.0 => Some(cost / total * 100.0),
            Some(_) => Some(0.0),
            None => None,
        }
    }
}

/// Maps MySQL access_type to the normalized operator
pub fn access_type_to_operator(access_type: &str) -> Option<OperatorType> {
    let operator_type = match access_type.to_lowercase().as_str() {
        "all" => OperatorType::TableScan,
        "index" => OperatorType::IndexScan,
        "range" | "ref" | "eq_ref" | "const" | "system" | "ref_or_null" | "fulltext"
        | "unique_subquery" | "index_subquery" | "index_merge" => OperatorType::IndexSeek,
        _ => return None,
    };
    Some(operator_type)
}

/// MySQL writes numbers as strings in cost_info ("1.00")
fn num_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
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
