//! Canonical JSON form of a normalized plan
//!
//! `render_native` writes a `NormalizedPlan` as JSON and `NativeAdapter`
//! reads it back. Derived metrics and node ids are not carried: ids are
//! re-assigned in pre-order on the way in.

use super::{DocumentShape, ParseContext, ParseError, PlanAdapter, Result};
use crate::plan::{
    CpuStats, IoStats, NormalizedPlan, ObjectReference, OperatorNode, OperatorType, SpillMarker,
};
use planscope_core::SourceEngine;
use serde::Deserialize;
use serde_json::{Value, json};

const FORMAT_NAME: &str = "planscope";
const FORMAT_VERSION: u64 = 1;

/// Adapter for planscope's own JSON format
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAdapter;

impl PlanAdapter for NativeAdapter {
    fn engine(&self) -> SourceEngine {
        SourceEngine::Native
    }

    fn recognizes(&self, shape: &DocumentShape<'_>) -> bool {
        let DocumentShape::Json(value) = shape else {
            return false;
        };
        value.get("root").is_some_and(Value::is_object)
            && (value.get("format").and_then(Value::as_str) == Some(FORMAT_NAME)
                || value.get("engine").is_some())
    }

    fn parse(&self, document: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
        parse_native(document, ctx)
    }
}

/// Renders a plan in the canonical JSON format
pub fn render_native(plan: &NormalizedPlan) -> String {
    let document = json!({
        "format": FORMAT_NAME,
        "version": FORMAT_VERSION,
        "engine": plan.engine,
        "is_actual": plan.is_actual,
        "total_estimated_cost": plan.total_estimated_cost,
        "statement": plan.statement,
        "root": plan.root,
    });
    format!("{:#}", document)
}

/// Node fields as they appear in the canonical format
#[derive(Debug, Deserialize)]
struct NativeNode {
    operator_type: OperatorType,
    #[serde(default)]
    physical_name: Option<String>,
    #[serde(default)]
    estimated_rows: Option<f64>,
    #[serde(default)]
    actual_rows: Option<f64>,
    #[serde(default)]
    estimated_cost_percent: Option<f64>,
    #[serde(default)]
    subtree_cost: Option<f64>,
    #[serde(default)]
    io_stats: Option<IoStats>,
    #[serde(default)]
    cpu_stats: Option<CpuStats>,
    #[serde(default)]
    memory_grant_kb: Option<u64>,
    #[serde(default)]
    predicates: Vec<String>,
    #[serde(default)]
    sort_keys: Vec<String>,
    #[serde(default)]
    output_columns: Vec<String>,
    #[serde(default)]
    object: Option<ObjectReference>,
    #[serde(default)]
    spill_markers: Vec<SpillMarker>,
}

fn parse_native(document: &str, ctx: &mut ParseContext<'_>) -> Result<NormalizedPlan> {
    let mut value: Value = serde_json::from_str(document)?;

    if let Some(version) = value.get("version").and_then(Value::as_u64)
        && version > FORMAT_VERSION
    {
        return Err(ParseError::MalformedDocument(format!(
            "unsupported planscope format version {}",
            version
        )));
    }

    let engine = match value.get("engine") {
        Some(engine) => serde_json::from_value(engine.clone()).map_err(|e| {
            ParseError::MalformedDocument(format!("invalid engine field: {}", e))
        })?,
        None => SourceEngine::Native,
    };
    let is_actual = value
        .get("is_actual")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let total_cost = value.get("total_estimated_cost").and_then(Value::as_f64);
    let statement = value
        .get("statement")
        .and_then(Value::as_str)
        .map(str::to_string);

    let root_value = value
        .as_object_mut()
        .and_then(|obj| obj.remove("root"))
        .ok_or_else(|| ParseError::MalformedDocument("missing root node".into()))?;
    let root = parse_node(root_value, ctx)?;

    let mut plan = NormalizedPlan::new(engine, root).with_actuals(is_actual);
    if total_cost.is_some() {
        plan.total_estimated_cost = total_cost;
    }
    plan.statement = statement;
    Ok(plan)
}

fn parse_node(mut value: Value, ctx: &mut ParseContext<'_>) -> Result<OperatorNode> {
    let id = ctx.enter_node()?;

    let Some(object) = value.as_object_mut() else {
        return Ok(ctx.unparseable(id, None, "node is not a JSON object"));
    };
    let children = object.remove("children");
    let physical_name = object
        .get("physical_name")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut node = match serde_json::from_value::<NativeNode>(value) {
        Ok(fields) => {
            let mut node = OperatorNode::new(fields.operator_type);
            node.id = id;
            node.physical_name = fields.physical_name;
            node.estimated_rows = fields.estimated_rows;
            node.actual_rows = fields.actual_rows;
            node.estimated_cost_percent = fields.estimated_cost_percent;
            node.subtree_cost = fields.subtree_cost;
            node.io_stats = fields.io_stats;
            node.cpu_stats = fields.cpu_stats;
            node.memory_grant_kb = fields.memory_grant_kb;
            node.predicates = fields.predicates;
            node.sort_keys = fields.sort_keys;
            node.output_columns = fields.output_columns;
            node.object = fields.object;
            node.spill_markers = fields.spill_markers;
            super::sanitize_metrics(&mut node, ctx);
            node
        }
        // Readable children still hang off the placeholder
        Err(e) => ctx.unparseable(id, physical_name, format!("invalid node: {}", e)),
    };

    match children {
        None | Some(Value::Null) => {}
        Some(Value::Array(children)) => {
            for child in children {
                node.children.push(parse_node(child, ctx)?);
            }
        }
        Some(_) => {
            let child_id = ctx.enter_node()?;
            node.children
                .push(ctx.unparseable(child_id, None, "children is not an array"));
        }
    }

    Ok(node)
}
