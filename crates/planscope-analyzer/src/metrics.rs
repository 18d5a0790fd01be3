//! Metric Extractor
//!
//! Derives per-node metrics (row estimation error, spill flag) and the
//! plan-wide `PlanStatistics` from a parsed plan. The input plan is never
//! modified; `annotate` returns an annotated copy.

use crate::cancel::{Deadline, Interrupted};
use crate::plan::{NodeMetrics, NormalizedPlan, OperatorNode, PlanStatistics};

/// Relative row estimation error: `|actual - estimated| / max(estimated, 1)`
///
/// Returns `None` unless both row counts are known.
pub fn row_estimation_error(node: &OperatorNode) -> Option<f64> {
    let estimated = node.estimated_rows?;
    let actual = node.actual_rows?;
    Some((actual - estimated).abs() / estimated.max(1.0))
}

/// Returns an annotated copy of `plan`
///
/// Every node gets `metrics`, and the plan gets `statistics`. The deadline is
/// checked before each node; on expiry the partially annotated copy is
/// dropped and `Interrupted` is returned.
pub fn annotate(plan: &NormalizedPlan, deadline: &Deadline) -> Result<NormalizedPlan, Interrupted> {
    let mut annotated = plan.clone();
    let mut stats = PlanStatistics {
        total_estimated_cost: plan.total_estimated_cost.or(plan.root.subtree_cost),
        ..Default::default()
    };

    let mut stack: Vec<(&mut OperatorNode, usize)> = vec![(&mut annotated.root, 1)];
    while let Some((node, depth)) = stack.pop() {
        deadline.check()?;

        let metrics = NodeMetrics {
            row_estimation_error: row_estimation_error(node),
            spilled: node.has_spill_marker(),
        };
        accumulate(&mut stats, node, &metrics, depth);
        node.metrics = Some(metrics);

        stack.extend(node.children.iter_mut().rev().map(|c| (c, depth + 1)));
    }

    tracing::debug!(
        nodes = stats.node_count,
        depth = stats.depth,
        has_spill = stats.has_spill,
        "Annotated plan metrics"
    );
    annotated.statistics = Some(stats);
    Ok(annotated)
}

fn accumulate(stats: &mut PlanStatistics, node: &OperatorNode, metrics: &NodeMetrics, depth: usize) {
    stats.node_count += 1;
    stats.depth = stats.depth.max(depth);
    *stats.operator_counts.entry(node.operator_type).or_insert(0) += 1;
    stats.has_spill |= metrics.spilled;

    // Strict comparison keeps the first node in pre-order on ties
    if let Some(pct) = node.estimated_cost_percent
        && stats.max_cost_percent.is_none_or(|max| pct > max)
    {
        stats.max_cost_percent = Some(pct);
        stats.max_cost_node = Some(node.id);
    }

    if let Some(err) = metrics.row_estimation_error
        && stats.max_row_estimation_error.is_none_or(|max| err > max)
    {
        stats.max_row_estimation_error = Some(err);
    }
}
