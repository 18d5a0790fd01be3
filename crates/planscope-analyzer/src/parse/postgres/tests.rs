//! Tests for the PostgreSQL EXPLAIN parser

use super::*;
use crate::cancel::Deadline;
use indoc::indoc;
use pretty_assertions::assert_eq;

fn parse_postgres_explain(output: &str) -> Result<NormalizedPlan> {
    let deadline = Deadline::unbounded();
    let mut ctx = ParseContext::new(&deadline);
    let plan = PostgresAdapter.parse(output, &mut ctx)?;
    Ok(ctx.finish(plan))
}

// ============================================================================
// JSON Format Tests
// ============================================================================

#[test]
fn test_parse_simple_seq_scan_json() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Seq Scan",
                "Relation Name": "users",
                "Schema": "public",
                "Alias": "users",
                "Startup Cost": 0.00,
                "Total Cost": 10.50,
                "Plan Rows": 100,
                "Plan Width": 36
            }
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.engine, SourceEngine::Postgres);
    assert_eq!(plan.root.operator_type, OperatorType::TableScan);
    assert_eq!(plan.root.physical_name.as_deref(), Some("Seq Scan"));
    assert_eq!(
        plan.root.object,
        Some(ObjectReference::new("users").with_schema("public"))
    );
    assert_eq!(plan.root.subtree_cost, Some(10.5));
    assert_eq!(plan.root.estimated_cost_percent, Some(100.0));
    assert_eq!(plan.root.estimated_rows, Some(100.0));
    assert_eq!(plan.root.actual_rows, None);
    assert_eq!(plan.total_estimated_cost, Some(10.5));
    assert!(!plan.is_actual);
}

#[test]
fn test_parse_index_scan_json() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Index Scan",
                "Relation Name": "orders",
                "Index Name": "orders_pkey",
                "Index Cond": "(id = 42)",
                "Startup Cost": 0.42,
                "Total Cost": 8.44,
                "Plan Rows": 1,
                "Plan Width": 48
            }
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::IndexSeek);
    assert_eq!(
        plan.root.object.as_ref().and_then(|o| o.index.as_deref()),
        Some("orders_pkey")
    );
    assert_eq!(plan.root.predicates, vec!["(id = 42)".to_string()]);
}

#[test]
fn test_index_scan_without_condition_is_full_scan() {
    let json = r#"{"Plan": {"Node Type": "Index Only Scan", "Relation Name": "t", "Index Name": "t_idx", "Total Cost": 5.0}}"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::IndexScan);
}

#[test]
fn test_parse_nested_plan_nodes_json() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Hash Join",
                "Join Type": "Inner",
                "Hash Cond": "(o.user_id = u.id)",
                "Startup Cost": 10.00,
                "Total Cost": 100.00,
                "Plan Rows": 500,
                "Plan Width": 72,
                "Plans": [
                    {
                        "Node Type": "Seq Scan",
                        "Parent Relationship": "Outer",
                        "Relation Name": "orders",
                        "Alias": "o",
                        "Startup Cost": 0.00,
                        "Total Cost": 50.00,
                        "Plan Rows": 1000,
                        "Plan Width": 36
                    },
                    {
                        "Node Type": "Hash",
                        "Parent Relationship": "Inner",
                        "Startup Cost": 5.00,
                        "Total Cost": 10.00,
                        "Plan Rows": 100,
                        "Plan Width": 36,
                        "Plans": [
                            {
                                "Node Type": "Seq Scan",
                                "Relation Name": "users",
                                "Alias": "u",
                                "Startup Cost": 0.00,
                                "Total Cost": 5.00,
                                "Plan Rows": 100,
                                "Plan Width": 36
                            }
                        ]
                    }
                ]
            }
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::HashMatch);
    assert_eq!(plan.root.predicates, vec!["(o.user_id = u.id)".to_string()]);
    assert_eq!(plan.node_count(), 4);

    let percents: Vec<_> = plan
        .iter_nodes()
        .map(|n| n.estimated_cost_percent)
        .collect();
    assert_eq!(
        percents,
        vec![Some(40.0), Some(50.0), Some(5.0), Some(5.0)]
    );
    assert_eq!(plan.tables().len(), 2);
}

#[test]
fn test_parse_explain_analyze_json_scales_by_loops() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Index Scan",
                "Relation Name": "line_items",
                "Index Cond": "(order_id = o.id)",
                "Total Cost": 10.00,
                "Plan Rows": 10,
                "Actual Rows": 95,
                "Actual Loops": 3,
                "Shared Hit Blocks": 40,
                "Shared Read Blocks": 2
            },
            "Planning Time": 0.156,
            "Execution Time": 0.134
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert!(plan.is_actual);
    assert_eq!(plan.root.estimated_rows, Some(30.0));
    assert_eq!(plan.root.actual_rows, Some(285.0));
    let io = plan.root.io_stats.expect("io stats");
    assert_eq!(io.logical_reads, Some(42));
    assert_eq!(io.physical_reads, Some(2));
}

#[test]
fn test_parse_external_sort_json() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Sort",
                "Sort Key": ["created_at DESC", "id"],
                "Sort Method": "external merge",
                "Sort Space Used": 2048,
                "Sort Space Type": "Disk",
                "Startup Cost": 10.00,
                "Total Cost": 15.00,
                "Plan Rows": 100,
                "Plans": [
                    {
                        "Node Type": "Seq Scan",
                        "Relation Name": "events",
                        "Total Cost": 10.00,
                        "Plan Rows": 100
                    }
                ]
            }
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::Sort);
    assert_eq!(
        plan.root.sort_keys,
        vec!["created_at DESC".to_string(), "id".to_string()]
    );
    assert_eq!(
        plan.root.spill_markers,
        vec![
            SpillMarker::ExternalSort {
                method: "external merge".into()
            },
            SpillMarker::DiskSortSpace,
        ]
    );
    assert_eq!(plan.root.memory_grant_kb, Some(2048));
}

#[test]
fn test_in_memory_sort_has_no_spill() {
    let json = r#"{"Plan": {"Node Type": "Sort", "Sort Method": "quicksort", "Sort Space Used": 64, "Sort Space Type": "Memory", "Total Cost": 1.0}}"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert!(!plan.root.has_spill_marker());
    assert_eq!(plan.root.memory_grant_kb, Some(64));
}

#[test]
fn test_parse_hashed_aggregate_json() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Aggregate",
                "Strategy": "Hashed",
                "Group Key": ["status", "category"],
                "Hash Batches": 4,
                "Peak Memory Usage": 4145,
                "Startup Cost": 20.00,
                "Total Cost": 25.00,
                "Plan Rows": 10,
                "Plans": [
                    {
                        "Node Type": "Seq Scan",
                        "Relation Name": "items",
                        "Total Cost": 20.00,
                        "Plan Rows": 1000
                    }
                ]
            }
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::HashAggregate);
    assert_eq!(
        plan.root.sort_keys,
        vec!["status".to_string(), "category".to_string()]
    );
    assert_eq!(
        plan.root.spill_markers,
        vec![SpillMarker::HashBatches { batches: 4 }]
    );
    assert_eq!(plan.root.memory_grant_kb, Some(4145));
}

#[test]
fn test_plain_aggregate_is_stream_aggregate() {
    let json = r#"{"Plan": {"Node Type": "Aggregate", "Strategy": "Plain", "Total Cost": 1.0}}"#;
    let plan = parse_postgres_explain(json).expect("parse failed");
    assert_eq!(plan.root.operator_type, OperatorType::StreamAggregate);
}

#[test]
fn test_predicates_keep_key_order() {
    let json = r#"{"Plan": {
        "Node Type": "Bitmap Heap Scan",
        "Relation Name": "orders",
        "Recheck Cond": "(status = 'open'::text)",
        "Filter": "(lower(email) = 'a@b.c'::text)",
        "Total Cost": 20.0
    }}"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::IndexScan);
    assert_eq!(
        plan.root.predicates,
        vec![
            "(lower(email) = 'a@b.c'::text)".to_string(),
            "(status = 'open'::text)".to_string(),
        ]
    );
}

#[test]
fn test_parse_output_columns_json() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Seq Scan",
                "Relation Name": "users",
                "Output": ["id", "name", "email"],
                "Total Cost": 10.00
            }
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(
        plan.root.output_columns,
        vec!["id".to_string(), "name".to_string(), "email".to_string()]
    );
}

#[test]
fn test_unknown_node_type_is_other_with_warning() {
    let json = r#"{"Plan": {"Node Type": "Quantum Scan", "Total Cost": 1.0}}"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::Other);
    assert_eq!(plan.warnings.len(), 1);
    assert_eq!(plan.warnings[0].kind, ParseWarningKind::UnknownOperator);
}

#[test]
fn test_child_without_node_type_becomes_placeholder() {
    let json = r#"{"Plan": {
        "Node Type": "Append",
        "Total Cost": 10.0,
        "Plans": [
            {"Relation Name": "broken", "Total Cost": 2.0},
            {"Node Type": "Seq Scan", "Relation Name": "ok", "Total Cost": 3.0}
        ]
    }}"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.node_count(), 3);
    assert_eq!(plan.root.children[0].operator_type, OperatorType::Other);
    assert_eq!(plan.root.children[0].subtree_cost, None);
    assert_eq!(plan.root.children[1].operator_type, OperatorType::TableScan);
    assert_eq!(plan.warnings.len(), 1);
    assert_eq!(plan.warnings[0].kind, ParseWarningKind::UnparseableSubtree);
}

#[test]
fn test_placeholder_keeps_readable_children() {
    let json = r#"{"Plan": {
        "Total Cost": 10.0,
        "Plans": [
            {"Node Type": "Seq Scan", "Relation Name": "a", "Total Cost": 4.0},
            {"Node Type": "Seq Scan", "Relation Name": "b", "Total Cost": 5.0}
        ]
    }}"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.node_count(), 3);
    assert_eq!(plan.root.operator_type, OperatorType::Other);
    let types: Vec<_> = plan.root.children.iter().map(|c| c.operator_type).collect();
    assert_eq!(types, vec![OperatorType::TableScan, OperatorType::TableScan]);
}

#[test]
fn test_missing_costs_leave_percent_unknown() {
    let json = r#"{"Plan": {"Node Type": "Seq Scan", "Relation Name": "t"}}"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.estimated_cost_percent, None);
    assert_eq!(plan.warnings[0].kind, ParseWarningKind::MissingCostData);
}

// ============================================================================
// Text Format Tests
// ============================================================================

#[test]
fn test_parse_simple_seq_scan_text() {
    let text = "Seq Scan on users  (cost=0.00..10.50 rows=100 width=36)";

    let plan = parse_postgres_explain(text).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::TableScan);
    assert_eq!(plan.root.object, Some(ObjectReference::new("users")));
    assert_eq!(plan.root.subtree_cost, Some(10.5));
    assert_eq!(plan.root.estimated_rows, Some(100.0));
}

#[test]
fn test_parse_index_scan_text() {
    let text = indoc! {"
        Index Scan using users_pkey on users  (cost=0.42..8.44 rows=1 width=36)
          Index Cond: (id = 42)
    "};

    let plan = parse_postgres_explain(text).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::IndexSeek);
    assert_eq!(
        plan.root.object,
        Some(ObjectReference::new("users").with_index("users_pkey"))
    );
    assert_eq!(plan.root.predicates, vec!["(id = 42)".to_string()]);
}

#[test]
fn test_parse_nested_text() {
    let text = r#"Hash Join  (cost=10.00..100.00 rows=500 width=72)
   Hash Cond: (o.user_id = u.id)
   ->  Seq Scan on orders o  (cost=0.00..50.00 rows=1000 width=36)
   ->  Hash  (cost=5.00..10.00 rows=100 width=36)
         Buckets: 1024  Batches: 4  Memory Usage: 40kB
         ->  Seq Scan on users u  (cost=0.00..5.00 rows=100 width=36)"#;

    let plan = parse_postgres_explain(text).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::HashMatch);
    assert_eq!(plan.root.predicates, vec!["(o.user_id = u.id)".to_string()]);
    assert_eq!(plan.root.children.len(), 2);
    assert_eq!(plan.root.children[0].operator_type, OperatorType::TableScan);

    let hash = &plan.root.children[1];
    assert_eq!(hash.operator_type, OperatorType::HashMatch);
    assert_eq!(hash.children.len(), 1);
    assert_eq!(hash.spill_markers, vec![SpillMarker::HashBatches { batches: 4 }]);
    assert_eq!(hash.memory_grant_kb, Some(40));

    let ids: Vec<_> = plan.iter_nodes().map(|n| n.id.0).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(plan.root.estimated_cost_percent, Some(40.0));
}

#[test]
fn test_parse_analyze_text_with_properties() {
    let text = indoc! {"
                                QUERY PLAN
        ----------------------------------------------------------------
         Sort  (cost=100.00..102.50 rows=1000 width=36) (actual time=50.1..60.2 rows=1000 loops=1)
           Sort Key: created_at DESC, id
           Sort Method: external merge  Disk: 2048kB
           ->  Seq Scan on events  (cost=0.00..50.00 rows=1000 width=36) (actual time=0.01..10.0 rows=4000 loops=1)
                 Filter: (lower(kind) = 'click'::text)
                 Rows Removed by Filter: 10
                 Buffers: shared hit=12 read=3
         Planning Time: 0.156 ms
         Execution Time: 61.089 ms
        (9 rows)
    "};

    let plan = parse_postgres_explain(text).expect("parse failed");

    assert!(plan.is_actual);
    assert_eq!(plan.node_count(), 2);

    let sort = &plan.root;
    assert_eq!(sort.operator_type, OperatorType::Sort);
    assert_eq!(
        sort.sort_keys,
        vec!["created_at DESC".to_string(), "id".to_string()]
    );
    assert_eq!(
        sort.spill_markers,
        vec![
            SpillMarker::ExternalSort {
                method: "external merge".into()
            },
            SpillMarker::DiskSortSpace,
        ]
    );
    assert_eq!(sort.memory_grant_kb, Some(2048));
    assert_eq!(sort.actual_rows, Some(1000.0));

    let scan = &sort.children[0];
    assert_eq!(
        scan.predicates,
        vec!["(lower(kind) = 'click'::text)".to_string()]
    );
    assert_eq!(scan.actual_rows, Some(4000.0));
    assert_eq!(scan.estimated_rows, Some(1000.0));
    let io = scan.io_stats.expect("io stats");
    assert_eq!(io.logical_reads, Some(15));
    assert_eq!(io.physical_reads, Some(3));
}

#[test]
fn test_text_join_variants() {
    assert_eq!(text_operator("Hash Left Join"), Some(OperatorType::HashMatch));
    assert_eq!(text_operator("Merge Anti Join"), Some(OperatorType::MergeJoin));
    assert_eq!(text_operator("Nested Loop Left Join"), Some(OperatorType::NestedLoop));
    assert_eq!(text_operator("HashAggregate"), Some(OperatorType::HashAggregate));
    assert_eq!(text_operator("GroupAggregate"), Some(OperatorType::StreamAggregate));
    assert_eq!(text_operator("Merge Append"), Some(OperatorType::Other));
}

#[test]
fn test_parallel_prefix_is_stripped() {
    let (name, relation, index) = split_type_and_relation("Parallel Seq Scan on big_table b");
    assert_eq!(name, "Seq Scan");
    assert_eq!(relation.as_deref(), Some("big_table"));
    assert_eq!(index, None);
}

// ============================================================================
// Error Handling Tests
// ============================================================================

#[test]
fn test_parse_invalid_json() {
    let invalid = "{ not valid json }}}";
    let result = parse_postgres_explain(invalid);
    assert!(matches!(result, Err(ParseError::MalformedDocument(_))));
}

#[test]
fn test_parse_missing_plan() {
    let json = r#"[{"SomethingElse": {}}]"#;
    let result = parse_postgres_explain(json);
    assert_eq!(
        result.unwrap_err(),
        ParseError::MalformedDocument("missing Plan object in EXPLAIN output".into())
    );
}

#[test]
fn test_parse_empty_text() {
    let result = parse_postgres_explain("");
    assert!(matches!(result, Err(ParseError::MalformedDocument(_))));
}

// ============================================================================
// Helper Function Tests
// ============================================================================

#[test]
fn test_extract_between() {
    assert_eq!(extract_between("cost=10..20", "cost=", ".."), Some("10"));
    assert_eq!(
        extract_between("rows=100 width=36", "rows=", " width="),
        Some("100")
    );
    assert_eq!(extract_between("no match here", "foo", "bar"), None);
}

#[test]
fn test_count_indent() {
    assert_eq!(count_indent("no indent"), 0);
    assert_eq!(count_indent("   three spaces"), 3);
    assert_eq!(count_indent("      six spaces"), 6);
}

#[test]
fn test_split_list_respects_parentheses() {
    assert_eq!(
        split_list("lower(a, b), c DESC"),
        vec!["lower(a, b)".to_string(), "c DESC".to_string()]
    );
}

// ============================================================================
// Integration-style Tests
// ============================================================================

#[test]
fn test_parse_complex_query_plan_json() {
    let json = r#"[
        {
            "Plan": {
                "Node Type": "Limit",
                "Startup Cost": 100.00,
                "Total Cost": 110.00,
                "Plan Rows": 10,
                "Plans": [
                    {
                        "Node Type": "Sort",
                        "Sort Key": ["total DESC"],
                        "Startup Cost": 100.00,
                        "Total Cost": 102.50,
                        "Plan Rows": 100,
                        "Plans": [
                            {
                                "Node Type": "HashAggregate",
                                "Group Key": ["u.id"],
                                "Startup Cost": 80.00,
                                "Total Cost": 90.00,
                                "Plan Rows": 100,
                                "Plans": [
                                    {
                                        "Node Type": "Hash Join",
                                        "Join Type": "Inner",
                                        "Hash Cond": "(o.user_id = u.id)",
                                        "Startup Cost": 10.00,
                                        "Total Cost": 70.00,
                                        "Plan Rows": 1000,
                                        "Plans": [
                                            {
                                                "Node Type": "Seq Scan",
                                                "Relation Name": "orders",
                                                "Alias": "o",
                                                "Total Cost": 50.00,
                                                "Plan Rows": 1000
                                            },
                                            {
                                                "Node Type": "Hash",
                                                "Total Cost": 10.00,
                                                "Plan Rows": 100,
                                                "Plans": [
                                                    {
                                                        "Node Type": "Seq Scan",
                                                        "Relation Name": "users",
                                                        "Alias": "u",
                                                        "Total Cost": 5.00,
                                                        "Plan Rows": 100
                                                    }
                                                ]
                                            }
                                        ]
                                    }
                                ]
                            }
                        ]
                    }
                ]
            },
            "Planning Time": 1.234,
            "Execution Time": 15.678
        }
    ]"#;

    let plan = parse_postgres_explain(json).expect("parse failed");

    assert_eq!(plan.root.operator_type, OperatorType::Other);
    assert_eq!(plan.root.node_count(), 7);
    assert_eq!(plan.root.depth(), 6);
    assert_eq!(plan.find_nodes_by_type(OperatorType::TableScan).len(), 2);
    assert_eq!(plan.find_nodes_by_type(OperatorType::HashMatch).len(), 2);
    assert_eq!(plan.find_nodes_by_type(OperatorType::HashAggregate).len(), 1);
    assert!(plan.warnings.is_empty());
}
