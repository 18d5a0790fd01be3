//! Shared plan documents and collaborators for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use indoc::indoc;
use planscope_analyzer::{OperatorNode, OperatorType};
use planscope_core::{
    IndexMetadata, SchemaLookup, SchemaMetadataProvider, SchemaSnapshot, StaticSchemaProvider,
    TableMetadata, TableRef,
};
use std::sync::Arc;
use std::time::Duration;

/// PostgreSQL: one sequential scan carrying the whole plan cost, no filter
pub const SINGLE_SCAN_PG: &str = r#"[
    {
        "Plan": {
            "Node Type": "Seq Scan",
            "Relation Name": "users",
            "Startup Cost": 0.00,
            "Total Cost": 100.00,
            "Plan Rows": 5000,
            "Plan Width": 64
        }
    }
]"#;

/// PostgreSQL: a nested loop over two filtered scans of the same table
pub const SELF_JOIN_PG: &str = r#"[
    {
        "Plan": {
            "Node Type": "Nested Loop",
            "Join Type": "Inner",
            "Startup Cost": 0.00,
            "Total Cost": 100.00,
            "Plan Rows": 10,
            "Plans": [
                {
                    "Node Type": "Seq Scan",
                    "Parent Relationship": "Outer",
                    "Relation Name": "events",
                    "Alias": "e1",
                    "Startup Cost": 0.00,
                    "Total Cost": 40.00,
                    "Plan Rows": 5,
                    "Filter": "((a = 1) AND (b = 2))"
                },
                {
                    "Node Type": "Seq Scan",
                    "Parent Relationship": "Inner",
                    "Relation Name": "events",
                    "Alias": "e2",
                    "Startup Cost": 0.00,
                    "Total Cost": 45.00,
                    "Plan Rows": 2,
                    "Filter": "(a = 3)"
                }
            ]
        }
    }
]"#;

/// SQL Server: a spilling hash join over two cheap index seeks
pub const HASH_SPILL_SQLSERVER: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <ShowPlanXML xmlns="http://schemas.microsoft.com/sqlserver/2004/07/showplan" Version="1.539">
      <BatchSequence><Batch><Statements>
        <StmtSimple StatementText="SELECT c.Name, o.Total FROM dbo.Customers c JOIN dbo.Orders o ON o.CustomerId = c.Id" StatementSubTreeCost="10">
          <QueryPlan>
            <RelOp NodeId="0" PhysicalOp="Hash Match" LogicalOp="Inner Join" EstimateRows="20000" EstimatedTotalSubtreeCost="10">
              <Warnings>
                <HashSpillDetails GrantedMemoryKb="1024" UsedMemoryKb="1024" WritesToTempDb="64" ReadsFromTempDb="64" />
              </Warnings>
              <Hash>
                <RelOp NodeId="1" PhysicalOp="Index Seek" LogicalOp="Index Seek" EstimateRows="100" EstimatedTotalSubtreeCost="2">
                  <IndexScan Ordered="1">
                    <Object Schema="[dbo]" Table="[Customers]" Index="[IX_Customers_Region]" />
                  </IndexScan>
                </RelOp>
                <RelOp NodeId="2" PhysicalOp="Index Seek" LogicalOp="Index Seek" EstimateRows="20000" EstimatedTotalSubtreeCost="2">
                  <IndexScan Ordered="1">
                    <Object Schema="[dbo]" Table="[Orders]" Index="[IX_Orders_CustomerId]" />
                  </IndexScan>
                </RelOp>
              </Hash>
            </RelOp>
          </QueryPlan>
        </StmtSimple>
      </Statements></Batch></BatchSequence>
    </ShowPlanXML>
"#};

/// SQL Server: a key lookup driven by a 500-row index seek
pub const KEY_LOOKUP_SQLSERVER: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <ShowPlanXML xmlns="http://schemas.microsoft.com/sqlserver/2004/07/showplan" Version="1.539">
      <BatchSequence><Batch><Statements>
        <StmtSimple StatementText="SELECT o.Id, o.Total FROM dbo.Orders o WHERE o.CustomerId = 42" StatementSubTreeCost="1.25">
          <QueryPlan>
            <RelOp NodeId="0" PhysicalOp="Nested Loops" LogicalOp="Inner Join" EstimateRows="500" EstimateIO="0" EstimateCPU="0.00209" EstimatedTotalSubtreeCost="1.25">
              <OutputList>
                <ColumnReference Schema="[dbo]" Table="[Orders]" Alias="[o]" Column="Id" />
                <ColumnReference Schema="[dbo]" Table="[Orders]" Alias="[o]" Column="Total" />
              </OutputList>
              <NestedLoops Optimized="0">
                <RelOp NodeId="1" PhysicalOp="Index Seek" LogicalOp="Index Seek" EstimateRows="500" EstimateIO="0.003125" EstimateCPU="0.0007" EstimatedTotalSubtreeCost="0.25">
                  <OutputList>
                    <ColumnReference Schema="[dbo]" Table="[Orders]" Alias="[o]" Column="Id" />
                  </OutputList>
                  <IndexScan Ordered="1" ScanDirection="FORWARD">
                    <Object Schema="[dbo]" Table="[Orders]" Index="[IX_Orders_Status]" Alias="[o]" IndexKind="NonClustered" />
                    <SeekPredicates>
                      <SeekPredicateNew>
                        <SeekKeys>
                          <Prefix ScanType="EQ">
                            <RangeColumns>
                              <ColumnReference Schema="[dbo]" Table="[Orders]" Alias="[o]" Column="CustomerId" />
                            </RangeColumns>
                            <RangeExpressions>
                              <ScalarOperator ScalarString="(42)">
                                <Const ConstValue="(42)" />
                              </ScalarOperator>
                            </RangeExpressions>
                          </Prefix>
                        </SeekKeys>
                      </SeekPredicateNew>
                    </SeekPredicates>
                  </IndexScan>
                </RelOp>
                <RelOp NodeId="3" PhysicalOp="Clustered Index Seek" LogicalOp="Clustered Index Seek" EstimateRows="1" EstimateIO="0.003125" EstimateCPU="0.0001581" EstimatedTotalSubtreeCost="0.998">
                  <OutputList>
                    <ColumnReference Schema="[dbo]" Table="[Orders]" Alias="[o]" Column="Total" />
                  </OutputList>
                  <IndexScan Lookup="1" Ordered="1" ScanDirection="FORWARD">
                    <Object Schema="[dbo]" Table="[Orders]" Index="[PK_Orders]" Alias="[o]" IndexKind="Clustered" />
                    <SeekPredicates>
                      <SeekPredicateNew>
                        <SeekKeys>
                          <Prefix ScanType="EQ">
                            <RangeColumns>
                              <ColumnReference Schema="[dbo]" Table="[Orders]" Alias="[o]" Column="Id" />
                            </RangeColumns>
                            <RangeExpressions>
                              <ScalarOperator ScalarString="[dbo].[Orders].[Id] as [o].[Id]">
                                <Identifier>
                                  <ColumnReference Schema="[dbo]" Table="[Orders]" Alias="[o]" Column="Id" />
                                </Identifier>
                              </ScalarOperator>
                            </RangeExpressions>
                          </Prefix>
                        </SeekKeys>
                      </SeekPredicateNew>
                    </SeekPredicates>
                  </IndexScan>
                </RelOp>
              </NestedLoops>
            </RelOp>
          </QueryPlan>
        </StmtSimple>
      </Statements></Batch></BatchSequence>
    </ShowPlanXML>
"#};

/// SQL Server: one operator has no PhysicalOp and cannot be interpreted
pub const DAMAGED_SQLSERVER: &str = indoc! {r#"
    <ShowPlanXML>
      <BatchSequence><Batch><Statements>
        <StmtSimple StatementSubTreeCost="2">
          <QueryPlan>
            <RelOp PhysicalOp="Hash Match" LogicalOp="Inner Join" EstimatedTotalSubtreeCost="2">
              <Hash>
                <RelOp EstimateRows="10" EstimatedTotalSubtreeCost="1">
                  <RelOp PhysicalOp="Table Scan" LogicalOp="Table Scan" EstimatedTotalSubtreeCost="0.5">
                    <TableScan><Object Table="[a]" /></TableScan>
                  </RelOp>
                </RelOp>
                <RelOp PhysicalOp="Table Scan" LogicalOp="Table Scan" EstimatedTotalSubtreeCost="0.5">
                  <TableScan><Object Table="[b]" /></TableScan>
                </RelOp>
              </Hash>
            </RelOp>
          </QueryPlan>
        </StmtSimple>
      </Statements></Batch></BatchSequence>
    </ShowPlanXML>
"#};

/// MySQL: a filesort over a three-table join
pub const JOIN_SORT_MYSQL: &str = r#"{
  "query_block": {
    "select_id": 1,
    "cost_info": {"query_cost": "200.00"},
    "ordering_operation": {
      "using_filesort": true,
      "cost_info": {"sort_cost": "60.00"},
      "nested_loop": [
        {"table": {"table_name": "a", "access_type": "ALL", "rows_examined_per_scan": 1000,
                   "cost_info": {"read_cost": "50.00", "eval_cost": "10.00"},
                   "attached_condition": "(`shop`.`a`.`kind` = 'x')"}},
        {"table": {"table_name": "b", "access_type": "ref", "key": "idx_a_id",
                   "ref": ["shop.a.id"], "rows_examined_per_scan": 3,
                   "cost_info": {"read_cost": "20.00", "eval_cost": "5.00"}}},
        {"table": {"table_name": "c", "access_type": "eq_ref", "key": "PRIMARY",
                   "ref": ["shop.b.c_id"], "rows_examined_per_scan": 1,
                   "cost_info": {"read_cost": "40.00", "eval_cost": "15.00"}}}
      ]
    }
  }
}"#;

/// Every document fixture
pub fn all_documents() -> Vec<&'static str> {
    vec![
        SINGLE_SCAN_PG,
        SELF_JOIN_PG,
        HASH_SPILL_SQLSERVER,
        KEY_LOOKUP_SQLSERVER,
        DAMAGED_SQLSERVER,
        JOIN_SORT_MYSQL,
    ]
}

/// Metadata for the tables the fixtures touch
pub fn schema_snapshot() -> SchemaSnapshot {
    let columns = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    SchemaSnapshot::new(vec![
        TableMetadata::new(
            TableRef::new("Orders").with_schema("dbo"),
            columns(&["Id", "CustomerId", "Status", "Total"]),
        )
        .with_index(IndexMetadata::new("PK_Orders", columns(&["Id"])).primary())
        .with_index(IndexMetadata::new("IX_Orders_Status", columns(&["Status"]))),
        TableMetadata::new(TableRef::new("events"), columns(&["id", "a", "b", "c"])),
        TableMetadata::new(TableRef::new("users"), columns(&["id", "email"])),
    ])
}

pub fn schema_provider() -> Arc<StaticSchemaProvider> {
    Arc::new(StaticSchemaProvider::new(schema_snapshot()))
}

/// Schema provider that answers only after a delay on the tokio clock
pub struct DelayedSchemaProvider {
    pub delay: Duration,
}

#[async_trait]
impl SchemaMetadataProvider for DelayedSchemaProvider {
    async fn lookup(&self, tables: &[TableRef]) -> SchemaLookup {
        tokio::time::sleep(self.delay).await;
        schema_provider().lookup(tables).await
    }
}

/// Pre-order `(operator type, predicates, child count)` triples
pub fn shape(root: &OperatorNode) -> Vec<(OperatorType, Vec<String>, usize)> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        out.push((node.operator_type, node.predicates.clone(), node.children.len()));
        stack.extend(node.children.iter().rev());
    }
    out
}
