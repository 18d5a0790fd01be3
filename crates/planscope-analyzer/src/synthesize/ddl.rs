//! CREATE INDEX text for each engine

use planscope_core::{IndexMetadata, SourceEngine, TableRef};

/// Longest identifier PostgreSQL keeps without truncating
const MAX_INDEX_NAME_LEN: usize = 63;

/// Suggested name for a new index on `columns`
pub fn index_name(engine: SourceEngine, table: &TableRef, columns: &[String]) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    };

    let mut name = match engine {
        SourceEngine::SqlServer => format!(
            "IX_{}_{}",
            sanitize(&table.table),
            columns.iter().map(|c| sanitize(c)).collect::<Vec<_>>().join("_")
        ),
        _ => format!(
            "ix_{}_{}",
            sanitize(&table.table),
            columns.iter().map(|c| sanitize(c)).collect::<Vec<_>>().join("_")
        )
        .to_lowercase(),
    };
    name.truncate(MAX_INDEX_NAME_LEN);
    name
}

fn qualified_table(engine: SourceEngine, table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!(
            "{}.{}",
            engine.quote_identifier(schema),
            engine.quote_identifier(&table.table)
        ),
        None => engine.quote_identifier(&table.table),
    }
}

fn column_list(engine: SourceEngine, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| engine.quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn index_body(
    engine: SourceEngine,
    name: &str,
    table: &TableRef,
    columns: &[String],
    include: &[String],
) -> String {
    let kind = match engine {
        SourceEngine::SqlServer => "CREATE NONCLUSTERED INDEX",
        _ => "CREATE INDEX",
    };
    let mut sql = format!(
        "{} {} ON {} ({})",
        kind,
        engine.quote_identifier(name),
        qualified_table(engine, table),
        column_list(engine, columns)
    );
    if !include.is_empty() && engine.supports_included_columns() {
        sql.push_str(&format!(" INCLUDE ({})", column_list(engine, include)));
    }
    sql
}

/// `CREATE INDEX` statement for a new index
pub fn create_index(
    engine: SourceEngine,
    table: &TableRef,
    columns: &[String],
    include: &[String],
) -> String {
    let name = index_name(engine, table, columns);
    format!("{};", index_body(engine, &name, table, columns, include))
}

/// Statement(s) that rebuild `existing` with a wider definition, keeping its name
pub fn widen_index(
    engine: SourceEngine,
    table: &TableRef,
    existing: &IndexMetadata,
    columns: &[String],
    include: &[String],
) -> String {
    match engine {
        SourceEngine::SqlServer => format!(
            "{} WITH (DROP_EXISTING = ON);",
            index_body(engine, &existing.name, table, columns, include)
        ),
        SourceEngine::MySql => format!(
            "ALTER TABLE {} DROP INDEX {}, ADD INDEX {} ({});",
            qualified_table(engine, table),
            engine.quote_identifier(&existing.name),
            engine.quote_identifier(&existing.name),
            column_list(engine, columns)
        ),
        SourceEngine::Postgres | SourceEngine::Native => {
            let dropped = match &table.schema {
                Some(schema) => format!(
                    "{}.{}",
                    engine.quote_identifier(schema),
                    engine.quote_identifier(&existing.name)
                ),
                None => engine.quote_identifier(&existing.name),
            };
            format!(
                "DROP INDEX {};\n{};",
                dropped,
                index_body(engine, &existing.name, table, columns, include)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sql_server_create_with_include() {
        let table = TableRef::new("Orders").with_schema("dbo");
        assert_eq!(
            create_index(
                SourceEngine::SqlServer,
                &table,
                &cols(&["CustomerId", "CreatedAt"]),
                &cols(&["Total"])
            ),
            "CREATE NONCLUSTERED INDEX [IX_Orders_CustomerId_CreatedAt] ON [dbo].[Orders] ([CustomerId], [CreatedAt]) INCLUDE ([Total]);"
        );
    }

    #[test]
    fn test_postgres_create() {
        let table = TableRef::new("orders").with_schema("public");
        assert_eq!(
            create_index(SourceEngine::Postgres, &table, &cols(&["customer_id"]), &[]),
            r#"CREATE INDEX "ix_orders_customer_id" ON "public"."orders" ("customer_id");"#
        );
    }

    #[test]
    fn test_mysql_drops_include_columns() {
        let table = TableRef::new("users");
        assert_eq!(
            create_index(SourceEngine::MySql, &table, &cols(&["email"]), &cols(&["name"])),
            "CREATE INDEX `ix_users_email` ON `users` (`email`);"
        );
    }

    #[test]
    fn test_widen_existing_index() {
        let existing = IndexMetadata::new("ix_orders_customer_id", cols(&["customer_id"]));
        let columns = cols(&["customer_id", "status"]);

        assert_eq!(
            widen_index(
                SourceEngine::Postgres,
                &TableRef::new("orders").with_schema("public"),
                &existing,
                &columns,
                &[]
            ),
            "DROP INDEX \"public\".\"ix_orders_customer_id\";\nCREATE INDEX \"ix_orders_customer_id\" ON \"public\".\"orders\" (\"customer_id\", \"status\");"
        );
        assert_eq!(
            widen_index(SourceEngine::MySql, &TableRef::new("orders"), &existing, &columns, &[]),
            "ALTER TABLE `orders` DROP INDEX `ix_orders_customer_id`, ADD INDEX `ix_orders_customer_id` (`customer_id`, `status`);"
        );
        assert!(
            widen_index(SourceEngine::SqlServer, &TableRef::new("Orders"), &existing, &columns, &[])
                .ends_with("WITH (DROP_EXISTING = ON);")
        );
    }

    #[test]
    fn test_long_names_are_truncated() {
        let columns: Vec<String> = (0..20).map(|i| format!("column_{}", i)).collect();
        let name = index_name(SourceEngine::Postgres, &TableRef::new("t"), &columns);
        assert_eq!(name.len(), MAX_INDEX_NAME_LEN);
    }
}
