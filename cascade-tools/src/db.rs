//! Database tool handler.
//!
//! `db://<service>/<operation>` where the service configuration names the
//! Postgres URL and table. Operations `take list count page create modify
//! delete native` are compiled to parameterised SQL from structured args:
//! `{filter, fields, limit, offset, order, values, sql, binds}`.

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Identifier whitelist for table/column/order fragments interpolated into
/// SQL text. Everything else is bound as a parameter.
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub url: String,
    pub table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOperation {
    Take,
    List,
    Count,
    Page,
    Create,
    Modify,
    Delete,
    Native,
}

impl DbOperation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "take" => Some(Self::Take),
            "list" => Some(Self::List),
            "count" => Some(Self::Count),
            "page" => Some(Self::Page),
            "create" => Some(Self::Create),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            "native" => Some(Self::Native),
            _ => None,
        }
    }
}

/// A compiled statement: SQL text plus positional binds.
#[derive(Debug, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<Value>,
}

fn check_identifier(name: &str) -> ToolResult<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(ToolError::InvalidArgument(format!(
            "invalid identifier: {}",
            name
        )))
    }
}

/// Render `filter` into a WHERE clause. Object entries become equality
/// conjunctions; array values become IN lists.
fn where_clause(filter: Option<&Value>, binds: &mut Vec<Value>) -> ToolResult<String> {
    let Some(Value::Object(filter)) = filter else {
        return Ok(String::new());
    };
    if filter.is_empty() {
        return Ok(String::new());
    }

    let mut clauses = Vec::new();
    for (column, value) in filter {
        check_identifier(column)?;
        match value {
            Value::Array(items) => {
                let placeholders: Vec<String> = items
                    .iter()
                    .map(|item| {
                        binds.push(item.clone());
                        format!("${}", binds.len())
                    })
                    .collect();
                clauses.push(format!("{} IN ({})", column, placeholders.join(", ")));
            }
            Value::Null => clauses.push(format!("{} IS NULL", column)),
            other => {
                binds.push(other.clone());
                clauses.push(format!("{} = ${}", column, binds.len()));
            }
        }
    }
    Ok(format!(" WHERE {}", clauses.join(" AND ")))
}

fn fields_clause(args: &Value) -> ToolResult<String> {
    match args.get("fields") {
        Some(Value::Array(fields)) if !fields.is_empty() => {
            let names: Vec<&str> = fields
                .iter()
                .map(|f| {
                    f.as_str()
                        .ok_or_else(|| {
                            ToolError::InvalidArgument("fields must be strings".to_string())
                        })
                        .and_then(check_identifier)
                })
                .collect::<ToolResult<_>>()?;
            Ok(names.join(", "))
        }
        Some(Value::String(s)) => {
            let names: Vec<&str> = s
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(check_identifier)
                .collect::<ToolResult<_>>()?;
            Ok(names.join(", "))
        }
        _ => Ok("*".to_string()),
    }
}

fn order_clause(args: &Value) -> ToolResult<String> {
    let Some(order) = args.get("order").and_then(Value::as_str) else {
        return Ok(String::new());
    };
    let mut parts = Vec::new();
    for term in order.split(',') {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }
        let (column, dir) = match term.rsplit_once(' ') {
            Some((col, dir)) if dir.eq_ignore_ascii_case("desc") => (col.trim(), " DESC"),
            Some((col, dir)) if dir.eq_ignore_ascii_case("asc") => (col.trim(), ""),
            _ => (term, ""),
        };
        check_identifier(column)?;
        parts.push(format!("{}{}", column, dir));
    }
    if parts.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }
}

/// Compile an operation + args into a parameterised statement.
pub fn build_statement(op: DbOperation, table: &str, args: &Value) -> ToolResult<Statement> {
    check_identifier(table)?;
    let mut binds = Vec::new();

    let sql = match op {
        DbOperation::Take => {
            let fields = fields_clause(args)?;
            let filter = where_clause(args.get("filter"), &mut binds)?;
            let order = order_clause(args)?;
            format!("SELECT {} FROM {}{}{} LIMIT 1", fields, table, filter, order)
        }
        DbOperation::List | DbOperation::Page => {
            let fields = fields_clause(args)?;
            let filter = where_clause(args.get("filter"), &mut binds)?;
            let order = order_clause(args)?;
            let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(100);
            let offset = args.get("offset").and_then(Value::as_i64).unwrap_or(0);
            format!(
                "SELECT {} FROM {}{}{} LIMIT {} OFFSET {}",
                fields,
                table,
                filter,
                order,
                limit.max(0),
                offset.max(0)
            )
        }
        DbOperation::Count => {
            let filter = where_clause(args.get("filter"), &mut binds)?;
            format!("SELECT COUNT(*) FROM {}{}", table, filter)
        }
        DbOperation::Create => {
            let Some(Value::Object(values)) = args.get("values") else {
                return Err(ToolError::InvalidArgument(
                    "create requires a 'values' object".to_string(),
                ));
            };
            let mut columns = Vec::new();
            let mut placeholders = Vec::new();
            for (column, value) in values {
                check_identifier(column)?;
                binds.push(value.clone());
                columns.push(column.as_str());
                placeholders.push(format!("${}", binds.len()));
            }
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders.join(", ")
            )
        }
        DbOperation::Modify => {
            let Some(Value::Object(values)) = args.get("values") else {
                return Err(ToolError::InvalidArgument(
                    "modify requires a 'values' object".to_string(),
                ));
            };
            let mut sets = Vec::new();
            for (column, value) in values {
                check_identifier(column)?;
                binds.push(value.clone());
                sets.push(format!("{} = ${}", column, binds.len()));
            }
            let filter = where_clause(args.get("filter"), &mut binds)?;
            format!("UPDATE {} SET {}{}", table, sets.join(", "), filter)
        }
        DbOperation::Delete => {
            let filter = where_clause(args.get("filter"), &mut binds)?;
            if filter.is_empty() {
                return Err(ToolError::InvalidArgument(
                    "delete requires a filter".to_string(),
                ));
            }
            format!("DELETE FROM {}{}", table, filter)
        }
        DbOperation::Native => {
            let sql = args
                .get("sql")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArgument("native requires 'sql'".to_string()))?;
            if let Some(Value::Array(extra)) = args.get("binds") {
                binds.extend(extra.clone());
            }
            sql.to_string()
        }
    };

    Ok(Statement { sql, binds })
}

pub struct DbHandler {
    pools: HandleCache<PgPool>,
}

impl Default for DbHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DbHandler {
    pub fn new() -> Self {
        Self {
            pools: HandleCache::default(),
        }
    }

    async fn pool(&self, tenant: &str, service: &str, config: &DbConfig) -> ToolResult<PgPool> {
        let key = HandleCache::<PgPool>::key(tenant, service);
        let url = config.url.clone();
        let max = config.max_connections;
        self.pools
            .get_or_create(&key, || async move {
                PgPoolOptions::new()
                    .max_connections(max)
                    .connect(&url)
                    .await
                    .map_err(|e| ToolError::Connection(e.to_string()))
            })
            .await
    }
}

fn bind_value<'q>(
    query: sqlx::query::QueryScalar<'q, sqlx::Postgres, Value, sqlx::postgres::PgArguments>,
    value: &'q Value,
) -> sqlx::query::QueryScalar<'q, sqlx::Postgres, Value, sqlx::postgres::PgArguments> {
    match value {
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => query.bind(s.as_str()),
        Value::Null => query.bind(Option::<String>::None),
        other => query.bind(other.to_string()),
    }
}

#[async_trait]
impl ToolHandler for DbHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config: DbConfig = serde_json::from_value(config.clone())
            .map_err(|e| ToolError::InvalidArgument(format!("invalid db config: {}", e)))?;

        let op = DbOperation::parse(path)
            .ok_or_else(|| ToolError::InvalidArgument(format!("unknown db operation: {}", path)))?;
        let statement = build_statement(op, &config.table, &args)?;
        let pool = self.pool(&ctx.tenant_id, service, &config).await?;

        tracing::debug!(service, sql = %statement.sql, "executing db tool");

        match op {
            DbOperation::Count => {
                let mut query =
                    sqlx::query_scalar::<_, i64>(&statement.sql);
                for bind in &statement.binds {
                    query = match bind {
                        Value::Bool(b) => query.bind(*b),
                        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
                        Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
                        Value::String(s) => query.bind(s.as_str()),
                        Value::Null => query.bind(Option::<String>::None),
                        other => query.bind(other.to_string()),
                    };
                }
                let count = query
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| ToolError::Database(e.to_string()))?;
                Ok(serde_json::json!(count))
            }
            DbOperation::Take | DbOperation::List | DbOperation::Page | DbOperation::Native => {
                // Wrap in row_to_json so rows come back as JSON regardless
                // of column types.
                let wrapped = format!("SELECT row_to_json(t) FROM ({}) t", statement.sql);
                let mut query = sqlx::query_scalar::<_, Value>(&wrapped);
                for bind in &statement.binds {
                    query = bind_value(query, bind);
                }
                let rows = query
                    .fetch_all(&pool)
                    .await
                    .map_err(|e| ToolError::Database(e.to_string()))?;
                if op == DbOperation::Take {
                    Ok(rows.into_iter().next().unwrap_or(Value::Null))
                } else {
                    Ok(Value::Array(rows))
                }
            }
            DbOperation::Create | DbOperation::Modify | DbOperation::Delete => {
                let mut query = sqlx::query(&statement.sql);
                for bind in &statement.binds {
                    query = match bind {
                        Value::Bool(b) => query.bind(*b),
                        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
                        Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
                        Value::String(s) => query.bind(s.as_str()),
                        Value::Null => query.bind(Option::<String>::None),
                        other => query.bind(other.to_string()),
                    };
                }
                let result = query
                    .execute(&pool)
                    .await
                    .map_err(|e| ToolError::Database(e.to_string()))?;
                Ok(serde_json::json!({ "affected": result.rows_affected() }))
            }
        }
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "db".to_string(),
            description: "Parameterised SQL operations over Postgres".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.pools.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_statement() {
        let stmt = build_statement(
            DbOperation::List,
            "orders",
            &json!({
                "filter": { "customer_id": "C1", "status": ["open", "paid"] },
                "fields": ["id", "amount"],
                "order": "created_at desc",
                "limit": 10
            }),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT id, amount FROM orders WHERE customer_id = $1 AND status IN ($2, $3) \
             ORDER BY created_at DESC LIMIT 10 OFFSET 0"
        );
        assert_eq!(stmt.binds.len(), 3);
    }

    #[test]
    fn test_count_statement() {
        let stmt = build_statement(
            DbOperation::Count,
            "orders",
            &json!({ "filter": { "customer_id": "C1" } }),
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM orders WHERE customer_id = $1");
    }

    #[test]
    fn test_create_and_modify_statements() {
        // serde_json maps iterate in sorted key order.
        let stmt = build_statement(
            DbOperation::Create,
            "orders",
            &json!({ "values": { "id": 1, "amount": 9.5 } }),
        )
        .unwrap();
        assert_eq!(stmt.sql, "INSERT INTO orders (amount, id) VALUES ($1, $2)");

        let stmt = build_statement(
            DbOperation::Modify,
            "orders",
            &json!({ "values": { "amount": 10 }, "filter": { "id": 1 } }),
        )
        .unwrap();
        assert_eq!(stmt.sql, "UPDATE orders SET amount = $1 WHERE id = $2");
    }

    #[test]
    fn test_delete_requires_filter() {
        assert!(build_statement(DbOperation::Delete, "orders", &json!({})).is_err());
    }

    #[test]
    fn test_null_filter_is_is_null() {
        let stmt = build_statement(
            DbOperation::Count,
            "orders",
            &json!({ "filter": { "deleted_at": null } }),
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) FROM orders WHERE deleted_at IS NULL");
        assert!(stmt.binds.is_empty());
    }

    #[test]
    fn test_identifier_injection_rejected() {
        assert!(build_statement(
            DbOperation::Count,
            "orders; DROP TABLE users",
            &json!({}),
        )
        .is_err());
        assert!(build_statement(
            DbOperation::Count,
            "orders",
            &json!({ "filter": { "id = 1 OR 1=1 --": 1 } }),
        )
        .is_err());
    }

    #[test]
    fn test_native_statement() {
        let stmt = build_statement(
            DbOperation::Native,
            "orders",
            &json!({ "sql": "SELECT 1", "binds": [] }),
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT 1");
    }
}
