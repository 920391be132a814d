//! Workspace database nodes: `db_select`, `db_insert`, `db_update`,
//! `db_delete`, `db_migrate`.
//!
//! Statements are built with `?` placeholders; identifiers are validated
//! and backtick-quoted. Raw `sql`, `where` and `having` strings are
//! interpolated as given.

use crate::interpolate::{interpolate, interpolate_value};
use async_trait::async_trait;
use flowcore::adapters::{AuditEvent, DbAuthorizer, DbProvider};
use flowcore::{
    ConfigExt, NodeContext, NodeError, NodeExecutor, NodeMetadata, NodeOutput, Value, ValueMap,
};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOperation {
    Select,
    Insert,
    Update,
    Delete,
    Migrate,
}

impl DbOperation {
    pub const ALL: [DbOperation; 5] = [
        DbOperation::Select,
        DbOperation::Insert,
        DbOperation::Update,
        DbOperation::Delete,
        DbOperation::Migrate,
    ];

    pub fn parse(raw: &str) -> Result<Self, NodeError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "select" => Ok(DbOperation::Select),
            "insert" => Ok(DbOperation::Insert),
            "update" => Ok(DbOperation::Update),
            "delete" => Ok(DbOperation::Delete),
            "migrate" => Ok(DbOperation::Migrate),
            other => Err(NodeError::Configuration(format!(
                "Unknown db operation: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DbOperation::Select => "select",
            DbOperation::Insert => "insert",
            DbOperation::Update => "update",
            DbOperation::Delete => "delete",
            DbOperation::Migrate => "migrate",
        }
    }

    pub fn node_type(&self) -> &'static str {
        match self {
            DbOperation::Select => "db_select",
            DbOperation::Insert => "db_insert",
            DbOperation::Update => "db_update",
            DbOperation::Delete => "db_delete",
            DbOperation::Migrate => "db_migrate",
        }
    }
}

/// A statement and its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Statement {
    fn raw(sql: String) -> Self {
        Self {
            sql,
            args: Vec::new(),
        }
    }
}

fn config_error(message: impl Into<String>) -> NodeError {
    NodeError::Configuration(message.into())
}

/// Backtick-quotes `schema.table` style identifiers after validating
/// each part against `[A-Za-z_][A-Za-z0-9_]*`.
pub fn quote_identifier(name: &str) -> Result<String, NodeError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(config_error("identifier is required"));
    }
    let valid = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    name.split('.')
        .map(|part| {
            if valid(part) {
                Ok(format!("`{}`", part))
            } else {
                Err(config_error(format!("invalid identifier: {}", name)))
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|parts| parts.join("."))
}

/// Shared interpolation scope for the builders.
pub struct Scope<'a> {
    pub inputs: &'a ValueMap,
    pub run: &'a flowcore::ExecutionContext,
}

impl Scope<'_> {
    fn text(&self, template: &str) -> String {
        interpolate(template, self.inputs, self.run)
    }

    fn value(&self, raw: &Value) -> Value {
        interpolate_value(raw, self.inputs, self.run)
    }
}

const ALLOWED_OPERATORS: [&str; 13] = [
    "=", "!=", "<", ">", "<=", ">=", "LIKE", "NOT LIKE", "IN", "NOT IN", "IS NULL", "IS NOT NULL",
    "BETWEEN",
];

/// `[{column, operator, value, logic}]` into a WHERE body and its args.
pub fn build_conditions(conditions: &[Value], scope: &Scope<'_>) -> Result<Statement, NodeError> {
    let mut parts = Vec::new();
    let mut args = Vec::new();

    for (i, cond) in conditions.iter().filter_map(Value::as_object).enumerate() {
        let column = quote_identifier(&cond.get_string("column"))?;
        let op = cond.get_string_or("operator", "=").trim().to_uppercase();
        if !ALLOWED_OPERATORS.contains(&op.as_str()) {
            return Err(config_error(format!("unsupported operator: {}", op)));
        }
        let logic = match cond.get_string_or("logic", "AND").to_uppercase().as_str() {
            "OR" => "OR",
            _ => "AND",
        };
        let value = cond.get("value").cloned().unwrap_or_default();

        let clause = match op.as_str() {
            "IS NULL" | "IS NOT NULL" => format!("{} {}", column, op),
            "IN" | "NOT IN" => {
                let values = value
                    .as_array()
                    .ok_or_else(|| config_error(format!("{} operator requires array value", op)))?;
                let placeholders = vec!["?"; values.len()].join(", ");
                args.extend(values.iter().map(|v| scope.value(v)));
                format!("{} {} ({})", column, op, placeholders)
            }
            "BETWEEN" => match value.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    args.push(scope.value(low));
                    args.push(scope.value(high));
                    format!("{} BETWEEN ? AND ?", column)
                }
                _ => return Err(config_error("BETWEEN requires array of 2 values")),
            },
            _ => {
                args.push(scope.value(&value));
                format!("{} {} ?", column, op)
            }
        };

        if i == 0 {
            parts.push(clause);
        } else {
            parts.push(format!("{} {}", logic, clause));
        }
    }

    Ok(Statement {
        sql: parts.join(" "),
        args,
    })
}

fn raw_sql(config: &ValueMap, scope: &Scope<'_>) -> Option<Statement> {
    let sql = config.get_string("sql");
    let sql = sql.trim();
    (!sql.is_empty()).then(|| Statement::raw(scope.text(sql)))
}

pub fn build_select(config: &ValueMap, scope: &Scope<'_>) -> Result<Statement, NodeError> {
    if let Some(statement) = raw_sql(config, scope) {
        return Ok(statement);
    }
    let table = quote_identifier(&config.get_string("table"))?;

    let columns = match config.get_array("columns").filter(|c| !c.is_empty()) {
        Some(cols) => cols
            .iter()
            .map(|c| {
                let col = c.to_display_string();
                if col.contains(['(', ')']) || col.to_uppercase().contains(" AS ") {
                    Ok(col)
                } else {
                    quote_identifier(&col)
                }
            })
            .collect::<Result<Vec<_>, _>>()?
            .join(", "),
        None => "*".to_string(),
    };

    let mut args = Vec::new();
    let where_part = match config.get_array("conditions").filter(|c| !c.is_empty()) {
        Some(conditions) => {
            let built = build_conditions(conditions, scope)?;
            args = built.args;
            built.sql
        }
        None => scope.text(config.get_string("where").trim()),
    };

    let mut sql = format!("SELECT {} FROM {}", columns, table);
    if !where_part.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_part);
    }
    if let Some(group_by) = config.get_array("group_by").filter(|g| !g.is_empty()) {
        let cols = group_by
            .iter()
            .map(|g| quote_identifier(&g.to_display_string()))
            .collect::<Result<Vec<_>, _>>()?;
        sql.push_str(" GROUP BY ");
        sql.push_str(&cols.join(", "));
    }
    let having = config.get_string("having");
    if !having.trim().is_empty() {
        sql.push_str(" HAVING ");
        sql.push_str(&scope.text(having.trim()));
    }
    if let Some(order_by) = config.get_array("order_by") {
        let mut parts = Vec::new();
        for spec in order_by.iter().filter_map(Value::as_object) {
            let dir = match spec.get_string("direction").to_uppercase().as_str() {
                "DESC" => "DESC",
                _ => "ASC",
            };
            parts.push(format!("{} {}", quote_identifier(&spec.get_string("column"))?, dir));
        }
        if !parts.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }
    }
    let limit = config.get_i64_or("limit", 0);
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    let offset = config.get_i64_or("offset", 0);
    if offset > 0 {
        sql.push_str(&format!(" OFFSET {}", offset));
    }

    Ok(Statement { sql, args })
}

/// Values for insert/update: `config.values`, else `inputs.values`, else
/// `inputs.input`. Strings are rendered then parsed as a JSON object.
fn resolve_values(config: &ValueMap, scope: &Scope<'_>) -> Result<Vec<(String, Value)>, NodeError> {
    let raw = config
        .get("values")
        .or_else(|| scope.inputs.get("values"))
        .or_else(|| scope.inputs.get("input"))
        .filter(|v| !v.is_null());

    let map = match raw {
        None => ValueMap::new(),
        Some(Value::String(text)) => {
            let rendered = scope.text(text);
            if rendered.trim().is_empty() {
                ValueMap::new()
            } else {
                match serde_json::from_str::<serde_json::Value>(&rendered).map(Value::from) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => return Err(config_error("values json must be an object")),
                    Err(e) => return Err(config_error(format!("invalid values json: {}", e))),
                }
            }
        }
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), scope.value(v))).collect(),
        Some(_) => return Err(config_error("values must be JSON object or string")),
    };

    let mut values: Vec<(String, Value)> = map.into_iter().collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(values)
}

pub fn build_insert(config: &ValueMap, scope: &Scope<'_>) -> Result<Statement, NodeError> {
    if let Some(statement) = raw_sql(config, scope) {
        return Ok(statement);
    }
    let table = quote_identifier(&config.get_string("table"))?;
    let values = resolve_values(config, scope)?;
    if values.is_empty() {
        return Err(config_error("insert values are required"));
    }

    let mut columns = Vec::with_capacity(values.len());
    let mut args = Vec::with_capacity(values.len());
    for (column, value) in values {
        columns.push(quote_identifier(&column)?);
        args.push(value);
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        ),
        args,
    })
}

pub fn build_update(config: &ValueMap, scope: &Scope<'_>) -> Result<Statement, NodeError> {
    if let Some(statement) = raw_sql(config, scope) {
        return Ok(statement);
    }
    let table = quote_identifier(&config.get_string("table"))?;
    let values = resolve_values(config, scope)?;
    if values.is_empty() {
        return Err(config_error("update values are required"));
    }
    let where_clause = config.get_string("where");
    if where_clause.trim().is_empty() {
        return Err(config_error("update where clause is required"));
    }

    let mut sets = Vec::with_capacity(values.len());
    let mut args = Vec::with_capacity(values.len());
    for (column, value) in values {
        sets.push(format!("{} = ?", quote_identifier(&column)?));
        args.push(value);
    }
    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            table,
            sets.join(", "),
            scope.text(where_clause.trim())
        ),
        args,
    })
}

pub fn build_delete(config: &ValueMap, scope: &Scope<'_>) -> Result<Statement, NodeError> {
    if let Some(statement) = raw_sql(config, scope) {
        return Ok(statement);
    }
    let table = quote_identifier(&config.get_string("table"))?;
    let where_clause = config.get_string("where");
    if where_clause.trim().is_empty() {
        return Err(config_error("delete where clause is required"));
    }
    Ok(Statement::raw(format!(
        "DELETE FROM {} WHERE {}",
        table,
        scope.text(where_clause.trim())
    )))
}

/// One node type per operation; `config.operation` may override.
pub struct DbNode {
    operation: DbOperation,
    provider: Option<Arc<dyn DbProvider>>,
    authorizer: Option<Arc<dyn DbAuthorizer>>,
}

impl DbNode {
    pub fn new(
        operation: DbOperation,
        provider: Option<Arc<dyn DbProvider>>,
        authorizer: Option<Arc<dyn DbAuthorizer>>,
    ) -> Self {
        Self {
            operation,
            provider,
            authorizer,
        }
    }

    fn audit_write(&self, ctx: &NodeContext, target_type: &str, details: ValueMap) {
        let mut event = AuditEvent::new("data_written")
            .with_node(ctx.node_id())
            .with_detail("target_type", target_type);
        event.details.extend(details);
        ctx.run.record_audit(event);
    }
}

fn details(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[async_trait]
impl NodeExecutor for DbNode {
    fn node_type(&self) -> &str {
        self.operation.node_type()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let operation = match ctx.config.get_str("operation").filter(|s| !s.is_empty()) {
            Some(raw) => DbOperation::parse(raw)?,
            None => self.operation,
        };
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| config_error("workspace database provider not configured"))?;
        let workspace = ctx.run.workspace_id().to_string();
        if workspace.is_empty() {
            return Err(config_error("workspace_id missing in execution context"));
        }
        if let Some(authorizer) = &self.authorizer {
            let user = ctx.run.user_id();
            if !user.trim().is_empty() {
                authorizer.ensure_access(&workspace, user).await?;
            }
        }

        let scope = Scope {
            inputs: &ctx.inputs,
            run: &ctx.run,
        };
        let table = Value::from(ctx.config.get_string("table").trim());
        let where_clause = Value::from(ctx.config.get_string("where").trim());
        ctx.ensure_not_cancelled()?;

        let output = match operation {
            DbOperation::Select => {
                let statement = build_select(&ctx.config, &scope)?;
                debug!(node_id = %ctx.node.id, sql = %statement.sql, "db select");
                let rows = provider.query(&workspace, &statement.sql, &statement.args).await?;
                let mut columns: Vec<Value> = rows
                    .first()
                    .map(|row| row.keys().map(|k| Value::from(k.as_str())).collect())
                    .unwrap_or_default();
                columns.sort_by_key(Value::to_display_string);
                let first = rows.first().cloned().map(Value::Object).unwrap_or_default();
                let rows: Vec<Value> = rows.into_iter().map(Value::Object).collect();

                NodeOutput::new()
                    .with_output("count", rows.len())
                    .with_output("first", first)
                    .with_output("output", rows.clone())
                    .with_output("result", rows.clone())
                    .with_output("rows", rows)
                    .with_output("columns", columns)
                    .with_output("table", table)
                    .with_output("where", where_clause)
                    .with_output("limit", ctx.config.get_i64_or("limit", 0))
            }
            DbOperation::Insert => {
                let statement = build_insert(&ctx.config, &scope)?;
                debug!(node_id = %ctx.node.id, sql = %statement.sql, "db insert");
                let summary = provider.execute(&workspace, &statement.sql, &statement.args).await?;
                let inserted_id = summary.last_insert_id.unwrap_or_default();

                let mut audit = details(&[
                    ("operation", Value::from("insert")),
                    ("table", table.clone()),
                    ("rows_affected", Value::from(summary.rows_affected)),
                ]);
                if inserted_id > 0 {
                    audit.insert("inserted_id".into(), Value::from(inserted_id));
                }
                self.audit_write(&ctx, "db_table", audit);

                let result = details(&[
                    ("insertedId", Value::from(inserted_id)),
                    ("rowsAffected", Value::from(summary.rows_affected)),
                ]);
                NodeOutput::new()
                    .with_output("insertedId", inserted_id)
                    .with_output("rowsAffected", summary.rows_affected)
                    .with_output("output", result.clone())
                    .with_output("result", result)
                    .with_output("table", table)
            }
            DbOperation::Update | DbOperation::Delete => {
                let statement = if operation == DbOperation::Update {
                    build_update(&ctx.config, &scope)?
                } else {
                    build_delete(&ctx.config, &scope)?
                };
                debug!(node_id = %ctx.node.id, sql = %statement.sql, "db {}", operation.as_str());
                let summary = provider.execute(&workspace, &statement.sql, &statement.args).await?;
                self.audit_write(
                    &ctx,
                    "db_table",
                    details(&[
                        ("operation", Value::from(operation.as_str())),
                        ("table", table.clone()),
                        ("rows_affected", Value::from(summary.rows_affected)),
                    ]),
                );
                NodeOutput::new()
                    .with_output("rowsAffected", summary.rows_affected)
                    .with_output("output", summary.rows_affected)
                    .with_output("result", summary.rows_affected)
                    .with_output("table", table)
                    .with_output("where", where_clause)
            }
            DbOperation::Migrate => {
                let sql = match ctx.config.get_str("sql").map(str::trim).filter(|s| !s.is_empty()) {
                    Some(sql) => sql.to_string(),
                    None => ctx
                        .inputs
                        .get_str("sql")
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .ok_or_else(|| config_error("migration sql is required"))?,
                };
                let sql = scope.text(&sql);
                provider.execute(&workspace, &sql, &[]).await?;
                self.audit_write(
                    &ctx,
                    "db_migration",
                    details(&[
                        ("operation", Value::from("migrate")),
                        ("statement_len", Value::from(sql.len())),
                    ]),
                );
                NodeOutput::new()
                    .with_output("applied", true)
                    .with_output("appliedCount", 1i64)
                    .with_output("output", true)
                    .with_output("result", 1i64)
            }
        };

        Ok(output)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(
            "database",
            format!("Workspace database {}", self.operation.as_str()),
        )
        .output("result", "Rows or affected-row count")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::ExecutionContext;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn config(json: serde_json::Value) -> ValueMap {
        match Value::from(json) {
            Value::Object(map) => map,
            _ => ValueMap::new(),
        }
    }

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert_eq!(quote_identifier("app.users").ok().as_deref(), Some("`app`.`users`"));
        assert_err!(quote_identifier("users; DROP TABLE x"));
        assert_err!(quote_identifier("1abc"));
        assert_err!(quote_identifier(""));
    }

    #[test]
    fn select_builds_structured_query() {
        let run = ExecutionContext::new("wf");
        let mut inputs = ValueMap::new();
        inputs.insert("min".into(), Value::from(18i64));
        let scope = Scope { inputs: &inputs, run: &run };

        let statement = build_select(
            &config(json!({
                "table": "users",
                "columns": ["id", "name", "COUNT(id)"],
                "conditions": [
                    {"column": "age", "operator": ">=", "value": "{{min}}"},
                    {"column": "role", "operator": "in", "value": ["a", "b"], "logic": "or"},
                    {"column": "deleted_at", "operator": "IS NULL"}
                ],
                "group_by": ["role"],
                "order_by": [{"column": "name", "direction": "desc"}],
                "limit": 10,
                "offset": 5
            })),
            &scope,
        )
        .unwrap();

        assert_eq!(
            statement.sql,
            "SELECT `id`, `name`, COUNT(id) FROM `users` WHERE `age` >= ? OR `role` IN (?, ?) \
             AND `deleted_at` IS NULL GROUP BY `role` ORDER BY `name` DESC LIMIT 10 OFFSET 5"
        );
        assert_eq!(
            statement.args,
            vec![Value::Number(18.0), Value::from("a"), Value::from("b")]
        );
    }

    #[test]
    fn writes_sort_columns_and_require_where() {
        let run = ExecutionContext::new("wf");
        let inputs = ValueMap::new();
        let scope = Scope { inputs: &inputs, run: &run };

        let insert = assert_ok!(build_insert(
            &config(json!({"table": "t", "values": {"b": 2, "a": 1}})),
            &scope
        ));
        assert_eq!(insert.sql, "INSERT INTO `t` (`a`, `b`) VALUES (?, ?)");
        assert_eq!(insert.args, vec![Value::Number(1.0), Value::Number(2.0)]);

        let update = build_update(
            &config(json!({"table": "t", "values": "{\"a\": 3}", "where": "id = 1"})),
            &scope,
        )
        .unwrap();
        assert_eq!(update.sql, "UPDATE `t` SET `a` = ? WHERE id = 1");

        assert_err!(build_update(&config(json!({"table": "t", "values": {"a": 1}})), &scope));
        assert_err!(build_delete(&config(json!({"table": "t"})), &scope));
        assert_err!(build_select(
            &config(json!({"table": "t", "conditions": [{"column": "a", "operator": "~", "value": 1}]})),
            &scope
        ));
    }
}
