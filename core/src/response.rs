//! Uniform wrapper over the three kinds of step results.

use crate::error::StepError;
use crate::extract::{navigate, parse_index, soft_miss, split_query};
use crate::metadata::{ExecutionMetadata, StepKind};
use crate::sql::driver::RowSet;
use crate::sql::DatabaseResultSet;
use crate::transport::HttpResponse;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::error;

const HTTP_ROOTS: &[&str] = &[
    "status_code",
    "reason",
    "url",
    "headers",
    "cookies",
    "elapsed",
    "content",
    "text",
    "json",
];
const DATABASE_ROOTS: &[&str] = &["count", "result", "top", "first"];
const PLUGIN_ROOTS: &[&str] = &["result", "metadata", "script"];
const ELAPSED_FIELDS: &[&str] = &["days", "seconds", "microseconds", "total_seconds"];

#[derive(Debug, Clone, PartialEq)]
pub struct PluginOutput {
    pub script: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultVariant {
    Http(HttpResponse),
    Database(DatabaseResultSet),
    Plugin(PluginOutput),
}

/// Result of one simple step together with its metadata snapshot.
#[derive(Debug, Clone)]
pub struct StepResult {
    variant: ResultVariant,
    metadata: ExecutionMetadata,
    attributes: Map<String, Value>,
}

impl StepResult {
    pub fn new(variant: ResultVariant, metadata: ExecutionMetadata) -> Self {
        Self {
            variant,
            metadata,
            attributes: Map::new(),
        }
    }

    pub fn variant(&self) -> &ResultVariant {
        &self.variant
    }

    pub fn kind(&self) -> StepKind {
        match self.variant {
            ResultVariant::Http(_) => StepKind::Http,
            ResultVariant::Database(_) => StepKind::Database,
            ResultVariant::Plugin(_) => StepKind::Plugin,
        }
    }

    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut ExecutionMetadata {
        &mut self.metadata
    }

    pub fn into_metadata(self) -> ExecutionMetadata {
        self.metadata
    }

    /// Custom attribute assigned by a teardown hook, queryable as a root.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn extract(&self, query: &str) -> Result<Value, StepError> {
        let segments = split_query(query.trim());
        let (root, rest) = match segments.split_first() {
            Some((root, rest)) if !root.is_empty() => (*root, rest),
            _ => return Err(StepError::extract(format!("empty query '{query}'"))),
        };

        match &self.variant {
            ResultVariant::Http(response) => self.extract_http(response, root, rest, query),
            ResultVariant::Database(result) => self.extract_database(result, root, rest, query),
            ResultVariant::Plugin(output) => self.extract_plugin(output, root, rest, query),
        }
    }

    fn extract_http(
        &self,
        response: &HttpResponse,
        root: &str,
        rest: &[&str],
        query: &str,
    ) -> Result<Value, StepError> {
        match root {
            "status_code" => navigate(&json!(response.status_code), rest, query),
            "reason" => navigate(&json!(response.reason), rest, query),
            "url" => navigate(&json!(response.url), rest, query),
            "headers" => match rest.split_first() {
                None => Ok(json!(response.headers)),
                Some((name, tail)) => match response.header(name) {
                    Some(value) => navigate(&json!(value), tail, query),
                    None => Ok(soft_miss(query, format!("header '{name}' not found"))),
                },
            },
            "cookies" => match rest.split_first() {
                None => Ok(json!(response.cookies)),
                Some((name, tail)) => match response.cookies.get(*name) {
                    Some(value) => navigate(&json!(value), tail, query),
                    None => Ok(soft_miss(query, format!("cookie '{name}' not found"))),
                },
            },
            "elapsed" => elapsed_field(response.elapsed, rest, query),
            "content" | "text" | "json" => navigate(&response.body_value(), rest, query),
            other => self.extract_attribute(other, rest, query, HTTP_ROOTS),
        }
    }

    fn extract_database(
        &self,
        result: &DatabaseResultSet,
        root: &str,
        rest: &[&str],
        query: &str,
    ) -> Result<Value, StepError> {
        let Some(rows) = result.rows.as_ref() else {
            return Ok(Value::Null);
        };

        match root {
            "count" => {
                if !rest.is_empty() {
                    return Err(StepError::extract(format!(
                        "'{query}': count takes no further segments"
                    )));
                }
                Ok(json!(rows.rows.len()))
            }
            "result" => match rest.split_first() {
                None => Ok(Value::Array(rows.records())),
                Some((row, tail)) => {
                    let index = row_index(row, query)?;
                    if index >= rows.rows.len() {
                        return Ok(soft_miss(query, format!("row {index} out of range")));
                    }
                    column_of(rows, index, tail, query)
                }
            },
            "top" => match rest.split_first() {
                None => match rows.record(0) {
                    Some(record) => Ok(record),
                    None => Ok(soft_miss(query, "result has no rows")),
                },
                Some((count, tail)) => {
                    let count = row_index(count, query)?;
                    let block: Vec<Value> =
                        rows.records().into_iter().take(count).collect();
                    navigate(&Value::Array(block), tail, query)
                }
            },
            "first" => {
                if rows.rows.is_empty() {
                    return Ok(soft_miss(query, "result has no rows"));
                }
                column_of(rows, 0, rest, query)
            }
            other => self.extract_attribute(other, rest, query, DATABASE_ROOTS),
        }
    }

    fn extract_plugin(
        &self,
        output: &PluginOutput,
        root: &str,
        rest: &[&str],
        query: &str,
    ) -> Result<Value, StepError> {
        match root {
            "result" => navigate(&output.value, rest, query),
            "metadata" => {
                let metadata = serde_json::to_value(&self.metadata)
                    .map_err(|err| StepError::extract(format!("'{query}': {err}")))?;
                navigate(&metadata, rest, query)
            }
            "script" => {
                if !rest.is_empty() {
                    return Err(StepError::extract(format!(
                        "'{query}': script takes no further segments"
                    )));
                }
                Ok(json!(output.script))
            }
            other => self.extract_attribute(other, rest, query, PLUGIN_ROOTS),
        }
    }

    fn extract_attribute(
        &self,
        root: &str,
        rest: &[&str],
        query: &str,
        available: &[&str],
    ) -> Result<Value, StepError> {
        match self.attributes.get(root) {
            Some(value) => navigate(value, rest, query),
            None => {
                let mut roots: Vec<&str> = available.to_vec();
                roots.extend(self.attributes.keys().map(String::as_str));
                Err(StepError::extract(format!(
                    "unknown root '{root}' in '{query}', available: {}",
                    roots.join(", ")
                )))
            }
        }
    }

    /// JSON view bound into scope for teardown hooks.
    pub fn to_value(&self) -> Value {
        let mut view = match &self.variant {
            ResultVariant::Http(response) => json!({
                "status_code": response.status_code,
                "reason": response.reason,
                "url": response.url,
                "headers": response.headers,
                "cookies": response.cookies,
                "elapsed": response.elapsed.as_secs_f64(),
                "content": response.body_value(),
            }),
            ResultVariant::Database(result) => json!({
                "dialect": result.dialect,
                "statements": result.statements,
                "count": result.row_count,
                "result": result.rows.as_ref().map(|rows| rows.records()),
            }),
            ResultVariant::Plugin(output) => json!({
                "script": output.script,
                "result": output.value,
            }),
        };
        if let Value::Object(map) = &mut view {
            for (name, value) in &self.attributes {
                map.insert(name.clone(), value.clone());
            }
        }
        view
    }

    /// Writes identity and captured error text to the log.
    pub fn dump_diagnostics(&self) {
        let meta = &self.metadata;
        error!(
            "{} step '{}' failed against {}",
            meta.kind, meta.name, meta.identity
        );
        if let Some(message) = &meta.error {
            error!("captured error: {message}");
        }
        match &self.variant {
            ResultVariant::Http(response) => {
                error!("request: {}", meta.request);
                error!(
                    "response: {} {} body: {}",
                    response.status_code,
                    response.reason,
                    truncate_output(&response.body)
                );
            }
            ResultVariant::Database(result) => {
                for (kind, sql) in &result.statements {
                    error!("statement ({kind}): {sql}");
                }
            }
            ResultVariant::Plugin(output) => {
                error!("parameters: {}", meta.request);
                error!("result: {}", output.value);
            }
        }
    }
}

fn elapsed_field(elapsed: Duration, rest: &[&str], query: &str) -> Result<Value, StepError> {
    let field = match rest {
        [field] => *field,
        _ => {
            return Err(StepError::extract(format!(
                "'{query}': elapsed requires exactly one of {}",
                ELAPSED_FIELDS.join(", ")
            )))
        }
    };
    let total = elapsed.as_secs();
    match field {
        "days" => Ok(json!(total / 86_400)),
        "seconds" => Ok(json!(total % 86_400)),
        "microseconds" => Ok(json!(elapsed.subsec_micros())),
        "total_seconds" => Ok(json!(elapsed.as_secs_f64())),
        other => Err(StepError::extract(format!(
            "'{query}': invalid elapsed attribute '{other}', expected one of {}",
            ELAPSED_FIELDS.join(", ")
        ))),
    }
}

fn row_index(segment: &str, query: &str) -> Result<usize, StepError> {
    parse_index(segment).ok_or_else(|| {
        StepError::extract(format!("'{query}': row index must be numeric, got '{segment}'"))
    })
}

fn column_of(rows: &RowSet, row: usize, rest: &[&str], query: &str) -> Result<Value, StepError> {
    let Some((column, tail)) = rest.split_first() else {
        return Ok(rows.record(row).unwrap_or(Value::Null));
    };
    match rows.cell(row, column) {
        Some(value) => navigate(value, tail, query),
        None => Ok(soft_miss(query, format!("column '{column}' not found"))),
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    const MAX: usize = 512;
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
