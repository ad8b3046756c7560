//! Blocking sqlx driver for mysql and postgres.
//!
//! Statements run through `raw_sql`, so both servers answer in their text
//! protocol. Cells are read as text and converted by column type name.

use super::driver::{Connection, DatabaseDriver, DriverError, RowSet};
use super::ConnectionTarget;
use serde_json::Value;
use sqlx::mysql::MySqlConnection;
use sqlx::postgres::PgConnection;
use sqlx::{Column, ColumnIndex, Connection as _, Decode, Row, TypeInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::warn;

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        DriverError::new(err.to_string())
    }
}

pub struct SqlxDriver {
    runtime: Arc<Runtime>,
}

impl SqlxDriver {
    pub fn new() -> Result<Self, DriverError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| DriverError::new(format!("failed to start database runtime: {err}")))?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }
}

enum Link {
    MySql(MySqlConnection),
    Postgres(PgConnection),
}

impl DatabaseDriver for SqlxDriver {
    fn connect(
        &self,
        target: &ConnectionTarget,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, DriverError> {
        let url = target.url();
        let connected = self.runtime.block_on(async {
            tokio::time::timeout(timeout, async {
                match target.scheme {
                    "mysql" => MySqlConnection::connect(&url).await.map(Link::MySql),
                    "postgres" => PgConnection::connect(&url).await.map(Link::Postgres),
                    other => Err(sqlx::Error::Configuration(
                        format!("no driver for scheme '{other}'").into(),
                    )),
                }
            })
            .await
        });
        let link = match connected {
            Ok(result) => result?,
            Err(_) => {
                return Err(DriverError::new(format!(
                    "timed out after {}s connecting to {}",
                    timeout.as_secs_f64(),
                    target.redacted()
                )))
            }
        };
        Ok(Box::new(SqlxConnection {
            runtime: Arc::clone(&self.runtime),
            link: Some(link),
        }))
    }
}

struct SqlxConnection {
    runtime: Arc<Runtime>,
    link: Option<Link>,
}

impl SqlxConnection {
    fn live(&mut self) -> Result<(&Runtime, &mut Link), DriverError> {
        match self.link.as_mut() {
            Some(link) => Ok((&*self.runtime, link)),
            None => Err(DriverError::new("connection already closed")),
        }
    }
}

impl Connection for SqlxConnection {
    fn query(&mut self, sql: &str) -> Result<RowSet, DriverError> {
        let (runtime, link) = self.live()?;
        match link {
            Link::MySql(conn) => {
                let rows = runtime.block_on(sqlx::raw_sql(sql).fetch_all(&mut *conn))?;
                Ok(decode_rows(&rows))
            }
            Link::Postgres(conn) => {
                let rows = runtime.block_on(sqlx::raw_sql(sql).fetch_all(&mut *conn))?;
                Ok(decode_rows(&rows))
            }
        }
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        let (runtime, link) = self.live()?;
        let affected = match link {
            Link::MySql(conn) => runtime
                .block_on(sqlx::raw_sql(sql).execute(&mut *conn))?
                .rows_affected(),
            Link::Postgres(conn) => runtime
                .block_on(sqlx::raw_sql(sql).execute(&mut *conn))?
                .rows_affected(),
        };
        Ok(affected)
    }

    fn close(&mut self) {
        let closed = match self.link.take() {
            Some(Link::MySql(conn)) => self.runtime.block_on(conn.close()),
            Some(Link::Postgres(conn)) => self.runtime.block_on(conn.close()),
            None => Ok(()),
        };
        if let Err(err) = closed {
            warn!("failed to close database connection: {err}");
        }
    }
}

fn decode_rows<R>(rows: &[R]) -> RowSet
where
    R: Row,
    usize: ColumnIndex<R>,
    for<'r> String: Decode<'r, R::Database>,
    for<'r> Vec<u8>: Decode<'r, R::Database>,
{
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect()
        })
        .unwrap_or_default();
    let rows = rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .map(|column| {
                    let index = column.ordinal();
                    let type_name = column.type_info().name().to_uppercase();
                    if is_binary(&type_name) {
                        row.try_get_unchecked::<Option<Vec<u8>>, _>(index)
                            .ok()
                            .flatten()
                            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                            .unwrap_or(Value::Null)
                    } else {
                        let text = row.try_get_unchecked::<Option<String>, _>(index).ok().flatten();
                        cell_from_text(&type_name, text)
                    }
                })
                .collect()
        })
        .collect();
    RowSet { columns, rows }
}

fn is_binary(type_name: &str) -> bool {
    matches!(
        type_name,
        "BYTEA" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY"
    )
}

/// Converts the text form of a cell according to its column type.
/// Types without a JSON counterpart (dates, uuids, enums) stay strings.
pub(crate) fn cell_from_text(type_name: &str, text: Option<String>) -> Value {
    let Some(text) = text else {
        return Value::Null;
    };
    let base = type_name.trim_end_matches(" UNSIGNED");
    match base {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR" | "INT2"
        | "INT4" | "INT8" | "OID" => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<u64>().map(Value::from))
            .unwrap_or(Value::String(text)),
        "FLOAT" | "DOUBLE" | "REAL" | "FLOAT4" | "FLOAT8" | "DECIMAL" | "NUMERIC" => {
            match serde_json::from_str::<Value>(&text) {
                Ok(number @ Value::Number(_)) => number,
                _ => Value::String(text),
            }
        }
        "BOOL" | "BOOLEAN" => match text.as_str() {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            other => other
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(text)),
        },
        "JSON" | "JSONB" => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        "NULL" | "VOID" => Value::Null,
        _ => Value::String(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell(type_name: &str, text: &str) -> Value {
        cell_from_text(type_name, Some(text.to_string()))
    }

    #[test]
    fn integer_columns_become_numbers() {
        assert_eq!(cell("TINYINT", "3"), json!(3));
        assert_eq!(cell("BIGINT UNSIGNED", "18446744073709551615"), json!(u64::MAX));
        assert_eq!(cell("INT8", "-7"), json!(-7));
    }

    #[test]
    fn decimals_keep_their_value() {
        assert_eq!(cell("DECIMAL", "12.50"), json!(12.5));
        assert_eq!(cell("NUMERIC", "NaN"), json!("NaN"));
        assert_eq!(cell("FLOAT8", "0.25"), json!(0.25));
    }

    #[test]
    fn temporal_and_uuid_columns_stay_text() {
        assert_eq!(cell("DATETIME", "2024-05-01 10:00:00"), json!("2024-05-01 10:00:00"));
        assert_eq!(cell("TIMESTAMPTZ", "2024-05-01 10:00:00+00"), json!("2024-05-01 10:00:00+00"));
        assert_eq!(
            cell("UUID", "9b2f3c1e-0000-4000-8000-000000000000"),
            json!("9b2f3c1e-0000-4000-8000-000000000000")
        );
    }

    #[test]
    fn booleans_and_json_are_structured() {
        assert_eq!(cell("BOOL", "t"), json!(true));
        assert_eq!(cell("BOOLEAN", "1"), json!(1));
        assert_eq!(cell("JSONB", r#"{"a": [1]}"#), json!({"a": [1]}));
        assert_eq!(cell("JSON", "not json"), json!("not json"));
    }

    #[test]
    fn null_cells_are_null() {
        assert_eq!(cell_from_text("INT", None), Value::Null);
        assert!(is_binary("BYTEA"));
        assert!(!is_binary("TEXT"));
    }
}
