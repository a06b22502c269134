//! Store Gateway (C1)
//!
//! Opens pooled connections to the relational store and invokes named
//! stored procedures, returning tabular results (spec.md §4.1). Connection
//! loss is surfaced as a distinguishable [`GatewayError::ConnectionLost`] so
//! the change-capture loop (C6) can transition to BACKOFF instead of
//! bubbling an opaque error.

use crate::normalize::{RawCell, RawRowBatch};
use async_trait::async_trait;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, Row};

pub type Pool = bb8::Pool<PostgresConnectionManager<NoTls>>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Connection to the store was lost or never established. Recoverable:
    /// callers in the change-capture loop retry after a backoff delay.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A statement (stored procedure call) failed, named so the caller can
    /// log which procedure misbehaved.
    #[error("statement error calling {procedure}: {source}")]
    Statement {
        procedure: String,
        #[source]
        source: anyhow::Error,
    },
}

impl GatewayError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, GatewayError::ConnectionLost(_))
    }
}

/// The store-facing contract C6/C7 depend on. A trait so tests can supply a
/// fake gateway without a live Postgres instance.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// `get_all(start, end)` or the zero-argument form when `window` is
    /// `None` (spec.md §4.1).
    async fn call_get_all(
        &self,
        procedure: &str,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<RawRowBatch, GatewayError>;

    /// `get_by_id({fetch_key: payloads}, null)` (spec.md §4.1, §6 wire format a).
    async fn call_get_by_id(
        &self,
        procedure: &str,
        fetch_key: &str,
        payloads: &[String],
    ) -> Result<RawRowBatch, GatewayError>;

    /// Arbitrary procedure call returning rows.
    async fn call(&self, procedure: &str, args: Vec<JsonValue>) -> Result<RawRowBatch, GatewayError>;

    /// Arbitrary procedure call that commits and returns nothing.
    async fn call_void(&self, procedure: &str, args: Vec<JsonValue>) -> Result<(), GatewayError>;
}

/// Connection parameters resolved from configuration and the secret store
/// (spec.md §4.1: `{name, user, password, host, port, schema}`).
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub schema: String,
}

impl ConnectionParams {
    pub fn connection_string(&self) -> String {
        format!(
            "dbname={} user={} password={} host={} port={} options='-c search_path={}'",
            self.name, self.user, self.password, self.host, self.port, self.schema
        )
    }
}

pub struct PgStoreGateway {
    pool: Pool,
}

impl PgStoreGateway {
    /// Build a connection pool scoped to one logical gateway. Every
    /// subsequent call acquires-and-releases a connection for its own
    /// duration (spec.md §5, "Shared resources").
    pub async fn connect(params: &ConnectionParams) -> Result<Self, GatewayError> {
        let config: tokio_postgres::Config = params
            .connection_string()
            .parse()
            .map_err(|e| GatewayError::ConnectionLost(format!("invalid connection string: {e}")))?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = bb8::Pool::builder()
            .max_size(8)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .await
            .map_err(|e| GatewayError::ConnectionLost(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, PostgresConnectionManager<NoTls>>, GatewayError> {
        self.pool
            .get()
            .await
            .map_err(|e| GatewayError::ConnectionLost(e.to_string()))
    }
}

#[async_trait]
impl StoreGateway for PgStoreGateway {
    async fn call_get_all(
        &self,
        procedure: &str,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<RawRowBatch, GatewayError> {
        let conn = self.conn().await?;
        let rows = match window {
            None => {
                let sql = format!("SELECT * FROM {procedure}($1)");
                conn.query(&sql, &[&Option::<i32>::None])
                    .await
                    .map_err(|e| statement_error(procedure, e))?
            }
            Some((start, end)) => {
                let sql = format!("SELECT * FROM {procedure}($1, $2, $3)");
                conn.query(&sql, &[&Option::<i32>::None, &start, &end])
                    .await
                    .map_err(|e| statement_error(procedure, e))?
            }
        };
        Ok(rows_to_batch(&rows))
    }

    async fn call_get_by_id(
        &self,
        procedure: &str,
        fetch_key: &str,
        payloads: &[String],
    ) -> Result<RawRowBatch, GatewayError> {
        let conn = self.conn().await?;
        let json_text =
            serde_json::to_string(&serde_json::json!({ fetch_key: payloads })).unwrap();
        let sql = format!("SELECT * FROM {procedure}($1, $2)");
        let rows = conn
            .query(&sql, &[&json_text, &Option::<i32>::None])
            .await
            .map_err(|e| statement_error(procedure, e))?;
        Ok(rows_to_batch(&rows))
    }

    async fn call(&self, procedure: &str, args: Vec<JsonValue>) -> Result<RawRowBatch, GatewayError> {
        let conn = self.conn().await?;
        let texts: Vec<String> = args.iter().map(json_arg_to_text).collect();
        let placeholders: Vec<String> = (1..=texts.len()).map(|i| format!("${i}")).collect();
        let sql = format!("SELECT * FROM {procedure}({})", placeholders.join(", "));
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            texts.iter().map(|t| t as _).collect();
        let rows = conn
            .query(&sql, &params)
            .await
            .map_err(|e| statement_error(procedure, e))?;
        Ok(rows_to_batch(&rows))
    }

    async fn call_void(&self, procedure: &str, args: Vec<JsonValue>) -> Result<(), GatewayError> {
        let conn = self.conn().await?;
        let texts: Vec<String> = args.iter().map(json_arg_to_text).collect();
        let placeholders: Vec<String> = (1..=texts.len()).map(|i| format!("${i}")).collect();
        let sql = format!("CALL {procedure}({})", placeholders.join(", "));
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            texts.iter().map(|t| t as _).collect();
        conn.execute(&sql, &params)
            .await
            .map_err(|e| statement_error(procedure, e))?;
        Ok(())
    }
}

/// Bind a procedure argument as the text PostgreSQL will receive: a plain
/// string passes through untouched (channel names, domain tokens), while
/// anything else is JSON-encoded (the `{fetch_key: payloads}` wire shape).
/// `JsonValue::to_string()` would otherwise wrap plain strings in literal
/// quote characters.
fn json_arg_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn statement_error(procedure: &str, source: tokio_postgres::Error) -> GatewayError {
    if source.is_closed() {
        GatewayError::ConnectionLost(source.to_string())
    } else {
        GatewayError::Statement {
            procedure: procedure.to_string(),
            source: source.into(),
        }
    }
}

fn rows_to_batch(rows: &[Row]) -> RawRowBatch {
    let Some(first) = rows.first() else {
        return RawRowBatch {
            columns: Vec::new(),
            rows: Vec::new(),
        };
    };
    let columns: Vec<String> = first
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let out_rows = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|i| cell_from_row(row, i))
                .collect()
        })
        .collect();

    RawRowBatch {
        columns,
        rows: out_rows,
    }
}

fn cell_from_row(row: &Row, idx: usize) -> RawCell {
    let ty = row.columns()[idx].type_();
    match *ty {
        Type::BOOL => row
            .get::<_, Option<bool>>(idx)
            .map(RawCell::Bool)
            .unwrap_or(RawCell::Null),
        Type::INT2 => row
            .get::<_, Option<i16>>(idx)
            .map(|v| RawCell::Integer(v as i64))
            .unwrap_or(RawCell::Null),
        Type::INT4 => row
            .get::<_, Option<i32>>(idx)
            .map(|v| RawCell::Integer(v as i64))
            .unwrap_or(RawCell::Null),
        Type::INT8 => row
            .get::<_, Option<i64>>(idx)
            .map(RawCell::Integer)
            .unwrap_or(RawCell::Null),
        Type::FLOAT4 => row
            .get::<_, Option<f32>>(idx)
            .map(|v| RawCell::Float(v as f64))
            .unwrap_or(RawCell::Null),
        Type::FLOAT8 => row
            .get::<_, Option<f64>>(idx)
            .map(RawCell::Float)
            .unwrap_or(RawCell::Null),
        Type::TIMESTAMPTZ => row
            .get::<_, Option<DateTime<Utc>>>(idx)
            .map(RawCell::Timestamp)
            .unwrap_or(RawCell::Null),
        Type::JSON | Type::JSONB => row
            .get::<_, Option<JsonValue>>(idx)
            .map(RawCell::Json)
            .unwrap_or(RawCell::Null),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .get::<_, Option<Vec<Option<String>>>>(idx)
            .map(RawCell::TextArray)
            .unwrap_or(RawCell::Null),
        _ => row
            .get::<_, Option<String>>(idx)
            .map(RawCell::Text)
            .unwrap_or(RawCell::Null),
    }
}
