//! MySQL driver backed by `mysql_async`.
//!
//! Queries run over the text protocol, so every value arrives as raw
//! bytes or NULL — exactly the agent's untyped row contract. A pump task
//! owns the connection for the lifetime of a result set and feeds rows
//! through a bounded channel; cancelling the token drops the connection
//! mid-result, which aborts the wire operation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::AgentConfig;
use crate::driver::{ConnSpec, DbPool, Driver, RawColumn, RawRow, RowStream};
use crate::error::AgentError;

/// Rows buffered between the pump task and the consuming cursor.
const ROW_PIPELINE_DEPTH: usize = 64;

impl From<mysql_async::Error> for AgentError {
    fn from(err: mysql_async::Error) -> Self {
        AgentError::Db(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MySqlDriver {
    max_open: usize,
    idle_at_start: usize,
}

impl MySqlDriver {
    pub fn new(max_open: usize, idle_at_start: usize) -> Self {
        Self {
            max_open,
            idle_at_start,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.pool_max_open, config.pool_idle_at_start)
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    #[instrument(skip(self, spec), fields(host = %spec.host, port = spec.port))]
    async fn open(&self, spec: &ConnSpec) -> Result<Arc<dyn DbPool>, AgentError> {
        let constraints = PoolConstraints::new(self.idle_at_start, self.max_open)
            .ok_or_else(|| AgentError::Unrecoverable("invalid pool constraints".to_string()))?;
        let opts = OptsBuilder::default()
            .ip_or_hostname(spec.host.clone())
            .tcp_port(spec.port)
            .user(Some(spec.user.clone()))
            .pass(Some(spec.pass.clone()))
            .db_name(spec.db.clone())
            .pool_opts(PoolOpts::default().with_constraints(constraints));
        let pool = Pool::new(Opts::from(opts));
        debug!(host = %spec.host, port = spec.port, "opened mysql pool");
        Ok(Arc::new(MySqlDbPool { pool }))
    }
}

struct MySqlDbPool {
    pool: Pool,
}

#[async_trait]
impl DbPool for MySqlDbPool {
    async fn ping(&self, timeout: Duration) -> Result<(), AgentError> {
        let check = async {
            let mut conn = self.pool.get_conn().await?;
            conn.ping().await
        };
        match tokio::time::timeout(timeout, check).await {
            Ok(result) => result.map_err(AgentError::from),
            Err(_) => Err(AgentError::Db("connectivity check timed out".to_string())),
        }
    }

    async fn query(
        &self,
        sql: &str,
        token: &CancellationToken,
    ) -> Result<Box<dyn RowStream>, AgentError> {
        let (tx, rx) = mpsc::channel(ROW_PIPELINE_DEPTH);
        tokio::spawn(pump_rows(
            self.pool.clone(),
            sql.to_string(),
            token.clone(),
            tx,
        ));
        Ok(Box::new(MySqlRowStream { rx }))
    }

    async fn exec(&self, sql: &str, token: &CancellationToken) -> Result<u64, AgentError> {
        let work = async {
            let mut conn = self.pool.get_conn().await?;
            let result = conn.query_iter(sql).await?;
            let affected = result.affected_rows();
            result.drop_result().await?;
            Ok::<u64, mysql_async::Error>(affected)
        };
        tokio::select! {
            _ = token.cancelled() => Err(AgentError::Cancelled),
            result = work => result.map_err(AgentError::from),
        }
    }

    async fn close(&self) {
        if let Err(err) = self.pool.clone().disconnect().await {
            warn!(error = %err, "mysql pool disconnect failed");
        }
    }
}

/// Drives one result set to completion, feeding rows into `tx`.
///
/// Dropping the in-flight future on cancellation drops the connection,
/// which closes the socket under the running statement.
async fn pump_rows(
    pool: Pool,
    sql: String,
    token: CancellationToken,
    tx: mpsc::Sender<Result<RawRow, AgentError>>,
) {
    let work = async {
        let mut conn = pool.get_conn().await?;
        let mut result = conn.query_iter(sql.as_str()).await?;
        while let Some(row) = result.next().await? {
            if tx.send(Ok(decode_row(&row))).await.is_err() {
                // consumer went away; abandon the result set
                return Ok(());
            }
        }
        result.drop_result().await?;
        Ok::<(), mysql_async::Error>(())
    };
    tokio::select! {
        _ = token.cancelled() => {
            let _ = tx.send(Err(AgentError::Cancelled)).await;
        }
        result = work => {
            if let Err(err) = result {
                let _ = tx.send(Err(AgentError::from(err))).await;
            }
        }
    }
}

struct MySqlRowStream {
    rx: mpsc::Receiver<Result<RawRow, AgentError>>,
}

#[async_trait]
impl RowStream for MySqlRowStream {
    async fn next_row(&mut self) -> Result<Option<RawRow>, AgentError> {
        match self.rx.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

fn decode_row(row: &Row) -> RawRow {
    let columns = row.columns_ref();
    let mut out = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let value = match row.as_ref(i) {
            None | Some(Value::NULL) => None,
            Some(Value::Bytes(bytes)) => Some(bytes.clone()),
            // binary-protocol values do not occur on the text protocol,
            // but render them rather than drop data
            Some(other) => Some(render_value(other).into_bytes()),
        };
        out.push(RawColumn {
            name: column.name_str().into_owned(),
            value,
        });
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(y, m, d, 0, 0, 0, 0) => format!("{y:04}-{m:02}-{d:02}"),
        Value::Date(y, m, d, h, min, s, us) => {
            format!("{y:04}-{m:02}-{d:02} {h:02}:{min:02}:{s:02}.{us:06}")
        }
        Value::Time(neg, days, h, m, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + u32::from(*days) * 24;
            format!("{sign}{hours:02}:{m:02}:{s:02}.{us:06}")
        }
        Value::Bytes(_) | Value::NULL => String::new(),
    }
}
