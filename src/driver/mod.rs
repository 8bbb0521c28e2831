//! Database driver seam.
//!
//! The engine talks to the backing database only through these traits;
//! the concrete MySQL implementation lives in [`mysql`]. Every call that
//! can touch the wire accepts a cancellation token so that cancelling a
//! cursor aborts the wire operation, not merely the waiting task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

#[cfg(test)]
pub(crate) mod mock;
pub mod mysql;

/// Connection parameters forwarded from the caller at login.
#[derive(Debug, Clone)]
pub struct ConnSpec {
    pub user: String,
    pub pass: String,
    pub host: String,
    pub port: u16,
    pub db: Option<String>,
}

/// One column of one row: name plus raw value bytes.
///
/// `None` encodes SQL NULL; everything else is whatever bytes the server
/// sent, with no type-aware coercion.
#[derive(Debug, Clone)]
pub struct RawColumn {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

pub type RawRow = Vec<RawColumn>;

/// Opens connection pools for credentials supplied at login.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    async fn open(&self, spec: &ConnSpec) -> Result<Arc<dyn DbPool>, AgentError>;
}

/// A connection pool owned by exactly one session.
#[async_trait]
pub trait DbPool: Send + Sync + 'static {
    /// Connectivity check with a hard timeout.
    async fn ping(&self, timeout: Duration) -> Result<(), AgentError>;

    /// Start a read query; rows are pulled from the returned stream.
    async fn query(
        &self,
        sql: &str,
        token: &CancellationToken,
    ) -> Result<Box<dyn RowStream>, AgentError>;

    /// Run a mutating statement and return the affected-row count.
    async fn exec(&self, sql: &str, token: &CancellationToken) -> Result<u64, AgentError>;

    /// Close the pool; called exactly once on session teardown.
    async fn close(&self);
}

/// An open result-set iterator.
#[async_trait]
pub trait RowStream: Send + 'static {
    /// Next row, or `Ok(None)` once the result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<RawRow>, AgentError>;
}
