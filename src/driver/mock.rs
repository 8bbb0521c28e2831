//! In-memory driver used by the engine tests.
//!
//! Behavior is scripted per SQL string: result rows, open/iteration/exec
//! failures, and a "hang" switch that parks a query until its token is
//! cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::driver::{ConnSpec, DbPool, Driver, RawColumn, RawRow, RowStream};
use crate::error::AgentError;

#[derive(Clone, Default)]
pub(crate) struct Script {
    pub rows: Vec<Vec<(String, Option<String>)>>,
    /// Fail the query before any row is produced.
    pub open_error: Option<String>,
    /// Fail iteration after this many rows.
    pub error_after: Option<usize>,
    /// Park the query until its token is cancelled.
    pub hang: bool,
    pub affected: u64,
    pub exec_error: Option<String>,
}

impl Script {
    pub fn rows(rows: Vec<Vec<(&str, Option<&str>)>>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
                        .collect()
                })
                .collect(),
            ..Self::default()
        }
    }

    /// `count` rows of a single `id` column holding the row number.
    pub fn numbered_rows(count: usize) -> Self {
        Self {
            rows: (0..count)
                .map(|i| vec![("id".to_string(), Some(i.to_string()))])
                .collect(),
            ..Self::default()
        }
    }

    pub fn open_error(message: &str) -> Self {
        Self {
            open_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn affected(n: u64) -> Self {
        Self {
            affected: n,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<String, Script>>,
    fail_open: Mutex<Option<String>>,
    fail_ping: Mutex<Option<String>>,
    exec_log: Mutex<Vec<String>>,
    pools_opened: AtomicUsize,
    pools_closed: AtomicUsize,
}

/// Scriptable driver; clones share state so tests can observe effects.
#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, sql: &str, script: Script) {
        self.state
            .scripts
            .lock()
            .expect("mock scripts mutex poisoned")
            .insert(sql.to_string(), script);
    }

    pub fn fail_open(&self, message: &str) {
        *self
            .state
            .fail_open
            .lock()
            .expect("mock fail_open mutex poisoned") = Some(message.to_string());
    }

    pub fn fail_ping(&self, message: &str) {
        *self
            .state
            .fail_ping
            .lock()
            .expect("mock fail_ping mutex poisoned") = Some(message.to_string());
    }

    pub fn pools_opened(&self) -> usize {
        self.state.pools_opened.load(Ordering::SeqCst)
    }

    pub fn pools_closed(&self) -> usize {
        self.state.pools_closed.load(Ordering::SeqCst)
    }

    pub fn exec_log(&self) -> Vec<String> {
        self.state
            .exec_log
            .lock()
            .expect("mock exec log mutex poisoned")
            .clone()
    }

    fn script_for(&self, sql: &str) -> Script {
        self.state
            .scripts
            .lock()
            .expect("mock scripts mutex poisoned")
            .get(sql)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn open(&self, _spec: &ConnSpec) -> Result<Arc<dyn DbPool>, AgentError> {
        if let Some(message) = self
            .state
            .fail_open
            .lock()
            .expect("mock fail_open mutex poisoned")
            .clone()
        {
            return Err(AgentError::Db(message));
        }
        self.state.pools_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPool {
            driver: self.clone(),
        }))
    }
}

struct MockPool {
    driver: MockDriver,
}

#[async_trait]
impl DbPool for MockPool {
    async fn ping(&self, _timeout: Duration) -> Result<(), AgentError> {
        match self
            .driver
            .state
            .fail_ping
            .lock()
            .expect("mock fail_ping mutex poisoned")
            .clone()
        {
            Some(message) => Err(AgentError::Db(message)),
            None => Ok(()),
        }
    }

    async fn query(
        &self,
        sql: &str,
        token: &CancellationToken,
    ) -> Result<Box<dyn RowStream>, AgentError> {
        let script = self.driver.script_for(sql);
        if let Some(message) = script.open_error {
            return Err(AgentError::Db(message));
        }
        let rows = script
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(name, value)| RawColumn {
                        name,
                        value: value.map(String::into_bytes),
                    })
                    .collect::<RawRow>()
            })
            .collect();
        Ok(Box::new(MockRowStream {
            rows,
            served: 0,
            error_after: script.error_after,
            hang: script.hang,
            token: token.clone(),
        }))
    }

    async fn exec(&self, sql: &str, token: &CancellationToken) -> Result<u64, AgentError> {
        let script = self.driver.script_for(sql);
        self.driver
            .state
            .exec_log
            .lock()
            .expect("mock exec log mutex poisoned")
            .push(sql.to_string());
        if script.hang {
            token.cancelled().await;
            return Err(AgentError::Cancelled);
        }
        match script.exec_error {
            Some(message) => Err(AgentError::Db(message)),
            None => Ok(script.affected),
        }
    }

    async fn close(&self) {
        self.driver.state.pools_closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockRowStream {
    rows: VecDeque<RawRow>,
    served: usize,
    error_after: Option<usize>,
    hang: bool,
    token: CancellationToken,
}

#[async_trait]
impl RowStream for MockRowStream {
    async fn next_row(&mut self) -> Result<Option<RawRow>, AgentError> {
        if self.hang {
            self.token.cancelled().await;
            return Err(AgentError::Cancelled);
        }
        if self.token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if self.error_after == Some(self.served) {
            return Err(AgentError::Db("row iteration failed".to_string()));
        }
        match self.rows.pop_front() {
            Some(row) => {
                self.served += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}
