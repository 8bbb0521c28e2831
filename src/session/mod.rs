//! Session management: the agent core.
//!
//! [`Agent`] is the engine behind the HTTP surface. It owns the session
//! registry and the root cancellation token, opens pools through the
//! configured driver, and turns public operations into typed commands on
//! per-session worker inboxes.

pub mod id;
pub mod registry;
pub mod session;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::AgentConfig;
use crate::cursor::Batch;
use crate::driver::{ConnSpec, Driver};
use crate::error::AgentError;
use crate::session::id::{CursorId, SessionId};
use crate::session::registry::SessionRegistry;
use crate::session::session::{FetchParams, Session, SessionCommand};
use crate::session::worker::CursorPolicy;
use crate::stream::RowSink;

/// Lifecycle and timeout knobs, usually derived from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct AgentPolicy {
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
    pub cursor_ttl: Duration,
    pub cursor_sweep_interval: Duration,
    pub login_ping_timeout: Duration,
    pub ping_timeout: Duration,
    pub export_dir: Option<PathBuf>,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(1200),
            session_sweep_interval: Duration::from_secs(1200),
            cursor_ttl: Duration::from_secs(60),
            cursor_sweep_interval: Duration::from_secs(60),
            login_ping_timeout: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(1),
            export_dir: None,
        }
    }
}

impl AgentPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            session_ttl: Duration::from_secs(config.session_ttl_seconds),
            session_sweep_interval: Duration::from_secs(config.session_sweep_interval_seconds),
            cursor_ttl: Duration::from_secs(config.cursor_ttl_seconds),
            cursor_sweep_interval: Duration::from_secs(config.cursor_sweep_interval_seconds),
            login_ping_timeout: Duration::from_secs(config.login_ping_timeout_seconds),
            ping_timeout: Duration::from_secs(config.ping_timeout_seconds),
            export_dir: config.export_dir.clone(),
        }
    }
}

pub struct Agent {
    registry: Arc<SessionRegistry>,
    driver: Arc<dyn Driver>,
    policy: AgentPolicy,
    token: CancellationToken,
}

impl Agent {
    /// Build the agent and start the session sweeper.
    pub fn new(driver: Arc<dyn Driver>, policy: AgentPolicy) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let token = CancellationToken::new();
        registry::spawn_sweeper(
            Arc::clone(&registry),
            policy.session_ttl,
            policy.session_sweep_interval,
            token.child_token(),
        );
        Arc::new(Self {
            registry,
            driver,
            policy,
            token,
        })
    }

    /// Open a pool, check connectivity, close it again.
    pub async fn ping(&self, spec: &ConnSpec) -> Result<(), AgentError> {
        let pool = self.driver.open(spec).await?;
        let result = pool.ping(self.policy.ping_timeout).await;
        pool.close().await;
        result
    }

    /// Open a pool for the caller's credentials and create a session
    /// around it. The pool must answer a ping before the session exists.
    #[instrument(skip(self, spec), fields(host = %spec.host, port = spec.port))]
    pub async fn login(&self, spec: &ConnSpec) -> Result<SessionId, AgentError> {
        let pool = self.driver.open(spec).await?;
        if let Err(err) = pool.ping(self.policy.login_ping_timeout).await {
            pool.close().await;
            return Err(err);
        }

        let (session, rx) = Session::new(pool.clone(), &self.token);
        let sid = session.id().clone();
        if let Err(err) = self.registry.put(Arc::clone(&session)) {
            pool.close().await;
            return Err(err);
        }
        worker::spawn(
            session,
            rx,
            CursorPolicy {
                ttl: self.policy.cursor_ttl,
                sweep_interval: self.policy.cursor_sweep_interval,
                export_dir: self.policy.export_dir.clone(),
            },
        );
        info!(session_id = %sid, "session created");
        Ok(sid)
    }

    /// Change the session's active database.
    pub async fn set_db(&self, sid: &SessionId, db: &str) -> Result<(), AgentError> {
        let db = db.to_string();
        self.roundtrip(sid, |reply| SessionCommand::SetDb { db, reply })
            .await
    }

    /// Open a READ cursor for `sql` and return its id.
    pub async fn query(&self, sid: &SessionId, sql: &str) -> Result<CursorId, AgentError> {
        let sql = sql.to_string();
        self.roundtrip(sid, |reply| SessionCommand::Query { sql, reply })
            .await
    }

    /// Open a MUTATE cursor for `sql` and return its id.
    pub async fn execute(&self, sid: &SessionId, sql: &str) -> Result<CursorId, AgentError> {
        let sql = sql.to_string();
        self.roundtrip(sid, |reply| SessionCommand::Execute { sql, reply })
            .await
    }

    /// Fetch the next batch of at most `limit` rows from a cursor.
    pub async fn fetch(
        &self,
        sid: &SessionId,
        cid: &CursorId,
        limit: usize,
    ) -> Result<Batch, AgentError> {
        let params = FetchParams {
            cid: cid.clone(),
            limit,
        };
        self.roundtrip(sid, |reply| SessionCommand::Fetch { params, reply })
            .await
    }

    /// Stream the next `limit` rows from a cursor into `sink`.
    pub async fn fetch_stream(
        &self,
        sid: &SessionId,
        cid: &CursorId,
        limit: usize,
        export: bool,
        sink: Box<dyn RowSink>,
    ) -> Result<(), AgentError> {
        let params = FetchParams {
            cid: cid.clone(),
            limit,
        };
        self.roundtrip(sid, |reply| SessionCommand::FetchStream {
            params,
            export,
            sink,
            reply,
        })
        .await
    }

    /// Cancel a cursor, aborting any in-flight driver call.
    pub async fn cancel(&self, sid: &SessionId, cid: &CursorId) -> Result<(), AgentError> {
        let cid = cid.clone();
        self.roundtrip(sid, |reply| SessionCommand::Cancel { cid, reply })
            .await
    }

    /// Tear down every session; used on graceful shutdown.
    pub async fn shutdown(&self) {
        self.token.cancel();
        for sid in self.registry.snapshot_keys() {
            let Some(session) = self.registry.peek(&sid) else {
                continue;
            };
            let (tx, rx) = oneshot::channel();
            if session.send(SessionCommand::Cleanup { reply: tx }).await.is_ok() {
                let _ = rx.await;
            }
            self.registry.remove(&sid);
        }
        info!("agent shut down");
    }

    pub(crate) fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn roundtrip<T>(
        &self,
        sid: &SessionId,
        command: impl FnOnce(oneshot::Sender<Result<T, AgentError>>) -> SessionCommand,
    ) -> Result<T, AgentError> {
        let session = self.registry.get(sid)?;
        let (tx, rx) = oneshot::channel();
        session.send(command(tx)).await?;
        rx.await.map_err(|_| AgentError::InvalidSession)?
    }
}
