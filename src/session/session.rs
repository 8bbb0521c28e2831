//! Session entity and the typed command protocol.
//!
//! A session owns one connection pool and a registry of cursors. All
//! mutable non-timestamp state is owned by the session's worker task;
//! other tasks interact with it only through [`SessionCommand`] messages,
//! each carrying its own single-use reply channel.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cursor::{Batch, CursorRegistry};
use crate::driver::DbPool;
use crate::error::AgentError;
use crate::session::id::{CursorId, SessionId};
use crate::stream::RowSink;

/// Commands queued behind a session inbox before senders start waiting.
pub(crate) const SESSION_INBOX_CAPACITY: usize = 100;

/// Target cursor and batch size of one fetch.
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub cid: CursorId,
    pub limit: usize,
}

/// Requests a session worker accepts, one variant per command.
pub(crate) enum SessionCommand {
    SetDb {
        db: String,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Query {
        sql: String,
        reply: oneshot::Sender<Result<CursorId, AgentError>>,
    },
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<CursorId, AgentError>>,
    },
    Fetch {
        params: FetchParams,
        reply: oneshot::Sender<Result<Batch, AgentError>>,
    },
    FetchStream {
        params: FetchParams,
        export: bool,
        sink: Box<dyn RowSink>,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Cancel {
        cid: CursorId,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    /// Tear the session down; answered once every cursor is gone.
    Cleanup {
        reply: oneshot::Sender<()>,
    },
}

pub struct Session {
    id: SessionId,
    pool: Arc<dyn DbPool>,
    inbox: mpsc::Sender<SessionCommand>,
    last_access: Mutex<Instant>,
    cursors: CursorRegistry,
    token: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("last_access", &self.last_access)
            .field("cursors", &self.cursors)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create the entity plus the receiving end for its worker.
    pub(crate) fn new(
        pool: Arc<dyn DbPool>,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(SESSION_INBOX_CAPACITY);
        let session = Arc::new(Self {
            id: SessionId::generate(),
            pool,
            inbox: tx,
            last_access: Mutex::new(Instant::now()),
            cursors: CursorRegistry::new(),
            token: parent.child_token(),
        });
        (session, rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn pool(&self) -> &Arc<dyn DbPool> {
        &self.pool
    }

    pub(crate) fn cursors(&self) -> &CursorRegistry {
        &self.cursors
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn touch(&self) {
        let mut last = self
            .last_access
            .lock()
            .expect("last_access mutex poisoned");
        *last = Instant::now();
    }

    pub fn idle_duration(&self) -> Duration {
        let last = self
            .last_access
            .lock()
            .expect("last_access mutex poisoned");
        last.elapsed()
    }

    /// Queue a command for the worker. A closed inbox means the session
    /// is already torn down.
    pub(crate) async fn send(&self, command: SessionCommand) -> Result<(), AgentError> {
        self.inbox
            .send(command)
            .await
            .map_err(|_| AgentError::InvalidSession)
    }
}
