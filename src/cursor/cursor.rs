//! Cursor entity and the per-session cursor registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cursor::worker;
use crate::driver::DbPool;
use crate::error::AgentError;
use crate::session::id::CursorId;
use crate::stream::RowSink;

/// What a cursor does with its query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    Read,
    Mutate,
}

/// Lifecycle of a READ cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Created; no driver call issued yet.
    New,
    /// First driver call in flight.
    Running,
    /// Row stream open; fetches advance it.
    Draining,
    /// Sticky error recorded.
    Failed,
    /// Context cancelled.
    Cancelled,
    /// Worker exited; stream closed.
    Terminated,
}

/// A bounded slice of a result set.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<Vec<String>>,
    pub eof: bool,
}

/// Requests a session submits to a READ cursor's inbox.
pub(crate) enum CursorRequest {
    Fetch {
        cid: CursorId,
        limit: usize,
        reply: oneshot::Sender<Result<Batch, AgentError>>,
    },
    FetchStream {
        cid: CursorId,
        limit: usize,
        export_to: Option<PathBuf>,
        sink: Box<dyn RowSink>,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
}

#[derive(Debug)]
pub struct Cursor {
    id: CursorId,
    query: String,
    mode: CursorMode,
    token: CancellationToken,
    last_access: Mutex<Instant>,
    sticky: Mutex<Option<AgentError>>,
    state: Mutex<CursorState>,
    claimed: AtomicBool,
    inbox: Option<mpsc::Sender<CursorRequest>>,
}

impl Cursor {
    /// Create a READ cursor and start its worker.
    pub(crate) fn spawn_read(
        query: String,
        parent: &CancellationToken,
        pool: Arc<dyn DbPool>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let cursor = Arc::new(Self {
            id: CursorId::generate(),
            query,
            mode: CursorMode::Read,
            token: parent.child_token(),
            last_access: Mutex::new(Instant::now()),
            sticky: Mutex::new(None),
            state: Mutex::new(CursorState::New),
            claimed: AtomicBool::new(false),
            inbox: Some(tx),
        });
        worker::spawn(cursor.clone(), pool, rx);
        cursor
    }

    /// Create a MUTATE cursor; no worker, the session executes inline.
    pub(crate) fn new_mutate(query: String, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id: CursorId::generate(),
            query,
            mode: CursorMode::Mutate,
            token: parent.child_token(),
            last_access: Mutex::new(Instant::now()),
            sticky: Mutex::new(None),
            state: Mutex::new(CursorState::New),
            claimed: AtomicBool::new(false),
            inbox: None,
        })
    }

    pub fn id(&self) -> &CursorId {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn mode(&self) -> CursorMode {
        self.mode
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the cursor's context, aborting any in-flight driver call.
    pub fn cancel(&self) {
        self.token.cancel();
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

    pub(crate) fn set_sticky(&self, err: AgentError) {
        let mut sticky = self.sticky.lock().expect("sticky mutex poisoned");
        // first error wins
        if sticky.is_none() {
            *sticky = Some(err);
        }
        drop(sticky);
        self.set_state(CursorState::Failed);
    }

    pub(crate) fn sticky(&self) -> Option<AgentError> {
        self.sticky.lock().expect("sticky mutex poisoned").clone()
    }

    pub(crate) fn set_state(&self, state: CursorState) {
        *self.state.lock().expect("state mutex poisoned") = state;
    }

    pub fn state(&self) -> CursorState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// Claim the one-shot exec of a MUTATE cursor. Only the first caller
    /// wins; everyone else sees the cursor as already consumed.
    pub(crate) fn claim_exec(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    /// Submit a request to the READ worker's inbox.
    pub(crate) async fn submit(&self, request: CursorRequest) -> Result<(), AgentError> {
        let inbox = self.inbox.as_ref().ok_or(AgentError::InvalidCursorCommand)?;
        inbox.send(request).await.map_err(|_| AgentError::InvalidCursor)
    }
}

/// Cursors owned by one session, keyed by id.
///
/// The mutex is never held across an await; iteration snapshots keys.
#[derive(Debug)]
pub(crate) struct CursorRegistry {
    inner: Mutex<HashMap<CursorId, Arc<Cursor>>>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a cursor, rejecting id collisions.
    pub fn put(&self, cursor: Arc<Cursor>) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().expect("cursor registry lock poisoned");
        if inner.contains_key(cursor.id()) {
            return Err(AgentError::Unrecoverable("cursor id collision".to_string()));
        }
        inner.insert(cursor.id().clone(), cursor);
        Ok(())
    }

    /// Look up a live cursor. A recorded sticky error is returned instead
    /// of the cursor; an unknown id is `invalid-cursor-id`.
    pub fn get(&self, cid: &CursorId) -> Result<Arc<Cursor>, AgentError> {
        let inner = self.inner.lock().expect("cursor registry lock poisoned");
        let cursor = inner.get(cid).ok_or(AgentError::InvalidCursor)?;
        if let Some(err) = cursor.sticky() {
            return Err(err);
        }
        Ok(cursor.clone())
    }

    /// Look up regardless of sticky errors (teardown paths).
    pub fn get_any(&self, cid: &CursorId) -> Option<Arc<Cursor>> {
        self.inner
            .lock()
            .expect("cursor registry lock poisoned")
            .get(cid)
            .cloned()
    }

    pub fn snapshot_keys(&self) -> Vec<CursorId> {
        self.inner
            .lock()
            .expect("cursor registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Idempotent removal.
    pub fn remove(&self, cid: &CursorId) {
        self.inner
            .lock()
            .expect("cursor registry lock poisoned")
            .remove(cid);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("cursor registry lock poisoned")
            .len()
    }
}
