//! Session registry and the idle-session sweeper.
//!
//! The registry maps session ids to live sessions behind one coarse
//! mutex. The mutex is never held across an await or a send to a
//! session; iteration snapshots keys first. The sweeper evicts sessions
//! whose last access is older than the session TTL by asking each one to
//! clean itself up, then dropping it from the map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::AgentError;
use crate::session::id::SessionId;
use crate::session::session::{Session, SessionCommand};

pub struct SessionRegistry {
    inner: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a session, rejecting id collisions.
    pub(crate) fn put(&self, session: Arc<Session>) -> Result<(), AgentError> {
        let mut inner = self.inner.lock().expect("session registry lock poisoned");
        if inner.contains_key(session.id()) {
            return Err(AgentError::Unrecoverable(
                "session id collision".to_string(),
            ));
        }
        inner.insert(session.id().clone(), session);
        Ok(())
    }

    /// Look up a session and advance its last-access timestamp.
    pub fn get(&self, sid: &SessionId) -> Result<Arc<Session>, AgentError> {
        let inner = self.inner.lock().expect("session registry lock poisoned");
        let session = inner.get(sid).ok_or(AgentError::InvalidSession)?.clone();
        drop(inner);
        session.touch();
        Ok(session)
    }

    /// Look up without touching; used by the sweeper so that checking a
    /// session for idleness does not keep it alive.
    pub(crate) fn peek(&self, sid: &SessionId) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .get(sid)
            .cloned()
    }

    pub fn snapshot_keys(&self) -> Vec<SessionId> {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Idempotent removal.
    pub fn remove(&self, sid: &SessionId) {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .remove(sid);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    ttl: Duration,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => sweep(&registry, ttl).await,
            }
        }
    })
}

/// One sweep round over a snapshot of session ids.
#[instrument(skip(registry))]
pub(crate) async fn sweep(registry: &SessionRegistry, ttl: Duration) {
    debug!("starting session sweep");
    for sid in registry.snapshot_keys() {
        // removed between snapshot and lookup
        let Some(session) = registry.peek(&sid) else {
            continue;
        };
        if session.idle_duration() <= ttl {
            continue;
        }

        info!(session_id = %sid, idle = ?session.idle_duration(), "evicting idle session");
        let (tx, rx) = oneshot::channel();
        if session.send(SessionCommand::Cleanup { reply: tx }).await.is_err() {
            warn!(session_id = %sid, "session inbox closed; skipping this round");
            continue;
        }
        if rx.await.is_err() {
            warn!(session_id = %sid, "session cleanup did not complete; skipping this round");
            continue;
        }
        registry.remove(&sid);
        debug!(session_id = %sid, "idle session removed");
    }
    debug!("session sweep done");
}
