//! The per-session worker task.
//!
//! One cooperative task bound to the session's inbox. Commands other than
//! CLEANUP are dispatched on their own tasks so a long fetch never blocks
//! the session; CLEANUP runs inline, tears every cursor down and ends the
//! loop, after which the pool is closed. The loop also ticks the
//! per-session cursor sweeper.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cursor::{Batch, Cursor, CursorMode, CursorRequest};
use crate::error::AgentError;
use crate::session::id::CursorId;
use crate::session::session::{FetchParams, Session, SessionCommand};
use crate::stream::{default_export_dir, RowSink};

/// Cursor lifecycle knobs handed to each session worker.
#[derive(Debug, Clone)]
pub(crate) struct CursorPolicy {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub export_dir: Option<PathBuf>,
}

pub(crate) fn spawn(
    session: Arc<Session>,
    rx: mpsc::Receiver<SessionCommand>,
    policy: CursorPolicy,
) {
    tokio::spawn(run(session, rx, policy));
}

async fn run(session: Arc<Session>, mut rx: mpsc::Receiver<SessionCommand>, policy: CursorPolicy) {
    debug!(session_id = %session.id(), "session worker started");
    let start = tokio::time::Instant::now() + policy.sweep_interval;
    let mut sweep = tokio::time::interval_at(start, policy.sweep_interval);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    SessionCommand::Cleanup { reply } => {
                        clear_cursors(&session);
                        let _ = reply.send(());
                        break;
                    }
                    command => {
                        session.touch();
                        let session = Arc::clone(&session);
                        let export_dir = policy.export_dir.clone();
                        tokio::spawn(dispatch(session, command, export_dir));
                    }
                }
            }
            _ = sweep.tick() => {
                sweep_idle_cursors(&session, policy.ttl);
            }
        }
    }

    session.token().cancel();
    session.pool().close().await;
    debug!(session_id = %session.id(), "session worker stopped");
}

/// Cancel and drop every cursor, live or failed.
fn clear_cursors(session: &Session) {
    for cid in session.cursors().snapshot_keys() {
        if let Some(cursor) = session.cursors().get_any(&cid) {
            cursor.cancel();
        }
        session.cursors().remove(&cid);
    }
}

fn sweep_idle_cursors(session: &Session, ttl: Duration) {
    for cid in session.cursors().snapshot_keys() {
        let Ok(cursor) = session.cursors().get(&cid) else {
            // gone or failed between snapshot and lookup
            continue;
        };
        if cursor.idle_duration() > ttl {
            info!(session_id = %session.id(), cursor_id = %cid, "evicting idle cursor");
            cursor.cancel();
            session.cursors().remove(&cid);
        }
    }
}

async fn dispatch(session: Arc<Session>, command: SessionCommand, export_dir: Option<PathBuf>) {
    match command {
        SessionCommand::SetDb { db, reply } => {
            let _ = reply.send(set_db(&session, &db).await);
        }
        SessionCommand::Query { sql, reply } => {
            let _ = reply.send(open_cursor(&session, sql, CursorMode::Read));
        }
        SessionCommand::Execute { sql, reply } => {
            let _ = reply.send(open_cursor(&session, sql, CursorMode::Mutate));
        }
        SessionCommand::Fetch { params, reply } => {
            let _ = reply.send(fetch(&session, params).await);
        }
        SessionCommand::FetchStream {
            params,
            export,
            sink,
            reply,
        } => {
            let _ = reply.send(fetch_stream(&session, params, export, sink, export_dir).await);
        }
        SessionCommand::Cancel { cid, reply } => {
            let _ = reply.send(cancel_cursor(&session, &cid));
        }
        // handled inline by the worker loop
        SessionCommand::Cleanup { .. } => {}
    }
}

/// Switching databases invalidates every open cursor.
async fn set_db(session: &Session, db: &str) -> Result<(), AgentError> {
    clear_cursors(session);
    let statement = format!("USE `{}`", db.replace('`', "``"));
    session
        .pool()
        .exec(&statement, session.token())
        .await
        .map(|_| ())
}

fn open_cursor(session: &Session, sql: String, mode: CursorMode) -> Result<CursorId, AgentError> {
    let cursor = match mode {
        CursorMode::Read => Cursor::spawn_read(sql, session.token(), Arc::clone(session.pool())),
        CursorMode::Mutate => Cursor::new_mutate(sql, session.token()),
    };
    let cid = cursor.id().clone();
    if let Err(err) = session.cursors().put(Arc::clone(&cursor)) {
        warn!(session_id = %session.id(), cursor_id = %cid, "cursor id collision");
        cursor.cancel();
        return Err(err);
    }
    debug!(session_id = %session.id(), cursor_id = %cid, "cursor opened");
    Ok(cid)
}

async fn fetch(session: &Session, params: FetchParams) -> Result<Batch, AgentError> {
    let cursor = session.cursors().get(&params.cid)?;
    cursor.touch();

    match cursor.mode() {
        CursorMode::Mutate => exec_mutate(session, &cursor, &params).await,
        CursorMode::Read => {
            let (tx, rx) = oneshot::channel();
            cursor
                .submit(CursorRequest::Fetch {
                    cid: params.cid.clone(),
                    limit: params.limit,
                    reply: tx,
                })
                .await?;
            let result = match rx.await {
                Ok(result) => result,
                // worker went away before answering
                Err(_) => Err(AgentError::Cancelled),
            };
            match &result {
                Ok(batch) if batch.eof => session.cursors().remove(cursor.id()),
                Err(_) => session.cursors().remove(cursor.id()),
                Ok(_) => {}
            }
            result
        }
    }
}

/// MUTATE one-shot: run the statement once, answer with a synthetic
/// `rows-affected` row, and drop the cursor unconditionally.
async fn exec_mutate(
    session: &Session,
    cursor: &Arc<Cursor>,
    params: &FetchParams,
) -> Result<Batch, AgentError> {
    if !cursor.claim_exec() {
        return Err(AgentError::InvalidCursor);
    }
    let result = session.pool().exec(cursor.query(), cursor.token()).await;
    session.cursors().remove(&params.cid);
    match result {
        Ok(affected) => Ok(Batch {
            rows: vec![vec!["rows-affected".to_string(), affected.to_string()]],
            eof: false,
        }),
        Err(err) => Err(err),
    }
}

async fn fetch_stream(
    session: &Session,
    params: FetchParams,
    export: bool,
    sink: Box<dyn RowSink>,
    export_dir: Option<PathBuf>,
) -> Result<(), AgentError> {
    let cursor = session.cursors().get(&params.cid)?;
    cursor.touch();
    if cursor.mode() == CursorMode::Mutate {
        return Err(AgentError::InvalidCursorCommand);
    }

    let export_to = export.then(|| export_dir.unwrap_or_else(default_export_dir));
    let (tx, rx) = oneshot::channel();
    cursor
        .submit(CursorRequest::FetchStream {
            cid: params.cid.clone(),
            limit: params.limit,
            export_to,
            sink,
            reply: tx,
        })
        .await?;
    let result = match rx.await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Cancelled),
    };
    // a drained stream keeps its cursor; only failure terminates it here
    if result.is_err() {
        session.cursors().remove(cursor.id());
    }
    result
}

fn cancel_cursor(session: &Session, cid: &CursorId) -> Result<(), AgentError> {
    let cursor = session.cursors().get(cid)?;
    info!(session_id = %session.id(), cursor_id = %cid, "cancelling cursor");
    cursor.cancel();
    session.cursors().remove(cid);
    Ok(())
}
