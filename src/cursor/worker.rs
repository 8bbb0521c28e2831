//! The per-cursor worker task.
//!
//! One task per READ cursor, waiting on either the cursor's inbox or its
//! cancellation token. Requests are processed strictly one at a time
//! (single-flight); the first fetch opens the row stream, later fetches
//! advance it. The worker exits — closing the stream — on EOF, on error,
//! or when the cursor's context is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cursor::cursor::{Cursor, CursorRequest, CursorState};
use crate::cursor::scan;
use crate::cursor::Batch;
use crate::driver::{DbPool, RowStream};
use crate::error::AgentError;
use crate::session::id::CursorId;
use crate::stream::{self, RowSink};

/// How often the watchdog refreshes the cursor's last-access while a
/// request is being processed, so sweepers do not evict a cursor that is
/// legitimately waiting on the database.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

pub(crate) fn spawn(
    cursor: Arc<Cursor>,
    pool: Arc<dyn DbPool>,
    rx: mpsc::Receiver<CursorRequest>,
) {
    tokio::spawn(run(cursor, pool, rx));
}

async fn run(cursor: Arc<Cursor>, pool: Arc<dyn DbPool>, mut rx: mpsc::Receiver<CursorRequest>) {
    debug!(cursor_id = %cursor.id(), "cursor worker started");
    let mut stream: Option<Box<dyn RowStream>> = None;

    loop {
        tokio::select! {
            _ = cursor.token().cancelled() => {
                cursor.set_state(CursorState::Cancelled);
                break;
            }
            request = rx.recv() => {
                let Some(request) = request else { break };
                cursor.touch();
                let watchdog = Watchdog::start(cursor.clone());
                let terminal = handle_request(&cursor, &pool, &mut stream, request).await;
                drop(watchdog);
                if terminal {
                    break;
                }
            }
        }
    }

    cursor.set_state(CursorState::Terminated);
    // dropping the stream closes the row iterator
    drop(stream);
    debug!(cursor_id = %cursor.id(), "cursor worker stopped");
}

/// Process one request; returns true when the cursor is done for good.
async fn handle_request(
    cursor: &Cursor,
    pool: &Arc<dyn DbPool>,
    stream: &mut Option<Box<dyn RowStream>>,
    request: CursorRequest,
) -> bool {
    match request {
        CursorRequest::Fetch { cid, limit, reply } => {
            let result = fetch_batch(cursor, pool, stream, &cid, limit).await;
            let terminal = match &result {
                Ok(batch) => batch.eof,
                Err(_) => true,
            };
            let _ = reply.send(result);
            terminal
        }
        CursorRequest::FetchStream {
            cid,
            limit,
            export_to,
            mut sink,
            reply,
        } => {
            let result =
                stream_batch(cursor, pool, stream, &cid, limit, export_to, sink.as_mut()).await;
            let terminal = result.is_err();
            let _ = reply.send(result);
            terminal
        }
    }
}

async fn stream_batch(
    cursor: &Cursor,
    pool: &Arc<dyn DbPool>,
    stream: &mut Option<Box<dyn RowStream>>,
    cid: &CursorId,
    limit: usize,
    export_to: Option<std::path::PathBuf>,
    sink: &mut dyn RowSink,
) -> Result<(), AgentError> {
    if cid != cursor.id() {
        return Err(AgentError::InvalidCursor);
    }
    ensure_stream(cursor, pool, stream).await?;
    let open = stream.as_deref_mut().expect("stream opened above");
    match stream::stream_rows(open, limit, sink, export_to.as_deref(), cid).await {
        Ok(()) => Ok(()),
        Err(err) => {
            cursor.set_sticky(err.clone());
            Err(err)
        }
    }
}

async fn fetch_batch(
    cursor: &Cursor,
    pool: &Arc<dyn DbPool>,
    stream: &mut Option<Box<dyn RowStream>>,
    cid: &CursorId,
    limit: usize,
) -> Result<Batch, AgentError> {
    // defensive check against mis-routed fetch requests
    if cid != cursor.id() {
        return Err(AgentError::InvalidCursor);
    }
    ensure_stream(cursor, pool, stream).await?;
    let open = stream.as_deref_mut().expect("stream opened above");
    match scan::read_batch(open, limit).await {
        Ok(batch) => Ok(batch),
        Err(err) => {
            cursor.set_sticky(err.clone());
            Err(err)
        }
    }
}

/// Open the row stream on the first fetch; later fetches reuse it.
async fn ensure_stream(
    cursor: &Cursor,
    pool: &Arc<dyn DbPool>,
    stream: &mut Option<Box<dyn RowStream>>,
) -> Result<(), AgentError> {
    if stream.is_some() {
        return Ok(());
    }
    cursor.set_state(CursorState::Running);
    debug!(cursor_id = %cursor.id(), "opening row stream");
    match pool.query(cursor.query(), cursor.token()).await {
        Ok(open) => {
            *stream = Some(open);
            cursor.set_state(CursorState::Draining);
            Ok(())
        }
        Err(err) => {
            cursor.set_sticky(err.clone());
            Err(err)
        }
    }
}

/// Keeps the cursor's last-access fresh for the duration of one request.
struct Watchdog {
    handle: JoinHandle<()>,
}

impl Watchdog {
    fn start(cursor: Arc<Cursor>) -> Self {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + WATCHDOG_PERIOD;
            let mut ticker = tokio::time::interval_at(start, WATCHDOG_PERIOD);
            loop {
                ticker.tick().await;
                cursor.touch();
            }
        });
        Self { handle }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
