//! Streaming transport: row frames over a sink, with optional CSV export.
//!
//! The cursor worker drives [`stream_rows`]; the engine only sees the
//! [`RowSink`] trait, so tests substitute a collecting sink and the HTTP
//! layer plugs in a WebSocket.

mod export;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use tokio::sync::Mutex;

use crate::cursor::scan::flatten_row;
use crate::driver::RowStream;
use crate::error::AgentError;
use crate::response::Frame;
use crate::session::id::CursorId;

pub(crate) use export::{default_export_dir, ExportSink};

/// Export progress frames are emitted every this many rows.
const PROGRESS_EVERY: usize = 1000;

/// Where streamed frames go.
#[async_trait]
pub trait RowSink: Send + 'static {
    async fn send_text(&mut self, payload: String) -> Result<(), AgentError>;
}

/// WebSocket-backed sink.
///
/// The socket is shared so the HTTP layer can still report a terminal
/// error on it after the cursor is done with the sink.
pub struct WsSink {
    socket: Arc<Mutex<WebSocket>>,
}

impl WsSink {
    pub fn new(socket: Arc<Mutex<WebSocket>>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl RowSink for WsSink {
    async fn send_text(&mut self, payload: String) -> Result<(), AgentError> {
        self.socket
            .lock()
            .await
            .send(Message::Text(payload))
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))
    }
}

/// Stream up to `limit` rows into the sink, ending with the `eos` frame.
///
/// Without export every row becomes a `{"k":[col,val,…]}` frame. With
/// export the values go to a CSV file instead, and the stream carries the
/// header frame (first row), a progress frame every thousand rows, and a
/// final progress frame when fewer than a thousand rows were written.
pub(crate) async fn stream_rows(
    stream: &mut dyn RowStream,
    limit: usize,
    sink: &mut dyn RowSink,
    export_to: Option<&Path>,
    cursor_id: &CursorId,
) -> Result<(), AgentError> {
    let mut export = match export_to {
        Some(dir) => Some(ExportSink::create(dir)?),
        None => None,
    };

    let mut sent = 0usize;
    while sent < limit {
        let Some(raw) = stream.next_row().await? else {
            break;
        };
        let flat = flatten_row(raw);
        sent += 1;
        match export.as_mut() {
            Some(sink_file) => {
                sink_file.write_row(&flat)?;
                if sent == 1 {
                    sink.send_text(Frame::header(cursor_id, sink_file.path()).to_text())
                        .await?;
                }
                if sent % PROGRESS_EVERY == 0 {
                    sink.send_text(Frame::progress(sent).to_text()).await?;
                }
            }
            None => {
                sink.send_text(Frame::row(flat).to_text()).await?;
            }
        }
    }

    if let Some(sink_file) = export.as_mut() {
        if sent < PROGRESS_EVERY {
            sink.send_text(Frame::progress(sent).to_text()).await?;
        }
        sink_file.flush()?;
    }

    sink.send_text(Frame::eos().to_text()).await
}

#[cfg(test)]
pub(crate) struct CollectSink {
    pub frames: Arc<std::sync::Mutex<Vec<String>>>,
    pub fail_after: Option<usize>,
}

#[cfg(test)]
impl CollectSink {
    pub fn new() -> (Self, Arc<std::sync::Mutex<Vec<String>>>) {
        let frames = Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Self {
                frames: frames.clone(),
                fail_after: None,
            },
            frames,
        )
    }

    pub fn failing_after(n: usize) -> (Self, Arc<std::sync::Mutex<Vec<String>>>) {
        let (mut sink, frames) = Self::new();
        sink.fail_after = Some(n);
        (sink, frames)
    }
}

#[cfg(test)]
#[async_trait]
impl RowSink for CollectSink {
    async fn send_text(&mut self, payload: String) -> Result<(), AgentError> {
        let mut frames = self.frames.lock().expect("collect sink mutex poisoned");
        if let Some(limit) = self.fail_after {
            if frames.len() >= limit {
                return Err(AgentError::Transport("sink closed".to_string()));
            }
        }
        frames.push(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::driver::{RawColumn, RawRow};

    struct FixedStream {
        rows: VecDeque<RawRow>,
    }

    impl FixedStream {
        fn new(count: usize) -> Self {
            Self {
                rows: (0..count)
                    .map(|i| {
                        vec![RawColumn {
                            name: "n".to_string(),
                            value: Some(i.to_string().into_bytes()),
                        }]
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl RowStream for FixedStream {
        async fn next_row(&mut self) -> Result<Option<RawRow>, AgentError> {
            Ok(self.rows.pop_front())
        }
    }

    #[tokio::test]
    async fn frames_then_eos() {
        let mut stream = FixedStream::new(3);
        let (mut sink, frames) = CollectSink::new();
        let cid = CursorId::generate();
        stream_rows(&mut stream, 5, &mut sink, None, &cid)
            .await
            .unwrap();

        let frames = frames.lock().unwrap();
        assert_eq!(
            *frames,
            vec![
                r#"{"k":["n","0"]}"#,
                r#"{"k":["n","1"]}"#,
                r#"{"k":["n","2"]}"#,
                r#"{"k":["eos"]}"#,
            ]
        );
    }

    #[tokio::test]
    async fn empty_result_sends_only_eos() {
        let mut stream = FixedStream::new(0);
        let (mut sink, frames) = CollectSink::new();
        let cid = CursorId::generate();
        stream_rows(&mut stream, 5, &mut sink, None, &cid)
            .await
            .unwrap();
        assert_eq!(*frames.lock().unwrap(), vec![r#"{"k":["eos"]}"#]);
    }

    #[tokio::test]
    async fn limit_bounds_the_stream() {
        let mut stream = FixedStream::new(10);
        let (mut sink, frames) = CollectSink::new();
        let cid = CursorId::generate();
        stream_rows(&mut stream, 4, &mut sink, None, &cid)
            .await
            .unwrap();
        // 4 row frames + eos
        assert_eq!(frames.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn sink_failure_propagates_as_transport_error() {
        let mut stream = FixedStream::new(3);
        let (mut sink, _frames) = CollectSink::failing_after(1);
        let cid = CursorId::generate();
        let err = stream_rows(&mut stream, 5, &mut sink, None, &cid)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unrecoverable-error");
    }

    #[tokio::test]
    async fn export_replaces_row_frames_with_progress_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = FixedStream::new(3);
        let (mut sink, frames) = CollectSink::new();
        let cid = CursorId::generate();
        stream_rows(&mut stream, 10, &mut sink, Some(dir.path()), &cid)
            .await
            .unwrap();

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].contains(r#""header""#));
        assert!(frames[0].contains(cid.as_ref()));
        assert_eq!(frames[1], r#"{"k":["current-row","3"]}"#);
        assert_eq!(frames[2], r#"{"k":["eos"]}"#);

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let contents = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        // header row plus one line per exported row, values only
        assert_eq!(contents.lines().collect::<Vec<_>>(), vec!["n", "0", "1", "2"]);
    }

    #[tokio::test]
    async fn export_of_empty_result_reports_zero_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = FixedStream::new(0);
        let (mut sink, frames) = CollectSink::new();
        let cid = CursorId::generate();
        stream_rows(&mut stream, 10, &mut sink, Some(dir.path()), &cid)
            .await
            .unwrap();
        let frames = frames.lock().unwrap();
        assert_eq!(
            *frames,
            vec![r#"{"k":["current-row","0"]}"#, r#"{"k":["eos"]}"#]
        );
    }
}
