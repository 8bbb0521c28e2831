//! Row scanning and batching.
//!
//! Each row is flattened into the wire shape: an alternating sequence of
//! column name and value text. NULL values encode as the literal string
//! `"NULL"`; everything else is the raw bytes reinterpreted as UTF-8.

use crate::cursor::Batch;
use crate::driver::{RawRow, RowStream};
use crate::error::AgentError;

/// Pull up to `limit` rows off the stream.
///
/// `eof` is set when the stream ran dry before `limit` rows were
/// produced; a batch of exactly `limit` rows reports `eof: false` even if
/// the stream happens to be exhausted (the next fetch observes it).
pub(crate) async fn read_batch(
    stream: &mut dyn RowStream,
    limit: usize,
) -> Result<Batch, AgentError> {
    let mut rows = Vec::new();
    if limit == 0 {
        return Ok(Batch { rows, eof: false });
    }
    while rows.len() < limit {
        match stream.next_row().await? {
            Some(raw) => rows.push(flatten_row(raw)),
            None => return Ok(Batch { rows, eof: true }),
        }
    }
    Ok(Batch { rows, eof: false })
}

pub(crate) fn flatten_row(raw: RawRow) -> Vec<String> {
    let mut flat = Vec::with_capacity(raw.len() * 2);
    for column in raw {
        flat.push(column.name);
        flat.push(match column.value {
            None => "NULL".to_string(),
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    flat
}
