//! Cursors: one per query, owned by a session.
//!
//! A READ cursor wraps an open row stream and a worker task that advances
//! it one fetch at a time; a MUTATE cursor is a one-shot exec handled
//! inline by its session.

mod cursor;
pub(crate) mod scan;
mod worker;

pub use cursor::{Batch, Cursor, CursorMode, CursorState};
pub(crate) use cursor::{CursorRegistry, CursorRequest};
