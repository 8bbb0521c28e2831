//! Opaque identifiers for sessions and cursors.
//!
//! Ids are short random alphanumeric tokens. Collisions are treated as a
//! correctness concern: registries verify absence on insert and reject
//! duplicates rather than overwrite.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of generated tokens.
pub const TOKEN_LEN: usize = 16;

fn token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Unique identifier for a client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session id.
    pub fn generate() -> Self {
        Self(token())
    }

    /// Wrap an existing string (request decoding).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a cursor within its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorId(String);

impl CursorId {
    /// Create a new random cursor id.
    pub fn generate() -> Self {
        Self(token())
    }

    /// Wrap an existing string (request decoding).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CursorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for CursorId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
