//! JSON response envelope and streaming frame types.
//!
//! Plain endpoints answer with an [`Envelope`]; the WebSocket fetch route
//! emits one [`Frame`] per message.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::error::AgentError;
use crate::session::id::CursorId;

/// Envelope returned by every plain HTTP endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: String,
    pub msg: String,
    #[serde(rename = "error-code")]
    pub error_code: String,
    pub data: Value,
    pub eof: bool,
}

impl Envelope {
    pub fn ok(data: Value, eof: bool) -> Self {
        Self {
            status: "ok".to_string(),
            msg: String::new(),
            error_code: String::new(),
            data,
            eof,
        }
    }

    pub fn error(err: &AgentError) -> Self {
        Self {
            status: "error".to_string(),
            msg: err.to_string(),
            error_code: err.code().to_string(),
            data: Value::Null,
            eof: false,
        }
    }
}

/// One WebSocket message: `{"k": [...]}`.
///
/// Row frames carry the flat alternating column/value array; control
/// frames carry the `eos`, `header` and `current-row` markers.
#[derive(Debug, Serialize)]
pub struct Frame {
    pub k: Vec<String>,
}

impl Frame {
    pub fn row(values: Vec<String>) -> Self {
        Self { k: values }
    }

    /// Stream terminator, sent after the last row.
    pub fn eos() -> Self {
        Self {
            k: vec!["eos".to_string()],
        }
    }

    /// First frame of an export: cursor id plus the file being written.
    pub fn header(cursor_id: &CursorId, path: &Path) -> Self {
        Self {
            k: vec![
                "header".to_string(),
                cursor_id.to_string(),
                path.display().to_string(),
            ],
        }
    }

    /// Export progress marker.
    pub fn progress(rows: usize) -> Self {
        Self {
            k: vec!["current-row".to_string(), rows.to_string()],
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("frame serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;

    #[test]
    fn ok_envelope_shape() {
        let env = Envelope::ok(json!([["a", "1"]]), true);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "ok",
                "msg": "",
                "error-code": "",
                "data": [["a", "1"]],
                "eof": true,
            })
        );
    }

    #[test]
    fn error_envelope_carries_code_and_message() {
        let env = Envelope::error(&AgentError::InvalidSession);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error-code"], "invalid-session-id");
        assert_eq!(value["msg"], "unknown session id");
        assert_eq!(value["data"], Value::Null);
    }

    #[test]
    fn frame_shapes() {
        assert_eq!(Frame::eos().to_text(), r#"{"k":["eos"]}"#);
        assert_eq!(
            Frame::row(vec!["id".into(), "1".into()]).to_text(),
            r#"{"k":["id","1"]}"#
        );
        assert_eq!(Frame::progress(2000).to_text(), r#"{"k":["current-row","2000"]}"#);

        let cid = CursorId::from_string("abc".to_string());
        let frame = Frame::header(&cid, &PathBuf::from("/tmp/out.csv"));
        assert_eq!(frame.to_text(), r#"{"k":["header","abc","/tmp/out.csv"]}"#);
    }
}
