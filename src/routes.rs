//! HTTP surface: router, middleware, parameter decoding and handlers.
//!
//! Every endpoint is a GET with query-string parameters answering the
//! JSON envelope; `/fetch_ws` upgrades to a WebSocket and streams frames.
//! Handlers are thin adapters over [`Agent`] — parameter validation and
//! response shaping only.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

use crate::about;
use crate::config::AgentConfig;
use crate::driver::ConnSpec;
use crate::error::AgentError;
use crate::response::Envelope;
use crate::session::id::{CursorId, SessionId};
use crate::session::Agent;
use crate::stream::WsSink;

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub allowed_origin: String,
}

pub fn router(agent: Arc<Agent>, config: &AgentConfig) -> Router {
    let state = AppState {
        agent,
        allowed_origin: config.allowed_origin.clone(),
    };
    Router::new()
        .route("/about", get(about_handler))
        .route("/ping", get(ping))
        .route("/login", get(login))
        .route("/set-db", get(set_db))
        .route("/query", get(query))
        .route("/execute", get(execute))
        .route("/fetch", get(fetch))
        .route("/fetch_ws", get(fetch_ws))
        .route("/cancel", get(cancel))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}

/// Carry the caller's request id through a tracing span and reflect it.
async fn request_context(req: Request, next: Next) -> Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let span = info_span!("request", req_id = %req_id, path = %req.uri().path());
    let mut response = next.run(req).instrument(span).await;
    if req_id != "-" {
        if let Ok(value) = HeaderValue::from_str(&req_id) {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

async fn cors(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };
    let headers = response.headers_mut();
    if let Ok(origin) = HeaderValue::from_str(&state.allowed_origin) {
        headers.insert("access-control-allow-origin", origin);
    }
    headers.insert(
        "access-control-allow-credentials",
        HeaderValue::from_static("true"),
    );
    headers.insert(
        "access-control-allow-private-network",
        HeaderValue::from_static("true"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("X-Request-ID"),
    );
    response
}

fn success(data: serde_json::Value, eof: bool) -> Json<Envelope> {
    Json(Envelope::ok(data, eof))
}

fn failure(err: &AgentError) -> Json<Envelope> {
    Json(Envelope::error(err))
}

async fn about_handler() -> Json<Envelope> {
    success(
        json!({
            "device-id": about::device_id(),
            "version": about::version(),
            "os": about::os(),
        }),
        false,
    )
}

async fn ping(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    let spec = match conn_spec(&params) {
        Ok(spec) => spec,
        Err(err) => return failure(&err),
    };
    match state.agent.ping(&spec).await {
        Ok(()) => success(serde_json::Value::Null, false),
        Err(err) => failure(&err),
    }
}

async fn login(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    let spec = match conn_spec(&params) {
        Ok(spec) => spec,
        Err(err) => return failure(&err),
    };
    match state.agent.login(&spec).await {
        Ok(sid) => success(json!({ "session-id": sid.to_string() }), false),
        Err(err) => failure(&err),
    }
}

async fn set_db(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    let parsed = (|| -> Result<(SessionId, String), AgentError> {
        let sid = required(&params, "session-id", "Session ID not provided")?;
        let db = required(&params, "db", "Database not provided")?;
        Ok((SessionId::from_string(sid.to_string()), db.to_string()))
    })();
    match parsed {
        Ok((sid, db)) => match state.agent.set_db(&sid, &db).await {
            Ok(()) => success(serde_json::Value::Null, false),
            Err(err) => failure(&err),
        },
        Err(err) => failure(&err),
    }
}

async fn query(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    open_cursor(state, params, false).await
}

async fn execute(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    open_cursor(state, params, true).await
}

async fn open_cursor(
    state: AppState,
    params: HashMap<String, String>,
    mutate: bool,
) -> Json<Envelope> {
    let parsed = query_params(&params);
    match parsed {
        Ok((sid, sql)) => {
            let result = if mutate {
                state.agent.execute(&sid, &sql).await
            } else {
                state.agent.query(&sid, &sql).await
            };
            match result {
                Ok(cid) => success(json!({ "cursor-id": cid.to_string() }), false),
                Err(err) => failure(&err),
            }
        }
        Err(err) => failure(&err),
    }
}

async fn fetch(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    let parsed = fetch_params(&params);
    match parsed {
        Ok((sid, cid, limit)) => match state.agent.fetch(&sid, &cid, limit).await {
            Ok(batch) => success(json!(batch.rows), batch.eof),
            Err(err) => failure(&err),
        },
        Err(err) => failure(&err),
    }
}

async fn cancel(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    let parsed = (|| -> Result<(SessionId, CursorId), AgentError> {
        let sid = required(&params, "session-id", "Session ID not provided")?;
        let cid = required(&params, "cursor-id", "Cursor ID not provided")?;
        Ok((
            SessionId::from_string(sid.to_string()),
            CursorId::from_string(cid.to_string()),
        ))
    })();
    match parsed {
        Ok((sid, cid)) => match state.agent.cancel(&sid, &cid).await {
            Ok(()) => success(serde_json::Value::Null, false),
            Err(err) => failure(&err),
        },
        Err(err) => failure(&err),
    }
}

async fn fetch_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_fetch_ws(state, params, socket))
}

async fn handle_fetch_ws(state: AppState, params: HashMap<String, String>, socket: WebSocket) {
    // the websocket route carries its request id as a query parameter
    let req_id = params.get("req-id").cloned().unwrap_or_else(|| "-".to_string());
    let span = info_span!("fetch_ws", req_id = %req_id);
    async move {
        let socket = Arc::new(Mutex::new(socket));
        match fetch_params(&params) {
            Ok((sid, cid, limit)) => {
                let export = params.contains_key("export");
                let sink = WsSink::new(Arc::clone(&socket));
                if let Err(err) = state
                    .agent
                    .fetch_stream(&sid, &cid, limit, export, Box::new(sink))
                    .await
                {
                    send_ws_error(&socket, &err).await;
                }
            }
            Err(err) => send_ws_error(&socket, &err).await,
        }
    }
    .instrument(span)
    .await
}

async fn send_ws_error(socket: &Arc<Mutex<WebSocket>>, err: &AgentError) {
    if let Ok(text) = serde_json::to_string(&Envelope::error(err)) {
        let _ = socket.lock().await.send(Message::Text(text)).await;
    }
}

fn required<'a>(
    params: &'a HashMap<String, String>,
    key: &str,
    missing: &str,
) -> Result<&'a str, AgentError> {
    match params.get(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(AgentError::UserInput(missing.to_string())),
    }
}

fn conn_spec(params: &HashMap<String, String>) -> Result<ConnSpec, AgentError> {
    let user = required(params, "user", "User not provided")?;
    let pass = required(params, "pass", "Password not provided")?;
    let host = required(params, "host", "Host not provided")?;
    let port = required(params, "port", "Port not provided")?;
    let port: u16 = port
        .parse()
        .map_err(|_| AgentError::UserInput("Port must be an integer".to_string()))?;
    Ok(ConnSpec {
        user: user.to_string(),
        pass: pass.to_string(),
        host: host.to_string(),
        port,
        db: params.get("db").filter(|db| !db.is_empty()).cloned(),
    })
}

fn query_params(params: &HashMap<String, String>) -> Result<(SessionId, String), AgentError> {
    let sid = required(params, "session-id", "Session ID not provided")?;
    let sql = required(params, "query", "Query not provided")?;
    Ok((SessionId::from_string(sid.to_string()), sql.to_string()))
}

fn fetch_params(
    params: &HashMap<String, String>,
) -> Result<(SessionId, CursorId, usize), AgentError> {
    let sid = required(params, "session-id", "Session ID not provided")?;
    let cid = required(params, "cursor-id", "Cursor ID not provided")?;
    let num = required(params, "num-of-rows", "Number of rows not provided")?;
    let limit: usize = num
        .parse()
        .map_err(|_| AgentError::UserInput("Number of rows must be an integer".to_string()))?;
    Ok((
        SessionId::from_string(sid.to_string()),
        CursorId::from_string(cid.to_string()),
        limit,
    ))
}
