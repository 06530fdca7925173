//! REST surface and WebSocket relay endpoint.
//!
//! Every REST route is a thin mapping onto a router method; the handler runs
//! on the blocking pool against the single workspace connection.

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::auth::TokenIssuer;
use crate::ipc::{self, AppState, HandlerErr, Request};
use crate::relay::Relay;

pub struct Server {
    state: Mutex<AppState>,
    relay: Arc<Relay>,
    tokens: Arc<TokenIssuer>,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self {
            relay: Arc::clone(&state.relay),
            tokens: Arc::clone(&state.tokens),
            state: Mutex::new(state),
        }
    }
}

type Shared = Arc<Server>;

impl HandlerErr {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadParams(_)
            | Self::InvalidStatus { .. }
            | Self::DuplicateKey { .. }
            | Self::DuplicateAttendance
            | Self::ReferentialConflict(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::ProfileNotFound | Self::NotImplemented(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Unauthenticated | Self::TokenInvalid | Self::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NoWorkspace => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HandlerErr {
    fn into_response(self) -> Response {
        let mut error = json!({ "code": self.code(), "message": self.message() });
        if let Some(details) = self.details() {
            error["details"] = details;
        }
        (self.status_code(), Json(json!({ "error": error }))).into_response()
    }
}

/// `Authorization: Bearer <token>`; anything else counts as no token.
fn bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn build_params(
    body: &Bytes,
    query: HashMap<String, String>,
    id: Option<String>,
) -> Result<Value, HandlerErr> {
    let mut params = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) => return Err(HandlerErr::BadParams("body must be a JSON object".into())),
            Err(e) => return Err(HandlerErr::BadParams(format!("body is not valid JSON: {}", e))),
        }
    };
    for (k, v) in query {
        params.insert(k, Value::String(v));
    }
    if let Some(id) = id {
        params.insert("id".into(), Value::String(id));
    }
    Ok(Value::Object(params))
}

async fn call(
    server: Shared,
    method: &'static str,
    headers: HeaderMap,
    params: Result<Value, HandlerErr>,
    success: StatusCode,
) -> Response {
    let params = match params {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let req = Request {
        id: Uuid::new_v4().to_string(),
        method: method.to_string(),
        params,
        token: bearer(&headers),
    };
    let out = tokio::task::spawn_blocking(move || {
        let mut state = server.state.lock().unwrap_or_else(PoisonError::into_inner);
        ipc::dispatch(&mut state, &req)
    })
    .await;
    match out {
        Ok(Ok(result)) => (success, Json(result)).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(join) => {
            error!(method, error = %join, "handler task failed");
            HandlerErr::Unexpected(anyhow::anyhow!(join.to_string())).into_response()
        }
    }
}

type QueryMap = Query<HashMap<String, String>>;

fn read(method: &'static str) -> MethodRouter<Shared> {
    get(move |State(s): State<Shared>, h: HeaderMap, Query(q): QueryMap| {
        call(s, method, h, build_params(&Bytes::new(), q, None), StatusCode::OK)
    })
}

fn write(method: &'static str, success: StatusCode) -> MethodRouter<Shared> {
    post(move |State(s): State<Shared>, h: HeaderMap, body: Bytes| {
        call(s, method, h, build_params(&body, HashMap::new(), None), success)
    })
}

fn collection(list: &'static str, create: &'static str) -> MethodRouter<Shared> {
    read(list).merge(write(create, StatusCode::CREATED))
}

/// Routes for `/<things>/:id`; absent verbs fall through to 405.
fn item(
    get_method: Option<&'static str>,
    put_method: Option<&'static str>,
    delete_method: Option<&'static str>,
) -> MethodRouter<Shared> {
    let mut route = MethodRouter::new();
    if let Some(m) = get_method {
        route = route.get(move |State(s): State<Shared>, h: HeaderMap, Path(id): Path<String>| {
            call(s, m, h, build_params(&Bytes::new(), HashMap::new(), Some(id)), StatusCode::OK)
        });
    }
    if let Some(m) = put_method {
        route = route.put(
            move |State(s): State<Shared>, h: HeaderMap, Path(id): Path<String>, body: Bytes| {
                call(s, m, h, build_params(&body, HashMap::new(), Some(id)), StatusCode::OK)
            },
        );
    }
    if let Some(m) = delete_method {
        route = route.delete(move |State(s): State<Shared>, h: HeaderMap, Path(id): Path<String>| {
            call(s, m, h, build_params(&Bytes::new(), HashMap::new(), Some(id)), StatusCode::OK)
        });
    }
    route
}

pub fn router(server: Shared) -> Router {
    Router::new()
        .route("/api/health", read("health"))
        .route("/api/auth/bootstrap", write("auth.bootstrapAdmin", StatusCode::CREATED))
        .route("/api/auth/login", write("auth.login", StatusCode::OK))
        .route("/api/auth/me", read("auth.me"))
        .route("/api/auth/logout", write("auth.logout", StatusCode::OK))
        .route("/api/students", collection("students.list", "students.create"))
        .route(
            "/api/students/:id",
            item(Some("students.get"), Some("students.update"), Some("students.delete")),
        )
        .route("/api/teachers", collection("teachers.list", "teachers.create"))
        .route(
            "/api/teachers/:id",
            item(Some("teachers.get"), Some("teachers.update"), Some("teachers.delete")),
        )
        .route("/api/classes", collection("classes.list", "classes.create"))
        .route(
            "/api/classes/:id",
            item(Some("classes.get"), Some("classes.update"), Some("classes.delete")),
        )
        .route("/api/subjects", collection("subjects.list", "subjects.create"))
        .route("/api/subjects/:id", item(None, None, Some("subjects.delete")))
        .route("/api/assignments", collection("assignments.list", "assignments.create"))
        .route("/api/assignments/:id", item(None, None, Some("assignments.delete")))
        .route(
            "/api/attendance/students",
            collection("attendance.students.list", "attendance.students.create"),
        )
        .route(
            "/api/attendance/teachers",
            collection("attendance.teachers.list", "attendance.teachers.create"),
        )
        .route(
            "/api/notifications",
            collection("notifications.list", "notifications.create"),
        )
        .route(
            "/api/notifications/:id",
            item(
                Some("notifications.get"),
                Some("notifications.update"),
                Some("notifications.delete"),
            ),
        )
        .route("/api/dashboard", read("dashboard.get"))
        .route(
            "/api/settings",
            read("settings.get").put(move |State(s): State<Shared>, h: HeaderMap, body: Bytes| {
                call(s, "settings.update", h, build_params(&body, HashMap::new(), None), StatusCode::OK)
            }),
        )
        .route("/api/backup/export", write("backup.export", StatusCode::OK))
        .route("/api/backup/import", write("backup.import", StatusCode::OK))
        .route("/ws", get(ws_upgrade))
        .with_state(server)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    State(server): State<Shared>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let account_id = match q.token.or_else(|| bearer(&headers)) {
        None => None,
        Some(token) => match server.tokens.verify(&token, Utc::now().timestamp()) {
            Ok(claims) => Some(claims.sub),
            Err(_) => return HandlerErr::TokenInvalid.into_response(),
        },
    };
    ws.on_upgrade(move |socket| relay_session(server, socket, account_id))
}

async fn relay_session(server: Shared, mut socket: WebSocket, account_id: Option<String>) {
    let relay = Arc::clone(&server.relay);
    let (client_id, mut outbound) = relay.connect(account_id.as_deref());
    relay.emit_to_client(
        client_id,
        "connected",
        json!({ "clientId": client_id, "authenticated": account_id.is_some() }),
    );

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = relay.handle_client_frame(client_id, &text) {
                        debug!(client_id, error = %e, "rejected relay frame");
                        relay.emit_to_client(client_id, "error", json!({ "message": e.to_string() }));
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(client_id, error = %e, "failed to encode relay event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
    relay.disconnect(client_id);
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(Arc::new(Server::new(state)));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;
    info!("http server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use axum::http::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn error_status_codes() {
        assert_eq!(HandlerErr::BadParams("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(HandlerErr::DuplicateAttendance.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            HandlerErr::ReferentialConflict("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(HandlerErr::NotFound("student").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(HandlerErr::ProfileNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(HandlerErr::TokenInvalid.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(HandlerErr::InvalidCredentials.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(HandlerErr::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            HandlerErr::Unexpected(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bearer_header_parsing() {
        let mut h = HeaderMap::new();
        assert_eq!(bearer(&h), None);
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer(&h).as_deref(), Some("abc.def"));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer(&h), None);
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&h), None);
    }

    #[test]
    fn params_merge_body_query_and_path() {
        let mut q = HashMap::new();
        q.insert("unread".to_string(), "true".to_string());
        let p = build_params(&Bytes::from_static(br#"{"read":false}"#), q, Some("n1".into()))
            .expect("params");
        assert_eq!(p, json!({ "read": false, "unread": "true", "id": "n1" }));
        assert!(build_params(&Bytes::from_static(b"[1]"), HashMap::new(), None).is_err());
        assert!(build_params(&Bytes::from_static(b"{oops"), HashMap::new(), None).is_err());
    }

    async fn raw(
        addr: SocketAddr,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (u16, Value) {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let auth = token
            .map(|t| format!("Authorization: Bearer {}\r\n", t))
            .unwrap_or_default();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n{}Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            auth,
            body.len(),
            body
        );
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.expect("read");
        let text = String::from_utf8_lossy(&buf).to_string();
        let status: u16 = text
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status line");
        let (_, payload) = text.split_once("\r\n\r\n").expect("headers end");
        let json = serde_json::from_str(payload).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn rest_smoke_over_raw_tcp() {
        let ws = std::env::temp_dir().join(format!("schoold-http-{}", Uuid::new_v4()));
        let mut state = AppState::new(
            Arc::new(TokenIssuer::new(b"http-test", 3600)),
            Arc::new(Relay::new()),
        );
        state.db = Some(db::open_db(&ws).expect("open db"));
        state.workspace = Some(ws);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(Arc::new(Server::new(state)));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (status, body) = raw(addr, "GET", "/api/health", None, None).await;
        assert_eq!(status, 200);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

        let (status, body) = raw(addr, "GET", "/api/students", None, None).await;
        assert_eq!(status, 401);
        assert_eq!(body["error"]["code"], "unauthenticated");

        let admin = json!({ "name": "Admin", "email": "admin@school.id", "password": "admin123" });
        let (status, _) = raw(addr, "POST", "/api/auth/bootstrap", None, Some(admin)).await;
        assert_eq!(status, 201);

        let login = json!({ "role": "ADMIN", "email": "admin@school.id", "password": "admin123" });
        let (status, body) = raw(addr, "POST", "/api/auth/login", None, Some(login)).await;
        assert_eq!(status, 200);
        let token = body["token"].as_str().expect("token").to_string();

        let (status, body) =
            raw(addr, "POST", "/api/classes", Some(&token), Some(json!({ "name": "X-1" }))).await;
        assert_eq!(status, 201);
        let class_id = body["class"]["id"].as_str().expect("id").to_string();

        let (status, body) =
            raw(addr, "GET", &format!("/api/classes/{}", class_id), Some(&token), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["class"]["name"], "X-1");

        let (status, body) = raw(addr, "DELETE", "/api/classes/nope", Some(&token), None).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"]["code"], "not_found");

        let (status, body) =
            raw(addr, "GET", "/api/dashboard", Some("not-a-token"), None).await;
        assert_eq!(status, 401);
        assert_eq!(body["error"]["code"], "token_invalid");
    }
}
