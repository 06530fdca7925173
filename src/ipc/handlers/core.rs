use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

fn handle_health(state: &AppState) -> Result<Value, HandlerErr> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "relayClients": state.relay.client_count(),
    }))
}

fn handle_workspace_select(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let path = PathBuf::from(required_str(params, "path")?);
    let conn = db::open_db(&path)?;
    info!(workspace = %path.display(), "workspace opened");
    state.db = Some(conn);
    state.workspace = Some(path.clone());
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    match req.method.as_str() {
        "health" => Some(handle_health(state)),
        "workspace.select" => Some(handle_workspace_select(state, &req.params)),
        _ => None,
    }
}
