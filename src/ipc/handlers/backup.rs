use crate::backup;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{authorize, required_str, ADMIN_ONLY};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};

fn handle_export(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    authorize(state, req, ADMIN_ONLY)?;
    let workspace = state.workspace.as_ref().ok_or(HandlerErr::NoWorkspace)?;
    let out_path = PathBuf::from(required_str(&req.params, "outPath")?);
    let summary = backup::export_database(workspace, &out_path)?;
    info!(out = %out_path.display(), sha256 = %summary.db_sha256, "database exported");
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "dbSha256": summary.db_sha256,
        "dbBytes": summary.db_bytes,
    }))
}

fn handle_import(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    authorize(state, req, ADMIN_ONLY)?;
    let workspace = state.workspace.clone().ok_or(HandlerErr::NoWorkspace)?;
    let in_path = PathBuf::from(required_str(&req.params, "inPath")?);

    // The file is swapped underneath SQLite, so the live connection goes first.
    state.db = None;
    let imported = backup::import_database(&in_path, &workspace);
    let reopened = db::open_db(&workspace);
    match reopened {
        Ok(conn) => state.db = Some(conn),
        Err(e) => {
            warn!(error = ?e, "workspace could not be reopened after import");
            return Err(e.into());
        }
    }
    let summary = imported?;
    info!(source = %in_path.display(), format = %summary.bundle_format_detected, "database imported");
    Ok(json!({
        "ok": true,
        "bundleFormatDetected": summary.bundle_format_detected,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    match req.method.as_str() {
        "backup.export" => Some(handle_export(state, req)),
        "backup.import" => Some(handle_import(state, req)),
        _ => None,
    }
}
