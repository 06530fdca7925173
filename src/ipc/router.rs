use serde_json::Value;
use tracing::{debug, error};

use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::{ok, HandlerErr};

type Family = fn(&mut AppState, &Request) -> Option<Result<Value, HandlerErr>>;

const FAMILIES: &[Family] = &[
    handlers::core::try_handle,
    handlers::auth::try_handle,
    handlers::students::try_handle,
    handlers::teachers::try_handle,
    handlers::classes::try_handle,
    handlers::subjects::try_handle,
    handlers::attendance::try_handle,
    handlers::notifications::try_handle,
    handlers::dashboard::try_handle,
    handlers::settings::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> Value {
    match dispatch(state, &req) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn dispatch(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    debug!(id = %req.id, method = %req.method, "request");
    let out = FAMILIES
        .iter()
        .find_map(|family| family(state, req))
        .unwrap_or_else(|| Err(HandlerErr::NotImplemented(req.method.clone())));
    if let Err(HandlerErr::Unexpected(e)) = &out {
        error!(id = %req.id, method = %req.method, error = ?e, "request failed");
    }
    out
}
