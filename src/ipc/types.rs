use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::TokenIssuer;
use crate::relay::Relay;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Bearer token; the HTTP transport fills it from the `Authorization` header.
    #[serde(default)]
    pub token: Option<String>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub tokens: Arc<TokenIssuer>,
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(tokens: Arc<TokenIssuer>, relay: Arc<Relay>) -> Self {
        Self {
            workspace: None,
            db: None,
            tokens,
            relay,
        }
    }
}
