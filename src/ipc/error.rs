use serde_json::{json, Value};
use thiserror::Error;

pub fn ok(id: &str, result: Value) -> Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Failure of a single request, shared by both transports.
#[derive(Debug, Error)]
pub enum HandlerErr {
    #[error("{0}")]
    BadParams(String),
    #[error("invalid status {status:?}")]
    InvalidStatus {
        status: String,
        allowed: &'static [&'static str],
    },
    #[error("{field} already exists")]
    DuplicateKey { field: String },
    #[error("attendance already recorded for this date")]
    DuplicateAttendance,
    #[error("{0}")]
    ReferentialConflict(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("profile not found")]
    ProfileNotFound,
    #[error("missing or malformed bearer token")]
    Unauthenticated,
    #[error("token is invalid or expired")]
    TokenInvalid,
    #[error("credentials incorrect")]
    InvalidCredentials,
    #[error("{0}")]
    Forbidden(String),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("unknown method: {0}")]
    NotImplemented(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unexpected(e.into())
    }
}

impl HandlerErr {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams(_) => "bad_params",
            Self::InvalidStatus { .. } => "invalid_status",
            Self::DuplicateKey { .. } => "duplicate_key",
            Self::DuplicateAttendance => "duplicate_attendance",
            Self::ReferentialConflict(_) => "referential_conflict",
            Self::NotFound(_) => "not_found",
            Self::ProfileNotFound => "profile_not_found",
            Self::Unauthenticated => "unauthenticated",
            Self::TokenInvalid => "token_invalid",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Forbidden(_) => "forbidden",
            Self::NoWorkspace => "no_workspace",
            Self::NotImplemented(_) => "not_implemented",
            Self::Unexpected(_) => "internal",
        }
    }

    /// Caller-facing message. Unexpected failures never leak their cause.
    pub fn message(&self) -> String {
        match self {
            Self::Unexpected(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::DuplicateKey { field } => Some(json!({ "field": field })),
            Self::InvalidStatus { allowed, .. } => Some(json!({ "allowed": allowed })),
            _ => None,
        }
    }

    pub fn response(&self, id: &str) -> Value {
        err(id, self.code(), self.message(), self.details())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_errors_hide_their_cause() {
        let e = HandlerErr::from(anyhow::anyhow!("disk I/O error at page 7"));
        let resp = e.response("r1");
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["code"], "internal");
        assert_eq!(resp["error"]["message"], "internal error");
    }

    #[test]
    fn duplicate_key_names_the_field() {
        let resp = HandlerErr::DuplicateKey {
            field: "nisn".into(),
        }
        .response("r2");
        assert_eq!(resp["error"]["code"], "duplicate_key");
        assert_eq!(resp["error"]["details"]["field"], "nisn");
        assert_eq!(resp["error"]["message"], "nisn already exists");
    }
}
