//! The line-delimited JSON envelope (spec §6 "Stratum wire protocol"):
//! requests and responses carry an `id`, notifications don't. Every
//! outbound line is newline-terminated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A client → server request. `id` is forwarded verbatim on the response.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<(i32, String, Option<String>)>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: &StratumError) -> Self {
        Response {
            id,
            result: None,
            error: Some((error.code(), error.message(), None)),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{}\n", serde_json::to_string(self).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub method: &'static str,
    pub params: Vec<Value>,
}

impl Notification {
    pub fn to_line(&self) -> String {
        format!("{}\n", serde_json::to_string(self).unwrap_or_default())
    }
}

/// Stratum wire error codes (spec §6 table).
#[derive(Debug, Clone, Error)]
pub enum StratumError {
    #[error("unknown error: {0}")]
    Unknown(String),
    #[error("job not found")]
    JobNotFound,
    #[error("duplicate share")]
    DuplicateShare,
    #[error("low difficulty share")]
    LowDifficultyShare,
    #[error("unauthorized worker")]
    UnauthorizedWorker,
    #[error("not subscribed")]
    NotSubscribed,
}

impl StratumError {
    pub fn code(&self) -> i32 {
        match self {
            StratumError::Unknown(_) => 20,
            StratumError::JobNotFound => 21,
            StratumError::DuplicateShare => 22,
            StratumError::LowDifficultyShare => 23,
            StratumError::UnauthorizedWorker => 24,
            StratumError::NotSubscribed => 25,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}
