//! Host wire format
//!
//! One JSON object per line in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vpnctl_core::{DispatchError, SessionSnapshot, SessionState};

/// `{"id": 7, "method": "start", "args": {...}}`
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Result of one request
#[derive(Debug, Serialize)]
pub struct Reply {
    /// `None` when the request line itself could not be read
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn success(id: u64, value: Value) -> Self {
        Self {
            id: Some(id),
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(id: u64, err: &DispatchError) -> Self {
        Self {
            id: Some(id),
            ok: false,
            value: None,
            error: Some(ErrorBody {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }

    /// Reply to a line that is not a valid request
    pub fn malformed(message: String) -> Self {
        Self {
            id: None,
            ok: false,
            value: None,
            error: Some(ErrorBody {
                code: "INVALID_ARGUMENT",
                message,
            }),
        }
    }
}

/// Snapshot pushed to the host whenever it changes
#[derive(Debug, Serialize)]
pub struct StatusEvent {
    pub event: &'static str,
    pub state: SessionState,
    pub upload: u64,
    pub download: u64,
    pub elapsed_secs: u64,
    pub any_vpn: bool,
}

impl From<&SessionSnapshot> for StatusEvent {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            event: "status",
            state: snapshot.state,
            upload: snapshot.stats.upload_bytes,
            download: snapshot.stats.download_bytes,
            elapsed_secs: snapshot.elapsed.as_secs(),
            any_vpn: snapshot.any_vpn_active,
        }
    }
}
