use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use berth_agent::{OrchestratorError, RconError, format_error_chain};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        }
    }
}

/// JSON error response: `{code, message, hint?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub payload: ErrorPayload,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: ErrorPayload::new(code, message, None),
        }
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.payload.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }
}

fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::AlreadyRunning(_)
        | OrchestratorError::NotRunning(_)
        | OrchestratorError::StillRunning(_)
        | OrchestratorError::AlreadyExists(_) => StatusCode::CONFLICT,
        OrchestratorError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Provision { .. }
        | OrchestratorError::Runtime(_)
        | OrchestratorError::Console(_) => StatusCode::BAD_GATEWAY,
    }
}

fn hint_for(err: &OrchestratorError) -> Option<&'static str> {
    match err {
        OrchestratorError::NotRunning(_) => Some("Start the server first."),
        OrchestratorError::StillRunning(_) => Some("Stop the server before deleting it."),
        OrchestratorError::Provision { .. } => {
            Some("Check the image build context and that the Docker daemon is reachable.")
        }
        OrchestratorError::Console(RconError::AuthRejected) => {
            Some("The server rejected the admin password.")
        }
        OrchestratorError::Console(RconError::Timeout(_)) => {
            Some("Check that RCON is enabled in the server settings.")
        }
        _ => None,
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self {
            status: status_for(&err),
            payload: ErrorPayload::new(
                err.code(),
                format_error_chain(&err),
                hint_for(&err).map(str::to_string),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.payload)).into_response()
    }
}
