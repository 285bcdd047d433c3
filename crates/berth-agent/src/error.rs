use berth_types::ServerId;

use crate::{rcon::RconError, runtime::RuntimeError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("server {0} is not registered")]
    NotFound(ServerId),
    #[error("server {0} is already running")]
    AlreadyRunning(ServerId),
    #[error("server {0} is not running")]
    NotRunning(ServerId),
    #[error("server {0} is still running; stop it first")]
    StillRunning(ServerId),
    #[error("server {0} already exists")]
    AlreadyExists(ServerId),
    #[error("invalid server config: {0}")]
    InvalidConfig(String),
    #[error("failed to provision image `{image}`: {reason}")]
    Provision { image: String, reason: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Console(#[from] RconError),
}

impl OrchestratorError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::AlreadyRunning(_) => "already_running",
            OrchestratorError::NotRunning(_) => "not_running",
            OrchestratorError::StillRunning(_) => "still_running",
            OrchestratorError::AlreadyExists(_) => "already_exists",
            OrchestratorError::InvalidConfig(_) => "invalid_config",
            OrchestratorError::Provision { .. } => "provision_failed",
            OrchestratorError::Runtime(_) => "runtime_error",
            OrchestratorError::Console(_) => "console_error",
        }
    }

    /// Caller precondition, as opposed to a failure in the runtime or the workload.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            OrchestratorError::NotFound(_)
                | OrchestratorError::AlreadyRunning(_)
                | OrchestratorError::NotRunning(_)
                | OrchestratorError::StillRunning(_)
                | OrchestratorError::AlreadyExists(_)
                | OrchestratorError::InvalidConfig(_)
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let id = ServerId::parse("alpha").unwrap();
        assert_eq!(OrchestratorError::NotFound(id.clone()).code(), "not_found");
        assert_eq!(
            OrchestratorError::StillRunning(id).code(),
            "still_running"
        );
        let err = OrchestratorError::from(RuntimeError::NotFound {
            target: "abc".to_string(),
        });
        assert_eq!(err.code(), "runtime_error");
        assert!(!err.is_precondition());
    }

    #[test]
    fn messages_name_the_server() {
        let err = OrchestratorError::AlreadyRunning(ServerId::parse("alpha").unwrap());
        assert_eq!(err.to_string(), "server alpha is already running");
    }
}
