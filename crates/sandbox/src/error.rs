use crate::types::{SandboxId, SandboxStatus};

/// Errors surfaced by every sandbox provider.
///
/// Backend failures (CLI exit codes, I/O errors, parse errors) are folded into
/// one of these variants at the provider boundary; callers never see a raw
/// backend error. A command that runs past its timeout is not an error, see
/// [`ExecResult::timed_out`](crate::ExecResult::timed_out).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("sandbox start failed: {0}")]
    StartFailed(String),

    #[error("sandbox stop failed: {0}")]
    StopFailed(String),

    #[error("sandbox removal failed: {0}")]
    RemovalFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("cannot {operation} sandbox {id} while {status}")]
    InvalidState {
        id: SandboxId,
        status: SandboxStatus,
        operation: &'static str,
    },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("copy failed: {0}")]
    CopyFailed(String),

    #[error("resource stats failed: {0}")]
    StatsFailed(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),
}

impl SandboxError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::CreationFailed(_) => "CREATION_FAILED",
            Self::StartFailed(_) => "START_FAILED",
            Self::StopFailed(_) => "STOP_FAILED",
            Self::RemovalFailed(_) => "REMOVAL_FAILED",
            Self::ExecFailed(_) => "EXEC_FAILED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::WriteFailed(_) => "WRITE_FAILED",
            Self::CopyFailed(_) => "COPY_FAILED",
            Self::StatsFailed(_) => "STATS_FAILED",
            Self::ResourceLimitExceeded(_) => "RESOURCE_LIMIT_EXCEEDED",
            Self::Timeout(_) => "TIMEOUT",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::BackendNotAvailable(_) => "BACKEND_NOT_AVAILABLE",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_upper_snake() {
        let id = SandboxId::generate();
        let errors = [
            SandboxError::NotFound(id),
            SandboxError::InvalidState {
                id,
                status: SandboxStatus::Stopped,
                operation: "exec",
            },
            SandboxError::ResourceLimitExceeded("pids".into()),
        ];
        let codes: Vec<_> = errors.iter().map(SandboxError::code).collect();
        assert_eq!(codes, ["NOT_FOUND", "INVALID_STATE", "RESOURCE_LIMIT_EXCEEDED"]);
    }

    #[test]
    fn invalid_state_message_names_operation() {
        let id = SandboxId::generate();
        let err = SandboxError::InvalidState {
            id,
            status: SandboxStatus::Paused,
            operation: "exec",
        };
        let message = err.to_string();
        assert!(message.contains("exec"), "got: {message}");
        assert!(message.contains("paused"), "got: {message}");
    }
}
