use execward_config::SandboxTechnology;
use execward_process::ProcessError;
use thiserror::Error;

use crate::approval::ApprovalStatus;
use crate::execution::ExecutionResult;
use crate::runtime::Runtime;
use crate::store::StoreError;

/// Sandbox selection failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox technology `{technology}` is not supported on {platform}")]
    Unsupported {
        technology: SandboxTechnology,
        platform: String,
    },
}

/// Typed outcomes of the public execution operations.
///
/// `ApprovalRequired` is a control-flow signal, not a fault: the caller must
/// resolve the named approval, then resubmit in the named session.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(
        "approval `{approval_id}` must be resolved before this request can run in session `{session_id}`"
    )]
    ApprovalRequired {
        approval_id: String,
        session_id: String,
    },

    #[error("execution was rejected by approval `{approval_id}`")]
    ApprovalRejected { approval_id: String },

    #[error("sandbox technology `{technology}` is not supported on {platform}")]
    SandboxUnsupported {
        technology: SandboxTechnology,
        platform: String,
    },

    #[error("execution timed out after {timeout_ms} ms")]
    ExecutionTimeout {
        timeout_ms: u64,
        result: Box<ExecutionResult>,
    },

    #[error("session `{session_id}` is invalid: {reason}")]
    SessionInvalid { session_id: String, reason: String },

    #[error("failed to start {runtime} process: {source}")]
    SpawnFailure {
        runtime: Runtime,
        #[source]
        source: ProcessError,
    },

    #[error("approval `{0}` not found")]
    ApprovalNotFound(String),

    #[error("approval `{approval_id}` is already {status}")]
    ApprovalNotPending {
        approval_id: String,
        status: ApprovalStatus,
    },

    #[error("{runtime} runtime is unavailable: {reason}")]
    RuntimeUnavailable { runtime: Runtime, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    pub fn is_approval_required(&self) -> bool {
        matches!(self, Self::ApprovalRequired { .. })
    }

    /// Approval id carried by approval-related outcomes.
    pub fn approval_id(&self) -> Option<&str> {
        match self {
            Self::ApprovalRequired { approval_id, .. }
            | Self::ApprovalRejected { approval_id }
            | Self::ApprovalNotPending { approval_id, .. } => Some(approval_id),
            Self::ApprovalNotFound(id) => Some(id),
            _ => None,
        }
    }

    /// Session id carried by session-related outcomes.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::ApprovalRequired { session_id, .. } | Self::SessionInvalid { session_id, .. } => {
                Some(session_id)
            }
            _ => None,
        }
    }

    pub(crate) fn session_invalid(session_id: &str, reason: impl Into<String>) -> Self {
        Self::SessionInvalid {
            session_id: session_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<SandboxError> for ExecError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Unsupported {
                technology,
                platform,
            } => Self::SandboxUnsupported {
                technology,
                platform,
            },
        }
    }
}
