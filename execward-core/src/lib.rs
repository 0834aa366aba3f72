//! Sandboxed execution of untrusted code snippets.
//!
//! [`CodeExecutionManager`] is the entry point: it resolves the session,
//! consults the [`ApprovalGate`], obtains the cached [`Sandbox`] from the
//! [`SandboxManager`], runs the snippet through the matching
//! [`RuntimeAdapter`] and returns an [`ExecutionResult`] whose output has
//! passed through the [`SecretsFilter`].
//!
//! [`SandboxMonitor`] re-verifies isolation on a timer, and
//! [`CaptureSandbox`] is a stricter profile with its own violation log.

pub mod approval;
pub mod capture;
pub mod error;
pub mod execution;
pub mod monitor;
pub mod runtime;
pub mod sandboxing;
pub mod secrets;
pub mod session;
pub mod store;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRecord, ApprovalStatus, GateOutcome};
pub use capture::{
    CaptureOutput, CaptureProfile, CaptureRequest, CaptureSandbox, CaptureSandboxResult,
    CaptureSandboxViolation, ResourceUsage, Severity, ViolationKind,
};
pub use error::{ExecError, SandboxError};
pub use execution::{
    CodeExecutionManager, CodeExecutionManagerBuilder, ExecutionRequest, ExecutionResult,
};
pub use monitor::{IntegrityCheck, IntegrityReport, SandboxMonitor};
pub use runtime::{Runtime, RuntimeAdapter};
pub use sandboxing::{
    Capabilities, CapabilityDetector, CapabilityProbe, Sandbox, SandboxManager, SandboxStatus,
    SandboxType, StaticProbe, SystemProbe,
};
pub use secrets::SecretsFilter;
pub use session::{ExecutionSession, SessionStatus};
pub use store::{ExecutionStore, InMemoryStore, JsonFileStore, StoreError};

pub use execward_process::{KILLED_EXIT_CODE, OutputChunk, StreamKind};
