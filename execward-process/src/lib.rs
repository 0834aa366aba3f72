//! Process plumbing for execward.
//!
//! Spawns children in their own process group with a scrubbed environment,
//! applies a [`Confinement`] between fork and exec, and captures their output
//! under a shared byte ceiling with per-line redaction and a watchdog timeout.

pub mod capture;
pub mod confine;
pub mod error;
pub mod process_group;
pub mod spawn;
pub mod stream;
mod syscalls;

pub use capture::{
    CaptureOptions, CapturedOutput, LineRedactor, OutputChunk, StreamKind, Termination,
    run_captured,
};
pub use confine::{Confinement, FilesystemRules, ResourceLimits, SyscallPolicy};
pub use error::ProcessError;
pub use spawn::SpawnSpec;
pub use syscalls::syscall_number;

/// Exit code reported when the child was killed by the watchdog or cancelled.
pub const KILLED_EXIT_CODE: i32 = -1;
