//! Capture sandbox: a stricter preset with its own violation log.
//!
//! Requests declare the paths they read and write and whether they need the
//! network. Declarations the preset forbids are recorded as violations and
//! the run is refused. After a run, denials that surfaced as signals,
//! timeouts, truncation or error messages are classified and logged too.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use execward_config::{
    DEFAULT_READ_PATHS, DEFAULT_SENSITIVE_PATHS, SandboxConfig, SandboxTechnology, normalize_path,
};
use execward_process::{
    CaptureOptions, CapturedOutput, ProcessError, SyscallPolicy, Termination, run_captured,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sandboxing::env::build_sanitized_env;
use crate::sandboxing::{CapabilityProbe, CommandSpec, SandboxManager, SandboxPolicy};
use crate::secrets::SecretsFilter;

/// System calls a capture process may make. Everything else kills it.
pub const CAPTURE_SYSCALLS: &[&str] = &[
    "read",
    "write",
    "readv",
    "writev",
    "pread64",
    "pwrite64",
    "open",
    "openat",
    "close",
    "stat",
    "fstat",
    "lstat",
    "newfstatat",
    "statx",
    "statfs",
    "fstatfs",
    "lseek",
    "access",
    "faccessat",
    "faccessat2",
    "readlink",
    "readlinkat",
    "getdents64",
    "getcwd",
    "chdir",
    "fcntl",
    "ioctl",
    "dup",
    "dup2",
    "dup3",
    "pipe",
    "pipe2",
    "mkdirat",
    "unlinkat",
    "renameat",
    "ftruncate",
    "fsync",
    "umask",
    "mmap",
    "munmap",
    "mprotect",
    "mremap",
    "madvise",
    "brk",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "sigaltstack",
    "tgkill",
    "getpid",
    "getppid",
    "gettid",
    "getuid",
    "geteuid",
    "getgid",
    "getegid",
    "getpgrp",
    "uname",
    "sysinfo",
    "getrlimit",
    "prlimit64",
    "getrandom",
    "clock_gettime",
    "clock_getres",
    "clock_nanosleep",
    "nanosleep",
    "gettimeofday",
    "futex",
    "sched_yield",
    "sched_getaffinity",
    "poll",
    "ppoll",
    "select",
    "pselect6",
    "epoll_create1",
    "epoll_ctl",
    "epoll_wait",
    "epoll_pwait",
    "execve",
    "clone",
    "clone3",
    "vfork",
    "wait4",
    "arch_prctl",
    "set_tid_address",
    "set_robust_list",
    "rseq",
    "exit",
    "exit_group",
];

/// Extra locations a capture may never touch.
const CAPTURE_BLOCKED_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/root",
    "/var/run/docker.sock",
    "/run/docker.sock",
];

/// Most recent violations kept in the audit log.
const AUDIT_LOG_CAPACITY: usize = 1024;
/// Most stderr lines classified per run.
const MAX_STDERR_VIOLATIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Filesystem,
    Network,
    Resource,
    Syscall,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSandboxViolation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

impl CaptureSandboxViolation {
    pub fn new(kind: ViolationKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            path: None,
            timestamp: Utc::now(),
            severity,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Stricter preset layered on the regular sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureProfile {
    pub technology: SandboxTechnology,
    pub max_memory_mb: u64,
    pub max_duration: Duration,
    pub max_file_size_mb: u64,
    pub max_processes: u64,
    pub max_output_bytes: usize,
    pub allowed_read_paths: Vec<PathBuf>,
    pub allowed_write_paths: Vec<PathBuf>,
    pub blocked_paths: Vec<String>,
    pub syscalls: Vec<String>,
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self {
            technology: SandboxTechnology::Auto,
            max_memory_mb: 256,
            max_duration: Duration::from_secs(30),
            max_file_size_mb: 16,
            max_processes: 32,
            max_output_bytes: 256 * 1024,
            allowed_read_paths: DEFAULT_READ_PATHS.iter().map(PathBuf::from).collect(),
            allowed_write_paths: Vec::new(),
            blocked_paths: DEFAULT_SENSITIVE_PATHS
                .iter()
                .chain(CAPTURE_BLOCKED_PATHS)
                .map(|path| (*path).to_string())
                .collect(),
            syscalls: CAPTURE_SYSCALLS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl CaptureProfile {
    /// The preset as a regular sandbox configuration. Network is always off.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            enabled: true,
            technology: self.technology,
            allowed_read_paths: self.allowed_read_paths.clone(),
            allowed_write_paths: self.allowed_write_paths.clone(),
            blocked_paths: self.blocked_paths.clone(),
            max_memory_mb: self.max_memory_mb,
            max_cpu_percent: 100,
            max_file_size_mb: self.max_file_size_mb,
            max_processes: self.max_processes,
            network_allowed: false,
            fallback_to_noop: true,
        }
    }

    pub fn syscall_policy(&self) -> SyscallPolicy {
        SyscallPolicy::AllowList {
            syscalls: self.syscalls.clone(),
        }
    }
}

/// One capture invocation and what it declares it will touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Scratch directory; cwd and the only writable root.
    pub work_dir: PathBuf,
    pub reads: Vec<PathBuf>,
    pub writes: Vec<PathBuf>,
    pub network: bool,
}

impl CaptureRequest {
    pub fn new(program: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn reading(mut self, path: impl Into<PathBuf>) -> Self {
        self.reads.push(path.into());
        self
    }

    pub fn writing(mut self, path: impl Into<PathBuf>) -> Self {
        self.writes.push(path.into());
        self
    }

    pub fn with_network(mut self) -> Self {
        self.network = true;
        self
    }
}

/// Redacted output of a capture run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub wall_time_ms: u64,
    pub output_bytes: usize,
    /// Largest resident set of any child this process has reaped so far
    /// (`RUSAGE_CHILDREN`). Earlier or concurrent runs count too, so this is
    /// an upper bound for the capture, not its own peak.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children_peak_rss_kb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSandboxResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<String>,
    pub usage: Option<ResourceUsage>,
    pub violations: Vec<CaptureSandboxViolation>,
}

impl<T> CaptureSandboxResult<T> {
    fn failed(
        error: impl Into<String>,
        usage: Option<ResourceUsage>,
        violations: Vec<CaptureSandboxViolation>,
    ) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
            usage,
            violations,
        }
    }
}

pub struct CaptureSandbox {
    profile: CaptureProfile,
    manager: SandboxManager,
    secrets: Arc<SecretsFilter>,
    audit: Mutex<Vec<CaptureSandboxViolation>>,
}

impl CaptureSandbox {
    pub fn new(profile: CaptureProfile) -> Self {
        let manager = SandboxManager::new(profile.sandbox_config())
            .with_syscall_policy(profile.syscall_policy());
        Self::with_manager(profile, manager)
    }

    pub fn with_probe(profile: CaptureProfile, probe: Arc<dyn CapabilityProbe>) -> Self {
        let manager = SandboxManager::with_probe(profile.sandbox_config(), probe)
            .with_syscall_policy(profile.syscall_policy());
        Self::with_manager(profile, manager)
    }

    fn with_manager(profile: CaptureProfile, manager: SandboxManager) -> Self {
        Self {
            profile,
            manager,
            secrets: Arc::new(SecretsFilter::identity()),
            audit: Mutex::new(Vec::new()),
        }
    }

    pub fn with_secrets(mut self, secrets: SecretsFilter) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }

    pub fn profile(&self) -> &CaptureProfile {
        &self.profile
    }

    pub fn sandbox_manager(&self) -> &SandboxManager {
        &self.manager
    }

    /// Every violation recorded so far, oldest first.
    pub fn violations(&self) -> Vec<CaptureSandboxViolation> {
        self.audit.lock().clone()
    }

    pub fn clear_violations(&self) {
        self.audit.lock().clear();
    }

    pub async fn run(&self, request: CaptureRequest) -> CaptureSandboxResult<CaptureOutput> {
        self.run_with(request, |output| Ok(output.clone())).await
    }

    /// Run `request` and turn its output into a `T` with `parse`.
    pub async fn run_with<T, F>(&self, request: CaptureRequest, parse: F) -> CaptureSandboxResult<T>
    where
        F: FnOnce(&CaptureOutput) -> Result<T, String>,
    {
        let sandbox = match self.manager.create_sandbox() {
            Ok(sandbox) => sandbox,
            Err(err) => return CaptureSandboxResult::failed(err.to_string(), None, Vec::new()),
        };
        let policy = sandbox
            .policy()
            .cloned()
            .unwrap_or_else(|| SandboxPolicy::from_config(&self.profile.sandbox_config()));

        let refused = preflight(&request, &policy);
        if !refused.is_empty() {
            self.record(&refused);
            let error = format!("capture refused: {} violation(s)", refused.len());
            return CaptureSandboxResult::failed(error, None, refused);
        }

        if let Err(err) = tokio::fs::create_dir_all(&request.work_dir).await {
            return CaptureSandboxResult::failed(
                format!("failed to prepare {}: {err}", request.work_dir.display()),
                None,
                Vec::new(),
            );
        }

        let host_env: BTreeMap<String, String> = std::env::vars().collect();
        let spec = CommandSpec::new(&request.program)
            .with_args(request.args.iter().cloned())
            .with_cwd(&request.work_dir)
            .with_env(build_sanitized_env(&host_env, &[], &request.work_dir))
            .with_timeout(self.profile.max_duration)
            .with_writable_root(&request.work_dir);
        let confined = sandbox.enforce(spec).into_spawn_spec();
        let options = CaptureOptions::new(self.profile.max_duration, self.profile.max_output_bytes)
            .with_redactor(self.secrets.clone());

        let started = Instant::now();
        let captured = match run_captured(&confined, options).await {
            Ok(captured) => captured,
            Err(err) => {
                let violations = spawn_violations(&err);
                self.record(&violations);
                return CaptureSandboxResult::failed(err.to_string(), None, violations);
            }
        };

        let usage = ResourceUsage {
            wall_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            output_bytes: captured.captured_bytes,
            children_peak_rss_kb: children_peak_rss_kb(),
        };
        let violations = classify(&captured, &self.profile);
        self.record(&violations);

        let output = CaptureOutput {
            exit_code: captured.termination.exit_code(),
            stdout: captured.stdout,
            stderr: captured.stderr,
            truncated: captured.truncated,
        };
        let blocking = violations
            .iter()
            .any(|violation| violation.severity >= Severity::High);
        if !captured.termination.success() || blocking {
            let error = match captured.termination {
                Termination::TimedOut => "capture timed out".to_string(),
                termination if !termination.success() => {
                    format!("capture exited with status {}", termination.exit_code())
                }
                _ => "capture completed with violations".to_string(),
            };
            return CaptureSandboxResult::failed(error, Some(usage), violations);
        }

        match parse(&output) {
            Ok(value) => CaptureSandboxResult {
                success: true,
                value: Some(value),
                error: None,
                usage: Some(usage),
                violations,
            },
            Err(err) => CaptureSandboxResult::failed(err, Some(usage), violations),
        }
    }

    fn record(&self, violations: &[CaptureSandboxViolation]) {
        if violations.is_empty() {
            return;
        }
        for violation in violations {
            warn!(
                kind = ?violation.kind,
                severity = ?violation.severity,
                path = ?violation.path,
                "capture sandbox violation: {}",
                violation.description
            );
        }
        let mut audit = self.audit.lock();
        audit.extend_from_slice(violations);
        let overflow = audit.len().saturating_sub(AUDIT_LOG_CAPACITY);
        audit.drain(..overflow);
    }
}

impl fmt::Debug for CaptureSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSandbox")
            .field("profile", &self.profile)
            .field("violations", &self.audit.lock().len())
            .finish()
    }
}

/// Check the declared paths and network use before anything runs.
fn preflight(request: &CaptureRequest, policy: &SandboxPolicy) -> Vec<CaptureSandboxViolation> {
    let mut violations = Vec::new();
    let work_dir = normalize_path(&request.work_dir);
    // Relative paths are taken against the work dir, then `..` is resolved
    // so nothing can climb out while looking like it stays inside.
    let resolve = |path: &Path| normalize_path(&work_dir.join(path));
    let in_work_dir = |path: &Path| path.starts_with(&work_dir);

    let program = Path::new(&request.program);
    let program = (program.components().count() > 1).then(|| resolve(program));
    if let Some(program) = program.as_deref()
        && policy.is_blocked(program)
    {
        violations.push(
            CaptureSandboxViolation::new(
                ViolationKind::Filesystem,
                Severity::Critical,
                "program lives under a blocked path",
            )
            .with_path(program),
        );
    }

    for path in request.reads.iter().map(|path| resolve(path)) {
        let path = path.as_path();
        if policy.is_blocked(path) {
            violations.push(
                CaptureSandboxViolation::new(
                    ViolationKind::Filesystem,
                    Severity::High,
                    "read of a blocked path",
                )
                .with_path(path),
            );
        } else if !policy.is_readable(path) && !in_work_dir(path) {
            violations.push(
                CaptureSandboxViolation::new(
                    ViolationKind::Filesystem,
                    Severity::Medium,
                    "read outside the allowed paths",
                )
                .with_path(path),
            );
        }
    }

    for path in request.writes.iter().map(|path| resolve(path)) {
        let path = path.as_path();
        if policy.is_blocked(path) {
            violations.push(
                CaptureSandboxViolation::new(
                    ViolationKind::Filesystem,
                    Severity::Critical,
                    "write to a blocked path",
                )
                .with_path(path),
            );
        } else if !policy.is_writable(path) && !in_work_dir(path) {
            violations.push(
                CaptureSandboxViolation::new(
                    ViolationKind::Filesystem,
                    Severity::High,
                    "write outside the capture directory",
                )
                .with_path(path),
            );
        }
    }

    if request.network && !policy.network_allowed {
        violations.push(CaptureSandboxViolation::new(
            ViolationKind::Network,
            Severity::High,
            "network access is not permitted during capture",
        ));
    }

    violations
}

/// Classify how a finished run ran into the preset's limits.
fn classify(output: &CapturedOutput, profile: &CaptureProfile) -> Vec<CaptureSandboxViolation> {
    let mut violations = Vec::new();

    if output.termination == Termination::TimedOut {
        violations.push(CaptureSandboxViolation::new(
            ViolationKind::Time,
            Severity::High,
            format!(
                "exceeded the {} ms capture time limit",
                profile.max_duration.as_millis()
            ),
        ));
    }
    if let Some(violation) = output.termination.signal().and_then(signal_violation) {
        violations.push(violation);
    }
    if output.truncated {
        violations.push(CaptureSandboxViolation::new(
            ViolationKind::Resource,
            Severity::Low,
            format!("output exceeded {} bytes and was truncated", profile.max_output_bytes),
        ));
    }

    violations.extend(
        output
            .stderr
            .lines()
            .filter_map(stderr_violation)
            .take(MAX_STDERR_VIOLATIONS),
    );
    violations
}

#[cfg(unix)]
fn signal_violation(signal: i32) -> Option<CaptureSandboxViolation> {
    let (kind, severity, description) = match signal {
        libc::SIGSYS => (
            ViolationKind::Syscall,
            Severity::Critical,
            "killed for a disallowed system call",
        ),
        libc::SIGXCPU => (
            ViolationKind::Resource,
            Severity::High,
            "CPU time limit exceeded",
        ),
        libc::SIGXFSZ => (
            ViolationKind::Resource,
            Severity::Medium,
            "file size limit exceeded",
        ),
        libc::SIGKILL => (
            ViolationKind::Resource,
            Severity::High,
            "killed by the kernel, likely for memory",
        ),
        _ => return None,
    };
    Some(CaptureSandboxViolation::new(kind, severity, description))
}

#[cfg(not(unix))]
fn signal_violation(_signal: i32) -> Option<CaptureSandboxViolation> {
    None
}

fn stderr_violation(line: &str) -> Option<CaptureSandboxViolation> {
    let lower = line.to_ascii_lowercase();
    let (kind, severity) = if lower.contains("permission denied")
        || lower.contains("operation not permitted")
    {
        (ViolationKind::Filesystem, Severity::Medium)
    } else if lower.contains("network is unreachable") || lower.contains("address family not supported")
    {
        (ViolationKind::Network, Severity::Medium)
    } else if lower.contains("cannot allocate memory")
        || lower.contains("out of memory")
        || lower.contains("memoryerror")
    {
        (ViolationKind::Resource, Severity::Medium)
    } else {
        return None;
    };

    let description: String = line.trim().chars().take(200).collect();
    let mut violation = CaptureSandboxViolation::new(kind, severity, description);
    if kind == ViolationKind::Filesystem {
        if let Some(path) = first_absolute_path(line) {
            violation = violation.with_path(path);
        }
    }
    Some(violation)
}

/// First token that looks like an absolute path, e.g. in `cat: /x: Permission denied`.
fn first_absolute_path(line: &str) -> Option<&str> {
    line.split(|c: char| c.is_whitespace() || matches!(c, ':' | '\'' | '"' | '`'))
        .find(|token| token.len() > 1 && token.starts_with('/'))
}

fn spawn_violations(err: &ProcessError) -> Vec<CaptureSandboxViolation> {
    if err.is_resource_exhaustion() {
        vec![CaptureSandboxViolation::new(
            ViolationKind::Resource,
            Severity::High,
            format!("process could not be created: {err}"),
        )]
    } else {
        Vec::new()
    }
}

#[cfg(unix)]
fn children_peak_rss_kb() -> Option<u64> {
    use nix::sys::resource::{UsageWho, getrusage};

    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).ok()?;
    let max_rss = u64::try_from(usage.max_rss()).ok()?;
    // ru_maxrss is in bytes on macOS and kilobytes elsewhere.
    if cfg!(target_os = "macos") {
        Some(max_rss / 1024)
    } else {
        Some(max_rss)
    }
}

#[cfg(not(unix))]
fn children_peak_rss_kb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandboxing::StaticProbe;

    fn captured(termination: Termination, stderr: &str, truncated: bool) -> CapturedOutput {
        CapturedOutput {
            termination,
            stdout: String::new(),
            stderr: stderr.to_string(),
            truncated,
            captured_bytes: 0,
            dropped_chunks: 0,
            duration: Duration::from_millis(5),
            pid: 1,
        }
    }

    fn policy() -> SandboxPolicy {
        SandboxPolicy::from_config(&CaptureProfile::default().sandbox_config())
    }

    #[test]
    fn profile_is_stricter_than_default_sandbox() {
        let profile = CaptureProfile::default();
        let config = profile.sandbox_config();
        let default = SandboxConfig::default();

        assert!(config.max_memory_mb < default.max_memory_mb);
        assert!(!config.network_allowed);
        assert!(config.max_processes > 0);
        assert!(config.blocked_paths.len() > default.blocked_paths.len());
        assert!(matches!(
            profile.syscall_policy(),
            SyscallPolicy::AllowList { syscalls } if syscalls.iter().any(|s| s == "execve")
        ));
    }

    #[test]
    fn preflight_flags_blocked_and_undeclared_access() {
        let request = CaptureRequest::new("/bin/cat", "/tmp/capture-1")
            .reading("/etc/shadow")
            .reading("/srv/data.txt")
            .writing("/etc/sudoers")
            .writing("/usr/local/out.txt")
            .writing("/tmp/capture-1/out.txt")
            .with_network();

        let violations = preflight(&request, &policy());
        let summary: Vec<_> = violations
            .iter()
            .map(|violation| (violation.kind, violation.severity))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ViolationKind::Filesystem, Severity::High),
                (ViolationKind::Filesystem, Severity::Medium),
                (ViolationKind::Filesystem, Severity::Critical),
                (ViolationKind::Filesystem, Severity::High),
                (ViolationKind::Network, Severity::High),
            ]
        );
        assert_eq!(violations[0].path.as_deref(), Some(Path::new("/etc/shadow")));
    }

    #[test]
    fn preflight_accepts_work_dir_and_system_reads() {
        let request = CaptureRequest::new("/bin/cat", "/tmp/capture-2")
            .reading("/usr/share/dict/words")
            .writing("/tmp/capture-2/result.json");
        assert!(preflight(&request, &policy()).is_empty());
    }

    #[test]
    fn preflight_resolves_parent_components() {
        let request = CaptureRequest::new("/bin/true", "/tmp/capture-3")
            .writing("/tmp/capture-3/../../../etc/shadow")
            .writing("../escaped.txt")
            .reading("/tmp/capture-3/./in/../notes.txt");

        let violations = preflight(&request, &policy());
        let summary: Vec<_> = violations
            .iter()
            .map(|violation| (violation.severity, violation.path.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Severity::Critical, Some(PathBuf::from("/etc/shadow"))),
                (Severity::High, Some(PathBuf::from("/tmp/escaped.txt"))),
            ]
        );
    }

    #[test]
    fn preflight_resolves_the_program_path() {
        let request = CaptureRequest::new("/tmp/capture-4/../../etc/shadow", "/tmp/capture-4");
        let violations = preflight(&request, &policy());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Critical);
        assert_eq!(violations[0].path.as_deref(), Some(Path::new("/etc/shadow")));
    }

    #[test]
    fn timeout_and_truncation_are_classified() {
        let profile = CaptureProfile::default();
        let violations = classify(&captured(Termination::TimedOut, "", true), &profile);
        let kinds: Vec<_> = violations.iter().map(|violation| violation.kind).collect();
        assert_eq!(kinds, vec![ViolationKind::Time, ViolationKind::Resource]);
        assert_eq!(violations[1].severity, Severity::Low);
    }

    #[cfg(unix)]
    #[test]
    fn sigsys_is_a_critical_syscall_violation() {
        let violations = classify(
            &captured(Termination::Signaled(libc::SIGSYS), "", false),
            &CaptureProfile::default(),
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Syscall);
        assert_eq!(violations[0].severity, Severity::Critical);
    }

    #[test]
    fn stderr_denials_carry_the_path() {
        let violations = classify(
            &captured(
                Termination::Exited(1),
                "cat: /etc/ssl/private/key.pem: Permission denied\nplain line\n",
                false,
            ),
            &CaptureProfile::default(),
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Filesystem);
        assert_eq!(
            violations[0].path.as_deref(),
            Some(Path::new("/etc/ssl/private/key.pem"))
        );
    }

    #[test]
    fn violation_serializes_kind_as_type() {
        let violation =
            CaptureSandboxViolation::new(ViolationKind::Network, Severity::High, "blocked");
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["type"], "network");
        assert_eq!(json["severity"], "high");
        assert!(json.get("path").is_none());
    }

    #[tokio::test]
    async fn refused_request_is_logged_and_not_run() {
        let sandbox =
            CaptureSandbox::with_probe(CaptureProfile::default(), Arc::new(StaticProbe::nothing()));
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let request = CaptureRequest::new("/bin/sh", dir.path())
            .with_args(["-c".to_string(), format!("touch {}", marker.display())])
            .writing("/etc/shadow");

        let result = sandbox.run(request).await;
        assert!(!result.success);
        assert!(result.usage.is_none());
        assert_eq!(sandbox.violations().len(), 1);
        assert!(!marker.exists());

        sandbox.clear_violations();
        assert!(sandbox.violations().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn parsed_capture_reports_usage() {
        let sandbox =
            CaptureSandbox::with_probe(CaptureProfile::default(), Arc::new(StaticProbe::nothing()));
        let dir = tempfile::tempdir().unwrap();
        let request = CaptureRequest::new("/bin/sh", dir.path()).with_args(["-c", "echo 41"]);

        let result = sandbox
            .run_with(request, |output| {
                output
                    .stdout
                    .trim()
                    .parse::<u32>()
                    .map(|value| value + 1)
                    .map_err(|err| err.to_string())
            })
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.value, Some(42));
        let usage = result.usage.unwrap();
        assert_eq!(usage.output_bytes, 3);
        assert!(result.violations.is_empty());

        // The RSS figure is labelled as a children-wide high-water mark.
        let json = serde_json::to_value(&usage).unwrap();
        assert!(json.get("peak_rss_kb").is_none());
        if let Some(rss) = usage.children_peak_rss_kb {
            assert_eq!(json["children_peak_rss_kb"], rss);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_capture_records_time_violation() {
        let profile = CaptureProfile {
            max_duration: Duration::from_millis(200),
            ..CaptureProfile::default()
        };
        let sandbox = CaptureSandbox::with_probe(profile, Arc::new(StaticProbe::nothing()));
        let dir = tempfile::tempdir().unwrap();
        let request = CaptureRequest::new("/bin/sh", dir.path()).with_args(["-c", "sleep 5"]);

        let result = sandbox.run(request).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("capture timed out"));
        assert!(
            result
                .violations
                .iter()
                .any(|violation| violation.kind == ViolationKind::Time)
        );
    }
}
