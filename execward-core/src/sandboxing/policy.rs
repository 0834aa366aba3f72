//! Sandbox policy: what a confined process may touch and consume.

use std::path::{Path, PathBuf};
use std::time::Duration;

use execward_config::{SandboxConfig, is_within};
use execward_config::sandbox::expand_home;
use execward_process::{FilesystemRules, ResourceLimits, SyscallPolicy};

const MIB: u64 = 1024 * 1024;

/// Syscalls denied by the default seccomp filter.
pub const BLOCKED_SYSCALLS: &[&str] = &[
    // Debugging/tracing - can be used to escape sandboxes
    "ptrace",
    "process_vm_readv",
    "process_vm_writev",
    // Filesystem namespace
    "mount",
    "umount2",
    "pivot_root",
    // Kernel modules and replacement
    "init_module",
    "finit_module",
    "delete_module",
    "kexec_load",
    "kexec_file_load",
    // Escape and side-channel primitives
    "bpf",
    "perf_event_open",
    "userfaultfd",
    "io_uring_setup",
    "io_uring_enter",
    "io_uring_register",
    // Host state
    "reboot",
    "swapon",
    "swapoff",
    "settimeofday",
    "clock_settime",
    "adjtimex",
    "acct",
    "quotactl",
    // Keyring
    "add_key",
    "request_key",
    "keyctl",
    // Raw I/O ports
    "ioperm",
    "iopl",
    // Namespaces
    "unshare",
    "setns",
];

/// Immutable policy derived from [`SandboxConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
    pub blocked_paths: Vec<PathBuf>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: u8,
    pub file_size_bytes: Option<u64>,
    pub max_processes: Option<u64>,
    pub network_allowed: bool,
    /// Replaces the default deny-list filter when set.
    pub syscalls: Option<SyscallPolicy>,
}

impl SandboxPolicy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        let nonzero = |value: u64| (value > 0).then_some(value);
        Self {
            read_paths: config.allowed_read_paths.clone(),
            write_paths: config.allowed_write_paths.clone(),
            blocked_paths: config
                .blocked_paths
                .iter()
                .map(|path| expand_home(path))
                .collect(),
            memory_bytes: nonzero(config.max_memory_mb).map(|mb| mb * MIB),
            cpu_percent: config.max_cpu_percent.clamp(1, 100),
            file_size_bytes: nonzero(config.max_file_size_mb).map(|mb| mb * MIB),
            max_processes: nonzero(config.max_processes),
            network_allowed: config.network_allowed,
            syscalls: None,
        }
    }

    pub fn with_syscalls(mut self, policy: SyscallPolicy) -> Self {
        self.syscalls = Some(policy);
        self
    }

    /// True when `path` is, or sits beneath, a blocked path. `.` and `..`
    /// are resolved first.
    pub fn is_blocked(&self, path: &Path) -> bool {
        self.blocked_paths
            .iter()
            .any(|blocked| is_within(path, blocked))
    }

    pub fn is_readable(&self, path: &Path) -> bool {
        !self.is_blocked(path)
            && (self.read_paths.iter().any(|root| is_within(path, root))
                || self.is_writable(path))
    }

    pub fn is_writable(&self, path: &Path) -> bool {
        !self.is_blocked(path) && self.write_paths.iter().any(|root| is_within(path, root))
    }

    /// rlimits for a run with the given wall-clock budget.
    pub fn resource_limits(&self, timeout: Duration) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: self.memory_bytes,
            cpu_seconds: Some(cpu_seconds(timeout, self.cpu_percent)),
            file_size_bytes: self.file_size_bytes,
            max_processes: self.max_processes,
            disable_core_dumps: true,
        }
    }

    /// Landlock allow-list. Roots inside a blocked path are dropped since
    /// Landlock cannot carve exceptions out of an allowed tree.
    pub fn filesystem_rules(&self, extra_write: &[PathBuf]) -> FilesystemRules {
        let keep = |path: &&PathBuf| !self.is_blocked(path);
        FilesystemRules {
            read_paths: self.read_paths.iter().filter(keep).cloned().collect(),
            write_paths: self
                .write_paths
                .iter()
                .chain(extra_write)
                .filter(keep)
                .cloned()
                .collect(),
        }
    }

    pub fn syscall_policy(&self) -> SyscallPolicy {
        self.syscalls
            .clone()
            .unwrap_or_else(|| SyscallPolicy::DenyList {
                syscalls: BLOCKED_SYSCALLS.iter().map(|s| (*s).to_string()).collect(),
                deny_network: !self.network_allowed,
            })
    }
}

/// CPU seconds for `timeout` at `percent` of one core, rounded up, at least 1.
pub fn cpu_seconds(timeout: Duration, percent: u8) -> u64 {
    let seconds = timeout.as_secs_f64() * f64::from(percent.clamp(1, 100)) / 100.0;
    (seconds.ceil() as u64).max(1)
}
