//! Confinement applied to a child between fork and exec.
//!
//! A [`Confinement`] is plain data. [`Confinement::prepare`] runs in the parent
//! and does everything that allocates or opens files: the Landlock ruleset is
//! created and populated, the seccomp program is compiled to BPF. The child then
//! only issues the final syscalls in [`PreparedConfinement::apply_in_child`].
//!
//! Order in the child: rlimits, `PR_SET_NO_NEW_PRIVS`, Landlock, seccomp. The
//! seccomp filter goes last so the earlier steps are not subject to it.

use std::io;
use std::path::PathBuf;

use crate::error::ProcessError;

/// Kernel resource limits (`setrlimit`). `None` leaves the inherited limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub file_size_bytes: Option<u64>,
    /// Counted per real user id by the kernel, not per sandbox.
    pub max_processes: Option<u64>,
    pub disable_core_dumps: bool,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_bytes.is_none()
            && self.cpu_seconds.is_none()
            && self.file_size_bytes.is_none()
            && self.max_processes.is_none()
            && !self.disable_core_dumps
    }
}

/// Landlock allow-list. Anything not listed is denied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemRules {
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
}

/// Seccomp filter shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallPolicy {
    /// Listed syscalls fail with `EPERM`; everything else is allowed.
    /// `deny_network` additionally refuses non-`AF_UNIX` sockets.
    DenyList {
        syscalls: Vec<String>,
        deny_network: bool,
    },
    /// Only listed syscalls are allowed; anything else kills the process (SIGSYS).
    AllowList { syscalls: Vec<String> },
}

/// Everything the child must apply to itself before exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Confinement {
    pub limits: ResourceLimits,
    pub filesystem: Option<FilesystemRules>,
    pub syscalls: Option<SyscallPolicy>,
    pub no_new_privs: bool,
}

impl Confinement {
    /// No restrictions at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.limits.is_empty()
            && self.filesystem.is_none()
            && self.syscalls.is_none()
            && !self.no_new_privs
    }

    /// Build kernel objects in the parent.
    pub fn prepare(&self) -> Result<PreparedConfinement, ProcessError> {
        #[cfg(not(target_os = "linux"))]
        {
            if self.filesystem.is_some() {
                return Err(ProcessError::Unsupported {
                    feature: "landlock filesystem rules",
                    platform: std::env::consts::OS,
                });
            }
            if self.syscalls.is_some() {
                return Err(ProcessError::Unsupported {
                    feature: "seccomp syscall filtering",
                    platform: std::env::consts::OS,
                });
            }
        }

        Ok(PreparedConfinement {
            limits: self.limits.clone(),
            no_new_privs: self.no_new_privs || self.syscalls.is_some(),
            #[cfg(target_os = "linux")]
            ruleset: self
                .filesystem
                .as_ref()
                .map(linux::build_ruleset)
                .transpose()?,
            #[cfg(target_os = "linux")]
            filter: self
                .syscalls
                .as_ref()
                .map(linux::compile_filter)
                .transpose()?,
        })
    }
}

/// Confinement with its kernel objects built, ready for `pre_exec`.
pub struct PreparedConfinement {
    limits: ResourceLimits,
    no_new_privs: bool,
    #[cfg(target_os = "linux")]
    ruleset: Option<landlock::RulesetCreated>,
    #[cfg(target_os = "linux")]
    filter: Option<seccompiler::BpfProgram>,
}

impl std::fmt::Debug for PreparedConfinement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("PreparedConfinement");
        debug
            .field("limits", &self.limits)
            .field("no_new_privs", &self.no_new_privs);
        #[cfg(target_os = "linux")]
        debug
            .field("landlock", &self.ruleset.is_some())
            .field("seccomp_instructions", &self.filter.as_ref().map(Vec::len));
        debug.finish()
    }
}

impl PreparedConfinement {
    /// Apply to the calling process. Runs in the forked child.
    #[cfg(unix)]
    pub fn apply_in_child(&mut self) -> io::Result<()> {
        apply_limits(&self.limits)?;

        #[cfg(target_os = "linux")]
        {
            if self.no_new_privs {
                // SAFETY: prctl with integer arguments only.
                if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            if let Some(ruleset) = self.ruleset.take() {
                let status = ruleset.restrict_self().map_err(io::Error::other)?;
                if status.ruleset == landlock::RulesetStatus::NotEnforced {
                    return Err(io::Error::other("landlock ruleset not enforced"));
                }
            }

            if let Some(filter) = self.filter.as_ref() {
                seccompiler::apply_filter(filter).map_err(io::Error::other)?;
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn apply_limits(limits: &ResourceLimits) -> io::Result<()> {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    #[cfg(target_os = "linux")]
    const MEMORY: Resource = Resource::RLIMIT_DATA;
    #[cfg(not(target_os = "linux"))]
    const MEMORY: Resource = Resource::RLIMIT_AS;

    // An unprivileged process cannot raise its hard limit, so never ask for more.
    let set = |resource: Resource, soft: u64, hard: u64| -> io::Result<()> {
        let (_, current_hard) = getrlimit(resource).map_err(io::Error::from)?;
        let hard = hard.min(current_hard);
        setrlimit(resource, soft.min(hard), hard).map_err(io::Error::from)
    };

    if let Some(bytes) = limits.memory_bytes {
        set(MEMORY, bytes, bytes)?;
    }
    if let Some(seconds) = limits.cpu_seconds {
        // Soft limit delivers SIGXCPU; the hard limit one second later is SIGKILL.
        set(Resource::RLIMIT_CPU, seconds, seconds.saturating_add(1))?;
    }
    if let Some(bytes) = limits.file_size_bytes {
        set(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    if let Some(count) = limits.max_processes {
        set(Resource::RLIMIT_NPROC, count, count)?;
    }
    if limits.disable_core_dumps {
        set(Resource::RLIMIT_CORE, 0, 0)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::BTreeMap;

    use landlock::{
        ABI, Access, AccessFs, CompatLevel, Compatible, Ruleset, RulesetAttr, RulesetCreated,
        RulesetCreatedAttr, path_beneath_rules,
    };
    use seccompiler::{
        BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
        SeccompFilter, SeccompRule, TargetArch,
    };

    use super::{FilesystemRules, SyscallPolicy};
    use crate::error::ProcessError;
    use crate::syscalls::syscall_number;

    fn confinement_error(err: impl std::fmt::Display) -> ProcessError {
        ProcessError::Confinement(err.to_string())
    }

    pub(super) fn build_ruleset(rules: &FilesystemRules) -> Result<RulesetCreated, ProcessError> {
        let abi = ABI::V5;
        let access_rw = AccessFs::from_all(abi);
        let access_ro = AccessFs::from_read(abi);

        // path_beneath_rules opens each path; missing paths would abort the ruleset.
        let read: Vec<_> = rules.read_paths.iter().filter(|p| p.exists()).collect();
        let write: Vec<_> = rules.write_paths.iter().filter(|p| p.exists()).collect();

        Ruleset::default()
            .set_compatibility(CompatLevel::BestEffort)
            .handle_access(access_rw)
            .map_err(confinement_error)?
            .create()
            .map_err(confinement_error)?
            .add_rules(path_beneath_rules(read, access_ro))
            .map_err(confinement_error)?
            .add_rules(path_beneath_rules(["/dev/null"], access_rw))
            .map_err(confinement_error)?
            .add_rules(path_beneath_rules(write, access_rw))
            .map_err(confinement_error)
    }

    fn target_arch() -> Result<TargetArch, ProcessError> {
        if cfg!(target_arch = "x86_64") {
            Ok(TargetArch::x86_64)
        } else if cfg!(target_arch = "aarch64") {
            Ok(TargetArch::aarch64)
        } else {
            Err(ProcessError::Unsupported {
                feature: "seccomp syscall filtering",
                platform: std::env::consts::ARCH,
            })
        }
    }

    fn resolve(names: &[String]) -> Vec<i64> {
        let mut numbers = Vec::with_capacity(names.len());
        for name in names {
            match syscall_number(name) {
                Some(nr) => numbers.push(nr),
                None => tracing::debug!(syscall = %name, "syscall not available on this architecture"),
            }
        }
        numbers
    }

    pub(super) fn compile_filter(policy: &SyscallPolicy) -> Result<BpfProgram, ProcessError> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

        let (mismatch, matched) = match policy {
            SyscallPolicy::DenyList {
                syscalls,
                deny_network,
            } => {
                for nr in resolve(syscalls) {
                    rules.insert(nr, Vec::new());
                }
                if *deny_network {
                    let non_unix = SeccompRule::new(vec![
                        SeccompCondition::new(
                            0,
                            SeccompCmpArgLen::Dword,
                            SeccompCmpOp::Ne,
                            libc::AF_UNIX as u64,
                        )
                        .map_err(confinement_error)?,
                    ])
                    .map_err(confinement_error)?;
                    rules.insert(libc::SYS_socket, vec![non_unix.clone()]);
                    rules.insert(libc::SYS_socketpair, vec![non_unix]);
                }
                (
                    SeccompAction::Allow,
                    SeccompAction::Errno(libc::EPERM as u32),
                )
            }
            SyscallPolicy::AllowList { syscalls } => {
                for nr in resolve(syscalls) {
                    rules.insert(nr, Vec::new());
                }
                (SeccompAction::KillProcess, SeccompAction::Allow)
            }
        };

        let filter = SeccompFilter::new(rules, mismatch, matched, target_arch()?)
            .map_err(confinement_error)?;
        filter
            .try_into()
            .map_err(|err: seccompiler::BackendError| confinement_error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_confinement_is_unrestricted() {
        assert!(Confinement::none().is_unrestricted());
        let limited = Confinement {
            limits: ResourceLimits {
                disable_core_dumps: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!limited.is_unrestricted());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn deny_list_compiles_to_bpf() {
        let confinement = Confinement {
            syscalls: Some(SyscallPolicy::DenyList {
                syscalls: vec!["ptrace".into(), "mount".into(), "no_such_call".into()],
                deny_network: true,
            }),
            ..Default::default()
        };
        let prepared = confinement.prepare().unwrap();
        assert!(prepared.no_new_privs);
        assert!(prepared.filter.as_ref().is_some_and(|prog| !prog.is_empty()));
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn filesystem_rules_are_rejected_off_linux() {
        let confinement = Confinement {
            filesystem: Some(FilesystemRules::default()),
            ..Default::default()
        };
        assert!(matches!(
            confinement.prepare(),
            Err(ProcessError::Unsupported { .. })
        ));
    }
}
