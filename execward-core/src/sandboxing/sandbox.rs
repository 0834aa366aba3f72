use std::fmt;
use std::path::{Path, PathBuf};

use execward_process::Confinement;
use serde::{Deserialize, Serialize};

use super::command::{CommandSpec, ConfinedCommand};
use super::env::apply_sandbox_markers;
use super::policy::SandboxPolicy;

pub(crate) const SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

/// Concrete sandbox in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxType {
    Noop,
    Landlock,
    Seccomp,
    Seatbelt,
}

impl SandboxType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Landlock => "landlock",
            Self::Seccomp => "seccomp",
            Self::Seatbelt => "seatbelt",
        }
    }

    pub fn is_enforcing(self) -> bool {
        self != Self::Noop
    }
}

impl fmt::Display for SandboxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One variant per platform primitive, plus pass-through.
///
/// Holds no per-request state; one instance is shared by all executions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sandbox {
    Noop,
    /// Landlock filesystem rules, optionally layered with the seccomp filter.
    Landlock {
        policy: SandboxPolicy,
        seccomp_layer: bool,
    },
    Seccomp {
        policy: SandboxPolicy,
    },
    Seatbelt {
        policy: SandboxPolicy,
    },
}

impl Sandbox {
    pub fn sandbox_type(&self) -> SandboxType {
        match self {
            Self::Noop => SandboxType::Noop,
            Self::Landlock { .. } => SandboxType::Landlock,
            Self::Seccomp { .. } => SandboxType::Seccomp,
            Self::Seatbelt { .. } => SandboxType::Seatbelt,
        }
    }

    pub fn policy(&self) -> Option<&SandboxPolicy> {
        match self {
            Self::Noop => None,
            Self::Landlock { policy, .. }
            | Self::Seccomp { policy }
            | Self::Seatbelt { policy } => Some(policy),
        }
    }

    /// Wrap `spec` so it runs confined. Pure: nothing is spawned or opened.
    pub fn enforce(&self, spec: CommandSpec) -> ConfinedCommand {
        match self {
            Self::Noop => ConfinedCommand {
                program: spec.program,
                args: spec.args,
                cwd: spec.cwd,
                env: spec.env,
                confinement: Confinement::none(),
                sandbox_type: SandboxType::Noop,
            },
            Self::Landlock {
                policy,
                seccomp_layer,
            } => {
                let confinement = Confinement {
                    limits: policy.resource_limits(spec.timeout),
                    filesystem: Some(policy.filesystem_rules(&spec.writable_roots)),
                    syscalls: seccomp_layer.then(|| policy.syscall_policy()),
                    no_new_privs: true,
                };
                confine(spec, policy, SandboxType::Landlock, confinement)
            }
            Self::Seccomp { policy } => {
                let confinement = Confinement {
                    limits: policy.resource_limits(spec.timeout),
                    filesystem: None,
                    syscalls: Some(policy.syscall_policy()),
                    no_new_privs: true,
                };
                confine(spec, policy, SandboxType::Seccomp, confinement)
            }
            Self::Seatbelt { policy } => {
                // The profile does the confining; rlimits still apply pre-exec.
                let confinement = Confinement {
                    limits: policy.resource_limits(spec.timeout),
                    ..Confinement::none()
                };
                confine(spec, policy, SandboxType::Seatbelt, confinement)
            }
        }
    }
}

fn confine(
    spec: CommandSpec,
    policy: &SandboxPolicy,
    sandbox_type: SandboxType,
    confinement: Confinement,
) -> ConfinedCommand {
    let writable_roots: Vec<PathBuf> = policy
        .write_paths
        .iter()
        .chain(&spec.writable_roots)
        .cloned()
        .collect();

    let mut env = spec.env;
    apply_sandbox_markers(
        &mut env,
        sandbox_type,
        !policy.network_allowed,
        &writable_roots,
    );

    let (program, args) = if sandbox_type == SandboxType::Seatbelt {
        let profile = seatbelt_profile(policy, &writable_roots);
        let mut args = vec!["-p".to_string(), profile, spec.program];
        args.extend(spec.args);
        (SEATBELT_EXECUTABLE.to_string(), args)
    } else {
        (spec.program, spec.args)
    };

    ConfinedCommand {
        program,
        args,
        cwd: spec.cwd,
        env,
        confinement,
        sandbox_type,
    }
}

fn quote_sbpl(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
}

/// Seatbelt profile: deny by default, read everywhere except blocked paths,
/// write only to the writable roots.
fn seatbelt_profile(policy: &SandboxPolicy, writable_roots: &[PathBuf]) -> String {
    let mut profile = String::from("(version 1)\n");
    profile.push_str("(deny default)\n");
    profile.push_str("(allow process-exec)\n");
    profile.push_str("(allow process-fork)\n");
    profile.push_str("(allow signal (target same-sandbox))\n");
    profile.push_str("(allow sysctl-read)\n");
    profile.push_str("(allow mach-lookup)\n");
    profile.push_str("(allow file-read*)\n");
    profile.push_str("(allow file-write* (literal \"/dev/null\"))\n");

    for root in writable_roots {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            quote_sbpl(root)
        ));
    }

    // Later rules win, so blocked paths override the broad allows above.
    for blocked in &policy.blocked_paths {
        profile.push_str(&format!(
            "(deny file-read* file-write* (subpath \"{}\"))\n",
            quote_sbpl(blocked)
        ));
    }

    if policy.network_allowed {
        profile.push_str("(allow network*)\n");
    } else {
        profile.push_str("(allow network* (local unix))\n");
    }

    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use execward_config::SandboxConfig;
    use execward_process::SyscallPolicy;
    use std::time::Duration;

    fn spec() -> CommandSpec {
        CommandSpec::new("/bin/sh")
            .with_args(["-c", "true"])
            .with_cwd("/tmp/s1")
            .with_timeout(Duration::from_secs(10))
            .with_writable_root("/tmp/s1")
    }

    fn policy() -> SandboxPolicy {
        SandboxPolicy::from_config(&SandboxConfig {
            blocked_paths: vec!["/Users/dev/.ssh".into()],
            ..SandboxConfig::default()
        })
    }

    #[test]
    fn noop_passes_through_unchanged() {
        let confined = Sandbox::Noop.enforce(spec());
        assert_eq!(confined.program, "/bin/sh");
        assert_eq!(confined.args, vec!["-c", "true"]);
        assert!(confined.confinement.is_unrestricted());
        assert!(confined.env.is_empty());
    }

    #[test]
    fn landlock_confines_filesystem_and_layers_seccomp() {
        let sandbox = Sandbox::Landlock {
            policy: policy(),
            seccomp_layer: true,
        };
        let confined = sandbox.enforce(spec());

        let rules = confined.confinement.filesystem.as_ref().unwrap();
        assert!(rules.write_paths.contains(&PathBuf::from("/tmp/s1")));
        assert!(matches!(
            confined.confinement.syscalls,
            Some(SyscallPolicy::DenyList { deny_network: true, .. })
        ));
        assert!(confined.confinement.no_new_privs);
        assert_eq!(confined.confinement.limits.cpu_seconds, Some(10));
        assert_eq!(
            confined.env.get("EXECWARD_SANDBOX_TYPE").map(String::as_str),
            Some("landlock")
        );
    }

    #[test]
    fn seatbelt_wraps_program_in_sandbox_exec() {
        let confined = Sandbox::Seatbelt { policy: policy() }.enforce(spec());

        assert_eq!(confined.program, SEATBELT_EXECUTABLE);
        assert_eq!(confined.args[0], "-p");
        assert_eq!(&confined.args[2..], ["/bin/sh", "-c", "true"]);
        let profile = &confined.args[1];
        assert!(profile.contains("(deny default)"));
        assert!(profile.contains("(allow file-write* (subpath \"/tmp/s1\"))"));
        assert!(profile.contains("(deny file-read* file-write* (subpath \"/Users/dev/.ssh\"))"));
        assert!(profile.contains("(allow network* (local unix))"));
        assert!(confined.confinement.filesystem.is_none());
    }

    #[test]
    fn sbpl_quoting_escapes_quotes() {
        assert_eq!(
            quote_sbpl(Path::new("/tmp/a\"b")),
            "/tmp/a\\\"b"
        );
    }
}
