//! Platform capability detection.
//!
//! Probing never fails: a primitive that cannot be confirmed is reported as
//! unavailable.

use std::fmt;
use std::sync::Arc;

use execward_config::SandboxTechnology;
use once_cell::sync::OnceCell;
use serde::Serialize;

/// Confinement primitives usable on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub platform: String,
    pub kernel_version: Option<String>,
    pub landlock: bool,
    pub landlock_abi: Option<u32>,
    pub seccomp: bool,
    pub seatbelt: bool,
}

impl Capabilities {
    /// Nothing available on `platform`.
    pub fn none(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            kernel_version: None,
            landlock: false,
            landlock_abi: None,
            seccomp: false,
            seatbelt: false,
        }
    }

    pub fn supports(&self, technology: SandboxTechnology) -> bool {
        match technology {
            SandboxTechnology::None | SandboxTechnology::Auto => true,
            SandboxTechnology::Landlock => self.landlock,
            SandboxTechnology::Seccomp => self.seccomp,
            SandboxTechnology::Seatbelt => self.seatbelt,
        }
    }

    /// Best primitive for this host, or `None` when nothing is available.
    pub fn best_available(&self) -> SandboxTechnology {
        if self.landlock {
            SandboxTechnology::Landlock
        } else if self.seccomp {
            SandboxTechnology::Seccomp
        } else if self.seatbelt {
            SandboxTechnology::Seatbelt
        } else {
            SandboxTechnology::None
        }
    }
}

/// Source of capability information. Swapped out in tests.
pub trait CapabilityProbe: Send + Sync + fmt::Debug {
    fn probe(&self) -> Capabilities;
}

/// Probes the running kernel and OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl CapabilityProbe for SystemProbe {
    fn probe(&self) -> Capabilities {
        probe_system()
    }
}

/// Reports a fixed set of capabilities.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub Capabilities);

impl StaticProbe {
    /// A host with no confinement primitives at all.
    pub fn nothing() -> Self {
        Self(Capabilities::none(std::env::consts::OS))
    }
}

impl CapabilityProbe for StaticProbe {
    fn probe(&self) -> Capabilities {
        self.0.clone()
    }
}

/// Memoizing wrapper around a [`CapabilityProbe`].
#[derive(Debug, Clone)]
pub struct CapabilityDetector {
    probe: Arc<dyn CapabilityProbe>,
    cached: Arc<OnceCell<Capabilities>>,
}

impl CapabilityDetector {
    pub fn new(probe: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            probe,
            cached: Arc::new(OnceCell::new()),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemProbe))
    }

    /// Probe once and return the cached answer afterwards.
    pub fn detect(&self) -> &Capabilities {
        self.cached.get_or_init(|| {
            let capabilities = self.probe.probe();
            tracing::debug!(?capabilities, "detected sandbox capabilities");
            capabilities
        })
    }

    /// Probe again, bypassing the cache. Used to notice degradation.
    pub fn probe_fresh(&self) -> Capabilities {
        self.probe.probe()
    }
}

impl Default for CapabilityDetector {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(target_os = "linux")]
fn probe_system() -> Capabilities {
    let landlock_abi = linux::landlock_abi();
    Capabilities {
        platform: std::env::consts::OS.to_string(),
        kernel_version: linux::kernel_release(),
        landlock: landlock_abi.is_some(),
        landlock_abi,
        seccomp: linux::seccomp_available(),
        seatbelt: false,
    }
}

#[cfg(target_os = "macos")]
fn probe_system() -> Capabilities {
    let kernel_version = nix::sys::utsname::uname()
        .ok()
        .map(|uts| uts.release().to_string_lossy().into_owned());
    Capabilities {
        kernel_version,
        seatbelt: is_executable(std::path::Path::new(super::sandbox::SEATBELT_EXECUTABLE)),
        ..Capabilities::none(std::env::consts::OS)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn probe_system() -> Capabilities {
    Capabilities::none(std::env::consts::OS)
}

#[cfg(target_os = "macos")]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
mod linux {
    const LANDLOCK_CREATE_RULESET_VERSION: libc::c_uint = 1 << 0;

    pub(super) fn kernel_release() -> Option<String> {
        nix::sys::utsname::uname()
            .ok()
            .map(|uts| uts.release().to_string_lossy().into_owned())
    }

    /// Landlock ABI version, if the kernel has Landlock enabled.
    pub(super) fn landlock_abi() -> Option<u32> {
        // SAFETY: a NULL attribute with size 0 and the VERSION flag only queries the ABI.
        let abi = unsafe {
            libc::syscall(
                libc::SYS_landlock_create_ruleset,
                std::ptr::null::<libc::c_void>(),
                0usize,
                LANDLOCK_CREATE_RULESET_VERSION,
            )
        };
        u32::try_from(abi).ok().filter(|abi| *abi >= 1)
    }

    /// Seccomp filtering is usable when the kernel answers `PR_GET_SECCOMP`.
    pub(super) fn seccomp_available() -> bool {
        // SAFETY: PR_GET_SECCOMP takes no pointers.
        let mode = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
        mode >= 0 && std::path::Path::new("/proc/sys/kernel/seccomp").exists()
    }
}
