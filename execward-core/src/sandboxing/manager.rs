use std::sync::Arc;

use execward_config::{SandboxConfig, SandboxTechnology};
use execward_process::SyscallPolicy;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};

use super::capabilities::{Capabilities, CapabilityDetector, CapabilityProbe};
use super::policy::SandboxPolicy;
use super::sandbox::{Sandbox, SandboxType};
use crate::error::SandboxError;

/// Snapshot for external reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxStatus {
    pub enabled: bool,
    pub technology: SandboxTechnology,
    pub capabilities: Capabilities,
    /// `None` until a sandbox has been created.
    pub sandbox_type: Option<SandboxType>,
}

/// Selects one [`Sandbox`] for the process lifetime.
///
/// The first successful [`create_sandbox`](Self::create_sandbox) fixes the
/// technology; later calls hand out the same `Arc`.
#[derive(Debug)]
pub struct SandboxManager {
    config: SandboxConfig,
    detector: CapabilityDetector,
    syscall_override: Option<SyscallPolicy>,
    sandbox: OnceCell<Arc<Sandbox>>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_detector(config, CapabilityDetector::system())
    }

    pub fn with_probe(config: SandboxConfig, probe: Arc<dyn CapabilityProbe>) -> Self {
        Self::with_detector(config, CapabilityDetector::new(probe))
    }

    pub fn with_detector(config: SandboxConfig, detector: CapabilityDetector) -> Self {
        Self {
            config,
            detector,
            syscall_override: None,
            sandbox: OnceCell::new(),
        }
    }

    /// Replace the default deny-list filter, e.g. with an allow-list preset.
    pub fn with_syscall_policy(mut self, policy: SyscallPolicy) -> Self {
        self.syscall_override = Some(policy);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_active()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn detector(&self) -> &CapabilityDetector {
        &self.detector
    }

    pub fn detect(&self) -> &Capabilities {
        self.detector.detect()
    }

    pub fn get_capabilities(&self) -> &Capabilities {
        self.detect()
    }

    /// Build the sandbox on first use and return the cached instance.
    ///
    /// Errors are not cached: a failed selection is retried on the next call.
    pub fn create_sandbox(&self) -> Result<Arc<Sandbox>, SandboxError> {
        self.sandbox
            .get_or_try_init(|| self.select().map(Arc::new))
            .cloned()
    }

    pub fn get_status(&self) -> SandboxStatus {
        SandboxStatus {
            enabled: self.is_enabled(),
            technology: self.config.technology,
            capabilities: self.detect().clone(),
            sandbox_type: self.sandbox.get().map(|sandbox| sandbox.sandbox_type()),
        }
    }

    fn select(&self) -> Result<Sandbox, SandboxError> {
        if !self.is_enabled() {
            info!("sandbox disabled; using noop");
            return Ok(Sandbox::Noop);
        }

        let capabilities = self.detect();
        let requested = self.config.technology;
        let technology = match requested {
            SandboxTechnology::Auto => {
                let best = capabilities.best_available();
                if best == SandboxTechnology::None {
                    warn!(
                        platform = %capabilities.platform,
                        "no sandbox technology available; falling back to noop"
                    );
                }
                best
            }
            explicit if capabilities.supports(explicit) => explicit,
            explicit => {
                if !self.config.fallback_to_noop {
                    return Err(SandboxError::Unsupported {
                        technology: explicit,
                        platform: capabilities.platform.clone(),
                    });
                }
                warn!(
                    requested = %explicit,
                    platform = %capabilities.platform,
                    "sandbox technology unavailable; falling back to noop"
                );
                SandboxTechnology::None
            }
        };

        let sandbox = self.instantiate(technology, capabilities);
        info!(
            requested = %requested,
            selected = %sandbox.sandbox_type(),
            "sandbox selected"
        );
        Ok(sandbox)
    }

    fn instantiate(&self, technology: SandboxTechnology, capabilities: &Capabilities) -> Sandbox {
        let mut policy = SandboxPolicy::from_config(&self.config);
        if let Some(syscalls) = &self.syscall_override {
            policy = policy.with_syscalls(syscalls.clone());
        }

        match technology {
            SandboxTechnology::None | SandboxTechnology::Auto => Sandbox::Noop,
            SandboxTechnology::Landlock => Sandbox::Landlock {
                policy,
                seccomp_layer: capabilities.seccomp,
            },
            SandboxTechnology::Seccomp => Sandbox::Seccomp { policy },
            SandboxTechnology::Seatbelt => Sandbox::Seatbelt { policy },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandboxing::StaticProbe;

    fn linux_caps() -> Capabilities {
        Capabilities {
            platform: "linux".into(),
            kernel_version: Some("6.8.0".into()),
            landlock: true,
            landlock_abi: Some(4),
            seccomp: true,
            seatbelt: false,
        }
    }

    fn manager(config: SandboxConfig, caps: Capabilities) -> SandboxManager {
        SandboxManager::with_probe(config, Arc::new(StaticProbe(caps)))
    }

    #[test]
    fn disabled_config_yields_cached_noop() {
        let manager = manager(SandboxConfig::disabled(), linux_caps());
        assert!(!manager.is_enabled());

        let first = manager.create_sandbox().unwrap();
        let second = manager.create_sandbox().unwrap();
        assert_eq!(*first, Sandbox::Noop);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn technology_none_is_not_enabled() {
        let config = SandboxConfig::default().with_technology(SandboxTechnology::None);
        let manager = manager(config, linux_caps());
        assert!(!manager.is_enabled());
        assert_eq!(*manager.create_sandbox().unwrap(), Sandbox::Noop);
    }

    #[test]
    fn auto_prefers_landlock_with_seccomp_layer() {
        let manager = manager(SandboxConfig::default(), linux_caps());
        let sandbox = manager.create_sandbox().unwrap();
        assert!(matches!(
            *sandbox,
            Sandbox::Landlock {
                seccomp_layer: true,
                ..
            }
        ));
    }

    #[test]
    fn auto_without_primitives_degrades_to_noop() {
        let manager = SandboxManager::with_probe(
            SandboxConfig::default(),
            Arc::new(StaticProbe::nothing()),
        );
        assert!(manager.is_enabled());
        assert_eq!(manager.create_sandbox().unwrap().sandbox_type(), SandboxType::Noop);
    }

    #[test]
    fn explicit_unsupported_falls_back_when_allowed() {
        let config = SandboxConfig::default().with_technology(SandboxTechnology::Seatbelt);
        let manager = manager(config, linux_caps());
        assert_eq!(*manager.create_sandbox().unwrap(), Sandbox::Noop);
    }

    #[test]
    fn explicit_unsupported_is_fatal_without_fallback() {
        let config = SandboxConfig {
            fallback_to_noop: false,
            ..SandboxConfig::default().with_technology(SandboxTechnology::Seatbelt)
        };
        let manager = manager(config, linux_caps());

        let err = manager.create_sandbox().unwrap_err();
        assert_eq!(
            err,
            SandboxError::Unsupported {
                technology: SandboxTechnology::Seatbelt,
                platform: "linux".into(),
            }
        );
        assert_eq!(manager.get_status().sandbox_type, None);
    }

    #[test]
    fn status_reports_cached_type_only_after_creation() {
        let config = SandboxConfig::default().with_technology(SandboxTechnology::Seccomp);
        let manager = manager(config, linux_caps());
        assert_eq!(manager.get_status().sandbox_type, None);

        manager.create_sandbox().unwrap();
        let status = manager.get_status();
        assert!(status.enabled);
        assert_eq!(status.technology, SandboxTechnology::Seccomp);
        assert_eq!(status.sandbox_type, Some(SandboxType::Seccomp));
        assert!(status.capabilities.landlock);
    }

    #[test]
    fn syscall_override_reaches_policy() {
        let override_policy = SyscallPolicy::AllowList {
            syscalls: vec!["read".into(), "write".into()],
        };
        let config = SandboxConfig::default().with_technology(SandboxTechnology::Seccomp);
        let manager = manager(config, linux_caps()).with_syscall_policy(override_policy.clone());

        let sandbox = manager.create_sandbox().unwrap();
        assert_eq!(
            sandbox.policy().and_then(|policy| policy.syscalls.clone()),
            Some(override_policy)
        );
    }
}
