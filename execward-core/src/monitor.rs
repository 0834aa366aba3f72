//! Runtime re-verification of sandbox isolation.
//!
//! Each check run spawns one probe shell through the active sandbox. The
//! probe reports what it could observe and attempt (a write outside its
//! writable root, its process group, its rlimits, the no-new-privs bit) and
//! the four checks are evaluated from those facts plus a fresh capability
//! probe. The monitor only observes; it never touches the sandbox it inspects.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use execward_config::SandboxTechnology;
use execward_process::{CaptureOptions, run_captured};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sandboxing::env::build_sanitized_env;
use crate::sandboxing::{
    Capabilities, CommandSpec, Sandbox, SandboxManager, SandboxPolicy, SandboxType,
};

pub const NAMESPACE_ISOLATION: &str = "namespace_isolation";
pub const FILESYSTEM_ISOLATION: &str = "filesystem_isolation";
pub const PROCESS_ISOLATION: &str = "process_isolation";
pub const RESOURCE_LIMITS: &str = "resource_limits";

/// Names of the checks, in report order.
pub const CHECK_NAMES: [&str; 4] = [
    NAMESPACE_ISOLATION,
    FILESYSTEM_ISOLATION,
    PROCESS_ISOLATION,
    RESOURCE_LIMITS,
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_OUTPUT_LIMIT: usize = 16 * 1024;
const PROBE_FILE: &str = "probe";

const PROBE_SCRIPT: &str = r#"
if (echo x > "$1/probe") 2>/dev/null; then echo write=ok; else echo write=denied; fi
echo "pid=$$"
pgid=$(cut -d' ' -f5 /proc/$$/stat 2>/dev/null)
[ -n "$pgid" ] || pgid=$(ps -o pgid= -p $$ 2>/dev/null | tr -d ' ')
echo "pgid=$pgid"
echo "data=$(ulimit -d 2>/dev/null)"
echo "vmem=$(ulimit -v 2>/dev/null)"
echo "cpu=$(ulimit -t 2>/dev/null)"
echo "nnp=$(sed -n 's/^NoNewPrivs:[[:space:]]*//p' /proc/$$/status 2>/dev/null)"
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IntegrityCheck {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: None,
        }
    }

    fn pass_with(name: &str, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::pass(name)
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// AND of every check's `passed`.
    pub all_passed: bool,
    pub checks: Vec<IntegrityCheck>,
    pub timestamp: DateTime<Utc>,
}

impl IntegrityReport {
    pub fn from_checks(checks: Vec<IntegrityCheck>) -> Self {
        Self {
            all_passed: checks.iter().all(|check| check.passed),
            checks,
            timestamp: Utc::now(),
        }
    }

    fn all_failed(detail: &str) -> Self {
        Self::from_checks(
            CHECK_NAMES
                .iter()
                .map(|name| IntegrityCheck::fail(name, detail))
                .collect(),
        )
    }

    pub fn check(&self, name: &str) -> Option<&IntegrityCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}

/// What the probe process saw from inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeFacts {
    /// The forbidden file exists on the host after the probe ran.
    pub wrote_outside_root: bool,
    pub pid: Option<i32>,
    pub pgid: Option<i32>,
    pub data_limit: Option<String>,
    pub vmem_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub no_new_privs: Option<bool>,
}

impl ProbeFacts {
    fn parse(stdout: &str, wrote_outside_root: bool) -> Self {
        let fields: HashMap<&str, &str> = stdout
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();
        let text = |key: &str| {
            fields
                .get(key)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
        };
        Self {
            wrote_outside_root,
            pid: fields.get("pid").and_then(|value| value.parse().ok()),
            pgid: fields.get("pgid").and_then(|value| value.parse().ok()),
            data_limit: text("data"),
            vmem_limit: text("vmem"),
            cpu_limit: text("cpu"),
            no_new_privs: fields.get("nnp").and_then(|value| match *value {
                "1" => Some(true),
                "0" => Some(false),
                _ => None,
            }),
        }
    }
}

/// Evaluate the four checks from probe facts. Pure.
pub fn evaluate(
    sandbox: &Sandbox,
    facts: &ProbeFacts,
    capabilities: &Capabilities,
    host_pgid: Option<i32>,
) -> Vec<IntegrityCheck> {
    let Some(policy) = sandbox.policy() else {
        return CHECK_NAMES
            .iter()
            .map(|name| IntegrityCheck::fail(name, "no sandbox is active"))
            .collect();
    };
    let sandbox_type = sandbox.sandbox_type();

    vec![
        namespace_check(sandbox_type, facts, capabilities),
        filesystem_check(sandbox_type, facts),
        process_check(facts, host_pgid),
        resource_check(policy, facts),
    ]
}

fn technology_of(sandbox_type: SandboxType) -> SandboxTechnology {
    match sandbox_type {
        SandboxType::Noop => SandboxTechnology::None,
        SandboxType::Landlock => SandboxTechnology::Landlock,
        SandboxType::Seccomp => SandboxTechnology::Seccomp,
        SandboxType::Seatbelt => SandboxTechnology::Seatbelt,
    }
}

fn namespace_check(
    sandbox_type: SandboxType,
    facts: &ProbeFacts,
    capabilities: &Capabilities,
) -> IntegrityCheck {
    if !capabilities.supports(technology_of(sandbox_type)) {
        return IntegrityCheck::fail(
            NAMESPACE_ISOLATION,
            format!("{sandbox_type} is no longer reported available on this host"),
        );
    }
    match sandbox_type {
        SandboxType::Landlock | SandboxType::Seccomp => match facts.no_new_privs {
            Some(true) => IntegrityCheck::pass(NAMESPACE_ISOLATION),
            Some(false) => IntegrityCheck::fail(
                NAMESPACE_ISOLATION,
                "probe runs without no_new_privs",
            ),
            None => IntegrityCheck::fail(
                NAMESPACE_ISOLATION,
                "probe could not report its no_new_privs state",
            ),
        },
        _ => IntegrityCheck::pass(NAMESPACE_ISOLATION),
    }
}

fn filesystem_check(sandbox_type: SandboxType, facts: &ProbeFacts) -> IntegrityCheck {
    if !facts.wrote_outside_root {
        return IntegrityCheck::pass(FILESYSTEM_ISOLATION);
    }
    let detail = if sandbox_type == SandboxType::Seccomp {
        "write outside the writable root succeeded; seccomp alone does not confine the filesystem"
    } else {
        "write outside the writable root succeeded"
    };
    IntegrityCheck::fail(FILESYSTEM_ISOLATION, detail)
}

fn process_check(facts: &ProbeFacts, host_pgid: Option<i32>) -> IntegrityCheck {
    let (Some(pid), Some(pgid)) = (facts.pid, facts.pgid) else {
        return IntegrityCheck::fail(PROCESS_ISOLATION, "probe could not report its process group");
    };
    if host_pgid == Some(pgid) {
        return IntegrityCheck::fail(
            PROCESS_ISOLATION,
            format!("probe shares the host process group {pgid}"),
        );
    }
    if pgid != pid {
        return IntegrityCheck::fail(
            PROCESS_ISOLATION,
            format!("probe {pid} is not the leader of its process group {pgid}"),
        );
    }
    IntegrityCheck::pass(PROCESS_ISOLATION)
}

fn resource_check(policy: &SandboxPolicy, facts: &ProbeFacts) -> IntegrityCheck {
    let is_limited = |value: &Option<String>| {
        value
            .as_deref()
            .is_some_and(|value| value != "unlimited")
    };

    let mut missing = Vec::new();
    if policy.memory_bytes.is_some() {
        let memory = if cfg!(target_os = "linux") {
            &facts.data_limit
        } else {
            &facts.vmem_limit
        };
        if !is_limited(memory) {
            missing.push("memory");
        }
    }
    // The CPU limit is always derived from the timeout.
    if !is_limited(&facts.cpu_limit) {
        missing.push("cpu time");
    }

    if missing.is_empty() {
        if policy.memory_bytes.is_none() {
            IntegrityCheck::pass_with(RESOURCE_LIMITS, "no memory ceiling configured")
        } else {
            IntegrityCheck::pass(RESOURCE_LIMITS)
        }
    } else {
        IntegrityCheck::fail(
            RESOURCE_LIMITS,
            format!("limits not in effect: {}", missing.join(", ")),
        )
    }
}

struct Inner {
    sandbox: Arc<SandboxManager>,
    probe_root: PathBuf,
    last_report: Mutex<Option<IntegrityReport>>,
    task: Mutex<Option<MonitorTask>>,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

/// Periodic integrity checker. Cloning shares the same state.
#[derive(Clone)]
pub struct SandboxMonitor {
    inner: Arc<Inner>,
}

impl SandboxMonitor {
    /// `probe_root` hosts the probe's scratch directories; it must not be writable
    /// by the sandbox policy itself.
    pub fn new(sandbox: Arc<SandboxManager>, probe_root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sandbox,
                probe_root: probe_root.into(),
                last_report: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Run the four checks once and remember the report.
    pub async fn check_integrity(&self) -> IntegrityReport {
        let report = check_once(&self.inner).await;
        *self.inner.last_report.lock() = Some(report.clone());
        report
    }

    pub fn get_last_report(&self) -> Option<IntegrityReport> {
        self.inner.last_report.lock().clone()
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Check now and then every `interval`. Restarts the loop if it is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring(&self, interval: Duration) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            Arc::downgrade(&self.inner),
            interval.max(Duration::from_millis(1)),
            cancel.clone(),
        ));

        if let Some(previous) = self
            .inner
            .task
            .lock()
            .replace(MonitorTask { cancel, handle })
        {
            previous.cancel.cancel();
        }
        info!(interval_ms = interval.as_millis() as u64, "sandbox monitor started");
    }

    /// Stop the loop and wait for it to finish. No-op when not running.
    pub async fn stop_monitoring(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(err) = task.handle.await {
                warn!(error = %err, "sandbox monitor task ended abnormally");
            }
            info!("sandbox monitor stopped");
        }
    }

    /// Forget the last report.
    pub fn reset(&self) {
        self.inner.last_report.lock().take();
    }
}

impl std::fmt::Debug for SandboxMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxMonitor")
            .field("probe_root", &self.inner.probe_root)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

async fn monitor_loop(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let report = tokio::select! {
            _ = cancel.cancelled() => break,
            report = check_once(&inner) => report,
        };
        *inner.last_report.lock() = Some(report);
    }
    debug!("sandbox monitor loop exited");
}

async fn check_once(inner: &Inner) -> IntegrityReport {
    let sandbox = match inner.sandbox.create_sandbox() {
        Ok(sandbox) => sandbox,
        Err(err) => {
            warn!(error = %err, "integrity check could not obtain a sandbox");
            return IntegrityReport::all_failed(&format!("no sandbox: {err}"));
        }
    };

    let report = if sandbox.sandbox_type().is_enforcing() {
        match run_probe(&sandbox, &inner.probe_root).await {
            Ok(facts) => {
                let capabilities = inner.sandbox.detector().probe_fresh();
                IntegrityReport::from_checks(evaluate(
                    &sandbox,
                    &facts,
                    &capabilities,
                    host_process_group(),
                ))
            }
            Err(err) => IntegrityReport::all_failed(&format!("integrity probe failed: {err}")),
        }
    } else {
        IntegrityReport::from_checks(evaluate(
            &sandbox,
            &ProbeFacts::default(),
            inner.sandbox.detect(),
            host_process_group(),
        ))
    };

    for check in report.checks.iter().filter(|check| !check.passed) {
        warn!(
            check = %check.name,
            detail = check.detail.as_deref().unwrap_or_default(),
            "sandbox integrity check failed"
        );
    }
    report
}

async fn run_probe(sandbox: &Sandbox, probe_root: &Path) -> std::io::Result<ProbeFacts> {
    tokio::fs::create_dir_all(probe_root).await?;
    let work_dir = tempfile::Builder::new()
        .prefix("integrity-")
        .tempdir_in(probe_root)?;
    let forbidden = tempfile::Builder::new()
        .prefix("integrity-forbidden-")
        .tempdir_in(probe_root)?;

    let host_env: BTreeMap<String, String> = std::env::vars().collect();
    let spec = CommandSpec::new("/bin/sh")
        .with_args([
            "-c".to_string(),
            PROBE_SCRIPT.to_string(),
            "integrity-probe".to_string(),
            forbidden.path().display().to_string(),
        ])
        .with_cwd(work_dir.path())
        .with_env(build_sanitized_env(&host_env, &[], work_dir.path()))
        .with_timeout(PROBE_TIMEOUT)
        .with_writable_root(work_dir.path());

    let confined = sandbox.enforce(spec).into_spawn_spec();
    let output = run_captured(&confined, CaptureOptions::new(PROBE_TIMEOUT, PROBE_OUTPUT_LIMIT))
        .await
        .map_err(|err| std::io::Error::other(err.to_string()))?;

    let wrote = forbidden.path().join(PROBE_FILE).exists();
    debug!(
        termination = ?output.termination,
        wrote_outside_root = wrote,
        "integrity probe finished"
    );
    Ok(ProbeFacts::parse(&output.stdout, wrote))
}

#[cfg(unix)]
fn host_process_group() -> Option<i32> {
    Some(nix::unistd::getpgrp().as_raw())
}

#[cfg(not(unix))]
fn host_process_group() -> Option<i32> {
    None
}
