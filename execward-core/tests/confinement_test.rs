//! Runs through the real Linux sandbox.
//!
//! Each test returns early on hosts where Landlock or seccomp is missing, so
//! the suite stays green in minimal containers.

#![cfg(target_os = "linux")]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use execward_config::{ApprovalPolicy, ExecutionConfig, SandboxConfig, SandboxTechnology};
use execward_core::{
    CapabilityDetector, CaptureProfile, CaptureRequest, CaptureSandbox, CodeExecutionManager,
    ExecutionRequest, Runtime, SandboxManager, SandboxType, SecretsFilter,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn host_confines() -> bool {
    let capabilities = CapabilityDetector::system().probe_fresh();
    let confines = capabilities.landlock && capabilities.seccomp;
    if !confines {
        eprintln!("skipping: host lacks landlock or seccomp ({capabilities:?})");
    }
    confines
}

fn host_env(home: &Path) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
        ("HOME".to_string(), home.display().to_string()),
        ("LANG".to_string(), "C".to_string()),
    ])
}

fn confined_manager(temp: &TempDir) -> CodeExecutionManager {
    let config = ExecutionConfig {
        approval_policy: ApprovalPolicy::None,
        work_root: Some(temp.path().to_path_buf()),
        kill_grace_ms: 200,
        ..ExecutionConfig::default()
    };
    let sandbox = SandboxConfig {
        fallback_to_noop: false,
        ..SandboxConfig::default().with_technology(SandboxTechnology::Landlock)
    };
    CodeExecutionManager::builder(config)
        .with_sandbox_manager(Arc::new(SandboxManager::new(sandbox)))
        .with_secrets(SecretsFilter::identity())
        .with_host_env(host_env(temp.path()))
        .build()
}

fn shell(code: &str) -> ExecutionRequest {
    ExecutionRequest::new(Runtime::Shell, code).with_session("confined")
}

#[tokio::test]
async fn shell_adapter_never_runs_unconfined() {
    if !host_confines() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let manager = confined_manager(&temp);

    let result = manager
        .submit_execution(shell(
            "echo $EXECWARD_SANDBOX_TYPE; grep -E '^(NoNewPrivs|Seccomp):' /proc/self/status",
        ))
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.sandbox_type, SandboxType::Landlock);
    assert_eq!(result.stdout, "landlock\nNoNewPrivs:\t1\nSeccomp:\t2\n");
}

#[tokio::test]
async fn writes_outside_the_session_directory_are_denied() {
    if !host_confines() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let target = outside.path().join("escaped.txt");
    let manager = confined_manager(&temp);

    let inside = manager
        .submit_execution(shell("echo kept > inside.txt && cat inside.txt"))
        .await
        .unwrap();
    assert_eq!(inside.stdout, "kept\n");

    let escaped = manager
        .submit_execution(shell(&format!("echo leaked > '{}'", target.display())))
        .await
        .unwrap();
    assert_ne!(escaped.exit_code, 0);
    assert!(escaped.stderr.contains("Permission denied"), "{}", escaped.stderr);
    assert!(!target.exists());
}

#[tokio::test]
async fn inet_sockets_are_refused_without_network() {
    if !host_confines() {
        return;
    }
    let Some(bash) = ["/bin/bash", "/usr/bin/bash"]
        .into_iter()
        .find(|path| Path::new(path).exists())
    else {
        eprintln!("skipping: bash is not installed");
        return;
    };
    let temp = TempDir::new().unwrap();
    let manager = confined_manager(&temp);

    let result = manager
        .submit_execution(shell(&format!(
            "{bash} -c 'exec 3<>/dev/tcp/127.0.0.1/9' 2>&1; echo status=$?"
        )))
        .await
        .unwrap();

    assert!(result.stdout.contains("Operation not permitted"), "{}", result.stdout);
    assert!(!result.stdout.ends_with("status=0\n"), "{}", result.stdout);
}

#[tokio::test]
async fn resource_limits_reach_the_child() {
    if !host_confines() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let manager = confined_manager(&temp);

    let result = manager
        .submit_execution(shell("ulimit -c; ulimit -t").with_timeout(Duration::from_secs(7)))
        .await
        .unwrap();

    // Core dumps off, CPU time capped at the wall-clock budget.
    assert_eq!(result.stdout, "0\n7\n");
}

#[tokio::test]
async fn capture_allow_list_still_runs_the_shell() {
    if !host_confines() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let capture = CaptureSandbox::new(CaptureProfile::default());

    let result = capture
        .run(
            CaptureRequest::new("/bin/sh", temp.path().join("capture"))
                .with_args(["-c", "echo captured > out.txt; read line < out.txt; echo $line"]),
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value.unwrap().stdout, "captured\n");
    let sandbox = capture.sandbox_manager().create_sandbox().unwrap();
    assert!(sandbox.sandbox_type().is_enforcing());
}
