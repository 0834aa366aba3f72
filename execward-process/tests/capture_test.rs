#![cfg(unix)]

use std::time::{Duration, Instant};

use execward_process::{
    CaptureOptions, KILLED_EXIT_CODE, ProcessError, SpawnSpec, StreamKind, Termination,
    run_captured,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn sh(script: &str) -> SpawnSpec {
    SpawnSpec::new("/bin/sh", std::env::temp_dir())
        .args(["-c", script])
        .env("PATH", "/usr/bin:/bin")
}

fn options() -> CaptureOptions {
    CaptureOptions::new(Duration::from_secs(10), 64 * 1024)
}

#[tokio::test]
async fn captures_both_streams() {
    let output = run_captured(&sh("echo hello; echo oops >&2; printf tail"), options())
        .await
        .unwrap();

    assert_eq!(output.termination, Termination::Exited(0));
    assert_eq!(output.stdout, "hello\ntail");
    assert_eq!(output.stderr, "oops\n");
    assert!(!output.truncated);
    assert_eq!(output.captured_bytes, output.stdout.len() + output.stderr.len());
}

#[tokio::test]
async fn child_sees_only_the_given_environment() {
    // SAFETY: the variable is unique to this test.
    unsafe { std::env::set_var("EXECWARD_PROCESS_TEST_LEAK", "visible") };
    let output = run_captured(
        &sh("echo \"${EXECWARD_PROCESS_TEST_LEAK:-absent} $MARKER\"").env("MARKER", "set"),
        options(),
    )
    .await
    .unwrap();

    assert_eq!(output.stdout, "absent set\n");
}

#[tokio::test]
async fn non_zero_exit_is_reported_verbatim() {
    let output = run_captured(&sh("exit 3"), options()).await.unwrap();
    assert_eq!(output.termination, Termination::Exited(3));
    assert_eq!(output.termination.exit_code(), 3);
}

#[tokio::test]
async fn timeout_kills_the_process_group() {
    let started = Instant::now();
    let output = run_captured(
        &sh("echo started; sleep 30 & sleep 30"),
        CaptureOptions::new(Duration::from_millis(300), 1024)
            .with_kill_grace(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    assert_eq!(output.termination, Termination::TimedOut);
    assert_eq!(output.termination.exit_code(), KILLED_EXIT_CODE);
    assert_eq!(output.stdout, "started\n");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn output_beyond_the_ceiling_is_truncated() {
    let output = run_captured(
        &sh("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"),
        CaptureOptions::new(Duration::from_secs(10), 100),
    )
    .await
    .unwrap();

    assert!(output.truncated);
    assert_eq!(output.captured_bytes, 100);
    assert_eq!(output.stdout.len(), 100);
    assert_eq!(output.termination, Termination::Exited(0));
}

#[tokio::test]
async fn chunks_are_streamed_in_order() {
    let (tx, mut rx) = mpsc::channel(16);
    let output = run_captured(&sh("echo one; echo two"), options().with_chunks(tx))
        .await
        .unwrap();

    let mut streamed = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        assert_eq!(chunk.stream, StreamKind::Stdout);
        streamed.push(chunk.data);
    }
    assert_eq!(streamed, vec!["one\n".to_string(), "two\n".to_string()]);
    assert_eq!(output.dropped_chunks, 0);
}

#[tokio::test]
async fn cancellation_stops_the_child() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let output = run_captured(&sh("sleep 30"), options().with_cancel(cancel))
        .await
        .unwrap();
    assert_eq!(output.termination, Termination::Cancelled);
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let spec = SpawnSpec::new("/nonexistent/definitely-not-here", std::env::temp_dir());
    let err = run_captured(&spec, options()).await.unwrap_err();
    assert!(matches!(err, ProcessError::Spawn { .. }));
    assert!(!err.is_resource_exhaustion());
}
