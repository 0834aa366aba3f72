use std::io::{IsTerminal, Read, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use execward_config::ExecwardConfig;
use execward_core::{
    ApprovalDecision, CodeExecutionManager, ExecError, ExecutionRequest, ExecutionResult,
    OutputChunk, StreamKind,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::args::RunArgs;
use super::{build_manager, exit_code};

/// Exit status when the run is parked behind a pending approval.
const APPROVAL_PENDING_EXIT: u8 = 3;

pub async fn handle_run_command(
    mut config: ExecwardConfig,
    args: RunArgs,
    json: bool,
) -> Result<ExitCode> {
    if let Some(policy) = args.approval_policy {
        config.execution.approval_policy = policy;
    }
    if let Some(technology) = args.sandbox {
        config.sandbox.technology = technology;
    }
    if args.network {
        config.sandbox.network_allowed = true;
    }

    let code = read_code(&args)?;
    let manager = build_manager(&config);

    let mut request = ExecutionRequest::new(args.runtime, code);
    if let Some(secs) = args.timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    if let Some(approval_id) = &args.approval {
        request = request.with_approval(approval_id);
    }
    let named_session = args.session.is_some();
    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| format!("cli-{}", std::process::id()));
    request = request.with_session(&session_id);

    let run = run_with_approval(&manager, request, &args);
    tokio::pin!(run);
    let mut interrupted = false;
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!(%session_id, "interrupted; terminating session");
            interrupted = true;
            // Termination cancels the run, which then releases the session.
            let (_, outcome) = tokio::join!(manager.terminate_session(&session_id), &mut run);
            outcome
        }
    };

    let pending = matches!(outcome, Err(ExecError::ApprovalRequired { .. }));
    if !named_session
        && !interrupted
        && !pending
        && let Err(err) = manager.terminate_session(&session_id).await
    {
        debug!(%session_id, error = %err, "session cleanup skipped");
    }
    manager.shutdown().await;

    let result = match outcome {
        Ok(result) => result,
        Err(ExecError::ApprovalRequired {
            approval_id,
            session_id,
        }) => {
            report_pending(&approval_id, &session_id, json)?;
            return Ok(ExitCode::from(APPROVAL_PENDING_EXIT));
        }
        Err(err) => return Err(err.into()),
    };
    if interrupted {
        bail!("interrupted");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !args.stream {
        print_result(&result)?;
    }
    if result.timed_out {
        eprintln!("execward: timed out after {} ms", result.timeout_ms);
    }
    if result.truncated {
        eprintln!("execward: output truncated at {} bytes", result.captured_bytes);
    }
    Ok(exit_code(result.exit_code))
}

/// Submit, resolving a required approval on the spot when possible.
///
/// Without `--yes` or a terminal to ask on, the approval is left pending.
async fn run_with_approval(
    manager: &CodeExecutionManager,
    request: ExecutionRequest,
    args: &RunArgs,
) -> Result<ExecutionResult, ExecError> {
    let (approval_id, session_id) = match submit(manager, request.clone(), args.stream).await {
        Err(ExecError::ApprovalRequired {
            approval_id,
            session_id,
        }) => (approval_id, session_id),
        other => return other,
    };

    let decision = if args.yes {
        ApprovalDecision::Approved
    } else if std::io::stdin().is_terminal() {
        prompt_for_approval(&request).await
    } else {
        return Err(ExecError::ApprovalRequired {
            approval_id,
            session_id,
        });
    };
    manager.resolve_approval(&approval_id, decision).await?;
    if decision == ApprovalDecision::Rejected {
        return Err(ExecError::ApprovalRejected { approval_id });
    }
    // The approval id doubles as the single-use token under the `always` policy.
    submit(manager, request.with_approval(approval_id), args.stream).await
}

async fn submit(
    manager: &CodeExecutionManager,
    request: ExecutionRequest,
    stream: bool,
) -> Result<ExecutionResult, ExecError> {
    if !stream {
        return manager.submit_execution(request).await;
    }

    let (tx, rx) = manager.chunk_channel();
    let printer = tokio::spawn(print_chunks(rx));
    let result = manager.submit_execution_streaming(request, tx).await;
    if let Err(err) = printer.await {
        debug!(error = %err, "chunk printer stopped");
    }
    result
}

async fn print_chunks(mut rx: mpsc::Receiver<OutputChunk>) {
    while let Some(chunk) = rx.recv().await {
        let written = match chunk.stream {
            StreamKind::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(chunk.data.as_bytes()).and_then(|()| out.flush())
            }
            StreamKind::Stderr => std::io::stderr().write_all(chunk.data.as_bytes()),
        };
        if written.is_err() {
            break;
        }
    }
}

async fn prompt_for_approval(request: &ExecutionRequest) -> ApprovalDecision {
    let question = format!(
        "Run {} snippet ({} bytes) in session `{}`? [y/N] ",
        request.runtime,
        request.code.len(),
        request.session_id.as_deref().unwrap_or("-"),
    );
    let answer = tokio::task::spawn_blocking(move || {
        eprint!("{question}");
        std::io::stderr().flush().ok();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await;

    match answer {
        Ok(Ok(line)) => match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => ApprovalDecision::Approved,
            other => other.parse().unwrap_or(ApprovalDecision::Rejected),
        },
        _ => ApprovalDecision::Rejected,
    }
}

fn report_pending(approval_id: &str, session_id: &str, json: bool) -> Result<()> {
    if json {
        let pending = json!({
            "status": "pending",
            "approval_id": approval_id,
            "session_id": session_id,
        });
        println!("{}", serde_json::to_string_pretty(&pending)?);
    } else {
        eprintln!("execward: approval `{approval_id}` is pending for session `{session_id}`");
        eprintln!(
            "execward: run `execward approve {approval_id}`, then resubmit with \
             `--session {session_id} --approval {approval_id}`"
        );
    }
    Ok(())
}

fn read_code(args: &RunArgs) -> Result<String> {
    if let Some(code) = &args.code {
        return Ok(code.clone());
    }
    match args.file.as_deref() {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snippet from {}", path.display())),
        _ => {
            if std::io::stdin().is_terminal() {
                bail!("no code given; use --code, --file or pipe the snippet on stdin");
            }
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("failed to read snippet from stdin")?;
            Ok(code)
        }
    }
}

fn print_result(result: &ExecutionResult) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(result.stdout.as_bytes())?;
    stdout.flush()?;
    std::io::stderr().write_all(result.stderr.as_bytes())?;
    Ok(())
}
