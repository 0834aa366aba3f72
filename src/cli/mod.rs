use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use execward_config::ExecwardConfig;
use execward_core::{ApprovalDecision, CodeExecutionManager, CodeExecutionManagerBuilder, JsonFileStore};

mod approvals;
pub mod args;
mod capture;
mod run;
mod sandbox;

pub use args::{Cli, Commands};

pub async fn dispatch(command: Commands, config: ExecwardConfig, json: bool) -> Result<ExitCode> {
    match command {
        Commands::Run(args) => run::handle_run_command(config, args, json).await,
        Commands::Approve { approval_id } => {
            approvals::handle_resolve_command(&config, &approval_id, ApprovalDecision::Approved, json)
                .await
        }
        Commands::Reject { approval_id } => {
            approvals::handle_resolve_command(&config, &approval_id, ApprovalDecision::Rejected, json)
                .await
        }
        Commands::Approvals => approvals::handle_approvals_command(&config, json).await,
        Commands::Session(command) => {
            approvals::handle_session_command(&config, command, json).await
        }
        Commands::Capture(args) => capture::handle_capture_command(&config, args, json).await,
        Commands::SandboxStatus => sandbox::handle_status_command(&config, json),
        Commands::Integrity => sandbox::handle_integrity_command(&config, json).await,
        Commands::Monitor(args) => sandbox::handle_monitor_command(&config, args, json).await,
        Commands::Config => sandbox::handle_config_command(&config),
    }
}

/// Manager backed by the on-disk state file, so separate invocations share
/// sessions and approvals. The state directory is also blocked inside the
/// sandbox.
fn build_manager(config: &ExecwardConfig) -> CodeExecutionManager {
    let state = config.execution.resolved_state_file();
    let mut config = config.clone();
    if let Some(dir) = state.parent() {
        config.sandbox.blocked_paths.push(dir.display().to_string());
    }
    CodeExecutionManagerBuilder::from_config(&config)
        .with_store(Arc::new(JsonFileStore::new(state)))
        .build()
}

/// Map a child exit status onto the process exit code.
fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}
