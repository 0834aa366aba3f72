use std::process::ExitCode;

use anyhow::Result;
use execward_config::ExecwardConfig;
use execward_core::{ApprovalDecision, ApprovalRecord, ExecutionSession};

use super::args::SessionCommand;
use super::build_manager;

pub async fn handle_resolve_command(
    config: &ExecwardConfig,
    approval_id: &str,
    decision: ApprovalDecision,
    json: bool,
) -> Result<ExitCode> {
    let manager = build_manager(config);
    let record = manager.resolve_approval(approval_id, decision).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("approval `{}` {}", record.id, record.status);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn handle_approvals_command(config: &ExecwardConfig, json: bool) -> Result<ExitCode> {
    let manager = build_manager(config);
    let pending = manager.list_pending_approvals().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
    } else if pending.is_empty() {
        println!("no pending approvals");
    } else {
        for record in &pending {
            print_record(record);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_record(record: &ApprovalRecord) {
    println!(
        "{}  {:<7}  session={}  requested={}",
        record.id,
        record.runtime,
        record.session_id,
        record.requested_at.to_rfc3339()
    );
}

pub async fn handle_session_command(
    config: &ExecwardConfig,
    command: SessionCommand,
    json: bool,
) -> Result<ExitCode> {
    let manager = build_manager(config);
    match command {
        SessionCommand::Status { session_id } => {
            let session = manager.get_session_status(&session_id).await?;
            print_session(&session, json)?;
        }
        SessionCommand::Terminate { session_id } => {
            manager.terminate_session(&session_id).await?;
            let session = manager.get_session_status(&session_id).await?;
            print_session(&session, json)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_session(session: &ExecutionSession, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(session)?);
    } else {
        println!("session:       {}", session.id);
        println!("status:        {}", session.status);
        println!("runtime:       {}", session.runtime);
        println!("created:       {}", session.created_at.to_rfc3339());
        println!("last activity: {}", session.last_activity.to_rfc3339());
        println!("work dir:      {}", session.work_dir.display());
    }
    Ok(())
}
