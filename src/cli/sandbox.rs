use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use execward_config::ExecwardConfig;
use execward_core::{IntegrityReport, SandboxManager, SandboxMonitor, SandboxStatus};
use tracing::info;

use super::args::MonitorArgs;

pub fn handle_status_command(config: &ExecwardConfig, json: bool) -> Result<ExitCode> {
    let manager = SandboxManager::new(config.sandbox.clone());
    let status = manager.get_status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&manager, &status);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(manager: &SandboxManager, status: &SandboxStatus) {
    let caps = &status.capabilities;
    println!("enabled:     {}", status.enabled);
    println!("technology:  {}", status.technology);
    println!(
        "platform:    {}{}",
        caps.platform,
        caps.kernel_version
            .as_deref()
            .map(|version| format!(" ({version})"))
            .unwrap_or_default()
    );
    println!(
        "landlock:    {}{}",
        caps.landlock,
        caps.landlock_abi
            .map(|abi| format!(" (abi v{abi})"))
            .unwrap_or_default()
    );
    println!("seccomp:     {}", caps.seccomp);
    println!("seatbelt:    {}", caps.seatbelt);
    match manager.create_sandbox() {
        Ok(sandbox) => println!("selected:    {}", sandbox.sandbox_type()),
        Err(err) => println!("selected:    none ({err})"),
    }
}

pub async fn handle_integrity_command(config: &ExecwardConfig, json: bool) -> Result<ExitCode> {
    let monitor = new_monitor(config);
    let report = monitor.check_integrity().await;
    print_report(&report, json)?;
    Ok(if report.all_passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub async fn handle_monitor_command(
    config: &ExecwardConfig,
    args: MonitorArgs,
    json: bool,
) -> Result<ExitCode> {
    let interval = args
        .interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.monitor.interval())
        .max(Duration::from_secs(1));
    let monitor = new_monitor(config);
    monitor.start_monitoring(interval);
    info!(interval_secs = interval.as_secs(), "monitoring started");

    let mut printed = 0usize;
    let mut last_seen = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut healthy = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        let Some(report) = monitor.get_last_report() else {
            continue;
        };
        if last_seen == Some(report.timestamp) {
            continue;
        }
        last_seen = Some(report.timestamp);
        healthy &= report.all_passed;
        print_report(&report, json)?;

        printed += 1;
        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    monitor.stop_monitoring().await;
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn new_monitor(config: &ExecwardConfig) -> SandboxMonitor {
    let manager = Arc::new(SandboxManager::new(config.sandbox.clone()));
    SandboxMonitor::new(manager, config.execution.resolved_work_root())
}

fn print_report(report: &IntegrityReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    println!(
        "[{}] integrity {}",
        report.timestamp.to_rfc3339(),
        if report.all_passed { "ok" } else { "FAILED" }
    );
    for check in &report.checks {
        let mark = if check.passed { "pass" } else { "fail" };
        match &check.detail {
            Some(detail) => println!("  {mark}  {:<22} {detail}", check.name),
            None => println!("  {mark}  {}", check.name),
        }
    }
    Ok(())
}

pub fn handle_config_command(config: &ExecwardConfig) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(ExitCode::SUCCESS)
}
