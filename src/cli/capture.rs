use std::process::ExitCode;

use anyhow::{Context, Result};
use execward_config::ExecwardConfig;
use execward_core::{CaptureProfile, CaptureRequest, CaptureSandbox, SecretsFilter};

use super::args::CaptureArgs;
use super::exit_code;

pub async fn handle_capture_command(
    config: &ExecwardConfig,
    args: CaptureArgs,
    json: bool,
) -> Result<ExitCode> {
    let work_dir = match args.work_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };

    let profile = CaptureProfile {
        technology: config.sandbox.technology,
        ..CaptureProfile::default()
    };
    let sandbox =
        CaptureSandbox::new(profile).with_secrets(SecretsFilter::from_env(&config.secrets));

    let mut request = CaptureRequest::new(args.program, work_dir).with_args(args.args);
    for path in args.reads {
        request = request.reading(path);
    }
    for path in args.writes {
        request = request.writing(path);
    }
    if args.network {
        request = request.with_network();
    }

    let result = sandbox.run(request).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if let Some(output) = &result.value {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
        }
        if let Some(error) = &result.error {
            eprintln!("execward: {error}");
        }
        for violation in &result.violations {
            eprintln!(
                "execward: {:?} violation ({:?}): {}",
                violation.kind, violation.severity, violation.description
            );
        }
    }

    Ok(match &result.value {
        Some(output) if result.success => exit_code(output.exit_code),
        _ => ExitCode::FAILURE,
    })
}
