use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use execward_config::{ApprovalPolicy, SandboxTechnology};
use execward_core::Runtime;

/// Run untrusted code snippets inside an OS-level sandbox.
#[derive(Debug, Parser)]
#[command(name = "execward", version, about, long_about = None)]
pub struct Cli {
    /// Explicit configuration file (overrides `EXECWARD_CONFIG_PATH`).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Workspace whose `execward.toml` layers are loaded.
    #[arg(long, global = true, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Print machine-readable JSON instead of plain output.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a code snippet.
    Run(RunArgs),
    /// Approve a pending approval request.
    Approve {
        approval_id: String,
    },
    /// Reject a pending approval request.
    Reject {
        approval_id: String,
    },
    /// List pending approval requests.
    Approvals,
    /// Inspect or close a named session.
    #[command(subcommand)]
    Session(SessionCommand),
    /// Run a program under the strict capture profile.
    Capture(CaptureArgs),
    /// Show detected capabilities and the selected sandbox.
    SandboxStatus,
    /// Probe the active sandbox once and report each isolation check.
    Integrity,
    /// Re-run integrity checks on an interval until interrupted.
    Monitor(MonitorArgs),
    /// Print the effective configuration.
    Config,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Runtime to execute the snippet with.
    #[arg(short, long, default_value = "shell")]
    pub runtime: Runtime,

    /// Inline code. Reads from `--file` or stdin when omitted.
    #[arg(short, long, conflicts_with = "file")]
    pub code: Option<String>,

    /// Read the snippet from a file (`-` for stdin).
    #[arg(short, long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Timeout in seconds, clamped to the configured maximum.
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Run in a named session. Named sessions keep their scratch directory
    /// until terminated; unnamed runs are cleaned up afterwards.
    #[arg(short, long)]
    pub session: Option<String>,

    /// Approved approval id authorizing this run.
    #[arg(long, value_name = "ID")]
    pub approval: Option<String>,

    /// Approve any approval request without prompting.
    #[arg(short, long)]
    pub yes: bool,

    /// Override the configured approval policy.
    #[arg(long, value_name = "POLICY")]
    pub approval_policy: Option<ApprovalPolicy>,

    /// Override the configured sandbox technology.
    #[arg(long, value_name = "TECH")]
    pub sandbox: Option<SandboxTechnology>,

    /// Allow network access inside the sandbox.
    #[arg(long)]
    pub network: bool,

    /// Print output as it arrives.
    #[arg(long)]
    pub stream: bool,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Show a session's state.
    Status { session_id: String },
    /// Terminate a session, rejecting its pending approvals.
    Terminate { session_id: String },
}

#[derive(Debug, Args)]
pub struct CaptureArgs {
    /// Program to run.
    pub program: String,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Working directory; writable inside the sandbox.
    #[arg(short = 'C', long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Additional readable path.
    #[arg(long = "read", value_name = "PATH")]
    pub reads: Vec<PathBuf>,

    /// Additional writable path.
    #[arg(long = "write", value_name = "PATH")]
    pub writes: Vec<PathBuf>,

    /// Request network access (recorded as a violation).
    #[arg(long)]
    pub network: bool,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Seconds between checks; defaults to `[monitor] interval_secs`.
    #[arg(short, long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Stop after this many reports.
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}
