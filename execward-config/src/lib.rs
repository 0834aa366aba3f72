//! Configuration for execward.
//!
//! The model mirrors the sections of `execward.toml`:
//!
//! ```toml
//! [sandbox]
//! enabled = true
//! technology = "auto"
//!
//! [execution]
//! approval_policy = "first_time"
//! default_timeout_secs = 30
//!
//! [secrets]
//! min_length = 8
//! ```
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable configuration.

pub mod debug;
pub mod env;
pub mod execution;
pub mod loader;
pub mod monitor;
pub mod paths;
pub mod root;
pub mod sandbox;
pub mod secrets;

pub use debug::{DebugConfig, TraceLevel};
pub use env::load_dotenv;
pub use execution::{ApprovalPolicy, ExecutionConfig};
pub use loader::{ConfigManager, merge_toml_values};
pub use monitor::MonitorConfig;
pub use paths::{is_within, normalize_path};
pub use root::ExecwardConfig;
pub use sandbox::{DEFAULT_READ_PATHS, DEFAULT_SENSITIVE_PATHS, SandboxConfig, SandboxTechnology};
pub use secrets::{DEFAULT_SECRET_NAME_PATTERNS, SecretsConfig};

/// File name looked up in the workspace and user config directory.
pub const CONFIG_FILE_NAME: &str = "execward.toml";

/// Environment variable pointing at an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "EXECWARD_CONFIG_PATH";
