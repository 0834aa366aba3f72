use async_trait::async_trait;

use super::{RunContext, Runtime, RuntimeAdapter};
use crate::error::ExecError;
use crate::sandboxing::CommandSpec;

const DEFAULT_SHELL: &str = "/bin/sh";

/// Runs snippets with `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    shell: String,
}

impl ShellAdapter {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

#[async_trait]
impl RuntimeAdapter for ShellAdapter {
    fn runtime(&self) -> Runtime {
        Runtime::Shell
    }

    fn command_spec(&self, code: &str, ctx: &RunContext) -> Result<CommandSpec, ExecError> {
        Ok(ctx.command(&self.shell).with_args(["-c", code]))
    }
}
