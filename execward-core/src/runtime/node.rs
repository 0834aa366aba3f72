use std::path::PathBuf;

use async_trait::async_trait;

use super::{RunContext, Runtime, RuntimeAdapter};
use crate::error::ExecError;
use crate::sandboxing::CommandSpec;

/// Runs snippets with `node -e`.
#[derive(Debug, Clone, Default)]
pub struct NodeAdapter {
    interpreter: Option<PathBuf>,
}

impl NodeAdapter {
    pub fn with_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: Some(interpreter.into()),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for NodeAdapter {
    fn runtime(&self) -> Runtime {
        Runtime::Node
    }

    fn command_spec(&self, code: &str, ctx: &RunContext) -> Result<CommandSpec, ExecError> {
        let interpreter = match &self.interpreter {
            Some(path) => path.clone(),
            None => which::which("node").map_err(|err| ExecError::RuntimeUnavailable {
                runtime: Runtime::Node,
                reason: format!("node not found on PATH: {err}"),
            })?,
        };
        Ok(ctx
            .command(interpreter.to_string_lossy())
            .with_args(["-e", code]))
    }
}
