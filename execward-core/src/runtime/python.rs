use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{RunContext, Runtime, RuntimeAdapter};
use crate::error::ExecError;
use crate::sandboxing::CommandSpec;

/// Runs snippets with `python3 -u -c`.
#[derive(Debug, Clone, Default)]
pub struct PythonAdapter {
    interpreter: Option<PathBuf>,
}

impl PythonAdapter {
    /// Pin the interpreter instead of resolving one per run.
    pub fn with_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: Some(interpreter.into()),
        }
    }

    /// Activated venv, then a `.venv` in the session directory, then `python3` on PATH.
    fn resolve_interpreter(&self, work_dir: &Path) -> Result<PathBuf, ExecError> {
        if let Some(interpreter) = &self.interpreter {
            return Ok(interpreter.clone());
        }

        if let Some(venv) = std::env::var_os("VIRTUAL_ENV") {
            let candidate = PathBuf::from(venv).join("bin").join("python");
            if candidate.exists() {
                debug!(interpreter = %candidate.display(), "using venv python");
                return Ok(candidate);
            }
        }

        let session_venv = work_dir.join(".venv").join("bin").join("python");
        if session_venv.exists() {
            debug!(interpreter = %session_venv.display(), "using session .venv python");
            return Ok(session_venv);
        }

        which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|err| ExecError::RuntimeUnavailable {
                runtime: Runtime::Python,
                reason: format!("no python interpreter on PATH: {err}"),
            })
    }
}

#[async_trait]
impl RuntimeAdapter for PythonAdapter {
    fn runtime(&self) -> Runtime {
        Runtime::Python
    }

    fn command_spec(&self, code: &str, ctx: &RunContext) -> Result<CommandSpec, ExecError> {
        let interpreter = self.resolve_interpreter(&ctx.work_dir)?;
        Ok(ctx
            .command(interpreter.to_string_lossy())
            .with_args(["-u", "-c", code]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_interpreter_wins() {
        let adapter = PythonAdapter::with_interpreter("/opt/py/bin/python3");
        let resolved = adapter.resolve_interpreter(Path::new("/tmp")).unwrap();
        assert_eq!(resolved, PathBuf::from("/opt/py/bin/python3"));
    }
}
