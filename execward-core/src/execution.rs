//! Execution orchestration: the public facade of the core.
//!
//! A request flows through session resolution, the approval gate, sandbox
//! selection and the runtime adapter. Output is redacted per line while it
//! streams and once more on the final aggregate.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use execward_config::{ExecutionConfig, ExecwardConfig};
use execward_process::{OutputChunk, Termination};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRecord, ApprovalStatus, GateOutcome};
use crate::error::ExecError;
use crate::monitor::{IntegrityReport, SandboxMonitor};
use crate::runtime::{RunContext, Runtime, RuntimeAdapter, default_adapters};
use crate::sandboxing::env::build_sanitized_env;
use crate::sandboxing::{SandboxManager, SandboxStatus, SandboxType};
use crate::secrets::SecretsFilter;
use crate::session::{ExecutionSession, SessionStatus};
use crate::store::{ExecutionStore, InMemoryStore};

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub runtime: Runtime,
    pub code: String,
    /// A fresh session is created when absent or unknown. One created for
    /// an absent id is discarded after its run.
    pub session_id: Option<String>,
    pub timeout: Option<Duration>,
    /// Approved record authorizing this run under the `always` policy.
    pub approval_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(runtime: Runtime, code: impl Into<String>) -> Self {
        Self {
            runtime,
            code: code.into(),
            session_id: None,
            timeout: None,
            approval_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_approval(mut self, approval_id: impl Into<String>) -> Self {
        self.approval_id = Some(approval_id.into());
        self
    }
}

/// Outcome of one run. `stdout` and `stderr` have always been redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub id: String,
    pub session_id: String,
    pub runtime: Runtime,
    /// [`KILLED_EXIT_CODE`](crate::KILLED_EXIT_CODE) when the run was killed by
    /// the watchdog or cancelled.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Effective timeout after clamping.
    pub timeout_ms: u64,
    /// Output exceeded the capture ceiling.
    pub truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub captured_bytes: usize,
    pub sandbox_type: SandboxType,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }

    /// Turn a timed-out result into [`ExecError::ExecutionTimeout`].
    pub fn ensure_completed(self) -> Result<Self, ExecError> {
        if self.timed_out {
            return Err(ExecError::ExecutionTimeout {
                timeout_ms: self.timeout_ms,
                result: Box::new(self),
            });
        }
        Ok(self)
    }
}

pub struct CodeExecutionManagerBuilder {
    config: ExecutionConfig,
    sandbox: Option<Arc<SandboxManager>>,
    store: Option<Arc<dyn ExecutionStore>>,
    secrets: Option<SecretsFilter>,
    adapters: BTreeMap<Runtime, Arc<dyn RuntimeAdapter>>,
    host_env: Option<BTreeMap<String, String>>,
}

impl CodeExecutionManagerBuilder {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config,
            sandbox: None,
            store: None,
            secrets: None,
            adapters: default_adapters(),
            host_env: None,
        }
    }

    /// Wire every section of a loaded configuration.
    pub fn from_config(config: &ExecwardConfig) -> Self {
        Self::new(config.execution.clone())
            .with_sandbox_manager(Arc::new(SandboxManager::new(config.sandbox.clone())))
            .with_secrets(SecretsFilter::from_env(&config.secrets))
    }

    pub fn with_sandbox_manager(mut self, sandbox: Arc<SandboxManager>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_secrets(mut self, secrets: SecretsFilter) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Register or replace the adapter for its runtime.
    pub fn with_adapter(mut self, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        self.adapters.insert(adapter.runtime(), adapter);
        self
    }

    /// Environment children are scrubbed from. Defaults to the process environment.
    pub fn with_host_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.host_env = Some(env);
        self
    }

    pub fn build(self) -> CodeExecutionManager {
        let store: Arc<dyn ExecutionStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryStore::new()),
        };
        let sandbox = self
            .sandbox
            .unwrap_or_else(|| Arc::new(SandboxManager::new(Default::default())));
        let work_root = self.config.resolved_work_root();
        let monitor = SandboxMonitor::new(Arc::clone(&sandbox), &work_root);

        CodeExecutionManager {
            gate: ApprovalGate::new(self.config.approval_policy, Arc::clone(&store)),
            secrets: Arc::new(self.secrets.unwrap_or_default()),
            host_env: self
                .host_env
                .unwrap_or_else(|| std::env::vars().collect()),
            adapters: self.adapters,
            work_root,
            config: self.config,
            store,
            sandbox,
            monitor,
            session_locks: Mutex::new(HashMap::new()),
            session_tokens: Mutex::new(HashMap::new()),
        }
    }
}

/// Entry point for collaborators (CLI, API layers).
pub struct CodeExecutionManager {
    config: ExecutionConfig,
    work_root: PathBuf,
    store: Arc<dyn ExecutionStore>,
    sandbox: Arc<SandboxManager>,
    gate: ApprovalGate,
    secrets: Arc<SecretsFilter>,
    adapters: BTreeMap<Runtime, Arc<dyn RuntimeAdapter>>,
    host_env: BTreeMap<String, String>,
    monitor: SandboxMonitor,
    /// Serializes every operation on one session id.
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Cancels the session's in-flight run and approval waits.
    session_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CodeExecutionManager {
    pub fn builder(config: ExecutionConfig) -> CodeExecutionManagerBuilder {
        CodeExecutionManagerBuilder::new(config)
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn sandbox_manager(&self) -> &Arc<SandboxManager> {
        &self.sandbox
    }

    pub fn approval_gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn monitor(&self) -> &SandboxMonitor {
        &self.monitor
    }

    /// Run a request, or report that it needs approval first.
    ///
    /// A run that hits its timeout is returned as `Ok` with `timed_out` set;
    /// use [`ExecutionResult::ensure_completed`] to treat it as an error.
    pub async fn submit_execution(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError> {
        self.execute(request, None).await
    }

    /// Like [`submit_execution`](Self::submit_execution), pushing redacted
    /// chunks to `chunks` as they arrive. A lagging consumer loses chunks,
    /// never the captured result.
    pub async fn submit_execution_streaming(
        &self,
        request: ExecutionRequest,
        chunks: mpsc::Sender<OutputChunk>,
    ) -> Result<ExecutionResult, ExecError> {
        self.execute(request, Some(chunks)).await
    }

    /// Open a bounded chunk channel sized from the configuration.
    pub fn chunk_channel(&self) -> (mpsc::Sender<OutputChunk>, mpsc::Receiver<OutputChunk>) {
        mpsc::channel(self.config.chunk_channel_capacity.max(1))
    }

    /// Submit, wait for a required approval, then resubmit once.
    ///
    /// The wait ends when the approval is resolved, `cancel` fires, the
    /// session is terminated, or the session's idle window passes (which
    /// expires the session and rejects the approval).
    pub async fn submit_and_wait(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let (approval_id, session_id) = match self.submit_execution(request.clone()).await {
            Err(ExecError::ApprovalRequired {
                approval_id,
                session_id,
            }) => (approval_id, session_id),
            other => return other,
        };

        let status = self.wait_for_approval(&session_id, &approval_id, cancel).await?;
        match status {
            ApprovalStatus::Approved => {
                let request = request.with_session(session_id).with_approval(approval_id);
                self.submit_execution(request).await
            }
            ApprovalStatus::Rejected => {
                self.discard_if_ephemeral(&session_id).await?;
                Err(ExecError::ApprovalRejected { approval_id })
            }
            ApprovalStatus::Pending => Err(ExecError::ApprovalRequired {
                approval_id,
                session_id,
            }),
        }
    }

    async fn wait_for_approval(
        &self,
        session_id: &str,
        approval_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ApprovalStatus, ExecError> {
        let session_cancel = self.session_token(session_id).child_token();
        let idle_window = self.config.session_idle_timeout();

        let waited = tokio::select! {
            status = self.gate.wait_for_resolution(approval_id, &session_cancel) => Some(status?),
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(idle_window) => {
                // Lookup applies lazy expiry, which rejects the approval.
                self.get_session_status(session_id).await?;
                None
            }
        };

        match waited {
            Some(status) if status.is_resolved() => Ok(status),
            _ => self
                .gate
                .get(approval_id)
                .await?
                .map(|record| record.status)
                .ok_or_else(|| ExecError::ApprovalNotFound(approval_id.to_string())),
        }
    }

    /// Apply an external decision. Expired sessions are settled first, so a
    /// late decision on them fails with `ApprovalNotPending`. Waits for any
    /// run in flight on the same session.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRecord, ExecError> {
        let record = self
            .gate
            .get(approval_id)
            .await?
            .ok_or_else(|| ExecError::ApprovalNotFound(approval_id.to_string()))?;

        let active = {
            let lock = self.session_lock(&record.session_id);
            let _guard = lock.lock().await;
            match self.store.get_session(&record.session_id).await? {
                Some(session) => self.expire_if_idle(session).await?.is_active(),
                None => false,
            }
        };
        if !active {
            self.forget_session(&record.session_id);
        }

        self.gate.resolve(approval_id, decision).await
    }

    pub async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRecord>, ExecError> {
        self.gate.list_pending().await
    }

    /// Current session state, applying lazy expiry.
    pub async fn get_session_status(&self, session_id: &str) -> Result<ExecutionSession, ExecError> {
        let session = {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().await;
            match self.store.get_session(session_id).await? {
                Some(session) => Some(self.expire_if_idle(session).await?),
                None => None,
            }
        };
        match session {
            Some(session) if session.is_active() => Ok(session),
            Some(session) => {
                self.forget_session(session_id);
                Ok(session)
            }
            None => {
                self.forget_session(session_id);
                Err(ExecError::session_invalid(session_id, "unknown session"))
            }
        }
    }

    /// Terminate a session: cancel its in-flight run, reject its pending
    /// approvals and remove its scratch directory. Idempotent.
    pub async fn terminate_session(&self, session_id: &str) -> Result<(), ExecError> {
        let known = self.store.get_session(session_id).await?.is_some();
        // Cancel before locking so a running execution releases the lock.
        self.session_token(session_id).cancel();

        let result = {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().await;
            self.terminate_locked(session_id).await
        };
        self.forget_session(session_id);
        match result {
            // An ephemeral session is discarded by its own run once cancelled.
            Err(ExecError::SessionInvalid { .. }) if known => Ok(()),
            other => other,
        }
    }

    async fn terminate_locked(&self, session_id: &str) -> Result<(), ExecError> {
        let Some(mut session) = self.store.get_session(session_id).await? else {
            return Err(ExecError::session_invalid(session_id, "unknown session"));
        };
        if session.status == SessionStatus::Terminated {
            debug!(session_id, "session already terminated");
            return Ok(());
        }

        session.transition(SessionStatus::Terminated);
        self.store.put_session(session.clone()).await?;
        self.gate.reject_pending_for_session(session_id).await?;
        remove_work_dir(&session.work_dir).await;
        info!(session_id, "session terminated");
        Ok(())
    }

    /// Terminate an ephemeral session and drop its record and approvals.
    /// Caller holds the session lock.
    async fn discard_locked(&self, session_id: &str) -> Result<(), ExecError> {
        self.terminate_locked(session_id).await?;
        self.store.remove_session(session_id).await?;
        debug!(session_id, "ephemeral session discarded");
        Ok(())
    }

    async fn discard_if_ephemeral(&self, session_id: &str) -> Result<(), ExecError> {
        {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().await;
            match self.store.get_session(session_id).await? {
                Some(session) if session.ephemeral => self.discard_locked(session_id).await?,
                _ => return Ok(()),
            }
        }
        self.forget_session(session_id);
        Ok(())
    }

    pub fn get_sandbox_status(&self) -> SandboxStatus {
        self.sandbox.get_status()
    }

    pub async fn run_integrity_check(&self) -> IntegrityReport {
        self.monitor.check_integrity().await
    }

    /// Cancel every in-flight run and stop the monitor.
    pub async fn shutdown(&self) {
        let tokens: Vec<_> = self.session_tokens.lock().drain().collect();
        for (_, token) in tokens {
            token.cancel();
        }
        self.monitor.stop_monitoring().await;
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        chunk_tx: Option<mpsc::Sender<OutputChunk>>,
    ) -> Result<ExecutionResult, ExecError> {
        let (session_id, ephemeral) = match &request.session_id {
            Some(id) => {
                validate_session_id(id)?;
                (id.clone(), false)
            }
            None => (uuid::Uuid::new_v4().to_string(), true),
        };

        let lock = self.session_lock(&session_id);
        let guard = lock.lock().await;

        let token = self.session_token(&session_id);
        if token.is_cancelled() {
            return Err(ExecError::session_invalid(&session_id, "session is terminating"));
        }

        let session = match self
            .resolve_session(&session_id, request.runtime, ephemeral)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                drop(guard);
                drop(lock);
                if matches!(err, ExecError::SessionInvalid { .. }) {
                    self.forget_session(&session_id);
                }
                return Err(err);
            }
        };

        let discard = session.ephemeral;
        let outcome = self.run_in_session(session, request, chunk_tx, &token).await;
        // A pending approval keeps the session so the caller can resubmit in it.
        if !discard || matches!(outcome, Err(ExecError::ApprovalRequired { .. })) {
            return outcome;
        }
        if let Err(err) = self.discard_locked(&session_id).await {
            warn!(session_id, error = %err, "failed to discard ephemeral session");
        }
        drop(guard);
        drop(lock);
        self.forget_session(&session_id);
        outcome
    }

    /// Gate, run and redact one request. Caller holds the session lock.
    async fn run_in_session(
        &self,
        mut session: ExecutionSession,
        request: ExecutionRequest,
        chunk_tx: Option<mpsc::Sender<OutputChunk>>,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let session_id = session.id.clone();
        let request_id = uuid::Uuid::new_v4().to_string();

        match self
            .gate
            .check(
                &session_id,
                request.runtime,
                &request_id,
                request.approval_id.as_deref(),
            )
            .await?
        {
            GateOutcome::Proceed => {}
            GateOutcome::Pending(record) => {
                return Err(ExecError::ApprovalRequired {
                    approval_id: record.id,
                    session_id,
                });
            }
            GateOutcome::Rejected(record) => {
                return Err(ExecError::ApprovalRejected {
                    approval_id: record.id,
                });
            }
        }

        let sandbox = self.sandbox.create_sandbox()?;
        let adapter = self.adapters.get(&request.runtime).cloned().ok_or_else(|| {
            ExecError::RuntimeUnavailable {
                runtime: request.runtime,
                reason: "no adapter registered".to_string(),
            }
        })?;

        tokio::fs::create_dir_all(&session.work_dir).await?;
        session.touch();
        self.store.put_session(session.clone()).await?;

        let timeout = self.config.effective_timeout(request.timeout);
        let ctx = RunContext {
            sandbox,
            work_dir: session.work_dir.clone(),
            timeout,
            max_output_bytes: self.config.max_output_bytes,
            kill_grace: self.config.kill_grace(),
            env: build_sanitized_env(
                &self.host_env,
                &self.config.env_allowlist,
                &session.work_dir,
            ),
            redactor: self.secrets.clone(),
            chunk_tx,
            cancel: token.child_token(),
        };

        let run = adapter.run(&request.code, ctx).await?;

        session.touch();
        self.store.put_session(session).await?;

        let output = run.output;
        if output.dropped_chunks > 0 {
            debug!(
                session_id,
                dropped = output.dropped_chunks,
                "stream consumer lagged; chunks dropped"
            );
        }
        let result = ExecutionResult {
            id: request_id,
            session_id,
            runtime: request.runtime,
            exit_code: output.termination.exit_code(),
            stdout: self.secrets.redact(&output.stdout),
            stderr: self.secrets.redact(&output.stderr),
            duration_ms: millis(output.duration),
            timeout_ms: millis(timeout),
            truncated: output.truncated,
            timed_out: output.termination == Termination::TimedOut,
            cancelled: output.termination == Termination::Cancelled,
            captured_bytes: output.captured_bytes,
            sandbox_type: run.sandbox_type,
        };
        debug!(
            execution_id = %result.id,
            session_id = %result.session_id,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "execution completed"
        );
        Ok(result)
    }

    /// Load or create the session; expired and terminated sessions are invalid.
    async fn resolve_session(
        &self,
        session_id: &str,
        runtime: Runtime,
        ephemeral: bool,
    ) -> Result<ExecutionSession, ExecError> {
        let Some(session) = self.store.get_session(session_id).await? else {
            let mut session =
                ExecutionSession::new(session_id, runtime, self.work_root.join(session_id));
            session.ephemeral = ephemeral;
            self.store.put_session(session.clone()).await?;
            info!(session_id, %runtime, ephemeral, "session created");
            return Ok(session);
        };

        let session = self.expire_if_idle(session).await?;
        match session.status {
            SessionStatus::Active => Ok(session),
            SessionStatus::Expired => Err(ExecError::session_invalid(session_id, "session expired")),
            SessionStatus::Terminated => {
                Err(ExecError::session_invalid(session_id, "session terminated"))
            }
        }
    }

    /// Expire an idle active session. Caller holds the session lock.
    async fn expire_if_idle(
        &self,
        mut session: ExecutionSession,
    ) -> Result<ExecutionSession, ExecError> {
        if !session.is_idle(self.config.session_idle_timeout(), chrono::Utc::now()) {
            return Ok(session);
        }

        session.transition(SessionStatus::Expired);
        self.store.put_session(session.clone()).await?;
        let rejected = self.gate.reject_pending_for_session(&session.id).await?;
        if let Some(token) = self.session_tokens.lock().remove(&session.id) {
            token.cancel();
        }
        remove_work_dir(&session.work_dir).await;
        info!(
            session_id = %session.id,
            rejected_approvals = rejected,
            "session expired"
        );
        Ok(session)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.session_locks
                .lock()
                .entry(session_id.to_string())
                .or_default(),
        )
    }

    fn session_token(&self, session_id: &str) -> CancellationToken {
        self.session_tokens
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the bookkeeping of a finished session. The lock entry stays while
    /// another task still holds it.
    fn forget_session(&self, session_id: &str) {
        self.session_tokens.lock().remove(session_id);
        let mut locks = self.session_locks.lock();
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> (usize, usize) {
        (self.session_locks.lock().len(), self.session_tokens.lock().len())
    }
}

impl std::fmt::Debug for CodeExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExecutionManager")
            .field("approval_policy", &self.config.approval_policy)
            .field("work_root", &self.work_root)
            .field("runtimes", &self.adapters.keys().collect::<Vec<_>>())
            .field("secrets", &self.secrets)
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Session ids become directory names, so only a conservative charset is accepted.
fn validate_session_id(session_id: &str) -> Result<(), ExecError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ExecError::session_invalid(
            session_id,
            "session ids may only contain ASCII letters, digits, '-', '_' and '.'",
        ))
    }
}

async fn remove_work_dir(path: &std::path::Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "removed session directory"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove session directory"),
    }
}

#[cfg(test)]
mod tests {
    use execward_config::{ApprovalPolicy, SandboxConfig};

    use super::*;
    use crate::sandboxing::StaticProbe;

    fn shell_manager(policy: ApprovalPolicy, work_root: &std::path::Path) -> CodeExecutionManager {
        let config = ExecutionConfig {
            approval_policy: policy,
            work_root: Some(work_root.to_path_buf()),
            ..ExecutionConfig::default()
        };
        let sandbox =
            SandboxManager::with_probe(SandboxConfig::disabled(), Arc::new(StaticProbe::nothing()));
        CodeExecutionManager::builder(config)
            .with_sandbox_manager(Arc::new(sandbox))
            .with_secrets(SecretsFilter::identity())
            .with_host_env(BTreeMap::from([(
                "PATH".to_string(),
                "/usr/bin:/bin".to_string(),
            )]))
            .build()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn anonymous_runs_leave_no_bookkeeping_behind() {
        let temp = tempfile::tempdir().unwrap();
        let manager = shell_manager(ApprovalPolicy::None, temp.path());

        for _ in 0..3 {
            let result = manager
                .submit_execution(ExecutionRequest::new(Runtime::Shell, "echo hi"))
                .await
                .unwrap();
            assert_eq!(result.stdout, "hi\n");
            assert_eq!(manager.store.get_session(&result.session_id).await.unwrap(), None);
        }
        assert_eq!(manager.tracked_sessions(), (0, 0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminated_sessions_release_their_lock_and_token() {
        let temp = tempfile::tempdir().unwrap();
        let manager = shell_manager(ApprovalPolicy::None, temp.path());

        let request = ExecutionRequest::new(Runtime::Shell, "true").with_session("kept");
        manager.submit_execution(request).await.unwrap();
        assert_eq!(manager.tracked_sessions(), (1, 1));

        manager.terminate_session("kept").await.unwrap();
        assert_eq!(manager.tracked_sessions(), (0, 0));
        assert!(manager.get_session_status("missing").await.is_err());
        assert_eq!(manager.tracked_sessions(), (0, 0));
    }

    #[test]
    fn session_ids_are_restricted() {
        assert!(validate_session_id("abc-123_x.y").is_ok());
        for bad in ["", "../etc", ".hidden", "a/b", "white space"] {
            assert!(
                matches!(validate_session_id(bad), Err(ExecError::SessionInvalid { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn timed_out_result_converts_to_error() {
        let result = ExecutionResult {
            id: "e1".into(),
            session_id: "s1".into(),
            runtime: Runtime::Shell,
            exit_code: crate::KILLED_EXIT_CODE,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1_012,
            timeout_ms: 1_000,
            truncated: false,
            timed_out: true,
            cancelled: false,
            captured_bytes: 0,
            sandbox_type: SandboxType::Noop,
        };
        assert!(!result.success());
        let err = result.ensure_completed().unwrap_err();
        assert!(matches!(err, ExecError::ExecutionTimeout { timeout_ms: 1_000, .. }));
    }
}
