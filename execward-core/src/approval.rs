//! Approval gating for execution requests.
//!
//! The gate reads and writes [`ApprovalRecord`]s but never decides a pending
//! record itself; resolution comes from a collaborator through
//! [`ApprovalGate::resolve`]. Waiters are woken through a `watch` channel per
//! record rather than by polling the store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use execward_config::ApprovalPolicy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ExecError;
use crate::runtime::Runtime;
use crate::store::ExecutionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_resolved(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External decision on a pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl From<ApprovalDecision> for ApprovalStatus {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => Self::Approved,
            ApprovalDecision::Rejected => Self::Rejected,
        }
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approved),
            "reject" | "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown approval decision `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub request_id: String,
    pub session_id: String,
    pub runtime: Runtime,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Set when an `always` approval has authorized its single run.
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ApprovalRecord {
    pub fn pending(
        session_id: impl Into<String>,
        runtime: Runtime,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            session_id: session_id.into(),
            runtime,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
            consumed_at: None,
        }
    }

    fn matches(&self, session_id: &str, runtime: Runtime) -> bool {
        self.session_id == session_id && self.runtime == runtime
    }
}

/// What the gate decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Proceed,
    Pending(ApprovalRecord),
    Rejected(ApprovalRecord),
}

pub struct ApprovalGate {
    policy: ApprovalPolicy,
    store: Arc<dyn ExecutionStore>,
    watchers: Mutex<HashMap<String, watch::Sender<ApprovalStatus>>>,
    /// Serializes read-modify-write of record status.
    resolve_lock: tokio::sync::Mutex<()>,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            policy,
            store,
            watchers: Mutex::new(HashMap::new()),
            resolve_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    /// Decide whether a request may run.
    ///
    /// Callers must serialize checks per session; the manager holds the
    /// session lock around this call.
    pub async fn check(
        &self,
        session_id: &str,
        runtime: Runtime,
        request_id: &str,
        approval_id: Option<&str>,
    ) -> Result<GateOutcome, ExecError> {
        match self.policy {
            ApprovalPolicy::None => Ok(GateOutcome::Proceed),
            ApprovalPolicy::FirstTime => self.check_first_time(session_id, runtime, request_id).await,
            ApprovalPolicy::Always => {
                self.check_always(session_id, runtime, request_id, approval_id)
                    .await
            }
        }
    }

    async fn check_first_time(
        &self,
        session_id: &str,
        runtime: Runtime,
        request_id: &str,
    ) -> Result<GateOutcome, ExecError> {
        let records = self.store.approvals_for(session_id, runtime).await?;

        if let Some(rejected) = records
            .iter()
            .find(|record| record.status == ApprovalStatus::Rejected)
        {
            return Ok(GateOutcome::Rejected(rejected.clone()));
        }
        if records
            .iter()
            .any(|record| record.status == ApprovalStatus::Approved)
        {
            return Ok(GateOutcome::Proceed);
        }
        // One outstanding request per pair; resubmits see the same record.
        if let Some(pending) = records
            .into_iter()
            .find(|record| record.status == ApprovalStatus::Pending)
        {
            return Ok(GateOutcome::Pending(pending));
        }

        self.create_pending(session_id, runtime, request_id).await
    }

    async fn check_always(
        &self,
        session_id: &str,
        runtime: Runtime,
        request_id: &str,
        approval_id: Option<&str>,
    ) -> Result<GateOutcome, ExecError> {
        if let Some(approval_id) = approval_id {
            let _guard = self.resolve_lock.lock().await;
            if let Some(mut record) = self.store.get_approval(approval_id).await? {
                if record.matches(session_id, runtime) {
                    match record.status {
                        ApprovalStatus::Approved if record.consumed_at.is_none() => {
                            record.consumed_at = Some(Utc::now());
                            debug!(approval_id, session_id, "consumed single-use approval");
                            self.store.put_approval(record).await?;
                            return Ok(GateOutcome::Proceed);
                        }
                        ApprovalStatus::Rejected => return Ok(GateOutcome::Rejected(record)),
                        ApprovalStatus::Pending => return Ok(GateOutcome::Pending(record)),
                        ApprovalStatus::Approved => {}
                    }
                }
            }
        }

        self.create_pending(session_id, runtime, request_id).await
    }

    async fn create_pending(
        &self,
        session_id: &str,
        runtime: Runtime,
        request_id: &str,
    ) -> Result<GateOutcome, ExecError> {
        let record = ApprovalRecord::pending(session_id, runtime, request_id);
        self.store.put_approval(record.clone()).await?;
        info!(
            approval_id = %record.id,
            session_id,
            %runtime,
            policy = %self.policy,
            "approval requested"
        );
        Ok(GateOutcome::Pending(record))
    }

    /// Apply an external decision to a pending record.
    pub async fn resolve(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRecord, ExecError> {
        let _guard = self.resolve_lock.lock().await;
        let mut record = self
            .store
            .get_approval(approval_id)
            .await?
            .ok_or_else(|| ExecError::ApprovalNotFound(approval_id.to_string()))?;

        if record.status.is_resolved() {
            return Err(ExecError::ApprovalNotPending {
                approval_id: approval_id.to_string(),
                status: record.status,
            });
        }

        record.status = decision.into();
        record.resolved_at = Some(Utc::now());
        self.store.put_approval(record.clone()).await?;
        self.notify(&record);
        info!(
            approval_id,
            session_id = %record.session_id,
            status = %record.status,
            "approval resolved"
        );
        Ok(record)
    }

    /// Reject every pending record of a session. Returns how many were rejected.
    pub async fn reject_pending_for_session(&self, session_id: &str) -> Result<usize, ExecError> {
        let _guard = self.resolve_lock.lock().await;
        let pending: Vec<_> = self
            .store
            .approvals_for_session(session_id)
            .await?
            .into_iter()
            .filter(|record| record.status == ApprovalStatus::Pending)
            .collect();

        let count = pending.len();
        for mut record in pending {
            record.status = ApprovalStatus::Rejected;
            record.resolved_at = Some(Utc::now());
            self.store.put_approval(record.clone()).await?;
            self.notify(&record);
        }
        if count > 0 {
            info!(session_id, count, "auto-rejected pending approvals");
        }
        Ok(count)
    }

    /// Wait until the record leaves `pending` or `cancel` fires.
    ///
    /// Returns the record's status at that point; on cancellation this may
    /// still be `pending`.
    pub async fn wait_for_resolution(
        &self,
        approval_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ApprovalStatus, ExecError> {
        let mut rx = self.subscribe(approval_id);
        // Subscribed before reading, so a resolution in between is not missed.
        let status = self.current_status(approval_id).await?;
        if status.is_resolved() {
            return Ok(status);
        }

        tokio::select! {
            changed = rx.wait_for(|status| status.is_resolved()) => {
                if let Ok(status) = changed {
                    return Ok(*status);
                }
            }
            _ = cancel.cancelled() => {
                debug!(approval_id, "stopped waiting for approval");
            }
        }
        self.current_status(approval_id).await
    }

    pub async fn list_pending(&self) -> Result<Vec<ApprovalRecord>, ExecError> {
        Ok(self.store.pending_approvals().await?)
    }

    pub async fn get(&self, approval_id: &str) -> Result<Option<ApprovalRecord>, ExecError> {
        Ok(self.store.get_approval(approval_id).await?)
    }

    async fn current_status(&self, approval_id: &str) -> Result<ApprovalStatus, ExecError> {
        self.store
            .get_approval(approval_id)
            .await?
            .map(|record| record.status)
            .ok_or_else(|| ExecError::ApprovalNotFound(approval_id.to_string()))
    }

    fn subscribe(&self, approval_id: &str) -> watch::Receiver<ApprovalStatus> {
        self.watchers
            .lock()
            .entry(approval_id.to_string())
            .or_insert_with(|| watch::channel(ApprovalStatus::Pending).0)
            .subscribe()
    }

    fn notify(&self, record: &ApprovalRecord) {
        if let Some(tx) = self.watchers.lock().remove(&record.id) {
            tx.send_replace(record.status);
        }
    }
}

impl fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("policy", &self.policy)
            .field("watchers", &self.watchers.lock().len())
            .finish()
    }
}
