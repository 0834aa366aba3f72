use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
        }
    }

    /// Sessions only move forward: active -> expired -> terminated.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Expired)
                | (Self::Active, Self::Terminated)
                | (Self::Expired, Self::Terminated)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sequence of executions sharing one scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub id: String,
    pub runtime: Runtime,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub work_dir: PathBuf,
    /// Created for a request that named no session; discarded once its run
    /// finishes.
    #[serde(default)]
    pub ephemeral: bool,
}

impl ExecutionSession {
    pub fn new(id: impl Into<String>, runtime: Runtime, work_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            runtime,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Active,
            work_dir,
            ephemeral: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Active and untouched for longer than `idle_timeout` as of `now`.
    pub fn is_idle(&self, idle_timeout: Duration, now: DateTime<Utc>) -> bool {
        let Ok(idle_timeout) = chrono::Duration::from_std(idle_timeout) else {
            return false;
        };
        self.is_active() && now.signed_duration_since(self.last_activity) > idle_timeout
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Apply a forward transition. Returns `false` (and changes nothing) otherwise.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ExecutionSession {
        ExecutionSession::new("s1", Runtime::Shell, PathBuf::from("/tmp/s1"))
    }

    #[test]
    fn transitions_only_move_forward() {
        let mut session = session();
        assert!(session.transition(SessionStatus::Expired));
        assert!(!session.transition(SessionStatus::Active));
        assert!(session.transition(SessionStatus::Terminated));
        assert!(!session.transition(SessionStatus::Terminated));
        assert_eq!(session.status, SessionStatus::Terminated);
    }

    #[test]
    fn idle_detection_uses_last_activity() {
        let mut session = session();
        session.last_activity = Utc::now() - chrono::Duration::seconds(120);

        assert!(session.is_idle(Duration::from_secs(60), Utc::now()));
        assert!(!session.is_idle(Duration::from_secs(600), Utc::now()));

        session.touch();
        assert!(!session.is_idle(Duration::from_secs(60), Utc::now()));
    }

    #[test]
    fn only_active_sessions_go_idle() {
        let mut session = session();
        session.last_activity = Utc::now() - chrono::Duration::seconds(120);
        session.transition(SessionStatus::Terminated);
        assert!(!session.is_idle(Duration::from_secs(1), Utc::now()));
    }
}
