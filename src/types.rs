use chrono::{DateTime, Local, NaiveTime};
use std::path::PathBuf;
use thiserror::Error;

use crate::api::ApiError;
use crate::client::BrowserError;

//
// ---------- Error Taxonomy ----------
//

/// Authentication failures are fatal; the run aborts rather than retrying.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("bad credentials: {0}")]
    BadCredentials(String),

    #[error("network failure during login: {0}")]
    Network(String),

    #[error("site layout did not match during login: {0}")]
    LayoutMismatch(String),

    #[error("browser failure during login: {0}")]
    Browser(#[from] BrowserError),

    #[error("API failure during login: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task discovery failed: {0}")]
    Discovery(String),

    #[error("task progress poll failed: {0}")]
    Poll(String),

    #[error("browser failure in task loop: {0}")]
    Browser(#[from] BrowserError),

    #[error("API failure in task loop: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("withdrawal amount {0} is not in the allowed set")]
    AmountNotAllowed(f64),

    #[error("could not read balance: {0}")]
    BalanceRead(String),

    #[error("withdrawal submission failed: {0}")]
    Submission(String),

    #[error("browser failure in wallet stage: {0}")]
    Browser(#[from] BrowserError),

    #[error("API failure in wallet stage: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("chat target '{0}' not found")]
    TargetNotFound(String),

    #[error("current time {0} is outside the send window")]
    OutsideSendWindow(NaiveTime),

    #[error("group only accepts messages from admins")]
    PermissionDenied,

    #[error("send could not be confirmed: {0}")]
    SendUnconfirmed(String),

    #[error("screenshot capture failed: {0}")]
    Capture(String),

    #[error("browser failure in notify stage: {0}")]
    Browser(#[from] BrowserError),
}

//
// ---------- Stage Outcomes ----------
//

/// Tagged result of one pipeline stage. Stages report rather than throw;
/// only authentication failure aborts the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Skipped(String),
    Failed(String),
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    pub fn failed(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }

    /// Whether later stages may run after this one: success, or the force
    /// flag that carries the pipeline to completion regardless.
    pub fn allows_downstream(&self, force: bool) -> bool {
        self.succeeded() || force
    }
}

//
// ---------- Data Model ----------
//

/// One watchable ad unit, discovered by polling and mutated as progress
/// updates arrive.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    /// Seconds of watching the site requires before submission.
    pub required_secs: u32,
    /// Seconds the site has credited so far.
    pub watched_secs: u32,
    pub completed: bool,
}

impl Task {
    pub fn new(id: u64, required_secs: u32) -> Self {
        Self {
            id,
            required_secs,
            watched_secs: 0,
            completed: false,
        }
    }

    pub fn watched_enough(&self) -> bool {
        self.watched_secs >= self.required_secs
    }
}

/// Point-in-time balance reading; immutable once taken.
#[derive(Debug, Clone, Copy)]
pub struct BalanceSnapshot {
    pub amount: f64,
    pub taken_at: DateTime<Local>,
}

impl BalanceSnapshot {
    pub fn now(amount: f64) -> Self {
        Self {
            amount,
            taken_at: Local::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Pending,
    Confirmed,
    Rejected(String),
    TimedOut,
}

/// A submitted withdrawal. Never mutated after submission except to record
/// the final status.
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub amount: f64,
    pub submitted_at: DateTime<Local>,
    pub status: WithdrawalStatus,
}

impl WithdrawalRequest {
    pub fn submitted(amount: f64) -> Self {
        Self {
            amount,
            submitted_at: Local::now(),
            status: WithdrawalStatus::Pending,
        }
    }
}

/// Screenshot evidence of completed work, plus the metadata that travels
/// with it. Consumed once by the notify stage, then left on disk.
#[derive(Debug, Clone)]
pub struct ProofArtifact {
    pub path: PathBuf,
    pub captured_at: DateTime<Local>,
    pub group: String,
    /// Completed-today counter read from the page before capture, when available.
    pub tasks_completed: Option<u32>,
    pub caption: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_stages_follow_success_or_the_force_flag() {
        assert!(StageOutcome::Success.allows_downstream(false));
        assert!(StageOutcome::Success.allows_downstream(true));
        assert!(!StageOutcome::Failed("stalled".into()).allows_downstream(false));
        assert!(StageOutcome::Failed("stalled".into()).allows_downstream(true));
        assert!(!StageOutcome::Skipped("nothing to do".into()).allows_downstream(false));
        assert!(StageOutcome::Skipped("nothing to do".into()).allows_downstream(true));
    }
}
