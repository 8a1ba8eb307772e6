pub mod queue;
pub mod repo;
pub mod worker;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Job error ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job insert failed: {0}")]
    DbInsert(#[source] sqlx::Error),

    #[error("job update failed: {0}")]
    DbUpdate(#[source] sqlx::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("enqueue failed: {0}")]
    Enqueue(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

// ── Job status ──────────────────────────────────────────────────────

/// Job lifecycle status. Transitions form a DAG:
/// `pending → running → {success, failed}`; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    pub fn can_transition(self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

// ── Job record ──────────────────────────────────────────────────────

/// One execution attempt of one script. The id is minted before the job is
/// enqueued and reused unchanged downstream. Timestamps are RFC3339;
/// `finished_at` stays empty until the job reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub script_id: String,
    pub status: JobStatus,
    pub log_path: String,
    pub started_at: String,
    pub finished_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(JobStatus::Success.to_string(), "success");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Running).unwrap(),
            r#""running""#
        );
        let parsed: JobStatus = serde_json::from_str(r#""failed""#).unwrap();
        assert_eq!(parsed, JobStatus::Failed);
    }

    #[test]
    fn test_transition_dag() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Success));
        assert!(JobStatus::Running.can_transition(JobStatus::Failed));

        // No skipping, no reversing, no leaving terminal states.
        assert!(!JobStatus::Pending.can_transition(JobStatus::Success));
        assert!(!JobStatus::Running.can_transition(JobStatus::Pending));
        assert!(!JobStatus::Success.can_transition(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_serializes_all_fields() {
        let job = Job {
            id: "j1".into(),
            script_id: "s1".into(),
            status: JobStatus::Pending,
            log_path: "data/logs/j1.log".into(),
            started_at: "2026-01-01T00:00:00+00:00".into(),
            finished_at: String::new(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["id"], "j1");
        assert_eq!(json["script_id"], "s1");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["log_path"], "data/logs/j1.log");
        assert_eq!(json["finished_at"], "");
    }
}
