//! Job queue worker.
//!
//! Dequeues run tasks, drives each through the runner, and persists the
//! status transitions. The worker never mints job ids and never retries —
//! retry policy belongs to whatever sits behind the queue. Concurrency is
//! bounded (one execution at a time unless configured otherwise).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::jobs::queue::{RunScriptPayload, Task, TASK_TYPE_RUN_SCRIPT};
use crate::jobs::repo::JobRepo;
use crate::jobs::JobStatus;
use crate::vm::VmError;

/// Seam between the worker and the VM engine. The production implementation
/// is `vm::executor::VmExecutor`; tests substitute a fake.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn execute(
        &self,
        job_id: &str,
        script_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), VmError>;
}

pub struct Worker<R> {
    repo: JobRepo,
    runner: Arc<R>,
    rx: mpsc::Receiver<Task>,
    concurrency: usize,
}

impl<R: ScriptRunner + 'static> Worker<R> {
    pub fn new(
        repo: JobRepo,
        runner: Arc<R>,
        rx: mpsc::Receiver<Task>,
        concurrency: usize,
    ) -> Self {
        Self {
            repo,
            runner,
            rx,
            concurrency: concurrency.max(1),
        }
    }

    /// Pull tasks until the queue closes or shutdown is signalled, then
    /// drain in-flight executions.
    pub async fn run(mut self, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut inflight = JoinSet::new();

        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = self.rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("worker semaphore closed")
                }
            };

            let repo = self.repo.clone();
            let runner = Arc::clone(&self.runner);
            let job_cancel = cancel.child_token();
            inflight.spawn(async move {
                let _permit = permit;
                handle_task(&repo, runner.as_ref(), task, job_cancel).await;
            });
        }

        while inflight.join_next().await.is_some() {}
        info!("worker stopped");
    }
}

/// Process one task: mark the job running, execute, persist the terminal
/// status. The in-memory outcome is authoritative; a failed terminal
/// update is logged, never retried.
async fn handle_task<R: ScriptRunner + ?Sized>(
    repo: &JobRepo,
    runner: &R,
    task: Task,
    cancel: CancellationToken,
) {
    if task.kind != TASK_TYPE_RUN_SCRIPT {
        warn!(kind = %task.kind, "dropping task of unknown type");
        return;
    }

    let payload: RunScriptPayload = match serde_json::from_slice(&task.payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "dropping undecodable run task");
            return;
        }
    };

    info!(job_id = %payload.job_id, script_id = %payload.script_id, "job dequeued");

    if let Err(e) = repo
        .update_status(&payload.job_id, JobStatus::Running, "")
        .await
    {
        warn!(job_id = %payload.job_id, error = %e, "failed to mark job running");
    }

    let result = runner
        .execute(&payload.job_id, &payload.script_id, cancel)
        .await;

    let status = match result {
        Ok(()) => JobStatus::Success,
        Err(VmError::Cancelled) => {
            warn!(job_id = %payload.job_id, "job cancelled");
            JobStatus::Failed
        }
        Err(e) => {
            warn!(job_id = %payload.job_id, error = %e, "job execution failed");
            JobStatus::Failed
        }
    };

    let finished_at = Utc::now().to_rfc3339();
    if let Err(e) = repo
        .update_status(&payload.job_id, status, &finished_at)
        .await
    {
        warn!(job_id = %payload.job_id, error = %e, "terminal status not persisted");
    }

    info!(job_id = %payload.job_id, status = %status, "job finished");
}
