//! Broker seam between the ingress and the worker.
//!
//! Tasks travel as `(type, JSON payload)` pairs over a bounded in-process
//! channel; the payload wire format is fixed so an external broker could be
//! dropped in behind the same contract. Backpressure is the channel depth.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::JobError;

pub const TASK_TYPE_RUN_SCRIPT: &str = "script:run";

/// Run-request payload. The job id is minted by the ingress before the
/// pending row is inserted; nothing downstream ever mints a second id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScriptPayload {
    #[serde(rename = "ScriptID")]
    pub script_id: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
}

#[derive(Debug)]
pub struct Task {
    pub kind: String,
    pub payload: Vec<u8>,
}

/// Producer half handed to the ingress.
#[derive(Clone)]
pub struct QueueClient {
    tx: mpsc::Sender<Task>,
}

impl QueueClient {
    /// Publish a run task. Fails when the queue is full or the worker side
    /// is gone; the caller surfaces that as an enqueue error, and the job
    /// row it inserted beforehand stays `pending`.
    pub async fn enqueue_run(&self, payload: &RunScriptPayload) -> Result<(), JobError> {
        let bytes =
            serde_json::to_vec(payload).map_err(|e| JobError::Enqueue(e.to_string()))?;
        self.tx
            .try_send(Task {
                kind: TASK_TYPE_RUN_SCRIPT.to_string(),
                payload: bytes,
            })
            .map_err(|e| JobError::Enqueue(e.to_string()))
    }
}

/// Build a broker channel of the given depth.
pub fn channel(depth: usize) -> (QueueClient, mpsc::Receiver<Task>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (QueueClient { tx }, rx)
}
