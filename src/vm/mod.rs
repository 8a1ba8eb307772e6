pub mod client;
pub mod console;
pub mod disk;
pub mod executor;
pub mod machine;
pub mod network;

use thiserror::Error;
use tokio::process::Command;

// ── VM error ────────────────────────────────────────────────────────

/// Failures of the VM engine. Each variant names the failing stage so a
/// single log line is enough to locate the broken step.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("path resolution failed for {path}: {cause}")]
    PathResolve { path: String, cause: String },

    #[error("image build failed at {stage}: {cause}")]
    ImageBuild { stage: &'static str, cause: String },

    #[error("network setup failed at {stage}: {cause}")]
    NetworkSetup { stage: &'static str, cause: String },

    #[error("vm start failed at {stage}: {cause}")]
    VmStart { stage: &'static str, cause: String },

    #[error("vm stop failed: {0}")]
    VmStop(String),

    #[error("console fifo open failed: {0}")]
    ConsoleOpen(String),

    #[error("log write failed: {0}")]
    LogWrite(String),

    #[error("execution cancelled")]
    Cancelled,
}

// ── Subprocess helpers ──────────────────────────────────────────────

/// Run a host command, returning the stderr text on non-zero exit.
pub(crate) async fn run_cmd(program: &str, args: &[&str]) -> Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("failed to run {} {:?}: {}", program, args, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} {:?} failed ({}): {}",
            program,
            args,
            output.status,
            stderr.trim()
        ));
    }

    Ok(())
}

/// Run a host command purely as an existence/state probe.
pub(crate) async fn cmd_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}
