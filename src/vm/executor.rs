//! Job executor: drives one script execution through its full VM lifecycle.
//!
//! Resolve paths → scratch dir → log file → script disk → networking →
//! VMM start → console capture → fixed execution window → stop → teardown.
//! Every acquired resource pushes a cleanup action onto an explicit stack
//! that is unwound in reverse on every exit path, cancellation included.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::jobs::worker::ScriptRunner;
use crate::scripts;
use crate::vm::machine::{self, Drive, Machine, NetworkInterfaceSpec, VmConfig};
use crate::vm::network::NetworkFabric;
use crate::vm::{console, disk, VmError};

// ── Cleanup stack ───────────────────────────────────────────────────

type CleanupAction = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Ordered teardown actions for one job. Pushed as resources are acquired,
/// unwound last-in first-out.
pub struct CleanupStack {
    actions: Vec<(&'static str, CleanupAction)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    pub fn push<F>(&mut self, name: &'static str, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.actions.push((name, Box::pin(action)));
    }

    pub async fn unwind(&mut self) {
        while let Some((name, action)) = self.actions.pop() {
            debug!(action = name, "running cleanup");
            action.await;
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

// ── Per-job log ─────────────────────────────────────────────────────

/// Executor-side view of the job log. Console bytes are appended to the
/// same file by the collector, after these lines.
struct JobLog {
    file: std::fs::File,
}

impl JobLog {
    fn new(file: std::fs::File) -> Self {
        Self { file }
    }

    fn line(&mut self, msg: &str) {
        if let Err(e) = writeln!(self.file, "{} {}", Utc::now().to_rfc3339(), msg) {
            warn!(error = %e, "job log write failed");
            return;
        }
        let _ = self.file.sync_data();
    }
}

// ── Executor ────────────────────────────────────────────────────────

pub struct VmExecutor {
    config: Arc<Config>,
    fabric: Arc<NetworkFabric>,
}

impl VmExecutor {
    pub fn new(config: Arc<Config>, fabric: Arc<NetworkFabric>) -> Self {
        Self { config, fabric }
    }

    async fn run_job(
        &self,
        job_id: &str,
        script_id: &str,
        cancel: &CancellationToken,
        cleanups: &mut CleanupStack,
    ) -> Result<(), VmError> {
        let cfg = &self.config;

        // 1. Resolve every input path to absolute form up front.
        let script_src = scripts::find_script(&cfg.scripts_dir(), script_id)
            .ok_or_else(|| VmError::PathResolve {
                path: cfg.scripts_dir().join(script_id).display().to_string(),
                cause: "script not found".into(),
            })?;
        let script_src = absolutize(&script_src)?;
        let kernel_image = absolutize(&cfg.kernel_image)?;
        let rootfs_image = absolutize(&cfg.rootfs_image)?;

        // 2. Log directory and per-VM scratch directory.
        let vm_id = Uuid::new_v4().to_string();
        std::fs::create_dir_all(cfg.logs_dir())
            .map_err(|e| VmError::LogWrite(format!("create log dir: {}", e)))?;

        let scratch = std::env::temp_dir().join(format!("fcvm-{}", vm_id));
        std::fs::create_dir_all(&scratch).map_err(|e| VmError::PathResolve {
            path: scratch.display().to_string(),
            cause: e.to_string(),
        })?;
        {
            let scratch = scratch.clone();
            cleanups.push("remove scratch dir", async move {
                if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                    warn!(dir = %scratch.display(), error = %e, "failed to remove scratch dir");
                }
            });
        }

        // 3. Per-job log file. Closed by drop after the final flush; the
        // scratch removal above runs later in the unwind either way.
        let log_path = cfg.logs_dir().join(format!("{}.log", job_id));
        let log_file = std::fs::File::create(&log_path)
            .map_err(|e| VmError::LogWrite(format!("create {}: {}", log_path.display(), e)))?;
        let mut job_log = JobLog::new(
            log_file
                .try_clone()
                .map_err(|e| VmError::LogWrite(e.to_string()))?,
        );
        job_log.line(&format!(
            "starting vm {} for script {}",
            vm_id,
            script_src.display()
        ));

        // 4. Build the script drive. The removal is registered first so a
        // build that fails after creating the image still gets reclaimed.
        let script_image = std::env::temp_dir().join(format!("script-{}.ext4", vm_id));
        {
            let script_image = script_image.clone();
            cleanups.push("remove script image", async move {
                match tokio::fs::remove_file(&script_image).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(image = %script_image.display(), error = %e, "failed to remove script image");
                    }
                }
            });
        }
        disk::build_script_image(&script_src, &script_image).await?;

        // 5. Host networking.
        let mut network = None;
        if cfg.enable_network {
            job_log.line("setting up networking");
            let tap = match self.fabric.acquire(&vm_id).await {
                Ok(tap) => tap,
                Err(e) => {
                    job_log.line(&format!("network setup failed: {}", e));
                    return Err(e);
                }
            };
            {
                let fabric = Arc::clone(&self.fabric);
                let tap_name = tap.name.clone();
                cleanups.push("release tap", async move {
                    fabric.release(&tap_name).await;
                });
            }
            job_log.line(&format!(
                "network interface {} with guest mac {}",
                tap.name, tap.guest_mac
            ));
            network = Some(NetworkInterfaceSpec {
                host_dev_name: tap.name,
                guest_mac: tap.guest_mac,
            });
        }

        if cancel.is_cancelled() {
            return Err(VmError::Cancelled);
        }

        // 6. Assemble the VM configuration and boot.
        let log_fifo = scratch.join("console.fifo");
        let vm_config = VmConfig {
            firecracker_bin: cfg.firecracker_bin.clone(),
            socket_path: scratch.join("firecracker.sock"),
            log_fifo: log_fifo.clone(),
            metrics_fifo: scratch.join("metrics.fifo"),
            kernel_image,
            kernel_args: machine::kernel_args(network.is_some()),
            drives: vec![
                Drive {
                    drive_id: "rootfs".into(),
                    path_on_host: rootfs_image.to_string_lossy().into_owned(),
                    is_root_device: true,
                    is_read_only: false,
                },
                Drive {
                    drive_id: "script".into(),
                    path_on_host: script_image.to_string_lossy().into_owned(),
                    is_root_device: false,
                    is_read_only: true,
                },
            ],
            vcpus: cfg.vcpus,
            mem_size_mib: cfg.mem_size_mib,
            network,
        };

        let mut vm = Machine::new(vm_config);
        job_log.line("starting vm");
        if let Err(e) = vm.start(cancel).await {
            job_log.line(&format!("vm start failed: {}", e));
            return Err(e);
        }

        // 7. Console capture runs concurrently from here on. The waiting
        // line goes in first so the console header never precedes it.
        job_log.line("vm started, waiting for execution to complete");
        let collector_done = console::spawn_collector(
            log_fifo,
            log_file
                .try_clone()
                .map_err(|e| VmError::LogWrite(e.to_string()))?,
        );

        // 8. Fixed execution window. Guest progress is not observed; the
        // window simply elapses unless the job is cancelled first.
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(cfg.exec_window()) => false,
            _ = cancel.cancelled() => true,
        };
        if cancelled {
            job_log.line("execution cancelled");
        }

        // 9. Stop the VM, then give the collector a bounded window to drain.
        job_log.line("stopping vm");
        if let Err(e) = vm.stop().await {
            warn!(job_id = %job_id, error = %e, "vm stop failed");
            job_log.line(&format!("vm stop failed: {}", e));
        }

        match tokio::time::timeout(console::JOIN_WAIT, collector_done).await {
            Ok(_) => job_log.line("console output captured"),
            Err(_) => {
                warn!(job_id = %job_id, "timed out waiting for console output");
                job_log.line("timed out waiting for console output");
            }
        }

        // 10. Final flush; registered cleanups run in the caller's unwind.
        if let Err(e) = log_file.sync_all() {
            warn!(job_id = %job_id, error = %e, "failed to flush job log");
        }

        if cancelled {
            return Err(VmError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptRunner for VmExecutor {
    async fn execute(
        &self,
        job_id: &str,
        script_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), VmError> {
        info!(job_id = %job_id, script_id = %script_id, "executing job");

        let mut cleanups = CleanupStack::new();
        let result = self.run_job(job_id, script_id, &cancel, &mut cleanups).await;
        cleanups.unwind().await;

        match &result {
            Ok(()) => info!(job_id = %job_id, "job execution complete"),
            Err(e) => warn!(job_id = %job_id, error = %e, "job execution failed"),
        }
        result
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, VmError> {
    std::fs::canonicalize(path).map_err(|e| VmError::PathResolve {
        path: path.display().to_string(),
        cause: e.to_string(),
    })
}
