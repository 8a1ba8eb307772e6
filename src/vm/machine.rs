//! VMM driver: configures one Firecracker microVM over its control socket
//! and drives it through `Configured → Started → Stopping → Stopped`.
//!
//! The driver never pre-creates the log/metrics FIFOs — the VMM creates
//! them when the logger/metrics endpoints are configured — and the console
//! collector only opens the log FIFO after the instance has started.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::VmmClient;
use super::VmError;

pub const DEFAULT_KERNEL_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off init=/init";

/// Static guest addressing appended to the kernel command line when a
/// network interface is attached.
pub const NETWORK_BOOT_ARG: &str = "ip=192.168.100.2::192.168.100.1:255.255.255.0::eth0:off";

/// How long to wait for the VMM to create its API socket after spawn.
const SOCKET_WAIT: Duration = Duration::from_secs(2);
const SOCKET_POLL: Duration = Duration::from_millis(100);

/// Bound on reaping the VMM process after a kill.
const REAP_WAIT: Duration = Duration::from_secs(2);

pub fn kernel_args(with_network: bool) -> String {
    if with_network {
        format!("{} {}", DEFAULT_KERNEL_ARGS, NETWORK_BOOT_ARG)
    } else {
        DEFAULT_KERNEL_ARGS.to_string()
    }
}

// ── Control-plane bodies ────────────────────────────────────────────
// Field names match the Firecracker API verbatim.

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
struct MachineSizing {
    vcpu_count: u32,
    mem_size_mib: u64,
}

#[derive(Debug, Clone, Serialize)]
struct NetworkInterfaceBody {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

#[derive(Debug, Clone, Serialize)]
struct LoggerBody {
    log_path: String,
    level: String,
}

#[derive(Debug, Clone, Serialize)]
struct MetricsBody {
    metrics_path: String,
}

#[derive(Debug, Clone, Serialize)]
struct InstanceAction {
    action_type: &'static str,
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Configured,
    Started,
    Stopping,
    Stopped,
}

impl VmState {
    pub fn can_transition(self, to: VmState) -> bool {
        matches!(
            (self, to),
            (VmState::Configured, VmState::Started)
                | (VmState::Started, VmState::Stopping)
                | (VmState::Stopping, VmState::Stopped)
        )
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Configured => write!(f, "configured"),
            VmState::Started => write!(f, "started"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Guest-side network attachment: the host TAP plus the MAC the guest sees.
#[derive(Debug, Clone)]
pub struct NetworkInterfaceSpec {
    pub host_dev_name: String,
    pub guest_mac: String,
}

/// Everything needed to configure one microVM. All paths are absolute.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub firecracker_bin: String,
    pub socket_path: PathBuf,
    pub log_fifo: PathBuf,
    pub metrics_fifo: PathBuf,
    pub kernel_image: PathBuf,
    pub kernel_args: String,
    pub drives: Vec<Drive>,
    pub vcpus: u32,
    pub mem_size_mib: u64,
    pub network: Option<NetworkInterfaceSpec>,
}

/// One Firecracker process under supervision.
pub struct Machine {
    config: VmConfig,
    state: VmState,
    child: Option<Child>,
}

impl Machine {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            state: VmState::Configured,
            child: None,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    fn start_err(stage: &'static str, cause: impl Into<String>) -> VmError {
        VmError::VmStart {
            stage,
            cause: cause.into(),
        }
    }

    /// Spawn the VMM, push the full configuration over its socket, and
    /// issue `InstanceStart`. On any failure the VMM process is killed and
    /// reaped before the error is returned.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), VmError> {
        let child = Command::new(&self.config.firecracker_bin)
            .arg("--api-sock")
            .arg(&self.config.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::start_err("spawn", e.to_string()))?;
        self.child = Some(child);

        match self.configure_and_boot(cancel).await {
            Ok(()) => {
                debug_assert!(self.state.can_transition(VmState::Started));
                self.state = VmState::Started;
                info!(socket = %self.config.socket_path.display(), "vm started");
                Ok(())
            }
            Err(e) => {
                self.kill_vmm().await;
                Err(e)
            }
        }
    }

    async fn configure_and_boot(&mut self, cancel: &CancellationToken) -> Result<(), VmError> {
        self.wait_for_socket(cancel).await?;

        let client = VmmClient::new(&self.config.socket_path);

        let put = |stage: &'static str| move |cause: String| Self::start_err(stage, cause);

        client
            .put(
                "/logger",
                &LoggerBody {
                    log_path: self.config.log_fifo.to_string_lossy().into_owned(),
                    level: "Debug".into(),
                },
            )
            .await
            .map_err(put("logger"))?;

        client
            .put(
                "/metrics",
                &MetricsBody {
                    metrics_path: self.config.metrics_fifo.to_string_lossy().into_owned(),
                },
            )
            .await
            .map_err(put("metrics"))?;

        client
            .put(
                "/boot-source",
                &BootSource {
                    kernel_image_path: self.config.kernel_image.to_string_lossy().into_owned(),
                    boot_args: self.config.kernel_args.clone(),
                },
            )
            .await
            .map_err(put("boot-source"))?;

        for drive in &self.config.drives {
            client
                .put(&format!("/drives/{}", drive.drive_id), drive)
                .await
                .map_err(put("drive"))?;
        }

        client
            .put(
                "/machine-config",
                &MachineSizing {
                    vcpu_count: self.config.vcpus,
                    mem_size_mib: self.config.mem_size_mib,
                },
            )
            .await
            .map_err(put("machine-config"))?;

        if let Some(ref net) = self.config.network {
            client
                .put(
                    "/network-interfaces/eth0",
                    &NetworkInterfaceBody {
                        iface_id: "eth0".into(),
                        guest_mac: net.guest_mac.clone(),
                        host_dev_name: net.host_dev_name.clone(),
                    },
                )
                .await
                .map_err(put("network-interface"))?;
        }

        if cancel.is_cancelled() {
            return Err(VmError::Cancelled);
        }

        client
            .put(
                "/actions",
                &InstanceAction {
                    action_type: "InstanceStart",
                },
            )
            .await
            .map_err(put("instance-start"))
    }

    /// Poll for the API socket the VMM creates on startup.
    async fn wait_for_socket(&mut self, cancel: &CancellationToken) -> Result<(), VmError> {
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        loop {
            if self.config.socket_path.exists() {
                return Ok(());
            }
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(Self::start_err(
                        "socket",
                        format!("vmm exited before creating socket ({})", status),
                    ));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Self::start_err("socket", "timed out waiting for API socket"));
            }
            tokio::select! {
                _ = tokio::time::sleep(SOCKET_POLL) => {}
                _ = cancel.cancelled() => return Err(VmError::Cancelled),
            }
        }
    }

    /// Stop the VMM. The guest is never assumed to shut down gracefully:
    /// the VMM process is killed outright and reaped with a bounded wait.
    pub async fn stop(&mut self) -> Result<(), VmError> {
        if self.state == VmState::Stopped || self.state == VmState::Stopping {
            return Ok(());
        }
        self.state = VmState::Stopping;

        let result = match self.child.as_mut() {
            Some(child) => match child.start_kill() {
                Ok(()) => match tokio::time::timeout(REAP_WAIT, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(status = %status, "vmm process exited");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(VmError::VmStop(format!("wait: {}", e))),
                    Err(_) => Err(VmError::VmStop("timed out reaping vmm process".into())),
                },
                // InvalidInput means the process already exited.
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(VmError::VmStop(format!("kill: {}", e))),
            },
            None => Ok(()),
        };

        self.state = VmState::Stopped;
        self.child = None;
        result
    }

    /// Best-effort teardown used on failed starts. Errors ignored; the
    /// scratch-directory cleanup reclaims the socket either way.
    async fn kill_vmm(&mut self) {
        if let Some(mut child) = self.child.take() {
            if child.start_kill().is_ok() {
                if tokio::time::timeout(REAP_WAIT, child.wait()).await.is_err() {
                    warn!("timed out reaping vmm after failed start");
                }
            }
        }
        self.state = VmState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> VmConfig {
        VmConfig {
            firecracker_bin: "firecracker".into(),
            socket_path: dir.join("firecracker.sock"),
            log_fifo: dir.join("console.fifo"),
            metrics_fifo: dir.join("metrics.fifo"),
            kernel_image: dir.join("vmlinux"),
            kernel_args: kernel_args(false),
            drives: vec![Drive {
                drive_id: "rootfs".into(),
                path_on_host: "/images/rootfs.ext4".into(),
                is_root_device: true,
                is_read_only: false,
            }],
            vcpus: 1,
            mem_size_mib: 128,
            network: None,
        }
    }

    #[test]
    fn test_default_kernel_args() {
        assert_eq!(
            kernel_args(false),
            "console=ttyS0 reboot=k panic=1 pci=off init=/init"
        );
    }

    #[test]
    fn test_network_kernel_args_append_static_ip() {
        let args = kernel_args(true);
        assert!(args.starts_with(DEFAULT_KERNEL_ARGS));
        assert!(args.ends_with("ip=192.168.100.2::192.168.100.1:255.255.255.0::eth0:off"));
    }

    #[test]
    fn test_state_transitions() {
        assert!(VmState::Configured.can_transition(VmState::Started));
        assert!(VmState::Started.can_transition(VmState::Stopping));
        assert!(VmState::Stopping.can_transition(VmState::Stopped));

        assert!(!VmState::Configured.can_transition(VmState::Stopped));
        assert!(!VmState::Stopped.can_transition(VmState::Started));
        assert!(!VmState::Started.can_transition(VmState::Configured));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(VmState::Configured.to_string(), "configured");
        assert_eq!(VmState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_drive_serializes_with_api_field_names() {
        let drive = Drive {
            drive_id: "script".into(),
            path_on_host: "/tmp/script.ext4".into(),
            is_root_device: false,
            is_read_only: true,
        };
        let json = serde_json::to_value(&drive).unwrap();
        assert_eq!(json["drive_id"], "script");
        assert_eq!(json["path_on_host"], "/tmp/script.ext4");
        assert_eq!(json["is_root_device"], false);
        assert_eq!(json["is_read_only"], true);
    }

    #[test]
    fn test_sizing_body_field_names() {
        let body = MachineSizing {
            vcpu_count: 2,
            mem_size_mib: 256,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["vcpu_count"], 2);
        assert_eq!(json["mem_size_mib"], 256);
    }

    #[test]
    fn test_instance_action_body() {
        let json = serde_json::to_value(InstanceAction {
            action_type: "InstanceStart",
        })
        .unwrap();
        assert_eq!(json["action_type"], "InstanceStart");
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_fails_at_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.firecracker_bin = "definitely-not-firecracker-xyz".into();

        let mut machine = Machine::new(cfg);
        let err = machine.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VmError::VmStart { stage: "spawn", .. }));
        assert_eq!(machine.state(), VmState::Configured);
    }

    #[tokio::test]
    async fn test_start_cancelled_while_waiting_for_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        // A binary that runs but never creates the socket.
        cfg.firecracker_bin = "sleep".into();
        cfg.socket_path = dir.path().join("never.sock");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut machine = Machine::new(cfg);
        let err = machine.start(&cancel).await.unwrap_err();
        // Cancellation wins unless the stand-in process exits first.
        assert!(
            matches!(err, VmError::Cancelled | VmError::VmStart { stage: "socket", .. }),
            "unexpected error: {}",
            err
        );
        // Failed start leaves no supervised process behind.
        assert_eq!(machine.state(), VmState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = Machine::new(config(dir.path()));
        machine.state = VmState::Stopped;
        assert!(machine.stop().await.is_ok());
    }
}
