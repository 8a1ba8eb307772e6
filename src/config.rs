use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub port: u16,
    pub kernel_image: PathBuf,
    pub rootfs_image: PathBuf,
    pub firecracker_bin: String,
    pub mem_size_mib: u64,
    pub vcpus: u32,
    pub enable_network: bool,
    pub exec_window_s: u64,
    pub worker_concurrency: usize,
    pub queue_depth: usize,
    pub fallback_iface: String,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir =
            PathBuf::from(std::env::var("SCRIPTVM_DATA").unwrap_or_else(|_| "data".to_string()));

        let port = std::env::var("SCRIPTVM_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let kernel_image = PathBuf::from(
            std::env::var("SCRIPTVM_KERNEL").unwrap_or_else(|_| "vm/images/vmlinux".to_string()),
        );

        let rootfs_image = PathBuf::from(
            std::env::var("SCRIPTVM_ROOTFS")
                .unwrap_or_else(|_| "vm/images/rootfs.ext4".to_string()),
        );

        let firecracker_bin = std::env::var("SCRIPTVM_FIRECRACKER_BIN")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "firecracker".to_string());

        let mem_size_mib = std::env::var("SCRIPTVM_MEM_MIB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(128);

        let vcpus = std::env::var("SCRIPTVM_VCPUS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let enable_network = std::env::var("SCRIPTVM_ENABLE_NETWORK").as_deref() == Ok("1");

        let exec_window_s = std::env::var("SCRIPTVM_EXEC_WINDOW_S")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let worker_concurrency = std::env::var("SCRIPTVM_WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let queue_depth = std::env::var("SCRIPTVM_QUEUE_DEPTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(64);

        let fallback_iface = std::env::var("SCRIPTVM_FALLBACK_IFACE")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "eth0".to_string());

        Self {
            data_dir,
            port,
            kernel_image,
            rootfs_image,
            firecracker_bin,
            mem_size_mib,
            vcpus,
            enable_network,
            exec_window_s,
            worker_concurrency,
            queue_depth,
            fallback_iface,
        }
    }

    /// Path to uploaded scripts: {data_dir}/scripts
    pub fn scripts_dir(&self) -> PathBuf {
        self.data_dir.join("scripts")
    }

    /// Path to per-job logs: {data_dir}/logs
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Path to the job database: {data_dir}/jobs.db
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }

    /// Fixed wall-clock execution window per job.
    pub fn exec_window(&self) -> Duration {
        Duration::from_secs(self.exec_window_s)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            port: 8080,
            kernel_image: PathBuf::from("vm/images/vmlinux"),
            rootfs_image: PathBuf::from("vm/images/rootfs.ext4"),
            firecracker_bin: "firecracker".to_string(),
            mem_size_mib: 128,
            vcpus: 1,
            enable_network: false,
            exec_window_s: 30,
            worker_concurrency: 1,
            queue_depth: 64,
            fallback_iface: "eth0".to_string(),
        }
    }
}
