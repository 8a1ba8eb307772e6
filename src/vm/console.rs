//! Console collector.
//!
//! Drains the VMM's log FIFO into the per-job log file. The FIFO is opened
//! only after the VM has started (the VMM creates it during configuration),
//! with a short bounded wait to tolerate setup latency. Capture failures
//! are warnings — a job is never failed just because its console was lost.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

pub const CONSOLE_HEADER: &[u8] = b"\n\n===== VM CONSOLE OUTPUT =====\n\n";

const COPY_BUF_SIZE: usize = 4096;

/// Bounded wait for the FIFO to appear after VM start.
const OPEN_ATTEMPTS: u32 = 10;
const OPEN_RETRY: Duration = Duration::from_millis(100);

/// How long the executor waits for the collector after stopping the VM.
pub const JOIN_WAIT: Duration = Duration::from_secs(2);

/// Start draining `fifo_path` into `log_file` on a blocking task.
///
/// The returned receiver resolves when the collector is done (FIFO EOF,
/// read error, or open failure). FIFO reads block, so the copy loop runs
/// off the async runtime.
pub fn spawn_collector(fifo_path: PathBuf, log_file: std::fs::File) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        collect(&fifo_path, log_file);
        let _ = done_tx.send(());
    });
    done_rx
}

fn collect(fifo_path: &Path, mut log_file: std::fs::File) {
    let mut fifo = match open_with_retry(fifo_path) {
        Some(f) => f,
        None => {
            warn!(fifo = %fifo_path.display(), "console fifo never became available");
            return;
        }
    };

    if let Err(e) = log_file.write_all(CONSOLE_HEADER) {
        warn!(error = %e, "failed to write console header");
        return;
    }
    let _ = log_file.sync_data();

    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        match fifo.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = log_file.write_all(&buf[..n]) {
                    warn!(error = %e, "console log write failed");
                    break;
                }
                let _ = log_file.sync_data();
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "console fifo read failed");
                break;
            }
        }
    }

    debug!(fifo = %fifo_path.display(), "console capture finished");
}

fn open_with_retry(fifo_path: &Path) -> Option<std::fs::File> {
    for attempt in 0..OPEN_ATTEMPTS {
        match std::fs::File::open(fifo_path) {
            Ok(f) => return Some(f),
            Err(e) => {
                if attempt + 1 == OPEN_ATTEMPTS {
                    warn!(fifo = %fifo_path.display(), error = %e, "console fifo open failed");
                } else {
                    std::thread::sleep(OPEN_RETRY);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collector_copies_bytes_after_header() {
        let dir = tempfile::tempdir().unwrap();

        // A regular file stands in for the FIFO: same read API, instant EOF.
        let fifo = dir.path().join("console.fifo");
        std::fs::write(&fifo, b"guest says hi\n").unwrap();

        let log_path = dir.path().join("job.log");
        let log_file = std::fs::File::create(&log_path).unwrap();

        let done = spawn_collector(fifo, log_file);
        done.await.unwrap();

        let captured = std::fs::read(&log_path).unwrap();
        assert!(captured.starts_with(CONSOLE_HEADER));
        assert!(captured.ends_with(b"guest says hi\n"));
    }

    #[tokio::test]
    async fn test_collector_signals_done_when_fifo_missing() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("job.log");
        let log_file = std::fs::File::create(&log_path).unwrap();

        let done = spawn_collector(dir.path().join("absent.fifo"), log_file);
        // Resolves after the bounded open retries; no header is written.
        done.await.unwrap();
        assert!(std::fs::read(&log_path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_header_precedes_existing_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("console.fifo");
        std::fs::write(&fifo, b"console output").unwrap();

        let log_path = dir.path().join("job.log");
        let mut log_file = std::fs::File::create(&log_path).unwrap();
        log_file.write_all(b"executor line\n").unwrap();

        let done = spawn_collector(fifo, log_file.try_clone().unwrap());
        done.await.unwrap();

        let text = std::fs::read_to_string(&log_path).unwrap();
        let header = std::str::from_utf8(CONSOLE_HEADER).unwrap();
        let header_at = text.find(header).unwrap();
        assert!(text[..header_at].contains("executor line"));
        assert_eq!(text.matches("===== VM CONSOLE OUTPUT =====").count(), 1);
    }
}
