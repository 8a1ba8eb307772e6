//! Script-disk builder.
//!
//! Turns an uploaded script into a small read-only ext4 block image that the
//! guest mounts as an auxiliary drive. The image is fixed at 10 MiB and
//! carries the script at its root, under its original base name, mode 0755.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use super::{run_cmd, VmError};

/// Capacity handed to `truncate`. The image is sparse, so the real on-disk
/// footprint is only the ext4 metadata plus the script itself.
pub const IMAGE_SIZE: &str = "10M";

fn build_err(stage: &'static str, cause: impl Into<String>) -> VmError {
    VmError::ImageBuild {
        stage,
        cause: cause.into(),
    }
}

/// Build the script drive at `out_image`.
///
/// Stages: stage the script into a private temp dir → truncate a sparse
/// image → mkfs.ext4 → loop-mount → copy → unmount. The staging dir and
/// mount point are released on every exit path; an unmount failure is
/// logged but never masks an earlier error.
pub async fn build_script_image(script_src: &Path, out_image: &Path) -> Result<(), VmError> {
    let script_name = script_src
        .file_name()
        .ok_or_else(|| build_err("stage", format!("no file name in {}", script_src.display())))?
        .to_owned();

    let staging = tempfile::Builder::new()
        .prefix("vm-script-")
        .tempdir()
        .map_err(|e| build_err("stage", e.to_string()))?;

    let staged = staging.path().join(&script_name);
    let contents = fs::read(script_src)
        .await
        .map_err(|e| build_err("stage", format!("read {}: {}", script_src.display(), e)))?;
    fs::write(&staged, &contents)
        .await
        .map_err(|e| build_err("stage", e.to_string()))?;
    fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| build_err("stage", e.to_string()))?;

    let image = out_image.to_string_lossy().into_owned();
    run_cmd("truncate", &["-s", IMAGE_SIZE, &image])
        .await
        .map_err(|c| build_err("truncate", c))?;
    run_cmd("mkfs.ext4", &["-F", &image])
        .await
        .map_err(|c| build_err("mkfs", c))?;

    let mount_dir = tempfile::Builder::new()
        .prefix("mnt-script-")
        .tempdir()
        .map_err(|e| build_err("mount", e.to_string()))?;
    let mount_path = mount_dir.path().to_string_lossy().into_owned();

    run_cmd("mount", &["-o", "loop", &image, &mount_path])
        .await
        .map_err(|c| build_err("mount", c))?;

    let staged_str = staged.to_string_lossy().into_owned();
    let dest = mount_dir
        .path()
        .join(&script_name)
        .to_string_lossy()
        .into_owned();
    let copied = run_cmd("cp", &[&staged_str, &dest])
        .await
        .map_err(|c| build_err("copy", c));

    if let Err(e) = run_cmd("umount", &[&mount_path]).await {
        warn!(error = %e, image = %image, "failed to unmount script image");
    }

    copied?;

    debug!(image = %image, script = %script_name.to_string_lossy(), "script image built");
    Ok(())
}
