//! Uploaded-script store helpers.
//!
//! Scripts live flat under the scripts directory as `<script_id><ext>`.
//! Uploads keep their original extension (defaulting to `.sh`), so lookup
//! probes the known extension set.

use std::path::{Path, PathBuf};

/// Extensions probed when resolving a script id, in order.
pub const SCRIPT_EXTENSIONS: &[&str] = &[".sh", ".py", ""];

/// Ids are minted as UUIDs; anything else (path separators in particular)
/// is rejected before it can touch the filesystem.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Resolve a script id to its stored file, probing known extensions.
pub fn find_script(scripts_dir: &Path, script_id: &str) -> Option<PathBuf> {
    if !valid_id(script_id) {
        return None;
    }
    SCRIPT_EXTENSIONS.iter().find_map(|ext| {
        let path = scripts_dir.join(format!("{}{}", script_id, ext));
        path.is_file().then_some(path)
    })
}

/// Normalize an uploaded file name to the extension stored on disk.
pub fn upload_extension(file_name: Option<&str>) -> String {
    let ext = file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if ext.is_empty() {
        ".sh".to_string()
    } else {
        format!(".{}", ext)
    }
}
