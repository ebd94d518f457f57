use std::fs;
use std::io;
use std::process::Command;

use tracing::trace;

use crate::error::SnapshotError;


const XDELTA_BIN: &str = "xdelta3";


fn command_failure(error: io::Error) -> SnapshotError {
    SnapshotError::Xdelta { message: error.to_string() }
}

/// Computes a binary patch turning `source` into `target`. Fails when the
/// encoder cannot run or the patch would exceed `max_out` bytes; callers are
/// expected to fall back to storing the target verbatim.
pub fn diff(source: &[u8], target: &[u8], max_out: usize) -> Result<Vec<u8>, SnapshotError> {
    let dir = tempfile::tempdir().map_err(command_failure)?;
    let source_path = dir.path().join("source");
    let target_path = dir.path().join("target");
    let patch_path = dir.path().join("patch");
    fs::write(&source_path, source).map_err(command_failure)?;
    fs::write(&target_path, target).map_err(command_failure)?;

    let output = Command::new(XDELTA_BIN)
        .arg("-e")
        .arg("-s").arg(&source_path)
        .arg(&target_path)
        .arg(&patch_path)
        .output()
        .map_err(command_failure)?;
    if !output.status.success() {
        return Err(SnapshotError::Xdelta {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let patch = fs::read(&patch_path).map_err(command_failure)?;
    if patch.len() > max_out {
        return Err(SnapshotError::Xdelta {
            message: format!("patch of {} bytes exceeds the {} byte limit", patch.len(), max_out),
        });
    }
    trace!(patch_len = patch.len(), "encoded binary diff");
    Ok(patch)
}

/// Applies a patch produced by [`diff`] to `source`.
pub fn apply(source: &[u8], patch: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    let dir = tempfile::tempdir().map_err(command_failure)?;
    let source_path = dir.path().join("source");
    let patch_path = dir.path().join("patch");
    let target_path = dir.path().join("target");
    fs::write(&source_path, source).map_err(command_failure)?;
    fs::write(&patch_path, patch).map_err(command_failure)?;

    let output = Command::new(XDELTA_BIN)
        .arg("-d")
        .arg("-s").arg(&source_path)
        .arg(&patch_path)
        .arg(&target_path)
        .output()
        .map_err(command_failure)?;
    if !output.status.success() {
        return Err(SnapshotError::Xdelta {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    fs::read(&target_path).map_err(command_failure)
}
