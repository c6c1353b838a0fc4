use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Create `dir` (and parents) and restrict it to the current user.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
  fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
  fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
    .with_context(|| format!("failed to set permissions on {}", dir.display()))?;
  Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "state".to_string());
  path.with_file_name(format!(".{name}.tmp"))
}

/// Replace `path` with `bytes` so that readers only ever see the old or the new content.
///
/// Writes a sibling temp file, fsyncs it and renames it over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {}", parent.display()))?;
  }
  let tmp = temp_path_for(path);
  let write_tmp = || -> Result<()> {
    let mut file: File = OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(true)
      .mode(0o600)
      .open(&tmp)
      .with_context(|| format!("failed to open {}", tmp.display()))?;
    file
      .write_all(bytes)
      .with_context(|| format!("failed to write {}", tmp.display()))?;
    file
      .sync_all()
      .with_context(|| format!("failed to sync {}", tmp.display()))?;
    Ok(())
  };
  if let Err(err) = write_tmp() {
    let _ = fs::remove_file(&tmp);
    return Err(err);
  }
  fs::rename(&tmp, path).with_context(|| {
    let _ = fs::remove_file(&tmp);
    format!("failed to move {} into place", path.display())
  })?;
  Ok(())
}
