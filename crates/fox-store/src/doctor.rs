use anyhow::Result;
use std::path::Path;

/// The calibration file is either absent or readable, and its directory is
/// writable so `save` can drop a temp file next to it.
pub fn check_store(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if path.exists() {
        anyhow::ensure!(path.is_file(), "store.path is not a file: {}", path.display());
        let s = std::fs::read_to_string(path)?;
        anyhow::ensure!(
            s.contains("[calibration]"),
            "store.path has no [calibration] table: {}",
            path.display()
        );
    }
    if dir.exists() {
        let md = std::fs::metadata(dir)?;
        anyhow::ensure!(md.is_dir(), "store directory is not a directory: {}", dir.display());
        anyhow::ensure!(!md.permissions().readonly(), "store directory is read-only: {}", dir.display());
    }
    Ok(())
}
