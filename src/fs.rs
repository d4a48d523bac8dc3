//! Filesystem helpers shared by the disk-backed tiers.

use std::io::{ErrorKind, Write};
use std::path::Path;

/// Replace `path` with `body` so readers only ever see the old or the new file.
///
/// Writes to a temp file in the same directory, syncs it, then renames it
/// over the destination.
pub fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
  let dir = path
    .parent()
    .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
  std::fs::create_dir_all(dir)?;

  let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
  tmp.write_all(body)?;
  tmp.as_file().sync_all()?;
  tmp.persist(path).map_err(|e| e.error)?;

  Ok(())
}

/// Delete a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
  match std::fs::remove_file(path) {
    Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_write_atomic_replaces_and_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sub").join("notes.json");

    write_atomic(&path, b"[1]").unwrap();
    write_atomic(&path, b"[1,2]").unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"[1,2]");
    let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
    assert_eq!(entries, 1);
  }

  #[test]
  fn test_remove_if_exists_ignores_missing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing");
    remove_if_exists(&path).unwrap();

    std::fs::write(&path, b"x").unwrap();
    remove_if_exists(&path).unwrap();
    assert!(!path.exists());
  }
}
