//! Filesystem helpers with operation and path context on errors.

use std::path::{Component, Path};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure the parent directory of a file path exists with a custom operation label.
pub async fn ensure_parent_dir_with_op(op: &'static str, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all_with_op(op, parent).await
}

/// Synchronous variant of [`ensure_dir_all_with_op`], for use before the runtime starts.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Write `bytes` to `path` via a temporary sibling file and a rename, so
/// readers never observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir_with_op("creating directory", path).await?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = Path::new(&tmp);

    tokio::fs::write(tmp, bytes)
        .await
        .map_err(|e| io_error("writing", tmp, e))?;
    if let Err(e) = tokio::fs::rename(tmp, path).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(io_error("renaming", path, e));
    }
    Ok(())
}

/// True if `relative` is a plain relative path that cannot escape its root.
pub fn is_contained_relative(relative: &Path) -> bool {
    relative.components().next().is_some()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contained_relative_paths() {
        assert!(is_contained_relative(Path::new("recipes/r-1/step-0.png")));
        assert!(!is_contained_relative(Path::new("../etc/passwd")));
        assert!(!is_contained_relative(Path::new("recipes/../../x")));
        assert!(!is_contained_relative(Path::new("/abs/path")));
        assert!(!is_contained_relative(Path::new("")));
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.bin");

        write_atomic(&path, b"hello").await.unwrap();
        write_atomic(&path, b"world").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"world");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
