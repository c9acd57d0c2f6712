//! Individual startup checks.

use crate::errors::StartupError;
use std::path::Path;

/// Check that the store file can be created or opened at `path`.
///
/// The parent directory is created when missing and must be writable.
pub fn check_store_path(path: &str) -> Result<(), StartupError> {
    let path = Path::new(path);

    if path.is_dir() {
        return Err(StartupError::StoreIsDirectory(path.display().to_string()));
    }

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    if !dir.exists() {
        tracing::info!(dir = %dir.display(), "creating store directory");
        std::fs::create_dir_all(dir).map_err(|e| {
            StartupError::Failed(format!(
                "failed to create store directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
    }

    if !dir.is_dir() {
        return Err(StartupError::NotADirectory(dir.display().to_string()));
    }

    let probe = dir.join(".opera_write_test");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(_) => Err(StartupError::NotWritable(dir.display().to_string())),
    }
}

/// Verify store integrity with a caller supplied probe.
pub fn check_store_integrity<F, E>(check_fn: F) -> Result<(), StartupError>
where
    F: FnOnce() -> Result<(), E>,
    E: std::fmt::Display,
{
    check_fn().map_err(|e| StartupError::IntegrityCheckFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_path_in_existing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("api.sqlite");
        assert!(check_store_path(db.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_store_dir_created() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("nested/data/api.sqlite");
        assert!(check_store_path(db.to_str().unwrap()).is_ok());
        assert!(temp_dir.path().join("nested/data").is_dir());
    }

    #[test]
    fn test_store_path_is_directory() {
        let temp_dir = TempDir::new().unwrap();
        let result = check_store_path(temp_dir.path().to_str().unwrap());
        assert!(matches!(result, Err(StartupError::StoreIsDirectory(_))));
    }

    #[test]
    fn test_store_parent_is_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("file.txt");
        std::fs::write(&file_path, b"test").unwrap();

        let db = file_path.join("api.sqlite");
        let result = check_store_path(db.to_str().unwrap());
        assert!(matches!(result, Err(StartupError::NotADirectory(_))));
    }

    #[test]
    fn test_store_integrity() {
        assert!(check_store_integrity(|| Ok::<(), &str>(())).is_ok());
        let result = check_store_integrity(|| Err("database disk image is malformed"));
        assert!(matches!(result, Err(StartupError::IntegrityCheckFailed(_))));
    }
}
