use std::io;
use std::path::Path;

use tracing::debug;

/// Replace `dir` with a fresh empty directory.
///
/// Whatever was there before (files from an earlier or interrupted
/// derivation) is discarded. A missing directory is not an error.
/// Blocking; call from a blocking thread.
pub fn reset_dir(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!(path = %dir.display(), "Removed previous output directory");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_dir_discards_contents() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("derived");
        std::fs::create_dir_all(dir.join("tiles")).unwrap();
        std::fs::write(dir.join("tiles/7.png"), b"stale").unwrap();

        reset_dir(&dir).unwrap();

        assert!(dir.is_dir());
        assert!(std::fs::read_dir(&dir).unwrap().next().is_none());
    }

    #[test]
    fn test_reset_dir_creates_missing() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("a/b/c");
        reset_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_reset_dir_under_regular_file_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("derived");
        std::fs::write(&file, b"not a directory").unwrap();

        assert!(reset_dir(&file.join("1")).is_err());
        assert!(file.is_file());
    }
}
