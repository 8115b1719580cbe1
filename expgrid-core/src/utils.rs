// Utility Functions
// Workspace root detection, atomic file replacement and shell quoting

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name that marks a directory as an expgrid workspace
pub const WORKSPACE_FILE: &str = "expgrid.yaml";

/// Find the root of a workspace by walking up from the given starting path.
///
/// Traverses ancestor directories looking for an `expgrid.yaml` file. Returns
/// `None` if no ancestor contains one.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(WORKSPACE_FILE).is_file())
        .map(Path::to_path_buf)
}

/// Resolve the workspace directory for a command.
///
/// An explicit directory wins; otherwise the workspace enclosing the current
/// directory is used, falling back to the current directory itself.
pub fn resolve_workspace_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_workspace_root(&cwd).unwrap_or(cwd)
}

/// Replace `path` with `contents` so readers never observe a partial file.
///
/// The data is written to a sibling temporary file, flushed, then renamed over
/// the destination. Parent directories are created as needed.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Single-quote a path for `sh`
pub fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn test_find_workspace_root_from_nested_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join(WORKSPACE_FILE), "workspace: {}\n").unwrap();

        let sub = root.join("experiments").join("app").join("wl");
        fs::create_dir_all(&sub).unwrap();

        let found = find_workspace_root(&sub).unwrap();
        assert_eq!(found, root.canonicalize().unwrap());
    }

    #[test]
    fn test_find_workspace_root_ignores_directories_named_like_the_file() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join(WORKSPACE_FILE)).unwrap();

        if let Some(found) = find_workspace_root(temp.path()) {
            assert!(found.join(WORKSPACE_FILE).is_file());
        }
    }

    #[test]
    fn test_find_workspace_root_nonexistent_path() {
        assert!(find_workspace_root(Path::new("/nonexistent/expgrid/path")).is_none());
    }

    #[test]
    fn test_resolve_workspace_dir_prefers_explicit() {
        let dir = resolve_workspace_dir(Some(Path::new("/tmp/ws")));
        assert_eq!(dir, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn test_atomic_write_replaces_contents() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("record.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote(Path::new("/a b/it's")), r"'/a b/it'\''s'");
    }

    #[test]
    fn test_remove_if_exists() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("job.json");
        fs::write(&path, "{}").unwrap();

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
