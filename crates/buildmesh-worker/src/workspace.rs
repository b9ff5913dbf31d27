//! Per-repository workspaces and their locks.
//!
//! A workspace path is derived deterministically from the workspace root and
//! the repository URL (`<root>/<host>/<path>[/<fragment>]`), so two
//! repositories only share a workspace when their whole URL matches. Each
//! workspace carries one binary lock; a build holds it for the duration of
//! the job, which keeps concurrent jobs for the same repository serialized.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use url::Url;

/// Mode of every directory created under the workspace root.
#[cfg(unix)]
const WORKSPACE_DIR_MODE: u32 = 0o750;

pub struct WorkspaceManager {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Semaphore>>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Derives the workspace path for a repository URL.
    pub fn workspace_path(&self, url: &Url) -> PathBuf {
        let mut path = self.root.clone();
        if let Some(host) = url.host_str() {
            if !host.is_empty() {
                path.push(host);
            }
        }
        for segment in url.path().split('/') {
            if !segment.is_empty() && segment != "." && segment != ".." {
                path.push(segment);
            }
        }
        if let Some(fragment) = url.fragment() {
            if !fragment.is_empty() {
                path.push(fragment);
            }
        }
        path
    }

    /// Derives the workspace path and creates it if missing.
    pub fn ensure_workspace(&self, url: &Url) -> io::Result<PathBuf> {
        let workspace = self.workspace_path(url);
        ensure_directory(&workspace)?;
        Ok(workspace)
    }

    /// The binary lock guarding a workspace, created on first use.
    pub fn workspace_lock(&self, workspace: &Path) -> Arc<Semaphore> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(workspace.to_path_buf())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Where the checked-out tree lives inside a workspace.
    pub fn src_dir(&self, workspace: &Path) -> PathBuf {
        workspace.join("src")
    }

    /// Whether the source directory exists. A non-directory in its place is
    /// an error.
    pub fn src_dir_exists(&self, workspace: &Path) -> io::Result<bool> {
        check_directory(&self.src_dir(workspace))
    }
}

fn check_directory(path: &Path) -> io::Result<bool> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(true),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("not a directory: {}", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn ensure_directory(path: &Path) -> io::Result<()> {
    if check_directory(path)? {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(WORKSPACE_DIR_MODE);
    }
    builder.create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        (dir, manager)
    }

    #[test]
    fn path_derivation_includes_host_and_path() {
        let (dir, manager) = manager();
        let url = Url::parse("git+ssh://git@example.com/team/project").unwrap();
        assert_eq!(
            manager.workspace_path(&url),
            dir.path().join("example.com/team/project")
        );
    }

    #[test]
    fn fragment_extends_the_path() {
        let (dir, manager) = manager();
        let url = Url::parse("git+https://example.com/team/project#develop").unwrap();
        assert_eq!(
            manager.workspace_path(&url),
            dir.path().join("example.com/team/project/develop")
        );
    }

    #[test]
    fn file_urls_have_no_host_component() {
        let (dir, manager) = manager();
        let url = Url::parse("git+file:///tmp/fixture").unwrap();
        assert_eq!(manager.workspace_path(&url), dir.path().join("tmp/fixture"));
    }

    #[test]
    fn same_repository_names_do_not_collide_across_hosts() {
        let (_dir, manager) = manager();
        let a = Url::parse("git+https://a.example.com/team/project").unwrap();
        let b = Url::parse("git+https://b.example.com/team/project").unwrap();
        assert_ne!(manager.workspace_path(&a), manager.workspace_path(&b));
    }

    #[test]
    fn ensure_workspace_creates_directories() {
        let (_dir, manager) = manager();
        let url = Url::parse("git+file:///tmp/fixture").unwrap();
        let workspace = manager.ensure_workspace(&url).unwrap();
        assert!(workspace.is_dir());

        // Idempotent.
        assert_eq!(manager.ensure_workspace(&url).unwrap(), workspace);
    }

    #[cfg(unix)]
    #[test]
    fn workspace_directories_use_restricted_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, manager) = manager();
        let url = Url::parse("git+file:///tmp/fixture").unwrap();
        let workspace = manager.ensure_workspace(&url).unwrap();
        let mode = std::fs::metadata(&workspace).unwrap().permissions().mode();
        // The process umask may clear more bits, but none outside 0o750 may
        // survive: never group-writable, never world-accessible.
        assert_eq!(mode & 0o777 & !0o750, 0);
    }

    #[test]
    fn src_dir_exists_distinguishes_the_three_cases() {
        let (_dir, manager) = manager();
        let url = Url::parse("git+file:///tmp/fixture").unwrap();
        let workspace = manager.ensure_workspace(&url).unwrap();

        assert!(!manager.src_dir_exists(&workspace).unwrap());

        std::fs::create_dir(manager.src_dir(&workspace)).unwrap();
        assert!(manager.src_dir_exists(&workspace).unwrap());

        let other = manager.workspace_path(&Url::parse("git+file:///tmp/other").unwrap());
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(other.join("src"), b"file, not dir").unwrap();
        assert!(manager.src_dir_exists(&other).is_err());
    }

    #[test]
    fn workspace_lock_is_shared_and_binary() {
        let (_dir, manager) = manager();
        let workspace = PathBuf::from("/w/example.com/p");

        let lock_a = manager.workspace_lock(&workspace);
        let lock_b = manager.workspace_lock(&workspace);
        assert!(Arc::ptr_eq(&lock_a, &lock_b));
        assert_eq!(lock_a.available_permits(), 1);

        let other = manager.workspace_lock(&PathBuf::from("/w/example.com/q"));
        assert!(!Arc::ptr_eq(&lock_a, &other));
    }
}
