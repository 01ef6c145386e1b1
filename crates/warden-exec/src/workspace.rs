//! The working tree the oracle's patches are applied to

use std::io;
use std::path::{Component, Path, PathBuf};

use warden_plan::FileChange;

use crate::oracle::Patch;

/// Working-tree access
pub trait Workspace: Send + Sync {
    /// Root directory commands run in
    fn root(&self) -> &Path;

    /// Apply every edit in a patch
    ///
    /// # Errors
    /// [`WorkspaceError`] on escaping paths or I/O failure
    fn apply(&self, patch: &Patch) -> Result<(), WorkspaceError>;

    /// Read a file, `None` when absent
    ///
    /// # Errors
    /// [`WorkspaceError`] on escaping paths or I/O failure
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, WorkspaceError>;
}

/// Uncommitted changes in the working tree
///
/// The healing loop re-reads this after every attempt, since a command can
/// write files the plan never declared.
pub trait TreeStatus: Send + Sync {
    /// Every path changed since the last commit
    ///
    /// # Errors
    /// [`WorkspaceError::Status`] when the tree cannot be read
    fn changes(&self) -> Result<Vec<FileChange>, WorkspaceError>;
}

/// Workspace backed by a directory on disk
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
}

impl FsWorkspace {
    /// Workspace rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, WorkspaceError> {
        let rel = Path::new(path);
        let escapes = rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir));
        if escapes || path.is_empty() {
            return Err(WorkspaceError::PathEscape(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl Workspace for FsWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    fn apply(&self, patch: &Patch) -> Result<(), WorkspaceError> {
        // Resolve everything first so an escaping path leaves the tree untouched.
        let resolved = patch
            .files
            .iter()
            .map(|f| self.resolve(&f.path).map(|p| (p, f)))
            .collect::<Result<Vec<_>, _>>()?;
        for (path, file) in resolved {
            match &file.content {
                Some(content) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, content)?;
                }
                None => match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
            tracing::debug!(path = %file.path, delete = file.content.is_none(), "patch applied");
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, WorkspaceError> {
        let path = self.resolve(path)?;
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Workspace errors
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Path leaves the workspace root
    #[error("path escapes the workspace: {0}")]
    PathEscape(String),

    /// Working-tree status unavailable
    #[error("working tree status unavailable: {0}")]
    Status(String),

    /// Filesystem failure
    #[error("workspace I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::FilePatch;

    #[test]
    fn writes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let ws = FsWorkspace::new(dir.path());
        ws.apply(&Patch::new(vec![FilePatch::write("pkg/app.py", "print(1)\n")]))
            .unwrap();
        assert_eq!(ws.read("pkg/app.py").unwrap().as_deref(), Some(&b"print(1)\n"[..]));

        ws.apply(&Patch::new(vec![FilePatch::delete("pkg/app.py"), FilePatch::delete("absent.py")]))
            .unwrap();
        assert_eq!(ws.read("pkg/app.py").unwrap(), None);
    }

    #[test]
    fn changed_lines_compare_against_current_content() {
        let dir = tempfile::tempdir().unwrap();
        let ws = FsWorkspace::new(dir.path());
        ws.apply(&Patch::new(vec![FilePatch::write("app.py", "a = 1\nb = 2\n")]))
            .unwrap();

        let edit = Patch::new(vec![
            FilePatch::write("app.py", "a = 1\nb = 3\n"),
            FilePatch::write("new.py", "x\n"),
        ]);
        assert_eq!(edit.changed_lines(&ws).unwrap(), 3);
        assert_eq!(Patch::new(vec![FilePatch::delete("app.py")]).changed_lines(&ws).unwrap(), 2);
    }

    #[test]
    fn rejects_escaping_paths_without_touching_tree() {
        let dir = tempfile::tempdir().unwrap();
        let ws = FsWorkspace::new(dir.path());
        let patch = Patch::new(vec![
            FilePatch::write("ok.py", "x"),
            FilePatch::write("../outside.py", "x"),
        ]);
        assert!(matches!(ws.apply(&patch), Err(WorkspaceError::PathEscape(_))));
        assert_eq!(ws.read("ok.py").unwrap(), None);
        assert!(matches!(ws.read("/etc/passwd"), Err(WorkspaceError::PathEscape(_))));
    }
}
