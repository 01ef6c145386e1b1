//! Declared file scope and observed working-tree changes

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Kind of change observed on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// New, untracked or added file
    Created,
    /// Existing file with edits
    Modified,
    /// Removed file
    Deleted,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        })
    }
}

/// One observed change
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    /// Repository-relative path with `/` separators
    pub path: String,
    /// What happened to it
    pub kind: ChangeKind,
}

impl FileChange {
    /// Build a change, normalising the path
    pub fn new(path: impl AsRef<str>, kind: ChangeKind) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            kind,
        }
    }
}

impl Display for FileChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.kind)
    }
}

/// Paths the plan is allowed to touch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileScope {
    /// Files the plan creates
    #[serde(default)]
    pub created: BTreeSet<String>,
    /// Files the plan edits
    #[serde(default)]
    pub modified: BTreeSet<String>,
    /// Files the plan removes
    #[serde(default)]
    pub deleted: BTreeSet<String>,
}

impl FileScope {
    /// Empty scope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a created path
    #[must_use]
    pub fn create(mut self, path: impl AsRef<str>) -> Self {
        self.created.insert(normalize_path(path.as_ref()));
        self
    }

    /// Declare a modified path
    #[must_use]
    pub fn modify(mut self, path: impl AsRef<str>) -> Self {
        self.modified.insert(normalize_path(path.as_ref()));
        self
    }

    /// Declare a deleted path
    #[must_use]
    pub fn delete(mut self, path: impl AsRef<str>) -> Self {
        self.deleted.insert(normalize_path(path.as_ref()));
        self
    }

    /// Number of distinct declared paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths().count()
    }

    /// True when nothing is declared
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Distinct declared paths in order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.created
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
    }

    /// True when any set mentions the path
    #[must_use]
    pub fn mentions(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.created.contains(&path) || self.modified.contains(&path) || self.deleted.contains(&path)
    }

    /// Whether a single change is permitted
    ///
    /// Created and modified files must be declared as created or modified;
    /// deletions must be declared as deletions.
    #[must_use]
    pub fn permits(&self, change: &FileChange) -> bool {
        let writable = self.created.contains(&change.path) || self.modified.contains(&change.path);
        match change.kind {
            ChangeKind::Created | ChangeKind::Modified => writable,
            ChangeKind::Deleted => self.deleted.contains(&change.path),
        }
    }

    /// Check a batch of changes, returning every offending one
    ///
    /// # Errors
    /// [`ScopeViolation`] listing all changes outside the scope
    pub fn check<'a, I>(&self, changes: I) -> Result<(), ScopeViolation>
    where
        I: IntoIterator<Item = &'a FileChange>,
    {
        let offending: Vec<FileChange> = changes
            .into_iter()
            .filter(|c| !self.permits(c))
            .cloned()
            .collect();
        if offending.is_empty() {
            Ok(())
        } else {
            Err(ScopeViolation { offending })
        }
    }
}

/// Changes that fell outside the declared scope
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} change(s) outside declared scope: {}", offending.len(), render(offending))]
pub struct ScopeViolation {
    /// Every out-of-scope change
    pub offending: Vec<FileChange>,
}

fn render(changes: &[FileChange]) -> String {
    changes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Strip `./` prefixes and normalise separators
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let mut p = path.as_str();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_matches('"').to_string()
}

/// Parse `git status --porcelain` (v1) output into changes
///
/// Renames become a deletion of the old path and a creation of the new one.
#[must_use]
pub fn parse_porcelain(output: &str) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, path) = line.split_at(2);
        let path = &path[1..];
        let mut status = code.chars();
        let index = status.next().unwrap_or(' ');
        let worktree = status.next().unwrap_or(' ');

        if index == 'R' || worktree == 'R' || index == 'C' {
            if let Some((from, to)) = path.split_once(" -> ") {
                if index != 'C' {
                    changes.push(FileChange::new(from, ChangeKind::Deleted));
                }
                changes.push(FileChange::new(to, ChangeKind::Created));
                continue;
            }
        }

        let kind = match (index, worktree) {
            ('?', '?') | ('A', _) => ChangeKind::Created,
            ('D', _) | (_, 'D') => ChangeKind::Deleted,
            _ => ChangeKind::Modified,
        };
        changes.push(FileChange::new(path, kind));
    }
    changes
}

/// Working tree must be clean apart from the ignore-rules file
///
/// # Errors
/// [`DirtyTree`] listing the dirty paths
pub fn check_clean_tree(changes: &[FileChange], ignore_file: &str) -> Result<(), DirtyTree> {
    let dirty: Vec<String> = changes
        .iter()
        .filter(|c| c.path != ignore_file)
        .map(|c| c.path.clone())
        .collect();
    if dirty.is_empty() {
        Ok(())
    } else {
        Err(DirtyTree { paths: dirty })
    }
}

/// Uncommitted changes found where a clean tree was required
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("working tree has uncommitted changes: {}", paths.join(", "))]
pub struct DirtyTree {
    /// Dirty paths
    pub paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_porcelain_codes() {
        let out = "?? new.py\n M app.py\nM  staged.py\n D gone.py\nA  added.py\nR  old.py -> renamed.py\n";
        assert_eq!(
            parse_porcelain(out),
            vec![
                FileChange::new("new.py", ChangeKind::Created),
                FileChange::new("app.py", ChangeKind::Modified),
                FileChange::new("staged.py", ChangeKind::Modified),
                FileChange::new("gone.py", ChangeKind::Deleted),
                FileChange::new("added.py", ChangeKind::Created),
                FileChange::new("old.py", ChangeKind::Deleted),
                FileChange::new("renamed.py", ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn scope_rules() {
        let scope = FileScope::new().create("test_app.py").modify("app.py").delete("legacy.py");
        assert!(scope.permits(&FileChange::new("app.py", ChangeKind::Modified)));
        assert!(scope.permits(&FileChange::new("./test_app.py", ChangeKind::Created)));
        assert!(scope.permits(&FileChange::new("test_app.py", ChangeKind::Modified)));
        assert!(scope.permits(&FileChange::new("legacy.py", ChangeKind::Deleted)));
        assert!(!scope.permits(&FileChange::new("app.py", ChangeKind::Deleted)));
        assert!(!scope.permits(&FileChange::new("legacy.py", ChangeKind::Modified)));
        assert!(!scope.permits(&FileChange::new("config.yaml", ChangeKind::Created)));
    }

    #[test]
    fn check_reports_all_offenders() {
        let scope = FileScope::new().modify("app.py");
        let changes = vec![
            FileChange::new("app.py", ChangeKind::Modified),
            FileChange::new("config.yaml", ChangeKind::Created),
            FileChange::new("README.md", ChangeKind::Deleted),
        ];
        let err = scope.check(&changes).unwrap_err();
        assert_eq!(err.offending.len(), 2);
        assert!(err.to_string().contains("config.yaml (created)"));
    }

    #[test]
    fn len_counts_distinct_paths() {
        let scope = FileScope::new().create("a").modify("a").modify("b");
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn clean_tree_tolerates_ignore_file_only() {
        let ignore_only = vec![FileChange::new(".gitignore", ChangeKind::Modified)];
        assert!(check_clean_tree(&ignore_only, ".gitignore").is_ok());

        let dirty = vec![
            FileChange::new(".gitignore", ChangeKind::Modified),
            FileChange::new("src/main.rs", ChangeKind::Modified),
        ];
        let err = check_clean_tree(&dirty, ".gitignore").unwrap_err();
        assert_eq!(err.paths, vec!["src/main.rs".to_string()]);
    }
}
