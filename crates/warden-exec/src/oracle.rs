//! The code-generation oracle and the patches it returns

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use warden_plan::{ChangeKind, ContentHash, FileChange, FieldHasher, PlanEnvelope};

use crate::extract::ErrorLocation;
use crate::workspace::{Workspace, WorkspaceError};

/// New content for one file, or its removal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    /// Repository-relative path
    pub path: String,
    /// Full new content; `None` deletes the file
    pub content: Option<String>,
}

impl FilePatch {
    /// Replace a file's content
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
        }
    }

    /// Delete a file
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: None,
        }
    }
}

/// A set of file edits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Edits in application order
    pub files: Vec<FilePatch>,
}

impl Patch {
    /// Patch from edits
    #[must_use]
    pub fn new(files: Vec<FilePatch>) -> Self {
        Self { files }
    }

    /// True when nothing is edited
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Exact content hash
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.hash_with(|s| s.to_string())
    }

    /// Hash after collapsing whitespace, so reformatted repeats compare equal
    #[must_use]
    pub fn normalized_hash(&self) -> ContentHash {
        self.hash_with(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    fn hash_with(&self, normalize: impl Fn(&str) -> String) -> ContentHash {
        let mut files: Vec<&FilePatch> = self.files.iter().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
            .into_iter()
            .fold(FieldHasher::new(), |h, f| {
                let h = h.field("path", f.path.as_bytes());
                match &f.content {
                    Some(c) => h.field("write", normalize(c).as_bytes()),
                    None => h.field("delete", &[]),
                }
            })
            .finish()
    }

    /// Changes the patch would make, for scope checking
    ///
    /// Writes are reported as modifications; the scope treats created and
    /// modified paths alike.
    #[must_use]
    pub fn changes(&self) -> Vec<FileChange> {
        self.files
            .iter()
            .map(|f| {
                let kind = if f.content.is_some() {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Deleted
                };
                FileChange::new(&f.path, kind)
            })
            .collect()
    }

    /// Lines added plus lines removed against the current workspace
    ///
    /// # Errors
    /// The workspace could not read a patched file
    pub fn changed_lines(&self, workspace: &dyn Workspace) -> Result<usize, WorkspaceError> {
        let mut total = 0;
        for file in &self.files {
            let old = workspace
                .read(&file.path)?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            total += line_delta(&old, file.content.as_deref().unwrap_or_default());
        }
        Ok(total)
    }
}

/// Lines present in one text but not the other, counted with multiplicity
fn line_delta(old: &str, new: &str) -> usize {
    let mut balance: HashMap<&str, isize> = HashMap::new();
    for line in old.lines() {
        *balance.entry(line).or_default() -= 1;
    }
    for line in new.lines() {
        *balance.entry(line).or_default() += 1;
    }
    balance.values().map(|n| n.unsigned_abs()).sum()
}

/// What the fix oracle is told about a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRequest {
    /// Failing command literal
    pub command: String,
    /// Attempt that failed (1-based)
    pub attempt: u32,
    /// Extracted locations, most relevant first
    pub locations: Vec<ErrorLocation>,
    /// Redacted, truncated output
    pub output: String,
    /// Hashes of fixes already applied in this session
    pub prior_fixes: Vec<ContentHash>,
}

impl FixRequest {
    /// Primary location, if any was extracted
    #[must_use]
    pub fn primary(&self) -> Option<&ErrorLocation> {
        self.locations.last()
    }
}

/// Oracle failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    /// Oracle could not be reached
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// Oracle answered with something unusable
    #[error("oracle response rejected: {0}")]
    InvalidResponse(String),
}

/// Opaque code-generation collaborator
#[async_trait]
pub trait CodeOracle: Send + Sync {
    /// Author the failing tests declared in the plan
    async fn propose_tests(&self, envelope: &PlanEnvelope) -> Result<Patch, OracleError>;

    /// Author the implementation
    async fn propose_implementation(&self, envelope: &PlanEnvelope) -> Result<Patch, OracleError>;

    /// Propose a fix for a failed attempt
    async fn propose_fix(&self, request: &FixRequest) -> Result<Patch, OracleError>;
}
