//! Version-control seam and its `git` implementation

use std::path::{Path, PathBuf};
use std::process::Command;

use warden_exec::{TreeStatus, WorkspaceError};
use warden_plan::{parse_porcelain, FileChange};

use crate::error::VcsError;

/// Repository operations the kernel needs
pub trait Vcs: Send + Sync {
    /// Create and switch to a branch at the current head
    fn create_branch(&self, name: &str) -> Result<(), VcsError>;

    /// Discard every uncommitted change, tracked or untracked, on `branch`
    fn hard_reset_to_last_commit(&self, branch: &str) -> Result<(), VcsError>;

    /// Stage everything and commit; returns the new head
    fn commit_with_message(&self, message: &str) -> Result<String, VcsError>;

    fn current_head_sha(&self) -> Result<String, VcsError>;

    /// Tree id of the current head
    fn base_tree_hash(&self) -> Result<String, VcsError>;

    /// Uncommitted changes, as `git status --porcelain` reports them
    fn status(&self) -> Result<Vec<FileChange>, VcsError>;

    fn is_working_tree_clean(&self) -> Result<bool, VcsError> {
        Ok(self.status()?.is_empty())
    }

    /// Current `origin/main` commit
    fn origin_main_sha(&self) -> Result<String, VcsError>;

    /// Tracked files, repository-relative
    fn list_files(&self) -> Result<Vec<String>, VcsError>;
}

/// [`TreeStatus`] read through a [`Vcs`]
#[derive(Clone, Copy)]
pub struct VcsTree<'a>(pub &'a dyn Vcs);

impl TreeStatus for VcsTree<'_> {
    fn changes(&self) -> Result<Vec<FileChange>, WorkspaceError> {
        self.0.status().map_err(|e| WorkspaceError::Status(e.to_string()))
    }
}

struct GitOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl GitOutput {
    fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// [`Vcs`] backed by the `git` binary
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo: PathBuf,
    remote: Option<String>,
    main_branch: String,
}

impl GitVcs {
    /// Repository at `repo`, comparing against `origin/main`
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            remote: Some("origin".into()),
            main_branch: "main".into(),
        }
    }

    /// Compare against a different remote, or the local branch with `None`
    #[must_use]
    pub fn with_remote(mut self, remote: Option<String>) -> Self {
        self.remote = remote;
        self
    }

    /// Use `branch` instead of `main` for drift and resets
    #[must_use]
    pub fn with_main_branch(mut self, branch: impl Into<String>) -> Self {
        self.main_branch = branch.into();
        self
    }

    /// Repository root
    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn exec(&self, args: &[&str]) -> Result<GitOutput, VcsError> {
        let output = Command::new("git").arg("-C").arg(&self.repo).args(args).output()?;
        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn run(&self, args: &[&str]) -> Result<String, VcsError> {
        let out = self.exec(args)?;
        if !out.success() {
            return Err(VcsError::Command {
                args: args.join(" "),
                code: out.exit_code,
                output: out.combined_output().trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    fn rev_parse(&self, refname: &str) -> Result<String, VcsError> {
        Ok(self.run(&["rev-parse", refname])?.trim().to_string())
    }
}

impl Vcs for GitVcs {
    fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        self.run(&["checkout", "-b", name])?;
        tracing::info!(branch = name, "isolation branch created");
        Ok(())
    }

    fn hard_reset_to_last_commit(&self, branch: &str) -> Result<(), VcsError> {
        self.run(&["checkout", "--force", branch])?;
        self.run(&["reset", "--hard", branch])?;
        self.run(&["clean", "-fd"])?;
        tracing::info!(branch, "working tree reset to last commit");
        Ok(())
    }

    fn commit_with_message(&self, message: &str) -> Result<String, VcsError> {
        self.run(&["add", "-A"])?;
        self.run(&["commit", "--no-verify", "-m", message])?;
        self.current_head_sha()
    }

    fn current_head_sha(&self) -> Result<String, VcsError> {
        self.rev_parse("HEAD")
    }

    fn base_tree_hash(&self) -> Result<String, VcsError> {
        self.rev_parse("HEAD^{tree}")
    }

    fn status(&self) -> Result<Vec<FileChange>, VcsError> {
        let out = self.run(&["status", "--porcelain", "--untracked-files=all"])?;
        Ok(parse_porcelain(&out))
    }

    fn origin_main_sha(&self) -> Result<String, VcsError> {
        let Some(remote) = &self.remote else {
            return self.rev_parse(&self.main_branch);
        };
        let fetch = self.exec(&["fetch", "--quiet", remote, &self.main_branch])?;
        if !fetch.success() {
            tracing::warn!(
                remote = %remote,
                output = %fetch.combined_output().trim(),
                "fetch failed, using the cached remote ref"
            );
        }
        self.rev_parse(&format!("{remote}/{}", self.main_branch))
    }

    fn list_files(&self) -> Result<Vec<String>, VcsError> {
        let out = self.run(&["ls-files"])?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }
}
