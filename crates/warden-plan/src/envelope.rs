//! The frozen plan envelope
//!
//! Built once during planning and never mutated. Everything that happens
//! later (isolation, execution, verification) is checked against it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::command::{CommandRole, CommandSpec};
use crate::hash::ContentHash;
use crate::scope::{FileChange, FileScope, ScopeViolation};
use crate::PlanError;

/// Default ceiling on declared scope size
pub const MAX_FILE_CAP: usize = 50;

/// Plan as proposed by the planner, prior to freezing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanContent {
    /// Stack name (resolved against the profile registry by the engine)
    pub stack: String,
    /// Dependency installation, the only command allowed to install packages
    pub install_command: Option<CommandSpec>,
    /// Build step
    pub compile_command: Option<CommandSpec>,
    /// Lint step
    pub lint_command: Option<CommandSpec>,
    /// Application run step (may be a long-running server)
    pub run_command: Option<CommandSpec>,
    /// Test runner
    pub test_command: Option<CommandSpec>,
    /// Extra commands executed in order while implementing
    #[serde(default)]
    pub run_commands: Vec<CommandSpec>,
    /// Files the plan may touch
    pub scope: FileScope,
    /// Test files written during the proving ground, all inside `scope`
    #[serde(default)]
    pub test_files: BTreeSet<String>,
    /// Declared third-party dependency names
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Hash of the dependency lockfiles at planning time
    pub lockfile_hash: ContentHash,
}

impl PlanContent {
    /// Every declared command in execution order
    pub fn commands(&self) -> impl Iterator<Item = &CommandSpec> {
        self.install_command
            .iter()
            .chain(&self.compile_command)
            .chain(&self.lint_command)
            .chain(&self.run_commands)
            .chain(&self.run_command)
            .chain(&self.test_command)
    }

    /// Content hash (the envelope hash once frozen)
    ///
    /// # Errors
    /// Serialization failure
    pub fn hash(&self) -> Result<ContentHash, PlanError> {
        Ok(ContentHash::compute_serializable(self)?)
    }

    fn validate(&self, limits: &FreezeLimits) -> Result<(), PlanError> {
        if self.stack.trim().is_empty() {
            return Err(PlanError::Invalid("stack name is empty".into()));
        }
        let slots = [
            (&self.install_command, CommandRole::Install),
            (&self.compile_command, CommandRole::Compile),
            (&self.lint_command, CommandRole::Lint),
            (&self.run_command, CommandRole::Run),
            (&self.test_command, CommandRole::Test),
        ];
        for (slot, expected) in slots {
            if let Some(cmd) = slot {
                if cmd.role != expected {
                    return Err(PlanError::Invalid(format!(
                        "{expected} slot holds a {} command",
                        cmd.role
                    )));
                }
            }
        }
        let declared = self.scope.len();
        if declared > limits.max_files {
            return Err(PlanError::ScopeTooLarge {
                declared,
                cap: limits.max_files,
            });
        }
        if let Some(stray) = self
            .test_files
            .iter()
            .find(|t| !self.scope.created.contains(*t) && !self.scope.modified.contains(*t))
        {
            return Err(PlanError::Invalid(format!(
                "test file {stray} is not a created or modified path in scope"
            )));
        }
        for cmd in self.commands() {
            if cmd.role != CommandRole::Install && cmd.is_package_install() {
                return Err(PlanError::ImplicitInstall(cmd.literal().to_string()));
            }
        }
        Ok(())
    }
}

/// Bounds applied when freezing
#[derive(Debug, Clone, Copy)]
pub struct FreezeLimits {
    /// Maximum distinct scope paths
    pub max_files: usize,
}

impl Default for FreezeLimits {
    fn default() -> Self {
        Self {
            max_files: MAX_FILE_CAP,
        }
    }
}

/// Immutable, hashed plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEnvelope {
    content: PlanContent,
    plan_envelope_hash: ContentHash,
    input_snapshot_hash: ContentHash,
    branch_base_sha: String,
}

impl PlanEnvelope {
    /// Validate and freeze a plan
    ///
    /// `branch_base_sha` is the `origin/main` commit observed while planning.
    ///
    /// # Errors
    /// [`PlanError`] when the content is invalid or cannot be hashed
    pub fn freeze(
        content: PlanContent,
        input_snapshot_hash: ContentHash,
        branch_base_sha: impl Into<String>,
        limits: &FreezeLimits,
    ) -> Result<Self, PlanError> {
        content.validate(limits)?;
        let plan_envelope_hash = content.hash()?;
        tracing::info!(
            plan = %plan_envelope_hash.short(),
            snapshot = %input_snapshot_hash.short(),
            files = content.scope.len(),
            "plan envelope frozen"
        );
        Ok(Self {
            content,
            plan_envelope_hash,
            input_snapshot_hash,
            branch_base_sha: branch_base_sha.into(),
        })
    }

    /// Frozen plan content
    #[must_use]
    pub fn content(&self) -> &PlanContent {
        &self.content
    }

    /// Hash taken at freeze time
    #[must_use]
    pub fn plan_envelope_hash(&self) -> ContentHash {
        self.plan_envelope_hash
    }

    /// Hash of the inputs the planner saw
    #[must_use]
    pub fn input_snapshot_hash(&self) -> ContentHash {
        self.input_snapshot_hash
    }

    /// `origin/main` commit at planning time
    #[must_use]
    pub fn branch_base_sha(&self) -> &str {
        &self.branch_base_sha
    }

    /// Declared scope
    #[must_use]
    pub fn scope(&self) -> &FileScope {
        &self.content.scope
    }

    /// Recompute the content hash and compare with the frozen one
    ///
    /// # Errors
    /// [`PlanError::HashMismatch`] if the content no longer matches
    pub fn verify_integrity(&self) -> Result<(), PlanError> {
        let actual = self.content.hash()?;
        if actual == self.plan_envelope_hash {
            Ok(())
        } else {
            Err(PlanError::HashMismatch {
                expected: self.plan_envelope_hash,
                actual,
            })
        }
    }

    /// Reject package installs other than the frozen install command
    ///
    /// # Errors
    /// [`PlanError::ImplicitInstall`]
    pub fn authorize_command(&self, command: &CommandSpec) -> Result<(), PlanError> {
        if !command.is_package_install() {
            return Ok(());
        }
        match &self.content.install_command {
            Some(install) if install.text == command.text => Ok(()),
            _ => Err(PlanError::ImplicitInstall(command.literal().to_string())),
        }
    }

    /// Check observed changes against the declared scope
    ///
    /// # Errors
    /// [`ScopeViolation`] listing every offending change
    pub fn check_changes<'a, I>(&self, changes: I) -> Result<(), ScopeViolation>
    where
        I: IntoIterator<Item = &'a FileChange>,
    {
        self.content.scope.check(changes)
    }

    /// Compare a freshly computed lockfile hash with the frozen one
    ///
    /// # Errors
    /// [`PlanError::LockfileMismatch`]
    pub fn verify_lockfile(&self, current: ContentHash) -> Result<(), PlanError> {
        if current == self.content.lockfile_hash {
            Ok(())
        } else {
            Err(PlanError::LockfileMismatch {
                expected: self.content.lockfile_hash,
                actual: current,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ChangeKind;

    fn content() -> PlanContent {
        PlanContent {
            stack: "python".into(),
            install_command: Some(CommandSpec::new(CommandRole::Install, "pip install -r requirements.txt").unwrap()),
            compile_command: Some(CommandSpec::new(CommandRole::Compile, "python -m py_compile app.py").unwrap()),
            lint_command: None,
            run_command: None,
            test_command: Some(CommandSpec::new(CommandRole::Test, "pytest -q").unwrap()),
            run_commands: Vec::new(),
            scope: FileScope::new().modify("app.py").create("test_app.py"),
            test_files: ["test_app.py".to_string()].into_iter().collect(),
            dependencies: BTreeSet::new(),
            lockfile_hash: ContentHash::compute(b"lock"),
        }
    }

    fn frozen() -> PlanEnvelope {
        PlanEnvelope::freeze(content(), ContentHash::compute(b"snap"), "abc123", &FreezeLimits::default())
            .unwrap()
    }

    #[test]
    fn frozen_hash_reverifies() {
        let env = frozen();
        assert_eq!(env.plan_envelope_hash(), content().hash().unwrap());
        env.verify_integrity().unwrap();
    }

    #[test]
    fn tampered_json_fails_integrity() {
        let env = frozen();
        let mut json: serde_json::Value = serde_json::to_value(&env).unwrap();
        json["content"]["stack"] = serde_json::Value::String("node".into());
        let tampered: PlanEnvelope = serde_json::from_value(json).unwrap();
        assert!(matches!(
            tampered.verify_integrity(),
            Err(PlanError::HashMismatch { .. })
        ));
    }

    #[test]
    fn rejects_scope_over_cap() {
        let mut c = content();
        for i in 0..3 {
            c.scope = c.scope.create(format!("f{i}.py"));
        }
        let err = PlanEnvelope::freeze(c, ContentHash::default(), "sha", &FreezeLimits { max_files: 4 })
            .unwrap_err();
        assert!(matches!(err, PlanError::ScopeTooLarge { declared: 5, cap: 4 }));
    }

    #[test]
    fn rejects_install_in_non_install_slot() {
        let mut c = content();
        c.run_commands
            .push(CommandSpec::new(CommandRole::Run, "npm install left-pad").unwrap());
        assert!(matches!(
            PlanEnvelope::freeze(c, ContentHash::default(), "sha", &FreezeLimits::default()),
            Err(PlanError::ImplicitInstall(_))
        ));
    }

    #[test]
    fn rejects_role_mismatch_and_stray_tests() {
        let mut c = content();
        c.lint_command = Some(CommandSpec::new(CommandRole::Test, "pytest").unwrap());
        assert!(matches!(
            PlanEnvelope::freeze(c, ContentHash::default(), "sha", &FreezeLimits::default()),
            Err(PlanError::Invalid(_))
        ));

        let mut c = content();
        c.test_files.insert("tests/test_other.py".into());
        assert!(matches!(
            PlanEnvelope::freeze(c, ContentHash::default(), "sha", &FreezeLimits::default()),
            Err(PlanError::Invalid(_))
        ));
    }

    #[test]
    fn authorizes_only_frozen_install() {
        let env = frozen();
        let frozen_install = CommandSpec::new(CommandRole::Install, "pip install -r requirements.txt").unwrap();
        env.authorize_command(&frozen_install).unwrap();
        env.authorize_command(&CommandSpec::new(CommandRole::Test, "pytest").unwrap())
            .unwrap();
        assert!(env
            .authorize_command(&CommandSpec::new(CommandRole::Run, "pip install requests").unwrap())
            .is_err());
    }

    #[test]
    fn scope_and_lockfile_enforcement() {
        let env = frozen();
        let extra = [
            FileChange::new("app.py", ChangeKind::Modified),
            FileChange::new("config.yaml", ChangeKind::Created),
        ];
        let violation = env.check_changes(&extra).unwrap_err();
        assert_eq!(violation.offending[0].path, "config.yaml");

        env.verify_lockfile(ContentHash::compute(b"lock")).unwrap();
        assert!(matches!(
            env.verify_lockfile(ContentHash::compute(b"lock2")),
            Err(PlanError::LockfileMismatch { .. })
        ));
    }
}
