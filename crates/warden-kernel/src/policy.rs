//! External policy gates
//!
//! Command safety, capability checks, secret redaction and dependency
//! risk are decided outside the kernel. A denial is an ordinary rejected
//! transition cause. The defaults here allow everything the frozen plan
//! already allows.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use warden_exec::{NoRedaction, OutputRedactor};
use warden_plan::{CommandSpec, PlanEnvelope, PlanError};

/// Command classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerdict {
    /// Local only
    Safe,
    /// Reaches the network; allowed only as the frozen install command
    Network,
    /// Never allowed
    Block,
}

/// Classifies commands before they run
pub trait CommandPolicy: Send + Sync {
    fn classify(&self, command: &CommandSpec) -> CommandVerdict;
}

/// Role/action capability check
pub trait CapabilityCheck: Send + Sync {
    fn allowed(&self, role: &str, action: &str) -> bool;
}

/// Scores a dependency name in `[0, 1]`; higher is riskier
pub trait DependencyRisk: Send + Sync {
    fn risk(&self, name: &str) -> f32;
}

/// Package installs are network commands, everything else is local
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallIsNetwork;

impl CommandPolicy for InstallIsNetwork {
    fn classify(&self, command: &CommandSpec) -> CommandVerdict {
        if command.is_package_install() {
            CommandVerdict::Network
        } else {
            CommandVerdict::Safe
        }
    }
}

/// Grants every capability
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn allowed(&self, _role: &str, _action: &str) -> bool {
        true
    }
}

/// Scores every dependency as risk-free
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependencyRisk;

impl DependencyRisk for NoDependencyRisk {
    fn risk(&self, _name: &str) -> f32 {
        0.0
    }
}

/// Actions checked against [`CapabilityCheck`]
pub mod actions {
    /// Starting a task
    pub const SUBMIT: &str = "submit_task";
    /// Writing to the workspace
    pub const MUTATE: &str = "mutate_workspace";
    /// Committing to the isolation branch
    pub const COMMIT: &str = "commit";
    /// Declaring the branch merge-ready
    pub const MERGE: &str = "merge";
}

/// A gate refusal
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateDenial {
    #[error("command `{0}` is blocked by policy")]
    Blocked(String),

    #[error("network command `{0}` is not the frozen install command")]
    Network(String),

    #[error("role `{role}` may not {action}")]
    Capability { role: String, action: String },
}

/// The gates consulted by the pipeline
#[derive(Clone)]
pub struct PolicyGates {
    /// Decides whether a planned command may run
    pub commands: Arc<dyn CommandPolicy>,
    /// Decides whether the agent holds a capability
    pub capabilities: Arc<dyn CapabilityCheck>,
    /// Scrubs command output
    pub redactor: Arc<dyn OutputRedactor>,
    /// Scores planned dependencies
    pub dependency_risk: Arc<dyn DependencyRisk>,
    /// Role the agent acts as
    pub role: String,
}

impl fmt::Debug for PolicyGates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyGates").field("role", &self.role).finish_non_exhaustive()
    }
}

impl Default for PolicyGates {
    fn default() -> Self {
        Self {
            commands: Arc::new(InstallIsNetwork),
            capabilities: Arc::new(AllowAll),
            redactor: Arc::new(NoRedaction),
            dependency_risk: Arc::new(NoDependencyRisk),
            role: "agent".into(),
        }
    }
}

impl PolicyGates {
    /// Command gate
    ///
    /// # Errors
    /// [`GateDenial::Blocked`], or [`GateDenial::Network`] for a network
    /// command other than the envelope's install command
    pub fn check_command(&self, envelope: &PlanEnvelope, command: &CommandSpec) -> Result<(), GateDenial> {
        match self.commands.classify(command) {
            CommandVerdict::Safe => Ok(()),
            CommandVerdict::Block => Err(GateDenial::Blocked(command.literal().to_string())),
            CommandVerdict::Network => match &envelope.content().install_command {
                Some(install) if install == command => Ok(()),
                _ => Err(GateDenial::Network(command.literal().to_string())),
            },
        }
    }

    /// Capability gate for the configured role
    ///
    /// # Errors
    /// [`GateDenial::Capability`]
    pub fn check_capability(&self, action: &str) -> Result<(), GateDenial> {
        if self.capabilities.allowed(&self.role, action) {
            Ok(())
        } else {
            Err(GateDenial::Capability {
                role: self.role.clone(),
                action: action.to_string(),
            })
        }
    }

    /// Dependency-risk gate
    ///
    /// # Errors
    /// [`PlanError::RiskyDependency`] for the first dependency at or above `threshold`
    pub fn check_dependencies(&self, dependencies: &BTreeSet<String>, threshold: f32) -> Result<(), PlanError> {
        for name in dependencies {
            let score = self.dependency_risk.risk(name);
            if score >= threshold {
                return Err(PlanError::RiskyDependency {
                    name: name.clone(),
                    score,
                    threshold,
                });
            }
        }
        Ok(())
    }
}
