use crate::oracle::OracleError;
use crate::precheck::MissingBinary;
use crate::workspace::WorkspaceError;

/// Execution engine errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Required binaries did not resolve
    #[error("missing required binaries:\n{}", render_missing(.0))]
    MissingBinaries(Vec<MissingBinary>),

    /// Process could not be spawned
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Workspace failure
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// Oracle failure
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

impl ExecError {
    /// Host problems that must be fixed before anything can run
    #[inline]
    #[must_use]
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::MissingBinaries(_) | Self::Spawn { .. })
    }
}

fn render_missing(missing: &[MissingBinary]) -> String {
    missing
        .iter()
        .map(|m| format!("  - {m}"))
        .collect::<Vec<_>>()
        .join("\n")
}
