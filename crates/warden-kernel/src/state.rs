//! Task lifecycle states and the legal-transition table

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransitionRejection;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Reading the request into a structured intent; read-only
    IntentAnalysis,
    /// Building the bounded repository map; read-only
    RepoDiscovery,
    /// Freezing the plan envelope and creating the isolation branch
    Planning,
    /// Writing the failing tests and committing them
    ProvingGround,
    /// Applying the implementation and healing planned commands
    Implementing,
    /// Governance checks, command tiers, CI and the merge guard
    Verifying,
    /// Parked until a human approves or the window expires
    FeedbackWait,
    /// Merge-ready
    Complete,
    /// The main branch moved under the task
    FailedByStale,
    /// Stopped by a signal or a denied approval
    FailedByInterrupt,
    /// Runtime cap or approval window exceeded
    FailedByTimeout,
    /// A change landed outside the declared scope
    FailedByScope,
}

impl State {
    /// Every state, in lifecycle order
    pub const ALL: [State; 12] = [
        State::IntentAnalysis,
        State::RepoDiscovery,
        State::Planning,
        State::ProvingGround,
        State::Implementing,
        State::Verifying,
        State::FeedbackWait,
        State::Complete,
        State::FailedByStale,
        State::FailedByInterrupt,
        State::FailedByTimeout,
        State::FailedByScope,
    ];

    /// No transition leaves a terminal state
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::FailedByStale
                | Self::FailedByInterrupt
                | Self::FailedByTimeout
                | Self::FailedByScope
        )
    }

    /// One of the four `FAILED_*` states
    #[inline]
    #[must_use]
    pub const fn is_failure(self) -> bool {
        self.is_terminal() && !matches!(self, Self::Complete)
    }

    /// Stable upper-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IntentAnalysis => "INTENT_ANALYSIS",
            Self::RepoDiscovery => "REPO_DISCOVERY",
            Self::Planning => "PLANNING",
            Self::ProvingGround => "PROVING_GROUND",
            Self::Implementing => "IMPLEMENTING",
            Self::Verifying => "VERIFYING",
            Self::FeedbackWait => "FEEDBACK_WAIT",
            Self::Complete => "COMPLETE",
            Self::FailedByStale => "FAILED_BY_STALE",
            Self::FailedByInterrupt => "FAILED_BY_INTERRUPT",
            Self::FailedByTimeout => "FAILED_BY_TIMEOUT",
            Self::FailedByScope => "FAILED_BY_SCOPE",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task was forced into a terminal failure state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedTrigger {
    /// Runtime cap exceeded or approval window expired
    Timeout,
    /// External stop signal
    Interrupt,
    /// Base moved under the branch
    Stale,
    /// Mutation outside the declared scope
    Scope,
}

impl ForcedTrigger {
    /// Terminal state this trigger lands in
    #[must_use]
    pub const fn target(self) -> State {
        match self {
            Self::Timeout => State::FailedByTimeout,
            Self::Interrupt => State::FailedByInterrupt,
            Self::Stale => State::FailedByStale,
            Self::Scope => State::FailedByScope,
        }
    }

    /// Inverse of [`ForcedTrigger::target`]
    #[must_use]
    pub const fn for_state(state: State) -> Option<Self> {
        match state {
            State::FailedByTimeout => Some(Self::Timeout),
            State::FailedByInterrupt => Some(Self::Interrupt),
            State::FailedByStale => Some(Self::Stale),
            State::FailedByScope => Some(Self::Scope),
            _ => None,
        }
    }
}

impl fmt::Display for ForcedTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Interrupt => "interrupt",
            Self::Stale => "stale",
            Self::Scope => "scope",
        };
        f.write_str(s)
    }
}

const FAILURES: [State; 4] = [
    State::FailedByStale,
    State::FailedByInterrupt,
    State::FailedByTimeout,
    State::FailedByScope,
];

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: State) -> Vec<State> {
    use State::*;
    let forward: &[State] = match from {
        IntentAnalysis => &[RepoDiscovery, FeedbackWait],
        RepoDiscovery => &[Planning, FeedbackWait],
        Planning => &[ProvingGround, FeedbackWait],
        ProvingGround => &[Implementing, FeedbackWait],
        Implementing => &[Verifying, FeedbackWait],
        Verifying => &[Complete, Implementing, FeedbackWait],
        FeedbackWait => &[IntentAnalysis, Planning, Implementing],
        Complete | FailedByStale | FailedByInterrupt | FailedByTimeout | FailedByScope => &[],
    };
    let mut out = forward.to_vec();
    if !from.is_terminal() {
        out.extend_from_slice(&FAILURES);
    }
    out
}

/// Check the table
///
/// # Errors
/// [`TransitionRejection::AlreadyTerminal`] from a terminal state,
/// [`TransitionRejection::Illegal`] for any edge not in the table
pub fn validate_transition(from: State, to: State) -> Result<(), TransitionRejection> {
    if from.is_terminal() {
        return Err(TransitionRejection::AlreadyTerminal { state: from });
    }
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionRejection::Illegal { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for s in State::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(allowed_transitions(s).is_empty(), "{s}");
        }
    }

    #[test]
    fn every_working_state_can_fail() {
        for s in State::ALL.into_iter().filter(|s| !s.is_terminal()) {
            for f in FAILURES {
                assert!(validate_transition(s, f).is_ok(), "{s} -> {f}");
            }
        }
    }

    #[test]
    fn cannot_skip_proving_ground() {
        assert!(matches!(
            validate_transition(State::Planning, State::Implementing),
            Err(TransitionRejection::Illegal { .. })
        ));
    }

    #[test]
    fn feedback_wait_resumes_only_to_listed_states() {
        assert!(validate_transition(State::FeedbackWait, State::Planning).is_ok());
        assert!(validate_transition(State::FeedbackWait, State::Verifying).is_err());
        assert!(validate_transition(State::FeedbackWait, State::Complete).is_err());
    }

    #[test]
    fn trigger_target_round_trips() {
        for t in [
            ForcedTrigger::Timeout,
            ForcedTrigger::Interrupt,
            ForcedTrigger::Stale,
            ForcedTrigger::Scope,
        ] {
            assert_eq!(ForcedTrigger::for_state(t.target()), Some(t));
        }
    }

    #[test]
    fn serde_uses_upper_snake_case() {
        let json = serde_json::to_string(&State::FailedByScope).unwrap();
        assert_eq!(json, "\"FAILED_BY_SCOPE\"");
    }
}
