//! Risk budget
//!
//! Bounds how much a task may change and how many commands it may launch.
//! A single patch over `max_patch_lines` needs a human to confirm it;
//! crossing `max_total_lines` or `max_commands` ends the task.

use std::fmt;

use serde::{Deserialize, Serialize};
use warden_plan::ContentHash;

/// Limits for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskBudget {
    /// Lines one patch may add or remove before it needs confirmation
    pub max_patch_lines: usize,
    /// Lines all applied patches and fixes may change together
    pub max_total_lines: usize,
    /// Commands the task may launch, healing attempts included
    pub max_commands: u32,
}

impl Default for RiskBudget {
    fn default() -> Self {
        Self {
            max_patch_lines: 200,
            max_total_lines: 500,
            max_commands: 60,
        }
    }
}

/// What a task has spent so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    /// Largest single patch or fix applied
    pub largest_patch_lines: usize,
    /// Lines changed by every applied patch and fix
    pub total_lines: usize,
    /// Commands launched by the engine
    pub commands: u32,
    /// Oversized patch waiting on a human
    pub awaiting_confirmation: Option<ContentHash>,
    /// Oversized patches a human approved
    pub confirmed: Vec<ContentHash>,
}

impl BudgetUsage {
    /// Account for an applied patch or fix
    pub fn record_lines(&mut self, lines: usize) {
        self.largest_patch_lines = self.largest_patch_lines.max(lines);
        self.total_lines = self.total_lines.saturating_add(lines);
    }

    /// Whether an oversized patch has been approved
    #[must_use]
    pub fn is_confirmed(&self, patch: &ContentHash) -> bool {
        self.confirmed.contains(patch)
    }

    /// Move the awaiting patch into the confirmed set
    pub fn confirm_awaiting(&mut self) {
        if let Some(hash) = self.awaiting_confirmation.take() {
            self.confirmed.push(hash);
        }
    }
}

/// Budgeted quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    PatchLines,
    TotalLines,
    Commands,
}

impl BudgetDimension {
    /// Crossing a hard dimension ends the task; a soft one asks for confirmation
    #[must_use]
    pub fn is_hard(self) -> bool {
        !matches!(self, Self::PatchLines)
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PatchLines => "patch size",
            Self::TotalLines => "total change",
            Self::Commands => "command count",
        })
    }
}

/// A budget dimension over its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{dimension} budget exceeded: {used} used, limit {limit}")]
pub struct BudgetExceeded {
    pub dimension: BudgetDimension,
    pub used: u64,
    pub limit: u64,
}

impl RiskBudget {
    /// First hard dimension over its limit
    #[must_use]
    pub fn exhausted(&self, usage: &BudgetUsage) -> Option<BudgetExceeded> {
        if usage.total_lines > self.max_total_lines {
            return Some(BudgetExceeded {
                dimension: BudgetDimension::TotalLines,
                used: usage.total_lines as u64,
                limit: self.max_total_lines as u64,
            });
        }
        if usage.commands > self.max_commands {
            return Some(BudgetExceeded {
                dimension: BudgetDimension::Commands,
                used: u64::from(usage.commands),
                limit: u64::from(self.max_commands),
            });
        }
        None
    }

    /// Whether a patch of `lines` may be applied without confirmation
    ///
    /// # Errors
    /// [`BudgetExceeded`] on the patch-size dimension
    pub fn check_patch(&self, lines: usize) -> Result<(), BudgetExceeded> {
        if lines > self.max_patch_lines {
            return Err(BudgetExceeded {
                dimension: BudgetDimension::PatchLines,
                used: lines as u64,
                limit: self.max_patch_lines as u64,
            });
        }
        Ok(())
    }
}
