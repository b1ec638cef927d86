//! Resolution options, per-conflict outcomes and the batch report

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::detector::Conflict;
use crate::probe::{ProcessInfo, TerminationMode};
use crate::registry::{EnvironmentId, ServiceName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    Automatic,
    /// Every action needs approval; `auto_approve` grants it up front
    Interactive,
    /// Plan only: no registry writes, no terminations
    DryRun,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub strategy: ResolutionStrategy,
    pub auto_approve: bool,
    /// Terminating an unexpected owner is allowed (also needs `auto_approve`)
    pub allow_termination: bool,
    pub termination_mode: TerminationMode,
    /// Conflicts not started before the deadline are left untouched
    pub timeout: Option<Duration>,
}

impl ResolveOptions {
    pub fn automatic() -> Self {
        ResolveOptions {
            auto_approve: true,
            ..Self::default()
        }
    }

    pub fn dry_run() -> Self {
        ResolveOptions {
            strategy: ResolutionStrategy::DryRun,
            auto_approve: true,
            ..Self::default()
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.strategy == ResolutionStrategy::DryRun
    }
}

/// Lifecycle of one conflict: `Detected -> Resolving -> Resolved | Failed`, or `Skipped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Detected,
    Resolving,
    Resolved,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Reassign {
        service: ServiceName,
        from: u16,
        to: u16,
    },
    Terminate {
        owner: ProcessInfo,
        mode: TerminationMode,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictOutcome {
    pub conflict: Conflict,
    pub state: ResolutionState,
    /// Actions taken (or planned, in a dry run) for this conflict
    pub actions: Vec<ActionKind>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub environment: EnvironmentId,
    pub dry_run: bool,
    pub outcomes: Vec<ConflictOutcome>,
    pub actions_taken: Vec<ActionKind>,
    pub resolved: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deadline_exceeded: bool,
}

impl ResolutionReport {
    pub(crate) fn new(environment: EnvironmentId, dry_run: bool) -> Self {
        ResolutionReport {
            environment,
            dry_run,
            outcomes: Vec::new(),
            actions_taken: Vec::new(),
            resolved: 0,
            failed: 0,
            skipped: 0,
            deadline_exceeded: false,
        }
    }

    pub(crate) fn record(&mut self, outcome: ConflictOutcome) {
        match outcome.state {
            ResolutionState::Resolved => self.resolved += 1,
            ResolutionState::Failed => self.failed += 1,
            ResolutionState::Skipped => self.skipped += 1,
            ResolutionState::Detected | ResolutionState::Resolving => {}
        }
        self.actions_taken.extend(outcome.actions.iter().cloned());
        self.outcomes.push(outcome);
    }

    /// Nothing failed and nothing was left unattempted
    pub fn is_safe(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|o| matches!(o.state, ResolutionState::Failed | ResolutionState::Detected))
    }
}
