//! Applies remediations for detected conflicts
//!
//! Conflicts are handled one at a time in input order against a working copy
//! of the environment, so later reassignments never pick a port an earlier one
//! already took. A dry run walks the same path and only skips the side effects,
//! which keeps its plan identical to what a live run would do.
//!
//! With a timeout, each conflict runs under the batch deadline. A conflict cut
//! off mid-way is reported `Failed` with whatever actions it had committed.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::detector::{Conflict, ConflictDetector, ConflictKind, OwnerMatcher};
use crate::errors::{EnvPortError, Result};
use crate::probe::{Occupancy, ProbePool, ProcessInfo, Terminator};
use crate::registry::{Environment, EnvironmentId, PortRegistry, ServiceName};
use crate::resolver::outcome::{
    ActionKind, ConflictOutcome, ResolutionReport, ResolutionState, ResolutionStrategy, ResolveOptions,
};
use crate::scorer::{SuggestOptions, SuggestionScorer};

pub struct ConflictResolver {
    registry: Arc<PortRegistry>,
    probes: ProbePool,
    matcher: OwnerMatcher,
    scorer: SuggestionScorer,
    terminator: Arc<dyn Terminator>,
}

fn outcome(conflict: &Conflict, state: ResolutionState, actions: Vec<ActionKind>, message: impl Into<String>) -> ConflictOutcome {
    ConflictOutcome {
        conflict: conflict.clone(),
        state,
        actions,
        message: message.into(),
    }
}

/// What an operator should do about a conflict the resolver will not touch
fn recommendation(conflict: &Conflict) -> String {
    match &conflict.kind {
        ConflictKind::InUse { owner } => match owner {
            Some(owner) => format!("no spare port in range; stop {} or widen the range", owner),
            None => "no spare port in range; free the port or widen the range".to_string(),
        },
        ConflictKind::ReservedRange { range } => format!(
            "move the service out of {}-{} ({})",
            range.start, range.end, range.description
        ),
        ConflictKind::DuplicatePort { .. } => "no spare port in range to split the duplicate".to_string(),
        ConflictKind::CrossEnvironment {
            other_environment,
            other_service,
            ..
        } => format!(
            "give one side a port from its own range; {} in {} also uses {}",
            other_service, other_environment, conflict.port
        ),
    }
}

impl ConflictResolver {
    /// Shares the detector's registry, probes and owner rules
    pub fn new(detector: &ConflictDetector, scorer: SuggestionScorer, terminator: Arc<dyn Terminator>) -> Self {
        ConflictResolver {
            registry: Arc::clone(detector.registry()),
            probes: detector.probes().clone(),
            matcher: detector.matcher().clone(),
            scorer,
            terminator,
        }
    }

    pub fn scorer(&self) -> &SuggestionScorer {
        &self.scorer
    }

    /// Resolve `conflicts` for `env`
    ///
    /// Per-conflict failures are recorded in the report; only an unknown
    /// environment aborts the batch.
    pub async fn resolve(
        &self,
        env: EnvironmentId,
        conflicts: &[Conflict],
        options: &ResolveOptions,
    ) -> Result<ResolutionReport> {
        let mut working = self.registry.get_environment(env)?;
        let dry_run = options.is_dry_run();
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut report = ResolutionReport::new(env, dry_run);

        for conflict in conflicts {
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                report.deadline_exceeded = true;
                report.record(outcome(
                    conflict,
                    ResolutionState::Detected,
                    Vec::new(),
                    "deadline reached before resolution started",
                ));
                continue;
            }

            let mut committed = Vec::new();
            let attempt = self.resolve_one(&mut working, conflict, options, &mut committed);
            let result = match deadline {
                Some(deadline) => {
                    let timed = tokio::time::timeout_at(deadline, attempt).await;
                    match timed {
                        Ok(result) => result?,
                        Err(_) => {
                            report.deadline_exceeded = true;
                            outcome(
                                conflict,
                                ResolutionState::Failed,
                                committed,
                                "deadline exceeded while resolving",
                            )
                        }
                    }
                }
                None => attempt.await?,
            };
            match result.state {
                ResolutionState::Failed => warn!(%env, port = conflict.port, message = %result.message, "Resolution failed"),
                state => debug!(%env, port = conflict.port, ?state, message = %result.message, "Conflict handled"),
            }
            report.record(result);
        }

        info!(
            %env,
            dry_run,
            resolved = report.resolved,
            failed = report.failed,
            skipped = report.skipped,
            deadline_exceeded = report.deadline_exceeded,
            "Resolution finished"
        );
        Ok(report)
    }

    /// `committed` collects actions as they take effect, so a caller that
    /// abandons this future still knows what was done
    async fn resolve_one(
        &self,
        working: &mut Environment,
        conflict: &Conflict,
        options: &ResolveOptions,
        committed: &mut Vec<ActionKind>,
    ) -> Result<ConflictOutcome> {
        if !conflict.auto_resolvable {
            return Ok(outcome(conflict, ResolutionState::Skipped, Vec::new(), recommendation(conflict)));
        }
        if options.strategy == ResolutionStrategy::Interactive && !options.auto_approve {
            return Ok(outcome(conflict, ResolutionState::Skipped, Vec::new(), "confirmation required"));
        }

        debug!(port = conflict.port, kind = conflict.kind.label(), "Resolving");
        match &conflict.kind {
            ConflictKind::InUse { owner } => self.resolve_in_use(working, conflict, owner.as_ref(), options).await,
            ConflictKind::DuplicatePort { services } => {
                self.resolve_duplicate(working, conflict, services, options, committed)
                    .await
            }
            _ => Ok(outcome(conflict, ResolutionState::Skipped, Vec::new(), recommendation(conflict))),
        }
    }

    async fn resolve_in_use(
        &self,
        working: &mut Environment,
        conflict: &Conflict,
        detected_owner: Option<&ProcessInfo>,
        options: &ResolveOptions,
    ) -> Result<ConflictOutcome> {
        let Some(service) = conflict.service else {
            return Ok(outcome(conflict, ResolutionState::Failed, Vec::new(), "conflict names no service"));
        };

        if working.port_of(service) != Some(conflict.port) {
            return Ok(outcome(
                conflict,
                ResolutionState::Resolved,
                Vec::new(),
                format!("{} no longer uses {}", service, conflict.port),
            ));
        }

        let current = self.probes.probe(conflict.port).await;
        match &current.occupancy {
            Occupancy::Free => {
                return Ok(outcome(
                    conflict,
                    ResolutionState::Resolved,
                    Vec::new(),
                    format!("{} is free again", conflict.port),
                ))
            }
            Occupancy::Bound { owner } if self.matcher.recognises(service, working.id, owner.as_ref()) => {
                return Ok(outcome(
                    conflict,
                    ResolutionState::Resolved,
                    Vec::new(),
                    format!("{} is now held by the expected owner", conflict.port),
                ))
            }
            _ => {}
        }

        let owner = current.occupancy.owner().or(detected_owner).cloned();
        if options.allow_termination && options.auto_approve {
            if let Some(owner) = owner {
                let action = ActionKind::Terminate {
                    owner: owner.clone(),
                    mode: options.termination_mode,
                };
                if options.is_dry_run() {
                    return Ok(outcome(
                        conflict,
                        ResolutionState::Resolved,
                        vec![action],
                        format!("would terminate {}", owner),
                    ));
                }
                return Ok(match self.terminator.terminate(&owner, options.termination_mode).await {
                    Ok(()) => outcome(
                        conflict,
                        ResolutionState::Resolved,
                        vec![action],
                        format!("terminated {}", owner),
                    ),
                    Err(e) => outcome(conflict, ResolutionState::Failed, Vec::new(), e.to_string()),
                });
            }
        }

        Ok(match self.reassign(working, service, conflict.port, options).await {
            Ok(Some(action)) => outcome(conflict, ResolutionState::Resolved, vec![action], format!("moved {}", service)),
            Ok(None) => outcome(
                conflict,
                ResolutionState::Resolved,
                Vec::new(),
                format!("{} was already moved", service),
            ),
            Err(e) => outcome(conflict, ResolutionState::Failed, Vec::new(), e.to_string()),
        })
    }

    async fn resolve_duplicate(
        &self,
        working: &mut Environment,
        conflict: &Conflict,
        services: &[ServiceName],
        options: &ResolveOptions,
        committed: &mut Vec<ActionKind>,
    ) -> Result<ConflictOutcome> {
        let holders: Vec<ServiceName> = services
            .iter()
            .copied()
            .filter(|s| working.port_of(*s) == Some(conflict.port))
            .collect();

        let Some(keeper) = holders.first().copied() else {
            return Ok(outcome(conflict, ResolutionState::Resolved, Vec::new(), "no service uses the port any more"));
        };
        if holders.len() < 2 {
            return Ok(outcome(
                conflict,
                ResolutionState::Resolved,
                Vec::new(),
                format!("only {} uses {} now", keeper, conflict.port),
            ));
        }

        for service in holders.iter().skip(1) {
            match self.reassign(working, *service, conflict.port, options).await {
                Ok(Some(action)) => committed.push(action),
                Ok(None) => {}
                Err(e) => {
                    return Ok(outcome(conflict, ResolutionState::Failed, committed.clone(), e.to_string()));
                }
            }
        }

        Ok(outcome(
            conflict,
            ResolutionState::Resolved,
            committed.clone(),
            format!("{} keeps {}", keeper, conflict.port),
        ))
    }

    /// Move `service` off `from`; `Ok(None)` when someone else already moved it
    async fn reassign(
        &self,
        working: &mut Environment,
        service: ServiceName,
        from: u16,
        options: &ResolveOptions,
    ) -> Result<Option<ActionKind>> {
        let attempts = self.scorer.config().max_attempts.max(1);
        let suggestions = self
            .scorer
            .suggest_in(working, service, attempts, &SuggestOptions::default())
            .await?;

        if suggestions.is_empty() {
            return Err(EnvPortError::ResolutionFailure(format!(
                "no free port left in {} for {}",
                working.range, service
            )));
        }

        for suggestion in &suggestions {
            let to = suggestion.port;

            // The port may have been taken since it was scored
            let recheck = self.probes.probe(to).await;
            if recheck.occupancy.bound() != Some(false) {
                debug!(%service, port = to, "Candidate no longer free");
                continue;
            }

            if !options.is_dry_run() && !self.registry.reassign(working.id, service, from, to)? {
                *working = self.registry.get_environment(working.id)?;
                return Ok(None);
            }

            working.services.insert(service, to);
            if !options.is_dry_run() {
                info!(env = %working.id, %service, from, to, "Reassigned service");
            }
            return Ok(Some(ActionKind::Reassign { service, from, to }));
        }

        Err(EnvPortError::ResolutionFailure(format!(
            "no free port for {} after {} attempts",
            service,
            suggestions.len()
        )))
    }
}
