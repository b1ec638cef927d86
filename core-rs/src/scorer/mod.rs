//! Replacement port suggestions
//!
//! Candidates are the free in-range ports nobody else is assigned. Each is
//! scored on four weighted factors (sum of default weights is 100):
//!
//! | factor       | full credit when                         |
//! |--------------|------------------------------------------|
//! | in_range     | inside the nominal range (half if exempt)|
//! | availability | probe says free (half if unknown)        |
//! | stability    | no conflicts recorded for the port       |
//! | spacing      | neither neighbour belongs to a service   |
//!
//! Ties break on the lowest port, so a fully free range always suggests its
//! lowest port first.

pub mod history;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::config::ScoringConfig;
use crate::errors::Result;
use crate::probe::{Occupancy, ProbePool};
use crate::registry::{find_reserved, Environment, EnvironmentId, PortRegistry, ServiceName};

pub use history::{ConflictHistory, NoHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoreWeights {
    pub in_range: u32,
    pub availability: u32,
    pub stability: u32,
    pub spacing: u32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            in_range: 30,
            availability: 40,
            stability: 20,
            spacing: 10,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> u32 {
        self.in_range + self.availability + self.stability + self.spacing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreFactor {
    InRange,
    Availability,
    Stability,
    Spacing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor: ScoreFactor,
    pub points: u32,
    pub max_points: u32,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub port: u16,
    pub score: u32,
    pub factors: Vec<FactorContribution>,
}

#[derive(Debug, Clone, Default)]
pub struct SuggestOptions {
    pub avoid_ports: BTreeSet<u16>,
}

pub struct SuggestionScorer {
    registry: Arc<PortRegistry>,
    probes: ProbePool,
    config: ScoringConfig,
    history: Arc<dyn ConflictHistory>,
}

impl SuggestionScorer {
    pub fn new(registry: Arc<PortRegistry>, probes: ProbePool, config: ScoringConfig) -> Self {
        SuggestionScorer {
            registry,
            probes,
            config,
            history: Arc::new(NoHistory),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn ConflictHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Up to `count` suggestions for `service` in `env`, best first
    pub async fn suggest(
        &self,
        service: ServiceName,
        env: EnvironmentId,
        count: usize,
        options: &SuggestOptions,
    ) -> Result<Vec<Suggestion>> {
        let environment = self.registry.get_environment(env)?;
        self.suggest_in(&environment, service, count, options).await
    }

    /// Score against an explicit snapshot of the environment
    ///
    /// Other environments are read from the registry.
    pub async fn suggest_in(
        &self,
        environment: &Environment,
        service: ServiceName,
        count: usize,
        options: &SuggestOptions,
    ) -> Result<Vec<Suggestion>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.candidates(environment, service, options);
        if candidates.is_empty() {
            debug!(env = %environment.id, %service, "No candidate ports left");
            return Ok(Vec::new());
        }

        let observed = self.probes.probe_many(candidates.iter().copied()).await;
        let neighbours: BTreeSet<u16> = environment
            .services
            .iter()
            .filter(|(s, _)| **s != service)
            .map(|(_, p)| *p)
            .collect();

        let mut suggestions: Vec<Suggestion> = candidates
            .into_iter()
            .filter_map(|port| {
                let occupancy = observed.get(&port).map(|o| &o.occupancy)?;
                if occupancy.bound() == Some(true) {
                    return None;
                }
                Some(self.score(environment, port, occupancy, &neighbours))
            })
            .collect();

        suggestions.sort_by(|a, b| b.score.cmp(&a.score).then(a.port.cmp(&b.port)));
        suggestions.truncate(count);

        debug!(
            env = %environment.id,
            %service,
            ports = ?suggestions.iter().map(|s| s.port).collect::<Vec<_>>(),
            "Suggestions ranked"
        );
        Ok(suggestions)
    }

    fn candidates(&self, environment: &Environment, service: ServiceName, options: &SuggestOptions) -> Vec<u16> {
        let mut taken: BTreeSet<u16> = environment.assigned_ports();
        for other in self.registry.snapshot() {
            if other.id != environment.id {
                taken.extend(other.services.values().copied());
            }
        }
        let reserved = self.registry.reserved_ranges();
        let eligible = |port: &u16| {
            !taken.contains(port) && !options.avoid_ports.contains(port) && find_reserved(reserved, *port).is_none()
        };

        let mut candidates: Vec<u16> = environment
            .range
            .ports()
            .filter(|p| eligible(p))
            .take(self.config.candidate_pool)
            .collect();

        // Exempt environments may fall back to the service's standard port
        let standard = service.internal_port();
        if environment.range_exempt && !environment.range.contains(standard) && eligible(&standard) {
            candidates.push(standard);
        }

        candidates
    }

    fn score(&self, environment: &Environment, port: u16, occupancy: &Occupancy, neighbours: &BTreeSet<u16>) -> Suggestion {
        let weights = &self.config.weights;

        let in_range = if environment.range.contains(port) {
            contribution(ScoreFactor::InRange, weights.in_range, weights.in_range, "inside nominal range")
        } else {
            contribution(ScoreFactor::InRange, weights.in_range / 2, weights.in_range, "exempt standard port")
        };

        let availability = match occupancy {
            Occupancy::Free => contribution(ScoreFactor::Availability, weights.availability, weights.availability, "free"),
            Occupancy::Bound { .. } => contribution(ScoreFactor::Availability, 0, weights.availability, "bound"),
            Occupancy::Unknown { reason } => contribution(
                ScoreFactor::Availability,
                weights.availability / 2,
                weights.availability,
                &format!("unknown: {}", reason),
            ),
        };

        let conflicts = self.history.conflict_count(environment.id, port);
        let stability = contribution(
            ScoreFactor::Stability,
            weights.stability / (1 + conflicts as u32),
            weights.stability,
            &format!("{} past conflicts", conflicts),
        );

        let adjacent = [port.checked_sub(1), port.checked_add(1)]
            .into_iter()
            .flatten()
            .any(|p| neighbours.contains(&p));
        let spacing = if adjacent {
            contribution(ScoreFactor::Spacing, 0, weights.spacing, "adjacent to an assigned port")
        } else {
            contribution(ScoreFactor::Spacing, weights.spacing, weights.spacing, "no assigned neighbours")
        };

        let factors = vec![in_range, availability, stability, spacing];
        Suggestion {
            port,
            score: factors.iter().map(|f| f.points).sum(),
            factors,
        }
    }
}

fn contribution(factor: ScoreFactor, points: u32, max_points: u32, note: &str) -> FactorContribution {
    FactorContribution {
        factor,
        points,
        max_points,
        note: note.to_string(),
    }
}
