//! Detection pass over one environment

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EnvPortConfig;
use crate::detector::conflict::{Conflict, ConflictKind, ConflictReport, ScanWarning, Severity, SeverityPolicy};
use crate::detector::owner::OwnerMatcher;
use crate::errors::Result;
use crate::probe::{Occupancy, OccupancyProber, PortOccupancy, ProbePool};
use crate::registry::{find_reserved, Environment, EnvironmentId, PortRegistry, ReservedRange};

/// Which optional checks a pass runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectOptions {
    pub include_cross_env: bool,
    pub include_reserved: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        DetectOptions {
            include_cross_env: true,
            include_reserved: true,
        }
    }
}

pub struct ConflictDetector {
    registry: Arc<PortRegistry>,
    probes: ProbePool,
    matcher: OwnerMatcher,
    severity: SeverityPolicy,
}

impl ConflictDetector {
    pub fn new(registry: Arc<PortRegistry>, probes: ProbePool) -> Self {
        ConflictDetector {
            registry,
            probes,
            matcher: OwnerMatcher::default(),
            severity: SeverityPolicy::default(),
        }
    }

    /// Detector wired with the configured allow-list, severities and probe limits
    pub fn from_config(
        registry: Arc<PortRegistry>,
        prober: Arc<dyn OccupancyProber>,
        config: &EnvPortConfig,
    ) -> Result<Self> {
        let matcher = OwnerMatcher::new(&config.spec.allow_list)?;
        Ok(Self::new(registry, ProbePool::new(prober, config.spec.probe.concurrency))
            .with_matcher(matcher)
            .with_severity(config.spec.severity))
    }

    pub fn with_matcher(mut self, matcher: OwnerMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_severity(mut self, severity: SeverityPolicy) -> Self {
        self.severity = severity;
        self
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn probes(&self) -> &ProbePool {
        &self.probes
    }

    pub fn matcher(&self) -> &OwnerMatcher {
        &self.matcher
    }

    /// Scan `env` for conflicts
    ///
    /// Order is stable across runs over identical state: services in canonical
    /// order, then reserved ranges, then duplicates by port, then cross-environment.
    pub async fn detect(&self, env: EnvironmentId, options: DetectOptions) -> Result<ConflictReport> {
        let environment = self.registry.get_environment(env)?;
        let occupancy = self
            .probes
            .probe_many(environment.services.values().copied())
            .await;
        self.assess(env, &occupancy, options)
    }

    /// Classify occupancy observed elsewhere against the registry as it is now
    ///
    /// Service ports missing from `occupancy` count as not observed: no in-use
    /// conflict and never live for cross-environment severity.
    pub fn assess(
        &self,
        env: EnvironmentId,
        occupancy: &BTreeMap<u16, PortOccupancy>,
        options: DetectOptions,
    ) -> Result<ConflictReport> {
        let environment = self.registry.get_environment(env)?;
        let others: Vec<Environment> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|e| e.id != env)
            .collect();
        let reserved = self.registry.reserved_ranges();

        let spare = has_spare_port(&environment, &others, reserved);
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();

        for (service, port) in &environment.services {
            let Some(observed) = occupancy.get(port) else {
                continue;
            };
            match &observed.occupancy {
                Occupancy::Free => {}
                Occupancy::Bound { owner } => {
                    if self.matcher.recognises(*service, env, owner.as_ref()) {
                        continue;
                    }
                    let (detail, severity) = match owner {
                        Some(owner) => (
                            format!("{} is bound by {}", port, owner),
                            self.severity.in_use,
                        ),
                        None => (
                            format!("{} is bound by an unidentified owner", port),
                            self.severity.in_use.relax(),
                        ),
                    };
                    conflicts.push(Conflict {
                        service: Some(*service),
                        port: *port,
                        kind: ConflictKind::InUse { owner: owner.clone() },
                        detail,
                        severity,
                        auto_resolvable: spare,
                    });
                }
                Occupancy::Unknown { reason } => {
                    warn!(%env, %service, port, %reason, "Occupancy unknown");
                    warnings.push(ScanWarning {
                        service: Some(*service),
                        port: *port,
                        message: format!("occupancy of {} could not be determined: {}", port, reason),
                        severity: Severity::Low,
                    });
                }
            }
        }

        if options.include_reserved {
            for (service, port) in &environment.services {
                if let Some(range) = find_reserved(reserved, *port) {
                    conflicts.push(Conflict {
                        service: Some(*service),
                        port: *port,
                        kind: ConflictKind::ReservedRange { range: range.clone() },
                        detail: format!(
                            "{} lies in reserved range {}-{} ({})",
                            port, range.start, range.end, range.description
                        ),
                        severity: self.severity.reserved_range,
                        auto_resolvable: false,
                    });
                }
            }
        }

        for (port, services) in environment.port_groups() {
            if services.len() < 2 {
                continue;
            }
            let names: Vec<&str> = services.iter().map(|s| s.as_str()).collect();
            conflicts.push(Conflict {
                service: None,
                port,
                detail: format!("{} is assigned to {}", port, names.join(", ")),
                kind: ConflictKind::DuplicatePort { services },
                severity: self.severity.duplicate_port,
                auto_resolvable: spare,
            });
        }

        if options.include_cross_env {
            for (service, port) in &environment.services {
                for other in &others {
                    let Some(other_service) = other.service_on(*port) else {
                        continue;
                    };
                    let live = occupancy
                        .get(port)
                        .and_then(|o| o.occupancy.bound())
                        .unwrap_or(false);
                    let severity = if live {
                        self.severity.cross_environment.escalate()
                    } else {
                        self.severity.cross_environment
                    };
                    conflicts.push(Conflict {
                        service: Some(*service),
                        port: *port,
                        kind: ConflictKind::CrossEnvironment {
                            other_environment: other.id,
                            other_service,
                            live,
                        },
                        detail: format!(
                            "{} is also assigned to {} in {}{}",
                            port,
                            other_service,
                            other.id,
                            if live { " and currently bound" } else { "" }
                        ),
                        severity,
                        auto_resolvable: false,
                    });
                }
            }
        }

        debug!(%env, conflicts = conflicts.len(), warnings = warnings.len(), "Detection pass complete");

        Ok(ConflictReport {
            environment: env,
            conflicts,
            warnings,
            checked_at: Utc::now(),
        })
    }
}

/// At least one in-range port is unassigned everywhere and not reserved
fn has_spare_port(environment: &Environment, others: &[Environment], reserved: &[ReservedRange]) -> bool {
    let taken: BTreeSet<u16> = environment
        .services
        .values()
        .chain(others.iter().flat_map(|e| e.services.values()))
        .copied()
        .collect();

    environment
        .range
        .ports()
        .any(|port| !taken.contains(&port) && find_reserved(reserved, port).is_none())
}
