/**
 * environment.rs
 * Environments, their port ranges and service tables
 *
 * Each environment owns:
 * - A nominal port range: [start, end] (inclusive)
 * - A service table: service -> external port
 * - An optional range exemption (production may pin standard ports)
 *
 * Built-in layout:
 * - development: [21000, 21999]
 * - staging:     [22000, 22999]
 * - testing:     [23000, 23999]
 * - production:  [24000, 24999] + standard ports (5432, 6379, 8080, 8500, 9090)
 *
 * Service port = range.start + service offset (api -> +1, database -> +432, ...)
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::errors::{EnvPortError, Result};
use crate::registry::service::ServiceName;

/// Deployment context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentId {
    Development,
    Staging,
    Testing,
    Production,
}

impl EnvironmentId {
    pub const ALL: [EnvironmentId; 4] = [
        EnvironmentId::Development,
        EnvironmentId::Staging,
        EnvironmentId::Testing,
        EnvironmentId::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentId::Development => "development",
            EnvironmentId::Staging => "staging",
            EnvironmentId::Testing => "testing",
            EnvironmentId::Production => "production",
        }
    }

    /// Tokens that identify this environment inside process/container names
    pub fn name_tokens(&self) -> &'static [&'static str] {
        match self {
            EnvironmentId::Development => &["development", "dev"],
            EnvironmentId::Staging => &["staging", "stage", "stg"],
            EnvironmentId::Testing => &["testing", "test"],
            EnvironmentId::Production => &["production", "prod"],
        }
    }

    /// Range start used by the built-in layout
    pub fn default_base_port(&self) -> u16 {
        match self {
            EnvironmentId::Development => 21000,
            EnvironmentId::Staging => 22000,
            EnvironmentId::Testing => 23000,
            EnvironmentId::Production => 24000,
        }
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentId {
    type Err = EnvPortError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        EnvironmentId::ALL
            .iter()
            .copied()
            .find(|id| id.name_tokens().contains(&normalized.as_str()))
            .ok_or_else(|| EnvPortError::EnvironmentNotFound(s.to_string()))
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(EnvPortError::Config(format!(
                "Invalid port range {}-{}: start must be below end",
                start, end
            )));
        }
        Ok(PortRange { start, end })
    }

    /// Check if port is within this range
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        (self.end as usize).saturating_sub(self.start as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A deployment environment with its own range and service table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: EnvironmentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub range: PortRange,
    /// Production escape valve: services may sit on fixed ports outside `range`
    #[serde(default)]
    pub range_exempt: bool,
    #[serde(default)]
    pub services: BTreeMap<ServiceName, u16>,
}

impl Environment {
    /// Built-in definition for an environment
    pub fn builtin(id: EnvironmentId) -> Self {
        let base = id.default_base_port();
        let range = PortRange {
            start: base,
            end: base + 999,
        };

        let mut services: BTreeMap<ServiceName, u16> = ServiceName::ALL
            .iter()
            .map(|service| (*service, base + service.default_offset()))
            .collect();

        let (name, description, range_exempt) = match id {
            EnvironmentId::Development => (
                "Development",
                "Local development stack with mail catcher and dashboards",
                false,
            ),
            EnvironmentId::Staging => ("Staging", "Pre-release verification stack", false),
            EnvironmentId::Testing => ("Testing", "Automated test runs and CI jobs", false),
            EnvironmentId::Production => {
                services.insert(ServiceName::Database, 5432);
                services.insert(ServiceName::Redis, 6379);
                services.insert(ServiceName::ProxyDashboard, 8080);
                services.insert(ServiceName::ServiceDiscovery, 8500);
                services.insert(ServiceName::Metrics, 9090);
                (
                    "Production",
                    "Production stack; infrastructure services keep their standard ports",
                    true,
                )
            }
        };

        Environment {
            id,
            name: name.to_string(),
            description: description.to_string(),
            range,
            range_exempt,
            services,
        }
    }

    pub fn port_of(&self, service: ServiceName) -> Option<u16> {
        self.services.get(&service).copied()
    }

    /// Service currently holding `port` (first in canonical order)
    pub fn service_on(&self, port: u16) -> Option<ServiceName> {
        self.services
            .iter()
            .find(|(_, p)| **p == port)
            .map(|(service, _)| *service)
    }

    pub fn assigned_ports(&self) -> BTreeSet<u16> {
        self.services.values().copied().collect()
    }

    /// Check a prospective assignment against the range policy
    pub fn check_range(&self, service: ServiceName, port: u16) -> Result<()> {
        if self.range_exempt || self.range.contains(port) {
            return Ok(());
        }
        Err(EnvPortError::RangeViolation {
            service: service.to_string(),
            environment: self.id.to_string(),
            port,
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Validate the environment, returning every issue found
    pub fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();

        if self.range.start >= self.range.end {
            issues.push(Issue {
                environment: self.id.to_string(),
                kind: IssueKind::InvalidRange { range: self.range },
                message: format!("Range {} is empty or inverted", self.range),
            });
        }

        if !self.range_exempt {
            for (service, port) in &self.services {
                if !self.range.contains(*port) {
                    issues.push(Issue {
                        environment: self.id.to_string(),
                        kind: IssueKind::OutOfRange {
                            service: *service,
                            port: *port,
                        },
                        message: format!(
                            "{} uses port {} outside range {}",
                            service, port, self.range
                        ),
                    });
                }
            }
        }

        for (port, members) in self.port_groups() {
            if members.len() > 1 {
                let names: Vec<&str> = members.iter().map(|s| s.as_str()).collect();
                issues.push(Issue {
                    environment: self.id.to_string(),
                    kind: IssueKind::DuplicatePort {
                        port,
                        services: members,
                    },
                    message: format!("Port {} shared by {}", port, names.join(", ")),
                });
            }
        }

        issues
    }

    /// Services grouped by assigned port, ports ascending
    pub fn port_groups(&self) -> BTreeMap<u16, Vec<ServiceName>> {
        let mut groups: BTreeMap<u16, Vec<ServiceName>> = BTreeMap::new();
        for (service, port) in &self.services {
            groups.entry(*port).or_default().push(*service);
        }
        groups
    }

    /// Order in which services can be started so dependencies come first
    ///
    /// Dependencies on services absent from this environment are ignored.
    pub fn startup_order(&self) -> Result<Vec<ServiceName>> {
        self.startup_order_with(|service| service.dependencies().to_vec())
    }

    /// Startup order under an arbitrary dependency table
    pub fn startup_order_with<F>(&self, dependencies: F) -> Result<Vec<ServiceName>>
    where
        F: Fn(ServiceName) -> Vec<ServiceName>,
    {
        let mut order = Vec::with_capacity(self.services.len());
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();

        for service in self.services.keys() {
            self.visit(*service, &dependencies, &mut visited, &mut stack, &mut order)?;
        }

        Ok(order)
    }

    fn visit<F>(
        &self,
        service: ServiceName,
        dependencies: &F,
        visited: &mut BTreeSet<ServiceName>,
        stack: &mut Vec<ServiceName>,
        order: &mut Vec<ServiceName>,
    ) -> Result<()>
    where
        F: Fn(ServiceName) -> Vec<ServiceName>,
    {
        if visited.contains(&service) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|s| *s == service) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(service.to_string());
            return Err(EnvPortError::CircularDependency(cycle));
        }

        stack.push(service);
        for dependency in dependencies(service) {
            if self.services.contains_key(&dependency) {
                self.visit(dependency, dependencies, visited, stack, order)?;
            }
        }
        stack.pop();

        visited.insert(service);
        order.push(service);
        Ok(())
    }
}

/// A validation finding; issues are data, never errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub environment: String,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssueKind {
    InvalidRange { range: PortRange },
    OutOfRange { service: ServiceName, port: u16 },
    DuplicatePort { port: u16, services: Vec<ServiceName> },
    OverlappingRange { other: EnvironmentId },
    UnknownEnvironment,
}
