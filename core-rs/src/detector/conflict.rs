//! Conflict records produced by a detection pass

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::probe::ProcessInfo;
use crate::registry::{EnvironmentId, ReservedRange, ServiceName};

/// Ordered severity: `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One step up, saturating at critical
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    /// One step down, saturating at low
    pub fn relax(self) -> Self {
        match self {
            Severity::Critical => Severity::High,
            Severity::High => Severity::Medium,
            Severity::Medium | Severity::Low => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base severity per conflict kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeverityPolicy {
    pub in_use: Severity,
    pub reserved_range: Severity,
    pub duplicate_port: Severity,
    pub cross_environment: Severity,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        SeverityPolicy {
            in_use: Severity::High,
            reserved_range: Severity::Medium,
            duplicate_port: Severity::High,
            cross_environment: Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Bound by something the service does not recognise
    InUse { owner: Option<ProcessInfo> },
    ReservedRange { range: ReservedRange },
    /// Every service sharing the port, canonical order
    DuplicatePort { services: Vec<ServiceName> },
    CrossEnvironment {
        other_environment: EnvironmentId,
        other_service: ServiceName,
        /// The shared port was bound when detected
        live: bool,
    },
}

impl ConflictKind {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictKind::InUse { .. } => "in_use",
            ConflictKind::ReservedRange { .. } => "reserved_range",
            ConflictKind::DuplicatePort { .. } => "duplicate_port",
            ConflictKind::CrossEnvironment { .. } => "cross_environment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// None for conflicts that involve several services (duplicates)
    pub service: Option<ServiceName>,
    pub port: u16,
    #[serde(flatten)]
    pub kind: ConflictKind,
    pub detail: String,
    pub severity: Severity,
    pub auto_resolvable: bool,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} on port {}: {}", self.severity, self.kind.label(), self.port, self.detail)
    }
}

/// Non-fatal observation, e.g. a port whose occupancy could not be determined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub service: Option<ServiceName>,
    pub port: u16,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub environment: EnvironmentId,
    pub conflicts: Vec<Conflict>,
    pub warnings: Vec<ScanWarning>,
    pub checked_at: DateTime<Utc>,
}

impl ConflictReport {
    /// Safe to start: nothing left to fix
    pub fn is_safe(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Conflicts naming `service`, including duplicates it takes part in
    pub fn conflicts_for(&self, service: ServiceName) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| {
                c.service == Some(service)
                    || matches!(&c.kind, ConflictKind::DuplicatePort { services } if services.contains(&service))
            })
            .collect()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.conflicts.iter().map(|c| c.severity).max()
    }

    pub fn auto_resolvable(&self) -> Vec<Conflict> {
        self.conflicts.iter().filter(|c| c.auto_resolvable).cloned().collect()
    }
}
