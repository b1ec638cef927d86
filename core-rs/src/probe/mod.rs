//! Occupancy probing
//!
//! The only boundary through which the core observes the operating system.
//! Probes are best effort and point-in-time: failures and timeouts become
//! `Occupancy::Unknown` instead of errors, so one flaky port never aborts a scan.

pub mod fake;
pub mod system;
pub mod terminate;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

pub use fake::{FakeProber, FakeTerminator};
pub use system::{HostOwnerLookup, OwnerLookup, SystemProber};
pub use terminate::{SystemTerminator, TerminationMode, Terminator};

/// Whether the owner is a plain process or a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Process,
    Container,
}

/// Who holds a bound port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Host PID; containers may not expose one
    pub pid: Option<u32>,
    pub name: String,
    pub kind: OwnerKind,
    /// Container id for containers, the PID as text for processes
    pub id: String,
}

impl ProcessInfo {
    pub fn process(pid: u32, name: &str) -> Self {
        ProcessInfo {
            pid: Some(pid),
            name: name.to_string(),
            kind: OwnerKind::Process,
            id: pid.to_string(),
        }
    }

    pub fn container(id: &str, name: &str) -> Self {
        ProcessInfo {
            pid: None,
            name: name.to_string(),
            kind: OwnerKind::Container,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OwnerKind::Process => write!(f, "process {} (pid {})", self.name, self.id),
            OwnerKind::Container => write!(f, "container {} ({})", self.name, self.id),
        }
    }
}

/// Observed state of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Occupancy {
    Free,
    Bound { owner: Option<ProcessInfo> },
    Unknown { reason: String },
}

impl Occupancy {
    /// `Some(true)` when bound, `Some(false)` when free, `None` when unknown
    pub fn bound(&self) -> Option<bool> {
        match self {
            Occupancy::Free => Some(false),
            Occupancy::Bound { .. } => Some(true),
            Occupancy::Unknown { .. } => None,
        }
    }

    pub fn owner(&self) -> Option<&ProcessInfo> {
        match self {
            Occupancy::Bound { owner } => owner.as_ref(),
            _ => None,
        }
    }
}

/// Snapshot of a single port at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortOccupancy {
    pub port: u16,
    pub occupancy: Occupancy,
    pub checked_at: DateTime<Utc>,
}

impl PortOccupancy {
    pub fn new(port: u16, occupancy: Occupancy) -> Self {
        PortOccupancy {
            port,
            occupancy,
            checked_at: Utc::now(),
        }
    }

    pub fn free(port: u16) -> Self {
        Self::new(port, Occupancy::Free)
    }

    pub fn bound(port: u16, owner: Option<ProcessInfo>) -> Self {
        Self::new(port, Occupancy::Bound { owner })
    }

    pub fn unknown(port: u16, reason: impl Into<String>) -> Self {
        Self::new(port, Occupancy::Unknown { reason: reason.into() })
    }
}

/// Asks the operating system whether a port is bound, and by whom
///
/// Implementations must return within a short bounded time and must never
/// fail the caller: errors map to `Occupancy::Unknown`.
#[async_trait]
pub trait OccupancyProber: Send + Sync {
    async fn probe(&self, port: u16) -> PortOccupancy;
}

/// Concurrent probing with a bounded number of in-flight probes
#[derive(Clone)]
pub struct ProbePool {
    prober: Arc<dyn OccupancyProber>,
    concurrency: usize,
}

impl ProbePool {
    pub fn new(prober: Arc<dyn OccupancyProber>, concurrency: usize) -> Self {
        ProbePool {
            prober,
            concurrency: concurrency.clamp(1, Semaphore::MAX_PERMITS),
        }
    }

    pub fn prober(&self) -> &Arc<dyn OccupancyProber> {
        &self.prober
    }

    pub async fn probe(&self, port: u16) -> PortOccupancy {
        self.prober.probe(port).await
    }

    /// Probe every distinct port; returns once all have answered or timed out
    pub async fn probe_many<I>(&self, ports: I) -> BTreeMap<u16, PortOccupancy>
    where
        I: IntoIterator<Item = u16>,
    {
        let unique: BTreeSet<u16> = ports.into_iter().collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for port in unique.iter().copied() {
            let prober = Arc::clone(&self.prober);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                prober.probe(port).await
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(occupancy) => {
                    results.insert(occupancy.port, occupancy);
                }
                Err(e) => warn!(error = %e, "Probe task failed"),
            }
        }

        // A panicked probe task still yields an answer for its port
        for port in unique {
            results
                .entry(port)
                .or_insert_with(|| PortOccupancy::unknown(port, "probe task aborted"));
        }

        results
    }
}
