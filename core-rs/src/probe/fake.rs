//! Deterministic prober and terminator for tests and dry rehearsals
//!
//! `FakeProber` answers from an in-memory table (ports default to free) and can
//! replay a scripted sequence per port. `FakeTerminator` records every request
//! and, when linked to a `FakeProber`, frees the ports the terminated owner held.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::errors::{EnvPortError, Result};
use crate::probe::terminate::{TerminationMode, Terminator};
use crate::probe::{Occupancy, OccupancyProber, PortOccupancy, ProcessInfo};

#[derive(Default)]
struct FakeState {
    fixed: HashMap<u16, Occupancy>,
    scripted: HashMap<u16, VecDeque<Occupancy>>,
    probes: HashMap<u16, usize>,
}

/// In-memory prober
#[derive(Default)]
pub struct FakeProber {
    state: Mutex<FakeState>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, port: u16, occupancy: Occupancy) {
        self.lock().fixed.insert(port, occupancy);
    }

    pub fn set_bound(&self, port: u16, owner: ProcessInfo) {
        self.set(port, Occupancy::Bound { owner: Some(owner) });
    }

    pub fn set_bound_anonymous(&self, port: u16) {
        self.set(port, Occupancy::Bound { owner: None });
    }

    pub fn set_unknown(&self, port: u16, reason: &str) {
        self.set(
            port,
            Occupancy::Unknown {
                reason: reason.to_string(),
            },
        );
    }

    pub fn set_free(&self, port: u16) {
        self.lock().fixed.remove(&port);
    }

    /// Answers consumed one per probe before falling back to the fixed table
    pub fn script(&self, port: u16, sequence: Vec<Occupancy>) {
        self.lock().scripted.insert(port, sequence.into());
    }

    /// Free every port held by `owner`; returns how many were released
    pub fn release_owner(&self, owner: &ProcessInfo) -> usize {
        let mut state = self.lock();
        let held: Vec<u16> = state
            .fixed
            .iter()
            .filter(|(_, occupancy)| occupancy.owner().map(|o| o.id == owner.id).unwrap_or(false))
            .map(|(port, _)| *port)
            .collect();
        for port in &held {
            state.fixed.remove(port);
        }
        held.len()
    }

    pub fn probe_count(&self, port: u16) -> usize {
        self.lock().probes.get(&port).copied().unwrap_or(0)
    }

    pub fn total_probes(&self) -> usize {
        self.lock().probes.values().sum()
    }
}

#[async_trait]
impl OccupancyProber for FakeProber {
    async fn probe(&self, port: u16) -> PortOccupancy {
        let mut state = self.lock();
        *state.probes.entry(port).or_insert(0) += 1;

        let scripted = state.scripted.get_mut(&port).and_then(|queue| queue.pop_front());
        let occupancy = scripted
            .or_else(|| state.fixed.get(&port).cloned())
            .unwrap_or(Occupancy::Free);

        PortOccupancy::new(port, occupancy)
    }
}

/// A termination request recorded by `FakeTerminator`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationCall {
    pub owner: ProcessInfo,
    pub mode: TerminationMode,
}

/// Recording terminator
#[derive(Default)]
pub struct FakeTerminator {
    calls: Mutex<Vec<TerminationCall>>,
    deny: Mutex<bool>,
    prober: Option<Arc<FakeProber>>,
}

impl FakeTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminations free the owner's ports in `prober`
    pub fn linked(prober: Arc<FakeProber>) -> Self {
        FakeTerminator {
            prober: Some(prober),
            ..Self::default()
        }
    }

    /// Make every subsequent termination fail (permission denied)
    pub fn deny_all(&self) {
        *self.deny.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }

    pub fn calls(&self) -> Vec<TerminationCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Terminator for FakeTerminator {
    async fn terminate(&self, owner: &ProcessInfo, mode: TerminationMode) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(TerminationCall {
                owner: owner.clone(),
                mode,
            });

        if *self.deny.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(EnvPortError::Termination(format!(
                "permission denied terminating {}",
                owner
            )));
        }

        if let Some(prober) = &self.prober {
            prober.release_owner(owner);
        }
        Ok(())
    }
}
