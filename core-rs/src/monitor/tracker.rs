//! Debounced per-port state machine
//!
//! `Unknown -> Free <-> Occupied`. A flip needs `debounce_polls` consecutive
//! agreeing observations; unknown probe results neither confirm nor flip.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::MonitorConfig;
use crate::monitor::events::AlertSeverity;
use crate::probe::{Occupancy, ProcessInfo};
use crate::registry::{EnvironmentId, ServiceName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    #[default]
    Unknown,
    Free,
    Occupied,
}

/// A port the monitor watches on behalf of one service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchTarget {
    pub environment: EnvironmentId,
    pub service: ServiceName,
    pub port: u16,
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.environment, self.service, self.port)
    }
}

/// What one observation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub changed: Option<(PortState, PortState)>,
    pub alert: Option<AlertSeverity>,
    /// Occupied by an owner the service does not recognise
    pub conflicted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PortTracker {
    state: PortState,
    pending: Option<PortState>,
    pending_polls: u32,
    owner: Option<ProcessInfo>,
    conflicted_polls: u32,
    /// Current episode started from Unknown rather than a confirmed Free
    first_seen_occupied: bool,
    warned: bool,
    escalated: bool,
}

impl PortTracker {
    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn owner(&self) -> Option<&ProcessInfo> {
        self.owner.as_ref()
    }

    pub fn conflicted_polls(&self) -> u32 {
        self.conflicted_polls
    }

    pub fn observe(&mut self, occupancy: &Occupancy, recognised: bool, config: &MonitorConfig) -> Observation {
        let observed = match occupancy.bound() {
            Some(true) => PortState::Occupied,
            Some(false) => PortState::Free,
            None => return Observation::default(),
        };

        let conflicted = observed == PortState::Occupied && !recognised;
        if observed == PortState::Occupied {
            self.owner = occupancy.owner().cloned();
        }
        if conflicted {
            self.conflicted_polls += 1;
        } else {
            self.conflicted_polls = 0;
        }

        let changed = self.advance(observed, config.debounce_polls.max(1));

        let mut alert = None;
        if self.state == PortState::Occupied && conflicted {
            if !self.escalated && self.conflicted_polls >= config.escalate_after {
                self.escalated = true;
                self.warned = true;
                alert = Some(AlertSeverity::Critical);
            } else if !self.warned
                && (!self.first_seen_occupied || self.conflicted_polls >= config.grace_polls)
            {
                self.warned = true;
                alert = Some(AlertSeverity::Warning);
            }
        }

        Observation {
            changed,
            alert,
            conflicted,
        }
    }

    fn advance(&mut self, observed: PortState, debounce: u32) -> Option<(PortState, PortState)> {
        if observed == self.state {
            self.pending = None;
            self.pending_polls = 0;
            return None;
        }

        if self.pending == Some(observed) {
            self.pending_polls += 1;
        } else {
            self.pending = Some(observed);
            self.pending_polls = 1;
        }
        if self.pending_polls < debounce {
            return None;
        }

        let from = self.state;
        self.state = observed;
        self.pending = None;
        self.pending_polls = 0;

        match observed {
            PortState::Free => {
                // Episode over
                self.owner = None;
                self.warned = false;
                self.escalated = false;
                self.first_seen_occupied = false;
            }
            PortState::Occupied => self.first_seen_occupied = from == PortState::Unknown,
            PortState::Unknown => {}
        }

        Some((from, observed))
    }
}
