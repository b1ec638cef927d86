//! Monitor event log
//!
//! Append-only and bounded: once `limit` events are held, the oldest is
//! evicted for every new one. Statistics are computed from whatever the log
//! still retains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use crate::monitor::tracker::{PortState, WatchTarget};
use crate::probe::ProcessInfo;
use crate::registry::{EnvironmentId, ServiceName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Warning => f.write_str("warning"),
            AlertSeverity::Critical => f.write_str("critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub port: u16,
    pub environment: EnvironmentId,
    pub service: Option<ServiceName>,
    pub severity: AlertSeverity,
    pub message: String,
    pub owner: Option<ProcessInfo>,
    pub consecutive_polls: u32,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEventKind {
    CycleCompleted {
        ports_checked: usize,
        conflicted: usize,
        unknown: usize,
        /// Conflicts in the detector's report for this cycle; 0 without a detector
        #[serde(default)]
        conflicts: usize,
        elapsed_ms: u64,
    },
    StateChanged {
        target: WatchTarget,
        from: PortState,
        to: PortState,
        owner: Option<ProcessInfo>,
    },
    Alert(Alert),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: MonitorEventKind,
}

impl MonitorEvent {
    pub fn new(kind: MonitorEventKind) -> Self {
        MonitorEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn alert(&self) -> Option<&Alert> {
        match &self.kind {
            MonitorEventKind::Alert(alert) => Some(alert),
            _ => None,
        }
    }
}

/// Slice of the retained history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    All,
    /// Most recent `n` events
    Last(usize),
    /// Events at or after the timestamp
    Since(DateTime<Utc>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatistics {
    pub total_checks: u64,
    pub conflicts_detected: u64,
    pub avg_response_time_ms: f64,
    pub cycles: u64,
    pub alerts: u64,
}

#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<MonitorEvent>,
    limit: usize,
}

impl EventLog {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        EventLog {
            events: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    pub fn push(&mut self, event: MonitorEvent) {
        while self.events.len() >= self.limit {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Oldest first
    pub fn window(&self, window: HistoryWindow) -> Vec<MonitorEvent> {
        match window {
            HistoryWindow::All => self.events.iter().cloned().collect(),
            HistoryWindow::Last(n) => {
                let skip = self.events.len().saturating_sub(n);
                self.events.iter().skip(skip).cloned().collect()
            }
            HistoryWindow::Since(since) => self
                .events
                .iter()
                .filter(|e| e.timestamp >= since)
                .cloned()
                .collect(),
        }
    }

    pub fn statistics(&self) -> MonitorStatistics {
        let mut stats = MonitorStatistics::default();
        let mut elapsed_total = 0u64;

        for event in &self.events {
            match &event.kind {
                MonitorEventKind::CycleCompleted {
                    ports_checked,
                    conflicted,
                    elapsed_ms,
                    ..
                } => {
                    stats.cycles += 1;
                    stats.total_checks += *ports_checked as u64;
                    stats.conflicts_detected += *conflicted as u64;
                    elapsed_total += elapsed_ms;
                }
                MonitorEventKind::Alert(_) => stats.alerts += 1,
                MonitorEventKind::StateChanged { .. } => {}
            }
        }

        if stats.cycles > 0 {
            stats.avg_response_time_ms = elapsed_total as f64 / stats.cycles as f64;
        }
        stats
    }

    /// Alerts retained for `port` in `env`
    pub fn alert_count(&self, env: EnvironmentId, port: u16) -> usize {
        self.events
            .iter()
            .filter_map(|e| e.alert())
            .filter(|a| a.environment == env && a.port == port)
            .count()
    }
}
