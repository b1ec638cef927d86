//! Continuous port monitoring
//!
//! Debounced occupancy tracking per watched port, a bounded event log with
//! derived statistics, and pluggable alert sinks.

pub mod alerts;
pub mod events;
pub mod service;
pub mod tracker;

pub use alerts::{AlertSink, ChannelAlertSink, TracingAlertSink};
pub use events::{Alert, AlertSeverity, EventLog, HistoryWindow, MonitorEvent, MonitorEventKind, MonitorStatistics};
pub use service::{targets_for_environment, PortMonitor};
pub use tracker::{Observation, PortState, PortTracker, WatchTarget};
