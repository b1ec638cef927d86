//! # envport - environment-aware port management
//!
//! Keeps the services of several deployment environments (development,
//! staging, testing, production) on non-overlapping host ports, and tells you
//! before start-up whether the intended layout is safe.
//!
//! ## Pipeline
//!
//! ```text
//!   ┌──────────────┐   snapshot   ┌──────────────┐  conflicts  ┌──────────────┐
//!   │ PortRegistry │ ───────────▶ │   Detector   │ ──────────▶ │   Resolver   │
//!   └──────────────┘              └──────────────┘             └──────────────┘
//!          ▲                             │ probes                │  suggest
//!          │ compare-and-set             ▼                       ▼
//!          └─────────────────────  OccupancyProber ◀──────  SuggestionScorer
//!                                        ▲
//!                                        │ periodic
//!                                  ┌──────────────┐
//!                                  │ PortMonitor  │ ──▶ AlertSink
//!                                  └──────────────┘
//! ```
//!
//! The registry is an explicit value (`Arc<PortRegistry>`) handed to every
//! component; nothing in the crate is a process-wide singleton. All operating
//! system access goes through `OccupancyProber` and `Terminator`, so tests
//! swap in `FakeProber` / `FakeTerminator`.

pub mod config;
pub mod detector;
pub mod errors;
pub mod monitor;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod scorer;

pub use config::{EnvPortConfig, MonitorConfig, ProbeConfig, ScoringConfig};
pub use detector::{Conflict, ConflictDetector, ConflictKind, ConflictReport, DetectOptions, OwnerMatcher, Severity, SeverityPolicy};
pub use errors::{EnvPortError, Result};
pub use monitor::{
    targets_for_environment, Alert, AlertSeverity, AlertSink, ChannelAlertSink, HistoryWindow, MonitorEvent,
    MonitorStatistics, PortMonitor, TracingAlertSink, WatchTarget,
};
pub use probe::{
    FakeProber, FakeTerminator, HostOwnerLookup, Occupancy, OccupancyProber, OwnerLookup, PortOccupancy, ProbePool,
    ProcessInfo, SystemProber, SystemTerminator, TerminationMode, Terminator,
};
pub use registry::{Environment, EnvironmentId, Issue, IssueKind, PortRange, PortRegistry, ReservedRange, ServiceName};
pub use resolver::{ConflictResolver, ResolutionReport, ResolutionState, ResolutionStrategy, ResolveOptions};
pub use scorer::{ConflictHistory, NoHistory, ScoreWeights, SuggestOptions, Suggestion, SuggestionScorer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Internal (container-facing) port of a service; independent of environment
pub fn get_internal_port(service: ServiceName) -> u16 {
    service.internal_port()
}
