/**
 * registry module
 * Environment port ranges, service tables and reserved ranges
 */

pub mod environment;
pub mod reserved;
pub mod service;
pub mod store;

pub use environment::{Environment, EnvironmentId, Issue, IssueKind, PortRange};
pub use reserved::{default_reserved_ranges, find_reserved, ReservedRange};
pub use service::ServiceName;
pub use store::PortRegistry;
