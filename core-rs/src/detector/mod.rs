//! Conflict detection
//!
//! Joins the registry's intended layout with observed occupancy and reports
//! every way the two disagree.

pub mod conflict;
pub mod engine;
pub mod owner;

pub use conflict::{Conflict, ConflictKind, ConflictReport, ScanWarning, Severity, SeverityPolicy};
pub use engine::{ConflictDetector, DetectOptions};
pub use owner::OwnerMatcher;
