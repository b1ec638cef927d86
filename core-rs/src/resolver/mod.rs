//! Conflict resolution
//!
//! Turns detected conflicts into reassignments (or, when explicitly
//! authorised, terminations) and reports what happened to each one.

pub mod engine;
pub mod outcome;

pub use engine::ConflictResolver;
pub use outcome::{
    ActionKind, ConflictOutcome, ResolutionReport, ResolutionState, ResolutionStrategy, ResolveOptions,
};
