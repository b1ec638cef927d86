//! Globally reserved port ranges
//!
//! Services must not be placed on ports the operating system or well-known
//! protocols claim. The defaults can be replaced from configuration.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::registry::environment::PortRange;

/// A port range claimed by the platform or a standards body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedRange {
    pub start: u16,
    pub end: u16,
    pub description: String,
}

impl ReservedRange {
    pub fn new(start: u16, end: u16, description: &str) -> Self {
        ReservedRange {
            start,
            end,
            description: description.to_string(),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn as_range(&self) -> PortRange {
        PortRange {
            start: self.start,
            end: self.end,
        }
    }
}

static DEFAULT_RESERVED: Lazy<Vec<ReservedRange>> = Lazy::new(|| {
    vec![
        ReservedRange::new(0, 1023, "IANA well-known system ports"),
        ReservedRange::new(6000, 6063, "X Window System displays"),
        ReservedRange::new(32768, 60999, "Linux ephemeral port range"),
    ]
});

pub fn default_reserved_ranges() -> Vec<ReservedRange> {
    DEFAULT_RESERVED.clone()
}

/// First reserved range containing `port`
pub fn find_reserved<'a>(ranges: &'a [ReservedRange], port: u16) -> Option<&'a ReservedRange> {
    ranges.iter().find(|range| range.contains(port))
}
