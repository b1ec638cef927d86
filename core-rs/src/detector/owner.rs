//! Owner recognition
//!
//! A bound port is expected when its owner looks like the service assigned to
//! it: the owner name matches one of the service's allow-list patterns and does
//! not carry a token naming a different environment (`staging-postgres` on a
//! development port is someone else's database).

use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

use crate::errors::Result;
use crate::probe::ProcessInfo;
use crate::registry::{EnvironmentId, ServiceName};

#[derive(Debug, Clone)]
pub struct OwnerMatcher {
    patterns: BTreeMap<ServiceName, Vec<Regex>>,
}

impl Default for OwnerMatcher {
    fn default() -> Self {
        // Built-in patterns are plain words; compiling them cannot fail
        let patterns = ServiceName::ALL
            .iter()
            .map(|service| {
                let compiled = service
                    .default_owner_patterns()
                    .iter()
                    .filter_map(|p| compile(p).ok())
                    .collect();
                (*service, compiled)
            })
            .collect();
        OwnerMatcher { patterns }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("(?i){}", pattern))?)
}

impl OwnerMatcher {
    /// Built-in patterns, with the services named in `allow_list` replaced
    pub fn new(allow_list: &BTreeMap<ServiceName, Vec<String>>) -> Result<Self> {
        let mut matcher = Self::default();
        for (service, patterns) in allow_list {
            let compiled = patterns
                .iter()
                .map(|p| compile(p))
                .collect::<Result<Vec<_>>>()?;
            matcher.patterns.insert(*service, compiled);
        }
        Ok(matcher)
    }

    /// Whether `owner` is the expected occupant of `service`'s port in `env`
    pub fn recognises(&self, service: ServiceName, env: EnvironmentId, owner: Option<&ProcessInfo>) -> bool {
        let Some(owner) = owner else {
            return false;
        };

        let matches_service = self
            .patterns
            .get(&service)
            .map(|patterns| patterns.iter().any(|p| p.is_match(&owner.name)))
            .unwrap_or(false);
        if !matches_service {
            debug!(%service, owner = %owner.name, "Owner does not match allow-list");
            return false;
        }

        if let Some(foreign) = foreign_environment(&owner.name, env) {
            debug!(%service, owner = %owner.name, %foreign, "Owner belongs to another environment");
            return false;
        }

        true
    }
}

/// Another environment named by a token of `name`, if any
fn foreign_environment(name: &str, env: EnvironmentId) -> Option<EnvironmentId> {
    let lowered = name.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    EnvironmentId::ALL
        .iter()
        .copied()
        .filter(|other| *other != env)
        .find(|other| other.name_tokens().iter().any(|t| tokens.contains(t)))
}
