//! Port registry - the single owner of environment data
//!
//! Readers get cloned snapshots; writers go through one `RwLock` write guard so
//! a detection pass never observes a half-applied reassignment. When the
//! registry was loaded from a file, every successful write is persisted back.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::config::EnvPortConfig;
use crate::errors::{EnvPortError, Result};
use crate::registry::environment::{Environment, EnvironmentId, Issue, IssueKind};
use crate::registry::reserved::ReservedRange;
use crate::registry::service::ServiceName;

struct RegistryState {
    /// Declaration order is preserved
    environments: Vec<Environment>,
    revision: u64,
}

/// Registry of environments, ranges and service ports
pub struct PortRegistry {
    state: RwLock<RegistryState>,
    reserved: Vec<ReservedRange>,
    /// Source document for write-back (None for in-memory registries)
    source: Option<(PathBuf, EnvPortConfig)>,
}

impl PortRegistry {
    /// Build a registry from already-parsed environments
    pub fn new(environments: Vec<Environment>, reserved: Vec<ReservedRange>) -> Result<Self> {
        let mut seen = Vec::with_capacity(environments.len());
        for environment in &environments {
            if seen.contains(&environment.id) {
                return Err(EnvPortError::Config(format!(
                    "Environment '{}' declared more than once",
                    environment.id
                )));
            }
            if environment.range.start >= environment.range.end {
                return Err(EnvPortError::Config(format!(
                    "Environment '{}' has invalid range {}",
                    environment.id, environment.range
                )));
            }
            seen.push(environment.id);
        }

        Ok(PortRegistry {
            state: RwLock::new(RegistryState {
                environments,
                revision: 0,
            }),
            reserved,
            source: None,
        })
    }

    /// Registry over the parsed configuration (no write-back)
    pub fn from_config(config: &EnvPortConfig) -> Result<Self> {
        Self::new(
            config.spec.environments.clone(),
            config.spec.reserved_ranges.clone(),
        )
    }

    /// Registry loaded from a file; reassignments are written back to it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = EnvPortConfig::load(&path)?;
        let mut registry = Self::from_config(&config)?;
        debug!(path = %path.display(), "Loaded port registry");
        registry.source = Some((path, config));
        Ok(registry)
    }

    /// Built-in four-environment layout
    pub fn with_defaults() -> Self {
        let config = EnvPortConfig::default();
        PortRegistry {
            state: RwLock::new(RegistryState {
                environments: config.spec.environments,
                revision: 0,
            }),
            reserved: config.spec.reserved_ranges,
            source: None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        // A poisoned lock still holds consistent data: writers validate before mutating
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of one environment
    pub fn get_environment(&self, id: EnvironmentId) -> Result<Environment> {
        self.read()
            .environments
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| EnvPortError::EnvironmentNotFound(id.to_string()))
    }

    /// Snapshot of every environment, declaration order
    pub fn snapshot(&self) -> Vec<Environment> {
        self.read().environments.clone()
    }

    pub fn list_environments(&self) -> Vec<EnvironmentId> {
        self.read().environments.iter().map(|e| e.id).collect()
    }

    pub fn reserved_ranges(&self) -> &[ReservedRange] {
        &self.reserved
    }

    /// Monotonic counter bumped on every committed write
    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    pub fn get_service_port(&self, service: ServiceName, env: EnvironmentId) -> Result<u16> {
        let state = self.read();
        let environment = state
            .environments
            .iter()
            .find(|e| e.id == env)
            .ok_or_else(|| EnvPortError::EnvironmentNotFound(env.to_string()))?;

        environment
            .port_of(service)
            .ok_or_else(|| EnvPortError::ServiceNotFound {
                service: service.to_string(),
                environment: env.to_string(),
            })
    }

    /// Assign `port` to `service`, enforcing the range policy
    ///
    /// Adds the service to the environment if it was not present.
    pub fn set_service_port(&self, service: ServiceName, env: EnvironmentId, port: u16) -> Result<()> {
        let mut state = self.write();
        let mut staged = state.environments.clone();
        let environment = find_mut(&mut staged, env)?;

        check_assignment(environment, service, port)?;
        let previous = environment.services.insert(service, port);
        self.commit(&mut state, staged)?;

        info!(%env, %service, ?previous, port, "Service port assigned");
        Ok(())
    }

    /// Compare-and-set reassignment
    ///
    /// Returns `Ok(false)` without writing when `service` no longer holds
    /// `expected`; that reassignment was already applied elsewhere.
    pub fn reassign(
        &self,
        env: EnvironmentId,
        service: ServiceName,
        expected: u16,
        new_port: u16,
    ) -> Result<bool> {
        let mut state = self.write();
        let mut staged = state.environments.clone();
        let environment = find_mut(&mut staged, env)?;

        match environment.port_of(service) {
            Some(current) if current == expected => {}
            Some(current) => {
                debug!(%env, %service, expected, current, "Skipping stale reassignment");
                return Ok(false);
            }
            None => {
                return Err(EnvPortError::ServiceNotFound {
                    service: service.to_string(),
                    environment: env.to_string(),
                })
            }
        }

        check_assignment(environment, service, new_port)?;
        environment.services.insert(service, new_port);
        self.commit(&mut state, staged)?;

        info!(%env, %service, from = expected, to = new_port, "Service reassigned");
        Ok(true)
    }

    /// Validate one environment; an unknown id is reported as an issue, not an error
    pub fn validate(&self, env: EnvironmentId) -> Vec<Issue> {
        match self.get_environment(env) {
            Ok(environment) => environment.validate(),
            Err(_) => vec![Issue {
                environment: env.to_string(),
                kind: IssueKind::UnknownEnvironment,
                message: format!("Environment '{}' is not declared", env),
            }],
        }
    }

    /// Validate every environment plus pairwise range overlap
    pub fn validate_all(&self) -> Vec<Issue> {
        let environments = self.snapshot();
        let mut issues: Vec<Issue> = environments.iter().flat_map(|e| e.validate()).collect();

        for (i, a) in environments.iter().enumerate() {
            for b in environments.iter().skip(i + 1) {
                if a.range.overlaps(&b.range) {
                    issues.push(Issue {
                        environment: a.id.to_string(),
                        kind: IssueKind::OverlappingRange { other: b.id },
                        message: format!(
                            "Range {} of {} overlaps range {} of {}",
                            a.range, a.id, b.range, b.id
                        ),
                    });
                }
            }
        }

        issues
    }

    /// Write `staged` back to the source file, then swap it in
    ///
    /// State and revision only change once the write succeeded, so a failed
    /// write-back leaves memory and file in agreement.
    fn commit(&self, state: &mut RegistryState, staged: Vec<Environment>) -> Result<()> {
        let revision = state.revision + 1;
        if let Some((path, base)) = &self.source {
            let mut document = base.clone();
            document.spec.environments = staged.clone();
            document.save(path)?;
            debug!(path = %path.display(), revision, "Registry written back");
        }
        state.environments = staged;
        state.revision = revision;
        Ok(())
    }
}

fn find_mut(environments: &mut [Environment], env: EnvironmentId) -> Result<&mut Environment> {
    environments
        .iter_mut()
        .find(|e| e.id == env)
        .ok_or_else(|| EnvPortError::EnvironmentNotFound(env.to_string()))
}

fn check_assignment(environment: &Environment, service: ServiceName, port: u16) -> Result<()> {
    environment.check_range(service, port)?;

    if let Some(holder) = environment
        .services
        .iter()
        .find(|(s, p)| **s != service && **p == port)
        .map(|(s, _)| *s)
    {
        return Err(EnvPortError::Validation(format!(
            "Port {} is already assigned to {} in {}",
            port, holder, environment.id
        )));
    }

    Ok(())
}
