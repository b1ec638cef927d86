//! Real occupancy probing against the local host
//!
//! Occupancy is decided by attempting a bind on 127.0.0.1, the same check the
//! port allocator has always used. Ownership is best effort: `docker ps` for
//! published container ports, then `lsof` for listening processes. A missing
//! tool only costs attribution, never the occupancy answer.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ProbeConfig;
use crate::probe::{Occupancy, OccupancyProber, PortOccupancy, ProcessInfo};

enum BindOutcome {
    Free,
    InUse,
    Denied,
    Failed(String),
}

/// Finds who holds a bound port
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn owner_of(&self, port: u16) -> Option<ProcessInfo>;
}

/// `docker ps` for published container ports, then `lsof` for listeners
///
/// Unbounded on its own; `SystemProber` runs it under the probe deadline and
/// child processes are killed when the lookup is abandoned.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostOwnerLookup;

impl HostOwnerLookup {
    async fn run(program: &str, args: &[String]) -> Option<String> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn container_owner(port: u16) -> Option<ProcessInfo> {
        let args = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("publish={}", port),
            "--format".to_string(),
            "{{.ID}}\t{{.Names}}".to_string(),
        ];
        let stdout = Self::run("docker", &args).await?;
        parse_docker_line(&stdout)
    }

    async fn process_owner(port: u16) -> Option<ProcessInfo> {
        let args = vec![
            "-nP".to_string(),
            format!("-iTCP:{}", port),
            "-sTCP:LISTEN".to_string(),
            "-t".to_string(),
        ];
        let stdout = Self::run("lsof", &args).await?;
        let pid = parse_first_pid(&stdout)?;

        let name = tokio::task::spawn_blocking(move || process_name(pid))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| format!("pid-{}", pid));

        Some(ProcessInfo::process(pid, &name))
    }
}

#[async_trait]
impl OwnerLookup for HostOwnerLookup {
    async fn owner_of(&self, port: u16) -> Option<ProcessInfo> {
        if let Some(owner) = Self::container_owner(port).await {
            return Some(owner);
        }
        Self::process_owner(port).await
    }
}

/// Bind test plus owner attribution, all inside one timeout per probe
pub struct SystemProber {
    timeout: Duration,
    owners: Option<Arc<dyn OwnerLookup>>,
}

impl Default for SystemProber {
    fn default() -> Self {
        Self::new(&ProbeConfig::default())
    }
}

impl SystemProber {
    pub fn new(config: &ProbeConfig) -> Self {
        SystemProber {
            timeout: config.timeout(),
            owners: Some(Arc::new(HostOwnerLookup)),
        }
    }

    /// Skip owner lookup; bound ports report `owner: None`
    pub fn without_attribution(mut self) -> Self {
        self.owners = None;
        self
    }

    pub fn with_owner_lookup(mut self, owners: Arc<dyn OwnerLookup>) -> Self {
        self.owners = Some(owners);
        self
    }

    fn try_bind(port: u16) -> BindOutcome {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(_) => BindOutcome::Free,
            Err(e) if e.kind() == ErrorKind::AddrInUse => BindOutcome::InUse,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => BindOutcome::Denied,
            Err(e) => BindOutcome::Failed(e.to_string()),
        }
    }

    /// Owner lookup with whatever is left of the probe's budget
    async fn attribute(&self, port: u16, deadline: Instant) -> Option<ProcessInfo> {
        let owners = self.owners.as_ref()?;
        match tokio::time::timeout_at(deadline, owners.owner_of(port)).await {
            Ok(owner) => owner,
            Err(_) => {
                debug!(port, "Owner lookup ran out of time");
                None
            }
        }
    }
}

fn process_name(pid: u32) -> Option<String> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All);
    sys.process(Pid::from_u32(pid))
        .map(|p| p.name().to_string_lossy().to_string())
}

fn parse_docker_line(stdout: &str) -> Option<ProcessInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut parts = line.trim().splitn(2, '\t');
    let id = parts.next()?.trim();
    let name = parts.next().map(str::trim).unwrap_or(id);
    if id.is_empty() {
        return None;
    }
    Some(ProcessInfo::container(id, name))
}

fn parse_first_pid(stdout: &str) -> Option<u32> {
    stdout.lines().find_map(|l| l.trim().parse::<u32>().ok())
}

#[async_trait]
impl OccupancyProber for SystemProber {
    async fn probe(&self, port: u16) -> PortOccupancy {
        let deadline = Instant::now() + self.timeout;
        let bind = tokio::time::timeout_at(
            deadline,
            tokio::task::spawn_blocking(move || Self::try_bind(port)),
        )
        .await;

        let outcome = match bind {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => BindOutcome::Failed(format!("probe task failed: {}", e)),
            Err(_) => {
                debug!(port, timeout_ms = self.timeout.as_millis() as u64, "Probe timed out");
                return PortOccupancy::unknown(port, "probe timed out");
            }
        };

        match outcome {
            BindOutcome::Free => PortOccupancy::free(port),
            BindOutcome::InUse => {
                let owner = self.attribute(port, deadline).await;
                debug!(port, owner = ?owner, "Port bound");
                PortOccupancy::bound(port, owner)
            }
            // Privileged ports refuse the bind either way; only a listener proves use
            BindOutcome::Denied => match self.attribute(port, deadline).await {
                Some(owner) => PortOccupancy::bound(port, Some(owner)),
                None => PortOccupancy::new(
                    port,
                    Occupancy::Unknown {
                        reason: "permission denied".to_string(),
                    },
                ),
            },
            BindOutcome::Failed(reason) => {
                debug!(port, %reason, "Probe failed");
                PortOccupancy::unknown(port, reason)
            }
        }
    }
}
