//! Process and container termination
//!
//! Destructive by nature; the resolver only calls a `Terminator` when the
//! caller explicitly authorised it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::{EnvPortError, Result};
use crate::probe::{OwnerKind, ProcessInfo};

/// How hard to ask the owner to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationMode {
    /// SIGTERM / `docker stop`
    #[default]
    Graceful,
    /// SIGKILL / `docker kill`
    Forced,
}

#[async_trait]
pub trait Terminator: Send + Sync {
    async fn terminate(&self, owner: &ProcessInfo, mode: TerminationMode) -> Result<()>;
}

/// Terminates real processes (signals) and containers (docker CLI)
pub struct SystemTerminator {
    timeout: Duration,
}

impl Default for SystemTerminator {
    fn default() -> Self {
        SystemTerminator {
            timeout: Duration::from_secs(15),
        }
    }
}

impl SystemTerminator {
    pub fn new(timeout: Duration) -> Self {
        SystemTerminator { timeout }
    }

    async fn stop_container(&self, id: &str, mode: TerminationMode) -> Result<()> {
        let verb = match mode {
            TerminationMode::Graceful => "stop",
            TerminationMode::Forced => "kill",
        };

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("docker").arg(verb).arg(id).output(),
        )
        .await
        .map_err(|_| {
            EnvPortError::Termination(format!(
                "docker {} {} timed out after {:?}",
                verb, id, self.timeout
            ))
        })?
        .map_err(|e| EnvPortError::Termination(format!("Failed to run docker: {}", e)))?;

        if !output.status.success() {
            return Err(EnvPortError::Termination(format!(
                "docker {} {} failed: {}",
                verb,
                id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn signal_process(&self, pid: u32, mode: TerminationMode) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let signal = match mode {
            TerminationMode::Graceful => Signal::SIGTERM,
            TerminationMode::Forced => Signal::SIGKILL,
        };

        let target = signal_target(pid)?;
        kill(Pid::from_raw(target), signal).map_err(|e| {
            EnvPortError::Termination(format!("Failed to send {:?} to {}: {}", signal, pid, e))
        })
    }

    #[cfg(not(unix))]
    fn signal_process(&self, pid: u32, _mode: TerminationMode) -> Result<()> {
        Err(EnvPortError::Termination(format!(
            "Signalling pid {} is not supported on this platform",
            pid
        )))
    }
}

/// Raw pid for `kill(2)`
///
/// 0 addresses the caller's process group and values past `i32::MAX` wrap to
/// negative group or broadcast targets, so both are refused.
#[cfg_attr(not(unix), allow(dead_code))]
fn signal_target(pid: u32) -> Result<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(EnvPortError::Termination(format!(
            "Refusing to signal pid {}: not a single process",
            pid
        ))),
    }
}

#[async_trait]
impl Terminator for SystemTerminator {
    async fn terminate(&self, owner: &ProcessInfo, mode: TerminationMode) -> Result<()> {
        info!(%owner, ?mode, "Terminating port owner");

        let result = match owner.kind {
            OwnerKind::Container => self.stop_container(&owner.id, mode).await,
            OwnerKind::Process => match owner.pid {
                Some(pid) => self.signal_process(pid, mode),
                None => Err(EnvPortError::Termination(format!(
                    "{} has no pid to signal",
                    owner
                ))),
            },
        };

        if let Err(e) = &result {
            warn!(%owner, error = %e, "Termination failed");
        }
        result
    }
}
