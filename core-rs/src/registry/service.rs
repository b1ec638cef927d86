//! Logical services managed by the registry
//!
//! The set is closed: every environment maps some subset of these services to
//! an external (host-facing) port. The internal (container-facing) port is a
//! fixed property of the service and never changes per environment.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::EnvPortError;

/// A logical service requiring one externally reachable port per environment
///
/// Variant order is the canonical declaration order used whenever services
/// are iterated (detection, startup ordering, duplicate member lists).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceName {
    Api,
    Database,
    #[serde(alias = "cache")]
    Redis,
    MailSmtp,
    MailWeb,
    Metrics,
    Dashboard,
    ProxyDashboard,
    ServiceDiscovery,
    Monitor,
}

impl ServiceName {
    pub const ALL: [ServiceName; 10] = [
        ServiceName::Api,
        ServiceName::Database,
        ServiceName::Redis,
        ServiceName::MailSmtp,
        ServiceName::MailWeb,
        ServiceName::Metrics,
        ServiceName::Dashboard,
        ServiceName::ProxyDashboard,
        ServiceName::ServiceDiscovery,
        ServiceName::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Api => "api",
            ServiceName::Database => "database",
            ServiceName::Redis => "redis",
            ServiceName::MailSmtp => "mail-smtp",
            ServiceName::MailWeb => "mail-web",
            ServiceName::Metrics => "metrics",
            ServiceName::Dashboard => "dashboard",
            ServiceName::ProxyDashboard => "proxy-dashboard",
            ServiceName::ServiceDiscovery => "service-discovery",
            ServiceName::Monitor => "monitor",
        }
    }

    /// Port the service listens on inside its container
    pub fn internal_port(&self) -> u16 {
        match self {
            ServiceName::Api => 3001,
            ServiceName::Database => 5432,
            ServiceName::Redis => 6379,
            ServiceName::MailSmtp => 1025,
            ServiceName::MailWeb => 8025,
            ServiceName::Metrics => 9090,
            ServiceName::Dashboard => 3000,
            ServiceName::ProxyDashboard => 8080,
            ServiceName::ServiceDiscovery => 8500,
            ServiceName::Monitor => 9100,
        }
    }

    /// Offset from an environment's range start used by the built-in layout
    pub fn default_offset(&self) -> u16 {
        match self {
            ServiceName::Api => 1,
            ServiceName::Database => 432,
            ServiceName::Redis => 379,
            ServiceName::MailSmtp => 25,
            ServiceName::MailWeb => 825,
            ServiceName::Metrics => 90,
            ServiceName::Dashboard => 300,
            ServiceName::ProxyDashboard => 80,
            ServiceName::ServiceDiscovery => 500,
            ServiceName::Monitor => 100,
        }
    }

    /// Services that must be up before this one starts
    pub fn dependencies(&self) -> &'static [ServiceName] {
        match self {
            ServiceName::Api => &[
                ServiceName::Database,
                ServiceName::Redis,
                ServiceName::MailSmtp,
            ],
            ServiceName::Dashboard => &[ServiceName::Metrics],
            ServiceName::ProxyDashboard => &[ServiceName::Api],
            ServiceName::Monitor => &[ServiceName::Metrics],
            _ => &[],
        }
    }

    /// Default process/container name patterns for owner recognition
    pub fn default_owner_patterns(&self) -> &'static [&'static str] {
        match self {
            ServiceName::Api => &["node", "api", "bun", "deno"],
            ServiceName::Database => &["postgres", "postgresql", "database", "db"],
            ServiceName::Redis => &["redis", "valkey", "cache"],
            ServiceName::MailSmtp | ServiceName::MailWeb => &["mailhog", "mailpit", "mail"],
            ServiceName::Metrics => &["prometheus", "metrics"],
            ServiceName::Dashboard => &["grafana", "dashboard"],
            ServiceName::ProxyDashboard => &["traefik", "proxy"],
            ServiceName::ServiceDiscovery => &["consul"],
            ServiceName::Monitor => &["node_exporter", "node-exporter", "monitor"],
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = EnvPortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        if normalized == "cache" {
            return Ok(ServiceName::Redis);
        }
        ServiceName::ALL
            .iter()
            .copied()
            .find(|service| service.as_str() == normalized)
            .ok_or_else(|| EnvPortError::ServiceNotFound {
                service: s.to_string(),
                environment: "*".to_string(),
            })
    }
}
