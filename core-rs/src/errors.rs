//! Error types for envport

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvPortError {
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Service not found: {service} in environment {environment}")]
    ServiceNotFound { service: String, environment: String },

    #[error(
        "Range violation: {service} in {environment} cannot use port {port} (allowed {start}-{end})"
    )]
    RangeViolation {
        service: String,
        environment: String,
        port: u16,
        start: u16,
        end: u16,
    },

    #[error("Probe timeout: port {port} did not answer within {timeout_ms}ms")]
    ProbeTimeout { port: u16, timeout_ms: u64 },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Resolution failure: {0}")]
    ResolutionFailure(String),

    #[error("Termination error: {0}")]
    Termination(String),

    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(String),
}

impl From<regex::Error> for EnvPortError {
    fn from(err: regex::Error) -> Self {
        EnvPortError::Regex(err.to_string())
    }
}

impl EnvPortError {
    /// Lookup and policy errors are caller mistakes and never worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnvPortError::ProbeTimeout { .. } | EnvPortError::Probe(_) | EnvPortError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EnvPortError>;
