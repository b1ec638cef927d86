use crate::registry::EnvironmentId;

/// Past conflicts observed on a port, feeding the stability factor
pub trait ConflictHistory: Send + Sync {
    fn conflict_count(&self, env: EnvironmentId, port: u16) -> usize;
}

/// No history: every port is fully stable
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHistory;

impl ConflictHistory for NoHistory {
    fn conflict_count(&self, _env: EnvironmentId, _port: u16) -> usize {
        0
    }
}
