//! Alert sinks

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::monitor::events::{Alert, AlertSeverity};

/// Receives every alert the monitor raises
///
/// Called from the monitor task; implementations must not block.
pub trait AlertSink: Send + Sync {
    fn publish(&self, alert: &Alert);
}

/// Writes alerts to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn publish(&self, alert: &Alert) {
        let service = alert.service.map(|s| s.to_string()).unwrap_or_default();
        let owner = alert.owner.as_ref().map(|o| o.to_string()).unwrap_or_default();
        match alert.severity {
            AlertSeverity::Warning => warn!(
                env = %alert.environment,
                %service,
                port = alert.port,
                %owner,
                polls = alert.consecutive_polls,
                "{}",
                alert.message
            ),
            AlertSeverity::Critical => error!(
                env = %alert.environment,
                %service,
                port = alert.port,
                %owner,
                polls = alert.consecutive_polls,
                "{}",
                alert.message
            ),
        }
    }
}

/// Forwards alerts into a bounded channel; drops them when the receiver lags
pub struct ChannelAlertSink {
    tx: mpsc::Sender<Alert>,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChannelAlertSink { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn publish(&self, alert: &Alert) {
        if let Err(e) = self.tx.try_send(alert.clone()) {
            debug!(port = alert.port, error = %e, "Alert dropped");
        }
    }
}
