//! Integration tests for the port monitor
//!
//! Covers the start/poll/stop lifecycle, alert delivery to sinks, derived
//! statistics and the monitor feeding conflict history back into the scorer.

use envport_core::monitor::MonitorEventKind;
use envport_core::{
    targets_for_environment, AlertSeverity, ChannelAlertSink, EnvPortConfig, EnvironmentId, FakeProber,
    HistoryWindow, MonitorConfig, OwnerMatcher, PortMonitor, PortRegistry, ProbePool, ProcessInfo, ServiceName,
    SuggestOptions, SuggestionScorer,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

// ==================== Test Helper Functions ====================

fn fast_config() -> MonitorConfig {
    MonitorConfig {
        interval_ms: 5,
        ..MonitorConfig::default()
    }
}

fn monitor_with(fake: Arc<FakeProber>, config: MonitorConfig) -> PortMonitor {
    PortMonitor::new(ProbePool::new(fake, 8), OwnerMatcher::default(), config)
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_background_loop_polls_until_stopped() {
    let registry = PortRegistry::with_defaults();
    let targets = targets_for_environment(&registry, EnvironmentId::Testing).unwrap();
    let fake = Arc::new(FakeProber::new());
    let monitor = monitor_with(fake.clone(), fast_config());

    monitor.start(targets.clone(), Duration::from_millis(5)).unwrap();
    assert!(monitor.is_running());

    tokio::time::sleep(Duration::from_millis(60)).await;
    monitor.stop().await;
    assert!(!monitor.is_running());

    let stats = monitor.statistics();
    assert!(stats.cycles >= 2);
    assert_eq!(stats.total_checks, stats.cycles * targets.len() as u64);
    assert_eq!(stats.conflicts_detected, 0);
    assert_eq!(stats.alerts, 0);
}

#[tokio::test]
async fn test_shutdown_flag_stops_loop_like_ctrlc() {
    let fake = Arc::new(FakeProber::new());
    let monitor = monitor_with(fake, fast_config());
    let registry = PortRegistry::with_defaults();
    let targets = targets_for_environment(&registry, EnvironmentId::Staging).unwrap();

    monitor.start(targets, Duration::from_millis(5)).unwrap();
    monitor.shutdown_flag().store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!monitor.is_running());
    monitor.stop().await;
}

#[tokio::test]
async fn test_monitor_can_restart_after_stop() {
    let fake = Arc::new(FakeProber::new());
    let monitor = monitor_with(fake, fast_config());
    let registry = PortRegistry::with_defaults();
    let targets = targets_for_environment(&registry, EnvironmentId::Development).unwrap();

    monitor.start(targets.clone(), Duration::from_millis(5)).unwrap();
    monitor.stop().await;
    monitor.start(targets, Duration::from_millis(5)).unwrap();
    monitor.stop().await;
}

// ==================== Alerts ====================

#[tokio::test]
async fn test_persistent_squatter_warns_then_escalates() {
    let registry = PortRegistry::with_defaults();
    let targets: Vec<_> = targets_for_environment(&registry, EnvironmentId::Development)
        .unwrap()
        .into_iter()
        .filter(|t| t.service == ServiceName::Api)
        .collect();
    let port = targets[0].port;

    let fake = Arc::new(FakeProber::new());
    fake.set_bound(port, ProcessInfo::process(999, "foo"));
    let monitor = monitor_with(fake, MonitorConfig::default());
    let (sink, mut rx) = ChannelAlertSink::new(16);
    monitor.add_sink(Arc::new(sink));
    monitor.watch(targets);

    for _ in 0..6 {
        monitor.poll_once().await;
    }

    let warning = rx.try_recv().unwrap();
    let critical = rx.try_recv().unwrap();
    assert!(rx.try_recv().is_err());

    assert_eq!(warning.severity, AlertSeverity::Warning);
    assert_eq!(warning.consecutive_polls, 3);
    assert_eq!(critical.severity, AlertSeverity::Critical);
    assert_eq!(critical.consecutive_polls, 5);
    assert_eq!(critical.service, Some(ServiceName::Api));

    let alerts = monitor
        .history(HistoryWindow::All)
        .into_iter()
        .filter(|e| matches!(e.kind, MonitorEventKind::Alert(_)))
        .count();
    assert_eq!(alerts, 2);
    assert_eq!(monitor.statistics().alerts, 2);
}

#[tokio::test]
async fn test_flapping_port_does_not_alert() {
    let fake = Arc::new(FakeProber::new());
    let monitor = monitor_with(fake.clone(), MonitorConfig::default());
    let (sink, mut rx) = ChannelAlertSink::new(16);
    monitor.add_sink(Arc::new(sink));
    let registry = PortRegistry::with_defaults();
    let targets: Vec<_> = targets_for_environment(&registry, EnvironmentId::Development)
        .unwrap()
        .into_iter()
        .filter(|t| t.service == ServiceName::Redis)
        .collect();
    let port = targets[0].port;
    monitor.watch(targets);

    monitor.poll_once().await;
    monitor.poll_once().await;
    for i in 0..6 {
        if i % 2 == 0 {
            fake.set_bound(port, ProcessInfo::process(5, "foo"));
        } else {
            fake.set_free(port);
        }
        monitor.poll_once().await;
    }

    assert!(rx.try_recv().is_err());
}

// ==================== History Feedback ====================

#[tokio::test]
async fn test_alerted_port_scores_lower_as_suggestion() {
    let config = EnvPortConfig::from_yaml(
        r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 30000, end: 30999 }
      services: { api: 30000 }
"#,
    )
    .unwrap();
    let registry = Arc::new(PortRegistry::from_config(&config).unwrap());
    let fake = Arc::new(FakeProber::new());
    let monitor = Arc::new(PortMonitor::from_config(fake.clone(), &config).unwrap());
    monitor.watch(targets_for_environment(&registry, EnvironmentId::Development).unwrap());

    fake.set_bound(30000, ProcessInfo::process(1, "foo"));
    for _ in 0..3 {
        monitor.poll_once().await;
    }

    // The api moves off 30000; the squatter's port is now a candidate with history
    registry
        .set_service_port(ServiceName::Api, EnvironmentId::Development, 30500)
        .unwrap();
    fake.set_free(30000);

    let scorer = SuggestionScorer::new(registry, ProbePool::new(fake, 8), config.spec.scoring)
        .with_history(monitor.clone());
    let suggestions = scorer
        .suggest(ServiceName::Metrics, EnvironmentId::Development, 400, &SuggestOptions::default())
        .await
        .unwrap();

    let penalised = suggestions.iter().find(|s| s.port == 30000).unwrap();
    assert!(penalised.score < 100);
    assert_ne!(suggestions[0].port, 30000);
}
