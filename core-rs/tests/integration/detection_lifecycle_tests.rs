//! Integration tests for conflict detection
//!
//! Exercises the registry -> prober -> detector path end to end with a
//! scripted prober:
//! - Unexpected owners on assigned ports
//! - Duplicate assignments inside one environment
//! - Cross-environment sharing, idle and live
//! - Reserved ranges and the built-in layout
//! - Determinism across repeated passes

use envport_core::{
    ConflictDetector, ConflictKind, DetectOptions, EnvPortConfig, EnvironmentId, FakeProber, PortRegistry,
    ProbePool, ProcessInfo, ServiceName, Severity, SuggestOptions, SuggestionScorer,
};
use std::sync::Arc;

// ==================== Test Helper Functions ====================

const TWO_ENVIRONMENTS: &str = r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 30000, end: 30999 }
      services:
        api: 30001
        database: 30432
        metrics: 30090
    - id: staging
      name: Staging
      range: { start: 31000, end: 31999 }
      services:
        api: 31001
        database: 30432
"#;

fn setup(yaml: &str) -> (Arc<PortRegistry>, Arc<FakeProber>, ConflictDetector, EnvPortConfig) {
    let config = EnvPortConfig::from_yaml(yaml).unwrap();
    let registry = Arc::new(PortRegistry::from_config(&config).unwrap());
    let fake = Arc::new(FakeProber::new());
    let detector = ConflictDetector::from_config(registry.clone(), fake.clone(), &config).unwrap();
    (registry, fake, detector, config)
}

// ==================== Unexpected Owners ====================

#[tokio::test]
async fn test_foreign_process_on_api_port_is_reported_and_avoided() {
    let (registry, fake, detector, config) = setup(TWO_ENVIRONMENTS);
    fake.set_bound(30001, ProcessInfo::process(4242, "foo"));

    let report = detector
        .detect(
            EnvironmentId::Development,
            DetectOptions {
                include_cross_env: false,
                include_reserved: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.service, Some(ServiceName::Api));
    assert_eq!(conflict.port, 30001);
    assert!(matches!(&conflict.kind, ConflictKind::InUse { owner: Some(owner) } if owner.name == "foo"));
    assert!(conflict.auto_resolvable);

    let scorer = SuggestionScorer::new(
        registry,
        ProbePool::new(fake.clone(), 8),
        config.spec.scoring,
    );
    let suggestions = scorer
        .suggest(ServiceName::Api, EnvironmentId::Development, 3, &SuggestOptions::default())
        .await
        .unwrap();

    assert_eq!(suggestions.len(), 3);
    for suggestion in &suggestions {
        assert_ne!(suggestion.port, 30001);
        assert!((30000..=30999).contains(&suggestion.port));
    }
    assert!(suggestions.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_expected_owner_is_quiet() {
    let (_registry, fake, detector, _config) = setup(TWO_ENVIRONMENTS);
    fake.set_bound(30432, ProcessInfo::container("c0ffee", "dev-postgres"));

    let report = detector
        .detect(
            EnvironmentId::Development,
            DetectOptions {
                include_cross_env: false,
                include_reserved: true,
            },
        )
        .await
        .unwrap();

    assert!(report.is_safe());
}

// ==================== Duplicates ====================

#[tokio::test]
async fn test_two_services_on_one_port_yield_one_duplicate() {
    let (_registry, _fake, detector, _config) = setup(
        r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 30000, end: 30999 }
      services: { api: 30050, metrics: 30050 }
"#,
    );

    let report = detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();

    let duplicates: Vec<_> = report
        .conflicts
        .iter()
        .filter(|c| c.kind.label() == "duplicate_port")
        .collect();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(
        duplicates[0].kind,
        ConflictKind::DuplicatePort {
            services: vec![ServiceName::Api, ServiceName::Metrics]
        }
    );
}

// ==================== Cross-environment ====================

#[tokio::test]
async fn test_shared_port_is_critical_when_live() {
    let (_registry, fake, detector, _config) = setup(TWO_ENVIRONMENTS);

    let idle = detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    let cross: Vec<_> = idle
        .conflicts
        .iter()
        .filter(|c| c.kind.label() == "cross_environment")
        .collect();
    assert_eq!(cross.len(), 1);
    assert_eq!(cross[0].service, Some(ServiceName::Database));
    assert!(!cross[0].auto_resolvable);

    fake.set_bound(30432, ProcessInfo::container("beef", "staging-postgres"));
    let live = detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();

    // The staging database answers on a development port: both in-use and live sharing
    let labels: Vec<&str> = live.conflicts.iter().map(|c| c.kind.label()).collect();
    assert_eq!(labels, vec!["in_use", "cross_environment"]);
    assert!(matches!(live.conflicts[1].kind, ConflictKind::CrossEnvironment { live: true, .. }));
    assert_eq!(live.highest_severity(), Some(Severity::Critical));
}

// ==================== Built-in Layout ====================

#[tokio::test]
async fn test_builtin_layout_is_clean_when_nothing_listens() {
    let registry = Arc::new(PortRegistry::with_defaults());
    let detector = ConflictDetector::new(registry, ProbePool::new(Arc::new(FakeProber::new()), 16));

    for env in EnvironmentId::ALL {
        let report = detector.detect(env, DetectOptions::default()).await.unwrap();
        assert!(report.is_safe(), "{} has conflicts: {:?}", env, report.conflicts);
    }
}

#[tokio::test]
async fn test_unknown_probe_does_not_abort_scan() {
    let (_registry, fake, detector, _config) = setup(TWO_ENVIRONMENTS);
    fake.set_unknown(30001, "permission denied");
    fake.set_bound(30090, ProcessInfo::process(1, "foo"));

    let report = detector
        .detect(
            EnvironmentId::Development,
            DetectOptions {
                include_cross_env: false,
                include_reserved: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].port, 30001);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].service, Some(ServiceName::Metrics));
}

#[tokio::test]
async fn test_repeated_passes_are_identical() {
    let (_registry, fake, detector, _config) = setup(TWO_ENVIRONMENTS);
    fake.set_bound(30001, ProcessInfo::process(4242, "foo"));
    fake.set_bound(30090, ProcessInfo::process(4243, "bar"));

    let first = detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    let second = detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();

    assert_eq!(first.conflicts, second.conflicts);
    assert_eq!(first.warnings, second.warnings);
}

#[tokio::test]
async fn test_unknown_environment_is_an_error() {
    let (_registry, _fake, detector, _config) = setup(
        r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: testing
      name: Testing
      range: { start: 23000, end: 23999 }
"#,
    );

    let result = detector
        .detect(EnvironmentId::Production, DetectOptions::default())
        .await;
    assert!(matches!(result, Err(envport_core::EnvPortError::EnvironmentNotFound(_))));
}
