// Suggestion and Resolution Contract Tests
//
// Ranking and dry-run behaviour are relied on by scripts that parse CLI output.
// These tests fail with an explanation of which guarantee moved.

use envport_core::resolver::ActionKind;
use envport_core::{
    ConflictDetector, ConflictResolver, DetectOptions, EnvPortConfig, EnvironmentId, FakeProber, FakeTerminator,
    PortRegistry, ProbePool, ProcessInfo, ResolveOptions, ServiceName, SuggestOptions, SuggestionScorer,
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn scorer_for(yaml: &str) -> (Arc<PortRegistry>, Arc<FakeProber>, SuggestionScorer) {
    let config = EnvPortConfig::from_yaml(yaml).unwrap();
    let registry = Arc::new(PortRegistry::from_config(&config).unwrap());
    let fake = Arc::new(FakeProber::new());
    let scorer = SuggestionScorer::new(registry.clone(), ProbePool::new(fake.clone(), 8), config.spec.scoring);
    (registry, fake, scorer)
}

const SPARSE: &str = r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 30000, end: 30999 }
      services: { api: 30500 }
"#;

/// WHY: With nothing else to tell candidates apart, the lowest free port wins
/// REASON: Ties break by ascending port so repeated runs suggest the same thing
/// BREAKS: Two developers running suggest on identical hosts get different answers
/// SACRIFICES: If this fails, suggestions stop being reproducible
#[tokio::test]
async fn top_suggestion_is_lowest_free_port() {
    let (_registry, fake, scorer) = scorer_for(SPARSE);
    fake.set_bound_anonymous(30000);

    let suggestions = scorer
        .suggest(ServiceName::Metrics, EnvironmentId::Development, 5, &SuggestOptions::default())
        .await
        .unwrap();

    let ports: Vec<u16> = suggestions.iter().map(|s| s.port).collect();
    assert_eq!(ports, vec![30001, 30002, 30003, 30004, 30005]);
    assert!(suggestions.iter().all(|s| s.score == 100));
}

/// WHY: Scores never increase down the list
/// REASON: Callers take the first N suggestions as the N best
/// BREAKS: Resolution would try a worse port before a better one
/// SACRIFICES: If this fails, "top suggestion" means nothing
#[tokio::test]
async fn suggestions_are_ranked_by_score() {
    let (_registry, fake, scorer) = scorer_for(
        r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 30000, end: 30099 }
      services: { api: 30050 }
"#,
    );
    fake.set_unknown(30010, "timeout");

    let suggestions = scorer
        .suggest(ServiceName::Metrics, EnvironmentId::Development, 1000, &SuggestOptions::default())
        .await
        .unwrap();

    assert!(suggestions.windows(2).all(|w| w[0].score >= w[1].score));
    // Adjacent to the api and of unknown occupancy: both ranked below clean ports
    let last: BTreeSet<u16> = suggestions.iter().rev().take(3).map(|s| s.port).collect();
    assert_eq!(last, BTreeSet::from([30010, 30049, 30051]));
}

/// WHY: Reserved ranges are never suggested
/// REASON: X11 displays and the kernel's ephemeral range are claimed by the OS at runtime
/// BREAKS: A suggested port would be stolen by the next outbound connection or display
/// SACRIFICES: If this fails, "free" ports become intermittently busy
#[tokio::test]
async fn reserved_ports_are_never_suggested() {
    let (registry, _fake, scorer) = scorer_for(
        r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 5990, end: 6100 }
      services: { api: 6090 }
"#,
    );

    let suggestions = scorer
        .suggest(ServiceName::Metrics, EnvironmentId::Development, 1000, &SuggestOptions::default())
        .await
        .unwrap();

    assert!(!suggestions.is_empty());
    for suggestion in &suggestions {
        assert!(
            envport_core::registry::find_reserved(registry.reserved_ranges(), suggestion.port).is_none(),
            "{} is reserved",
            suggestion.port
        );
    }
}

/// WHY: Ports assigned in any environment are never suggested
/// REASON: A free port today may be another environment's service tomorrow
/// BREAKS: Cross-environment conflicts appear the moment the other stack starts
/// SACRIFICES: If this fails, isolation depends on start order
#[tokio::test]
async fn other_environments_ports_are_never_suggested() {
    let (_registry, _fake, scorer) = scorer_for(
        r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 30000, end: 30009 }
      services: { api: 30000 }
    - id: staging
      name: Staging
      range: { start: 31000, end: 31999 }
      services: { api: 30001, database: 30002 }
"#,
    );

    let suggestions = scorer
        .suggest(ServiceName::Metrics, EnvironmentId::Development, 100, &SuggestOptions::default())
        .await
        .unwrap();

    let ports: BTreeSet<u16> = suggestions.iter().map(|s| s.port).collect();
    assert_eq!(ports, (30003..=30009).collect());
}

/// WHY: A dry run never writes the registry and never terminates anything
/// REASON: Users preview destructive plans before approving them
/// BREAKS: "Show me what you would do" kills the process it was asked about
/// SACRIFICES: If this fails, dry-run is no longer safe to run in production
#[tokio::test]
async fn dry_run_is_pure() {
    let config = EnvPortConfig::from_yaml(SPARSE).unwrap();
    let registry = Arc::new(PortRegistry::from_config(&config).unwrap());
    let fake = Arc::new(FakeProber::new());
    let terminator = Arc::new(FakeTerminator::linked(fake.clone()));
    let detector = ConflictDetector::from_config(registry.clone(), fake.clone(), &config).unwrap();
    let scorer = SuggestionScorer::new(registry.clone(), ProbePool::new(fake.clone(), 8), config.spec.scoring);
    let resolver = ConflictResolver::new(&detector, scorer, terminator.clone());

    fake.set_bound(30500, ProcessInfo::process(4242, "foo"));
    let report = detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();

    let options = ResolveOptions {
        allow_termination: true,
        auto_approve: true,
        ..ResolveOptions::dry_run()
    };
    let plan = resolver
        .resolve(EnvironmentId::Development, &report.conflicts, &options)
        .await
        .unwrap();

    assert!(matches!(plan.actions_taken[0], ActionKind::Terminate { .. }));
    assert!(terminator.calls().is_empty());
    assert_eq!(registry.revision(), 0);
    assert_eq!(
        registry
            .get_service_port(ServiceName::Api, EnvironmentId::Development)
            .unwrap(),
        30500
    );
}
