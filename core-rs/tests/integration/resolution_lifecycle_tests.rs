//! Integration tests for conflict resolution
//!
//! detect -> resolve -> detect round trips against a fake host, including
//! write-back of reassignments to the configuration file.

use envport_core::resolver::ActionKind;
use envport_core::{
    ConflictDetector, ConflictResolver, DetectOptions, EnvPortConfig, EnvironmentId, FakeProber, FakeTerminator,
    PortRegistry, ProbePool, ProcessInfo, ResolutionState, ResolveOptions, ServiceName, SuggestOptions,
    SuggestionScorer,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ==================== Test Helper Functions ====================

const DEV_ONLY: &str = r#"
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
"#;

struct Stack {
    registry: Arc<PortRegistry>,
    fake: Arc<FakeProber>,
    terminator: Arc<FakeTerminator>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
}

fn stack(registry: PortRegistry, config: &EnvPortConfig) -> Stack {
    let registry = Arc::new(registry);
    let fake = Arc::new(FakeProber::new());
    let terminator = Arc::new(FakeTerminator::linked(fake.clone()));
    let detector = ConflictDetector::from_config(registry.clone(), fake.clone(), config).unwrap();
    let scorer = SuggestionScorer::new(
        registry.clone(),
        ProbePool::new(fake.clone(), 8),
        config.spec.scoring,
    );
    let resolver = ConflictResolver::new(&detector, scorer, terminator.clone());
    Stack {
        registry,
        fake,
        terminator,
        detector,
        resolver,
    }
}

fn in_memory(yaml: &str) -> Stack {
    let config = EnvPortConfig::from_yaml(yaml).unwrap();
    stack(PortRegistry::from_config(&config).unwrap(), &config)
}

// ==================== Reassignment ====================

#[tokio::test]
async fn test_reassigns_api_to_top_suggestion_and_clears_conflict() {
    let s = in_memory(DEV_ONLY);
    s.fake.set_bound(30001, ProcessInfo::process(4242, "foo"));

    let report = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    let top = s
        .resolver
        .scorer()
        .suggest(ServiceName::Api, EnvironmentId::Development, 1, &SuggestOptions::default())
        .await
        .unwrap()[0]
        .port;

    let resolution = s
        .resolver
        .resolve(EnvironmentId::Development, &report.conflicts, &ResolveOptions::automatic())
        .await
        .unwrap();

    assert!(resolution.is_safe());
    assert_eq!(
        s.registry
            .get_service_port(ServiceName::Api, EnvironmentId::Development)
            .unwrap(),
        top
    );

    let after = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    assert!(after.conflicts_for(ServiceName::Api).is_empty());
}

#[tokio::test]
async fn test_several_conflicts_never_pick_the_same_port() {
    let s = in_memory(DEV_ONLY);
    s.fake.set_bound(30001, ProcessInfo::process(1, "foo"));
    s.fake.set_bound(30432, ProcessInfo::process(2, "bar"));
    s.fake.set_bound(30090, ProcessInfo::process(3, "baz"));

    let report = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    assert_eq!(report.conflicts.len(), 3);

    let resolution = s
        .resolver
        .resolve(EnvironmentId::Development, &report.conflicts, &ResolveOptions::automatic())
        .await
        .unwrap();

    let targets: Vec<u16> = resolution
        .actions_taken
        .iter()
        .filter_map(|a| match a {
            ActionKind::Reassign { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(targets.len(), 3);
    let mut unique = targets.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 3);

    let env = s.registry.get_environment(EnvironmentId::Development).unwrap();
    assert!(env.validate().is_empty());
}

#[tokio::test]
async fn test_candidate_taken_between_scoring_and_commit_is_skipped() {
    let s = in_memory(DEV_ONLY);
    s.fake.set_bound(30001, ProcessInfo::process(1, "foo"));
    // Free while scoring, bound on the re-probe
    s.fake.script(
        30000,
        vec![
            envport_core::Occupancy::Free,
            envport_core::Occupancy::Bound { owner: None },
        ],
    );
    s.fake.set_bound_anonymous(30000);

    let report = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    let resolution = s
        .resolver
        .resolve(EnvironmentId::Development, &report.conflicts, &ResolveOptions::automatic())
        .await
        .unwrap();

    assert!(resolution.is_safe());
    let api = s
        .registry
        .get_service_port(ServiceName::Api, EnvironmentId::Development)
        .unwrap();
    assert_ne!(api, 30000);
    assert_ne!(api, 30001);
}

// ==================== Dry Run ====================

#[tokio::test]
async fn test_dry_run_reports_plan_and_changes_nothing() {
    let dry = in_memory(DEV_ONLY);
    let live = in_memory(DEV_ONLY);
    for s in [&dry, &live] {
        s.fake.set_bound(30001, ProcessInfo::process(4242, "foo"));
        s.fake.set_bound(30090, ProcessInfo::process(4243, "foo"));
    }

    let conflicts = dry
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap()
        .conflicts;
    let before = dry.registry.snapshot();

    let plan = dry
        .resolver
        .resolve(EnvironmentId::Development, &conflicts, &ResolveOptions::dry_run())
        .await
        .unwrap();
    let applied = live
        .resolver
        .resolve(EnvironmentId::Development, &conflicts, &ResolveOptions::automatic())
        .await
        .unwrap();

    assert_eq!(dry.registry.snapshot(), before);
    assert_eq!(dry.registry.revision(), 0);
    assert!(plan.dry_run);
    assert_eq!(plan.actions_taken, applied.actions_taken);
}

// ==================== Termination ====================

#[tokio::test]
async fn test_termination_needs_both_flags() {
    let s = in_memory(DEV_ONLY);
    s.fake.set_bound(30001, ProcessInfo::process(4242, "foo"));
    let conflicts = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap()
        .conflicts;

    // allow_termination without auto_approve falls back to reassignment
    let options = ResolveOptions {
        allow_termination: true,
        auto_approve: false,
        ..ResolveOptions::default()
    };
    let report = s
        .resolver
        .resolve(EnvironmentId::Development, &conflicts, &options)
        .await
        .unwrap();

    assert!(s.terminator.calls().is_empty());
    assert!(matches!(report.actions_taken[0], ActionKind::Reassign { .. }));
}

// ==================== Partial Results ====================

#[tokio::test]
async fn test_manual_conflicts_are_skipped_with_recommendation() {
    let s = in_memory(
        r#"
apiVersion: envport/v1
kind: PortRegistry
spec:
  environments:
    - id: development
      name: Development
      range: { start: 6000, end: 6100 }
      services: { api: 6010 }
"#,
    );

    let report = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    let resolution = s
        .resolver
        .resolve(EnvironmentId::Development, &report.conflicts, &ResolveOptions::automatic())
        .await
        .unwrap();

    assert_eq!(resolution.skipped, 1);
    assert_eq!(resolution.outcomes[0].state, ResolutionState::Skipped);
    assert!(resolution.outcomes[0].message.contains("X Window"));
    assert!(resolution.is_safe());
}

#[tokio::test]
async fn test_zero_deadline_returns_well_formed_partial_report() {
    let s = in_memory(DEV_ONLY);
    s.fake.set_bound(30001, ProcessInfo::process(4242, "foo"));
    s.fake.set_bound(30090, ProcessInfo::process(4243, "foo"));
    let conflicts = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap()
        .conflicts;

    let options = ResolveOptions {
        timeout: Some(Duration::ZERO),
        ..ResolveOptions::automatic()
    };
    let report = s
        .resolver
        .resolve(EnvironmentId::Development, &conflicts, &options)
        .await
        .unwrap();

    assert!(report.deadline_exceeded);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.actions_taken.is_empty());
    assert!(!report.is_safe());
}

// ==================== Persistence ====================

#[tokio::test]
async fn test_reassignment_is_written_back_to_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("envport.yaml");
    fs::write(&path, DEV_ONLY).unwrap();

    let config = EnvPortConfig::load(&path).unwrap();
    let s = stack(PortRegistry::load(&path).unwrap(), &config);
    s.fake.set_bound(30001, ProcessInfo::process(4242, "foo"));

    let conflicts = s
        .detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap()
        .conflicts;
    s.resolver
        .resolve(EnvironmentId::Development, &conflicts, &ResolveOptions::automatic())
        .await
        .unwrap();

    let new_port = s
        .registry
        .get_service_port(ServiceName::Api, EnvironmentId::Development)
        .unwrap();
    let reloaded = PortRegistry::load(&path).unwrap();
    assert_eq!(
        reloaded
            .get_service_port(ServiceName::Api, EnvironmentId::Development)
            .unwrap(),
        new_port
    );
    assert_ne!(new_port, 30001);
}
