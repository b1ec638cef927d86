// Port Isolation Contract Tests
//
// These tests pin the layout guarantees every environment relies on.
// Changing one of them silently moves running stacks onto each other's ports.

use envport_core::{
    get_internal_port, EnvironmentId, FakeProber, FakeTerminator, PortRegistry, ProbePool, ResolveOptions,
    ServiceName,
};
use envport_core::{ConflictDetector, ConflictResolver, DetectOptions, EnvPortConfig, SuggestionScorer};
use std::sync::Arc;

/// WHY: Each built-in environment owns its own thousand-port block
/// REASON: Stacks for different environments run side by side on one host
/// BREAKS: Staging containers bind development ports if ranges overlap
/// SACRIFICES: If this fails, you're giving up environment isolation
#[test]
fn builtin_ranges_never_overlap() {
    let registry = PortRegistry::with_defaults();
    let environments = registry.snapshot();

    for (i, a) in environments.iter().enumerate() {
        for b in environments.iter().skip(i + 1) {
            assert!(
                !a.range.overlaps(&b.range),
                "{} ({}) overlaps {} ({})",
                a.id,
                a.range,
                b.id,
                b.range
            );
        }
    }

    // Block starts are part of user-facing documentation and compose files
    let starts: Vec<u16> = environments.iter().map(|e| e.range.start).collect();
    assert_eq!(starts, vec![21000, 22000, 23000, 24000]);
}

/// WHY: Only production may place services outside its range
/// REASON: Production infrastructure keeps conventional ports (5432, 6379, ...)
/// BREAKS: A non-exempt environment with out-of-range ports escapes isolation
/// SACRIFICES: If this fails, range checks are no longer enforced
#[test]
fn builtin_ports_stay_in_range_unless_exempt() {
    let registry = PortRegistry::with_defaults();

    for env in registry.snapshot() {
        for (service, port) in &env.services {
            if env.id == EnvironmentId::Production {
                assert!(env.range_exempt);
                continue;
            }
            assert!(
                env.range.contains(*port),
                "{}/{} on {} leaves {}",
                env.id,
                service,
                port,
                env.range
            );
        }
    }

    assert!(registry.validate_all().is_empty());
}

/// WHY: Non-exempt environments reject out-of-range assignments
/// REASON: Writes go through the same range policy as the built-in layout
/// BREAKS: A reassignment could push a service into another environment's block
/// SACRIFICES: If this fails, isolation only holds for the initial layout
#[test]
fn out_of_range_assignment_is_rejected() {
    let registry = PortRegistry::with_defaults();

    assert!(registry
        .set_service_port(ServiceName::Api, EnvironmentId::Development, 22001)
        .is_err());
    assert_eq!(
        registry
            .get_service_port(ServiceName::Api, EnvironmentId::Development)
            .unwrap(),
        21001
    );
    assert_eq!(registry.revision(), 0);
}

/// WHY: Internal (container-side) ports never depend on the environment
/// REASON: Images are built once and run in every environment
/// BREAKS: Port mappings in compose files stop matching the process inside
/// SACRIFICES: If this fails, every image needs per-environment configuration
#[test]
fn internal_ports_are_fixed() {
    let expected = [
        (ServiceName::Api, 3001),
        (ServiceName::Database, 5432),
        (ServiceName::Redis, 6379),
        (ServiceName::MailSmtp, 1025),
        (ServiceName::MailWeb, 8025),
        (ServiceName::Metrics, 9090),
        (ServiceName::Dashboard, 3000),
        (ServiceName::ProxyDashboard, 8080),
        (ServiceName::ServiceDiscovery, 8500),
        (ServiceName::Monitor, 9100),
    ];

    assert_eq!(expected.len(), ServiceName::ALL.len());
    for (service, port) in expected {
        assert_eq!(get_internal_port(service), port, "{}", service);
    }
}

/// WHY: The first service of a duplicate group keeps the port
/// REASON: Canonical order puts long-lived infrastructure first; it is what clients already reach
/// BREAKS: Resolving a duplicate would move the service everyone depends on
/// SACRIFICES: If this fails, resolution order becomes observable churn
#[tokio::test]
async fn duplicate_resolution_keeps_first_holder() {
    let config = EnvPortConfig::from_yaml(
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
    )
    .unwrap();
    let registry = Arc::new(PortRegistry::from_config(&config).unwrap());
    let fake = Arc::new(FakeProber::new());
    let detector = ConflictDetector::from_config(registry.clone(), fake.clone(), &config).unwrap();
    let scorer = SuggestionScorer::new(registry.clone(), ProbePool::new(fake.clone(), 8), config.spec.scoring);
    let resolver = ConflictResolver::new(&detector, scorer, Arc::new(FakeTerminator::linked(fake)));

    let report = detector
        .detect(EnvironmentId::Development, DetectOptions::default())
        .await
        .unwrap();
    resolver
        .resolve(EnvironmentId::Development, &report.conflicts, &ResolveOptions::automatic())
        .await
        .unwrap();

    let env = registry.get_environment(EnvironmentId::Development).unwrap();
    assert_eq!(env.port_of(ServiceName::Api), Some(30050));
    assert_ne!(env.port_of(ServiceName::Metrics), Some(30050));
    assert!(env.validate().is_empty());
}
