//! envport - environment port manager CLI
//!
//! Exit status is 1 whenever the inspected layout is not safe to start.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{debug, Level};

use envport_core::resolver::ActionKind;
use envport_core::{
    ConflictDetector, ConflictReport, ConflictResolver, DetectOptions, EnvPortConfig,
    EnvironmentId, PortMonitor, PortRegistry, ResolutionReport, ResolutionState, ResolutionStrategy,
    ResolveOptions, ServiceName, Severity, SuggestOptions, SuggestionScorer, SystemProber, SystemTerminator,
    TerminationMode, TracingAlertSink,
};

#[derive(Parser)]
#[command(name = "envport")]
#[command(version)]
#[command(about = "Per-environment port registry, conflict detection and monitoring", long_about = None)]
struct Cli {
    /// Configuration file (default: $ENVPORT_CONFIG, ./envport.yaml, ./.envport.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List environments, ranges and service ports
    List,
    /// Check environment definitions for range and duplicate issues
    Validate {
        /// Environment to validate (all when omitted)
        env: Option<EnvironmentId>,
    },
    /// Detect port conflicts in an environment
    Check {
        env: EnvironmentId,
        /// Skip the cross-environment check
        #[arg(long)]
        no_cross_env: bool,
        /// Skip the reserved-range check
        #[arg(long)]
        no_reserved: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Suggest replacement ports for a service
    Suggest {
        service: ServiceName,
        env: EnvironmentId,
        /// Number of suggestions
        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,
    },
    /// Detect and resolve conflicts
    Resolve {
        env: EnvironmentId,
        /// Plan only; change nothing
        #[arg(long)]
        dry_run: bool,
        /// Ask before applying
        #[arg(long)]
        interactive: bool,
        /// Approve every action up front
        #[arg(short, long)]
        yes: bool,
        /// Terminate unexpected owners instead of moving the service (needs --yes)
        #[arg(long)]
        kill: bool,
        /// Use SIGKILL / docker kill when terminating
        #[arg(long)]
        force: bool,
        /// Stop starting new resolutions after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Watch an environment's ports until Ctrl+C
    Monitor {
        env: EnvironmentId,
        /// Poll interval (default from configuration)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Print the dependency-respecting start-up order
    Order { env: EnvironmentId },
    /// Print a service's internal (container-facing) port
    InternalPort { service: ServiceName },
}

/// Loaded configuration and the registry built from it
struct Workspace {
    config: EnvPortConfig,
    registry: Arc<PortRegistry>,
}

fn load_context(explicit: Option<PathBuf>) -> Result<Workspace> {
    let located = match explicit {
        Some(path) => {
            let config = EnvPortConfig::load(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            Some((path, config))
        }
        None => {
            let cwd = std::env::current_dir()?;
            EnvPortConfig::discover(&cwd)?
        }
    };

    match located {
        Some((path, config)) => {
            debug!(path = %path.display(), "Using configuration file");
            let registry = PortRegistry::load(&path)?;
            Ok(Workspace {
                config,
                registry: Arc::new(registry),
            })
        }
        None => {
            debug!("No configuration file found, using built-in layout");
            Ok(Workspace {
                config: EnvPortConfig::default(),
                registry: Arc::new(PortRegistry::with_defaults()),
            })
        }
    }
}

fn severity_label(severity: Severity) -> colored::ColoredString {
    match severity {
        Severity::Low => "LOW".dimmed(),
        Severity::Medium => "MEDIUM".yellow(),
        Severity::High => "HIGH".red(),
        Severity::Critical => "CRITICAL".red().bold(),
    }
}

fn print_conflicts(report: &ConflictReport) {
    if report.is_safe() {
        println!("{} {} has no port conflicts", "✓".green(), report.environment);
    } else {
        println!(
            "{} {} conflict(s) in {}",
            "✗".red(),
            report.conflicts.len(),
            report.environment
        );
        for conflict in &report.conflicts {
            let who = conflict
                .service
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<10} {:<18} {:<18} {:<6} {}{}",
                severity_label(conflict.severity),
                conflict.kind.label(),
                who,
                conflict.port,
                conflict.detail,
                if conflict.auto_resolvable { "" } else { " (manual)" }
            );
        }
    }

    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow(), warning.message);
    }
}

fn print_resolution(report: &ResolutionReport) {
    let heading = if report.dry_run { "Planned" } else { "Applied" };
    println!("{} actions for {}:", heading, report.environment);
    if report.actions_taken.is_empty() {
        println!("  (none)");
    }
    for action in &report.actions_taken {
        match action {
            ActionKind::Reassign { service, from, to } => {
                println!("  reassign {:<18} {} -> {}", service.to_string(), from, to.to_string().green())
            }
            ActionKind::Terminate { owner, mode } => {
                println!("  terminate {} ({:?})", owner, mode)
            }
        }
    }

    for outcome in &report.outcomes {
        let state = match outcome.state {
            ResolutionState::Resolved => "resolved".green(),
            ResolutionState::Failed => "failed".red(),
            ResolutionState::Skipped => "skipped".yellow(),
            ResolutionState::Detected | ResolutionState::Resolving => "pending".yellow(),
        };
        println!(
            "  {:<9} {:<18} port {:<6} {}",
            state,
            outcome.conflict.kind.label(),
            outcome.conflict.port,
            outcome.message
        );
    }

    println!(
        "\nResolved: {}  Failed: {}  Skipped: {}{}",
        report.resolved,
        report.failed,
        report.skipped,
        if report.deadline_exceeded { "  (deadline exceeded)" } else { "" }
    );
}

/// Whether an interactive run may apply `planned`; an empty plan is never applied
fn approve(planned: &[ActionKind], ask: impl FnOnce() -> Result<bool>) -> Result<bool> {
    if planned.is_empty() {
        return Ok(false);
    }
    ask()
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Returns whether the command's result is safe
async fn run(cli: Cli) -> Result<bool> {
    if let Commands::InternalPort { service } = &cli.command {
        println!("{}", service.internal_port());
        return Ok(true);
    }

    let ws = load_context(cli.config)?;
    let prober = Arc::new(SystemProber::new(&ws.config.spec.probe));

    match cli.command {
        Commands::List => {
            for environment in ws.registry.snapshot() {
                println!(
                    "{} ({}) range {}{}",
                    environment.name.bold(),
                    environment.id,
                    environment.range,
                    if environment.range_exempt { " [exempt]" } else { "" }
                );
                for (service, port) in &environment.services {
                    println!(
                        "  {:<18} {:<6} internal {}",
                        service.to_string(),
                        port,
                        service.internal_port()
                    );
                }
            }
            Ok(true)
        }

        Commands::Validate { env } => {
            let issues = match env {
                Some(env) => ws.registry.validate(env),
                None => ws.registry.validate_all(),
            };
            if issues.is_empty() {
                println!("{} no issues found", "✓".green());
                return Ok(true);
            }
            for issue in &issues {
                println!("  {} [{}] {}", "✗".red(), issue.environment, issue.message);
            }
            Ok(false)
        }

        Commands::Check {
            env,
            no_cross_env,
            no_reserved,
            json,
        } => {
            let detector = ConflictDetector::from_config(ws.registry.clone(), prober, &ws.config)?;
            let report = detector
                .detect(
                    env,
                    DetectOptions {
                        include_cross_env: !no_cross_env,
                        include_reserved: !no_reserved,
                    },
                )
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_conflicts(&report);
            }
            Ok(report.is_safe())
        }

        Commands::Suggest { service, env, count } => {
            let detector = ConflictDetector::from_config(ws.registry.clone(), prober, &ws.config)?;
            let scorer = SuggestionScorer::new(ws.registry.clone(), detector.probes().clone(), ws.config.spec.scoring);
            let suggestions = scorer
                .suggest(service, env, count, &SuggestOptions::default())
                .await?;

            if suggestions.is_empty() {
                println!("No free ports left in {} for {}", env, service);
                return Ok(false);
            }
            for suggestion in &suggestions {
                let factors: Vec<String> = suggestion
                    .factors
                    .iter()
                    .map(|f| format!("{:?} {}/{}", f.factor, f.points, f.max_points))
                    .collect();
                println!(
                    "  {:<6} score {:>3}  {}",
                    suggestion.port.to_string().green(),
                    suggestion.score,
                    factors.join(", ").dimmed()
                );
            }
            Ok(true)
        }

        Commands::Resolve {
            env,
            dry_run,
            interactive,
            yes,
            kill,
            force,
            timeout_ms,
            json,
        } => {
            let detector = ConflictDetector::from_config(ws.registry.clone(), prober, &ws.config)?;
            let scorer = SuggestionScorer::new(ws.registry.clone(), detector.probes().clone(), ws.config.spec.scoring);
            let resolver = ConflictResolver::new(&detector, scorer, Arc::new(SystemTerminator::default()));

            let report = detector.detect(env, DetectOptions::default()).await?;
            if !json {
                print_conflicts(&report);
            }
            if report.is_safe() {
                return Ok(true);
            }

            let strategy = if dry_run {
                ResolutionStrategy::DryRun
            } else if interactive {
                ResolutionStrategy::Interactive
            } else {
                ResolutionStrategy::Automatic
            };
            let mut options = ResolveOptions {
                strategy,
                auto_approve: yes,
                allow_termination: kill,
                termination_mode: if force {
                    TerminationMode::Forced
                } else {
                    TerminationMode::Graceful
                },
                timeout: timeout_ms.map(Duration::from_millis),
            };

            // Interactive: show the plan, then ask once for the whole batch
            if strategy == ResolutionStrategy::Interactive && !yes {
                let plan = resolver
                    .resolve(
                        env,
                        &report.conflicts,
                        &ResolveOptions {
                            strategy: ResolutionStrategy::DryRun,
                            auto_approve: true,
                            ..options.clone()
                        },
                    )
                    .await?;
                print_resolution(&plan);
                if !approve(&plan.actions_taken, || confirm("Apply these actions?"))? {
                    println!(
                        "{} {} conflict(s) remain unresolved",
                        "✗".red(),
                        report.conflicts.len()
                    );
                    return Ok(false);
                }
                options.auto_approve = true;
            }

            let resolution = resolver.resolve(env, &report.conflicts, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&resolution)?);
            } else {
                print_resolution(&resolution);
            }
            Ok(resolution.is_safe())
        }

        Commands::Monitor { env, interval_ms } => {
            let detector = Arc::new(ConflictDetector::from_config(
                ws.registry.clone(),
                prober.clone(),
                &ws.config,
            )?);
            let monitor = PortMonitor::from_config(prober, &ws.config)?;
            monitor.add_sink(Arc::new(TracingAlertSink));
            monitor.follow(detector, env)?;

            let targets = monitor.targets();
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| ws.config.spec.monitor.interval());

            let shutdown = Arc::new(AtomicBool::new(false));
            let shutdown_clone = shutdown.clone();
            ctrlc::set_handler(move || {
                eprintln!("Received SIGTERM/SIGINT, finishing current cycle...");
                shutdown_clone.store(true, Ordering::SeqCst);
            })?;

            println!(
                "Monitoring {} port(s) in {} every {:?} (Ctrl+C to stop)",
                targets.len(),
                env,
                interval
            );
            monitor.start(targets, interval)?;

            while !shutdown.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            monitor.stop().await;

            if let Some(report) = monitor.last_report() {
                println!("\nLast cycle:");
                print_conflicts(&report);
            }
            let stats = monitor.statistics();
            println!(
                "\n{} cycles, {} checks, {} conflicted observations, {} alerts, avg cycle {:.1} ms",
                stats.cycles, stats.total_checks, stats.conflicts_detected, stats.alerts, stats.avg_response_time_ms
            );
            Ok(true)
        }

        Commands::Order { env } => {
            let environment = ws.registry.get_environment(env)?;
            let order = environment.startup_order()?;
            for (i, service) in order.iter().enumerate() {
                let port = environment
                    .port_of(*service)
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                println!("  {:>2}. {:<18} {}", i + 1, service.to_string(), port);
            }
            Ok(true)
        }

        Commands::InternalPort { .. } => Ok(true),
    }
}
