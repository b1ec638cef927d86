//! PortMonitor - periodic occupancy watch
//!
//! One background task polls every target per cycle through the probe pool,
//! feeds the debounced trackers, appends events to the bounded log and fans
//! alerts out to the registered sinks. `stop()` lets the in-flight cycle
//! finish before returning.
//!
//! A monitor that follows a detector re-reads the environment's targets from
//! the registry at the start of every cycle and runs the detector over the
//! cycle's observations, so registry edits show up on the next poll.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EnvPortConfig, MonitorConfig};
use crate::detector::{ConflictDetector, ConflictReport, DetectOptions, OwnerMatcher};
use crate::errors::{EnvPortError, Result};
use crate::monitor::alerts::AlertSink;
use crate::monitor::events::{
    Alert, AlertSeverity, EventLog, HistoryWindow, MonitorEvent, MonitorEventKind, MonitorStatistics,
};
use crate::monitor::tracker::{PortTracker, WatchTarget};
use crate::probe::{OccupancyProber, ProbePool};
use crate::registry::{EnvironmentId, PortRegistry};
use crate::scorer::ConflictHistory;

/// Watch targets for every service port of `env`, canonical service order
pub fn targets_for_environment(registry: &PortRegistry, env: EnvironmentId) -> Result<Vec<WatchTarget>> {
    let environment = registry.get_environment(env)?;
    Ok(environment
        .services
        .iter()
        .map(|(service, port)| WatchTarget {
            environment: env,
            service: *service,
            port: *port,
        })
        .collect())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
struct Following {
    detector: Arc<ConflictDetector>,
    environment: EnvironmentId,
}

struct MonitorInner {
    probes: ProbePool,
    matcher: OwnerMatcher,
    config: MonitorConfig,
    targets: RwLock<Vec<WatchTarget>>,
    trackers: Mutex<BTreeMap<WatchTarget, PortTracker>>,
    log: Mutex<EventLog>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    following: RwLock<Option<Following>>,
    last_report: Mutex<Option<ConflictReport>>,
    shutdown: Arc<AtomicBool>,
    wake: Notify,
}

impl MonitorInner {
    fn retarget(&self, targets: Vec<WatchTarget>) {
        lock(&self.trackers).retain(|t, _| targets.contains(t));
        *self.targets.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = targets;
    }

    async fn poll_cycle(&self) -> Vec<MonitorEvent> {
        let following = self
            .following
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(following) = &following {
            match targets_for_environment(following.detector.registry(), following.environment) {
                Ok(current) => self.retarget(current),
                Err(e) => warn!(error = %e, "Keeping previous watch targets"),
            }
        }

        let targets = self
            .targets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let started = Instant::now();
        let observed = self.probes.probe_many(targets.iter().map(|t| t.port)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut events = Vec::new();
        let mut alerts = Vec::new();
        let mut conflicted = 0;
        let mut unknown = 0;

        {
            let mut trackers = lock(&self.trackers);
            for target in &targets {
                let Some(snapshot) = observed.get(&target.port) else {
                    continue;
                };
                let occupancy = &snapshot.occupancy;
                if occupancy.bound().is_none() {
                    unknown += 1;
                }

                let recognised = self
                    .matcher
                    .recognises(target.service, target.environment, occupancy.owner());
                let tracker = trackers.entry(target.clone()).or_default();
                let observation = tracker.observe(occupancy, recognised, &self.config);
                if observation.conflicted {
                    conflicted += 1;
                }

                if let Some((from, to)) = observation.changed {
                    info!(%target, ?from, ?to, "Port state changed");
                    events.push(MonitorEvent::new(MonitorEventKind::StateChanged {
                        target: target.clone(),
                        from,
                        to,
                        owner: tracker.owner().cloned(),
                    }));
                }

                if let Some(severity) = observation.alert {
                    let owner = tracker.owner().cloned();
                    let message = match (severity, &owner) {
                        (AlertSeverity::Warning, Some(owner)) => {
                            format!("{} occupied by unexpected {}", target, owner)
                        }
                        (AlertSeverity::Warning, None) => format!("{} occupied by an unidentified owner", target),
                        (AlertSeverity::Critical, _) => format!(
                            "{} still occupied after {} polls",
                            target,
                            tracker.conflicted_polls()
                        ),
                    };
                    let alert = Alert {
                        port: target.port,
                        environment: target.environment,
                        service: Some(target.service),
                        severity,
                        message,
                        owner,
                        consecutive_polls: tracker.conflicted_polls(),
                        raised_at: Utc::now(),
                    };
                    alerts.push(alert.clone());
                    events.push(MonitorEvent::new(MonitorEventKind::Alert(alert)));
                }
            }
        }

        let conflicts = match &following {
            Some(following) => {
                match following
                    .detector
                    .assess(following.environment, &observed, DetectOptions::default())
                {
                    Ok(report) => {
                        let count = report.conflicts.len();
                        *lock(&self.last_report) = Some(report);
                        count
                    }
                    Err(e) => {
                        warn!(error = %e, "Detection skipped this cycle");
                        0
                    }
                }
            }
            None => 0,
        };

        events.push(MonitorEvent::new(MonitorEventKind::CycleCompleted {
            ports_checked: targets.len(),
            conflicted,
            unknown,
            conflicts,
            elapsed_ms,
        }));
        debug!(ports = targets.len(), conflicted, unknown, conflicts, elapsed_ms, "Monitor cycle complete");

        {
            let mut log = lock(&self.log);
            for event in &events {
                log.push(event.clone());
            }
        }

        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for alert in &alerts {
            for sink in &sinks {
                sink.publish(alert);
            }
        }

        events
    }
}

pub struct PortMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PortMonitor {
    pub fn new(probes: ProbePool, matcher: OwnerMatcher, config: MonitorConfig) -> Self {
        PortMonitor {
            inner: Arc::new(MonitorInner {
                probes,
                matcher,
                config,
                targets: RwLock::new(Vec::new()),
                trackers: Mutex::new(BTreeMap::new()),
                log: Mutex::new(EventLog::new(config.history_limit)),
                sinks: RwLock::new(Vec::new()),
                following: RwLock::new(None),
                last_report: Mutex::new(None),
                shutdown: Arc::new(AtomicBool::new(false)),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(prober: Arc<dyn OccupancyProber>, config: &EnvPortConfig) -> Result<Self> {
        let matcher = OwnerMatcher::new(&config.spec.allow_list)?;
        Ok(Self::new(
            ProbePool::new(prober, config.spec.probe.concurrency),
            matcher,
            config.spec.monitor,
        ))
    }

    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sink);
    }

    /// Replace the watched targets; trackers of dropped targets are discarded
    pub fn watch(&self, targets: Vec<WatchTarget>) {
        self.inner.retarget(targets);
    }

    /// Watch `env` as the detector's registry describes it, every cycle
    ///
    /// Targets are re-derived before each poll and the detector's report over
    /// the poll's observations is kept as `last_report()`.
    pub fn follow(&self, detector: Arc<ConflictDetector>, env: EnvironmentId) -> Result<()> {
        self.watch(targets_for_environment(detector.registry(), env)?);
        *self
            .inner
            .following
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Following {
            detector,
            environment: env,
        });
        Ok(())
    }

    /// Detector report from the most recent cycle, if following a detector
    pub fn last_report(&self) -> Option<ConflictReport> {
        lock(&self.inner.last_report).clone()
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        self.inner
            .targets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run one cycle now; returns the events it appended
    pub async fn poll_once(&self) -> Vec<MonitorEvent> {
        self.inner.poll_cycle().await
    }

    /// Flag observed by the background loop; set it to request a stop
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.shutdown)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Start polling `targets` every `interval` in a background task
    pub fn start(&self, targets: Vec<WatchTarget>, interval: Duration) -> Result<()> {
        let mut task = lock(&self.task);
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Err(EnvPortError::Validation("monitor is already running".to_string()));
        }

        self.watch(targets);
        self.inner.shutdown.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        info!(targets = self.targets().len(), interval_ms = interval.as_millis() as u64, "Monitor started");

        *task = Some(tokio::spawn(async move {
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }

                inner.poll_cycle().await;

                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            info!("Monitor stopped");
        }));
        Ok(())
    }

    /// Request a stop and wait for the in-flight cycle to finish
    pub async fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(error = %e, "Monitor task ended abnormally");
            }
        }
    }

    pub fn statistics(&self) -> MonitorStatistics {
        lock(&self.inner.log).statistics()
    }

    pub fn history(&self, window: HistoryWindow) -> Vec<MonitorEvent> {
        lock(&self.inner.log).window(window)
    }
}

impl ConflictHistory for PortMonitor {
    fn conflict_count(&self, env: EnvironmentId, port: u16) -> usize {
        lock(&self.inner.log).alert_count(env, port)
    }
}
