use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, ConfigSource};
use crate::models::{Target, Transition};
use crate::notify::Notifier;
use crate::probe::Probe;
use crate::storage::StateStore;
use crate::utils::wait_for_shutdown;

/// Whether a transition is worth a message. A first sighting counts, in
/// the bootstrap cycle or later, so targets added to the config while
/// running are announced too.
pub fn should_notify(transition: Transition) -> bool {
    transition != Transition::NoChange
}

/// Time of the last completed cycle, read by the liveness endpoint.
pub struct Liveness {
    period: Duration,
    last_cycle: Mutex<Option<DateTime<Utc>>>,
}

impl Liveness {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_cycle: Mutex::new(None),
        }
    }

    pub async fn mark_cycle_complete(&self, at: DateTime<Utc>) {
        *self.last_cycle.lock().await = Some(at);
    }

    pub async fn last_cycle(&self) -> Option<DateTime<Utc>> {
        *self.last_cycle.lock().await
    }

    pub async fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now()).await
    }

    /// Healthy while the last cycle finished less than two periods ago.
    pub async fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_cycle().await else {
            return false;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < self.period.saturating_mul(2),
            // clock stepped backwards
            Err(_) => true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub notified: usize,
}

pub struct Monitor<C, P, N> {
    source: C,
    checker: P,
    store: StateStore,
    notifier: N,
    period: Duration,
    liveness: Arc<Liveness>,
    concurrency_limiter: Arc<Semaphore>,
}

impl<C, P, N> Monitor<C, P, N>
where
    C: ConfigSource,
    P: Probe,
    N: Notifier,
{
    pub fn new(
        source: C,
        checker: P,
        store: StateStore,
        notifier: N,
        period: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            source,
            checker,
            store,
            notifier,
            period,
            liveness: Arc::new(Liveness::new(period)),
            concurrency_limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        Arc::clone(&self.liveness)
    }

    /// Loads the config and runs the first cycle. A config that cannot be
    /// loaded here is fatal since there is nothing to fall back to.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<Arc<Config>, ConfigError> {
        let config = Arc::new(self.source.load()?);
        info!(targets = config.targets.len(), "configuration loaded");
        self.run_cycle(&config, true).await;
        Ok(config)
    }

    /// Runs a cycle every period until shutdown. A cycle already in
    /// progress is always allowed to finish.
    pub async fn run(self: Arc<Self>, mut config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the bootstrap cycle stands in for the immediate first tick
        ticker.tick().await;

        info!("will run healthchecks every {:?}", self.period);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("check loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    config = self.reload(config);
                    self.run_cycle(&config, false).await;
                }
            }
        }
    }

    fn reload(&self, previous: Arc<Config>) -> Arc<Config> {
        match self.source.load() {
            Ok(config) => Arc::new(config),
            Err(e) => {
                warn!(error = %e, "unable to reload configuration, using last valid config");
                previous
            }
        }
    }

    /// Probes every target concurrently and waits for all of them before
    /// marking the cycle complete.
    pub async fn run_cycle(self: &Arc<Self>, config: &Config, bootstrap: bool) -> CycleReport {
        let start_time = Utc::now();
        let mut tasks = FuturesUnordered::new();

        for target in &config.targets {
            let monitor = Arc::clone(self);
            let target = Arc::clone(target);
            tasks.push(tokio::spawn(async move {
                let _permit = monitor.concurrency_limiter.acquire().await.ok();
                monitor.check_target(target).await
            }));
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.next().await {
            report.checked += 1;
            match joined {
                Ok(true) => report.notified += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "healthcheck task aborted"),
            }
        }

        let finished = Utc::now();
        self.liveness.mark_cycle_complete(finished).await;

        let duration = finished - start_time;
        info!(
            bootstrap,
            checked = report.checked,
            notified = report.notified,
            "cycle completed in {:.2}s",
            duration.num_milliseconds() as f64 / 1000.0
        );
        report
    }

    /// Returns whether a notification was attempted.
    async fn check_target(&self, target: Arc<Target>) -> bool {
        let result = self.checker.execute(&target).await;
        let transition = self.store.update(&result).await;

        if !should_notify(transition) {
            return false;
        }

        info!(target_name = %target.name, ?transition, "{}", result);
        if let Err(e) = self.notifier.notify(&result).await {
            error!(target_name = %target.name, error = %e, "notification failed");
        }
        true
    }
}
