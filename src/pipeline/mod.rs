//! Daemon wiring: intake -> batches -> calendar -> dispatch -> monitor ->
//! risk -> learner, with the periodic parts on [`Job`]s

pub mod dispatch;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::BrowserPool;
use crate::compliance::ComplianceGate;
use crate::config::{self, Config};
use crate::executor::{Executor, SurfaceProfile};
use crate::jobs::{Job, JobSchedule};
use crate::learner::PerformanceLearner;
use crate::llm::ModelRoles;
use crate::messaging::{build_notifier, Notifier};
use crate::monitor::OutcomeMonitor;
use crate::platform::PublicApi;
use crate::risk::RiskAdapter;
use crate::rules::RuleCache;
use crate::scheduler::{Batch, BatchAccumulator, CalendarScheduler};
use crate::store::Store;

pub use dispatch::{DispatchReport, Dispatcher, Publisher};

/// Intake rows taken per poll
const INTAKE_BATCH: usize = 100;

pub struct Pipeline {
    config: Config,
    store: Store,
    notifier: Arc<dyn Notifier>,
    browsers: Arc<BrowserPool>,
    rules: Arc<RuleCache>,
    scheduler: Arc<CalendarScheduler>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<OutcomeMonitor>,
    risk: RiskAdapter,
    learner: Arc<PerformanceLearner>,
}

impl Pipeline {
    /// Open the store and build every component from the configuration
    pub async fn build(config: Config) -> Result<Self> {
        let store = Store::open(config.database_path()?).await?;
        let notifier = build_notifier(&config)?;
        let roles = ModelRoles::from_config(&config.llm);
        let api = Arc::new(PublicApi::new(&config.platform)?);

        let rules = Arc::new(RuleCache::new(store.clone(), api.clone(), roles.parser.clone()));
        let gate = Arc::new(ComplianceGate::new(store.clone(), rules.clone()));

        let personas: HashMap<_, _> = config
            .actors
            .iter()
            .map(|a| (a.actor_id(), a.persona.clone()))
            .collect();
        let scheduler = Arc::new(CalendarScheduler::new(
            store.clone(),
            roles.adapter.clone(),
            notifier.clone(),
            config.scheduler.clone(),
            personas,
        ));

        let cookie_files: HashMap<_, _> = config
            .actors
            .iter()
            .filter_map(|a| a.cookie_file.clone().map(|path| (a.actor_id(), path)))
            .collect();
        let browsers = Arc::new(BrowserPool::new(config.browser.clone(), cookie_files));
        let executor = Executor::new(
            store.clone(),
            browsers.clone(),
            roles.oracle.clone(),
            notifier.clone(),
            SurfaceProfile::defaults(&config.platform.primary_url, &config.platform.legacy_url),
            &config.executor,
        )
        .with_diagnostics_dir(config::diagnostics_dir()?);

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            gate,
            Arc::new(executor),
            notifier.clone(),
            config.executor.max_request_attempts,
            config.executor.retry_backoff_mins,
        ));

        let risk = RiskAdapter::new(store.clone());
        let monitor = Arc::new(OutcomeMonitor::new(
            store.clone(),
            api,
            Arc::new(risk.clone()),
            notifier.clone(),
            config.monitor.max_age_hours,
        ));
        let learner = Arc::new(PerformanceLearner::new(store.clone()));

        Ok(Self {
            config,
            store,
            notifier,
            browsers,
            rules,
            scheduler,
            dispatcher,
            monitor,
            risk,
            learner,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn rules(&self) -> &RuleCache {
        &self.rules
    }

    pub fn scheduler(&self) -> &CalendarScheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &OutcomeMonitor {
        &self.monitor
    }

    pub fn risk(&self) -> &RiskAdapter {
        &self.risk
    }

    pub fn learner(&self) -> &PerformanceLearner {
        &self.learner
    }

    /// Close the browser, if one was started
    pub async fn shutdown(&self) {
        self.browsers.shutdown().await;
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> Result<()> {
        let recovered = self.store.recover_in_flight().await?;
        if recovered > 0 {
            warn!("Re-queued {} requests left in flight by the last run", recovered);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let window = Duration::from_secs(self.config.scheduler.batch_window_secs);
        let (accumulator, batches) = BatchAccumulator::new(window);
        let accumulator = Arc::new(accumulator);

        let mut handles = vec![
            self.spawn_intake(accumulator.clone(), shutdown_tx.subscribe()),
            self.spawn_batches(batches, shutdown_tx.subscribe()),
        ];
        for job in self.jobs()? {
            handles.push(job.spawn(shutdown_tx.subscribe()));
        }

        info!(
            "postline running for {} actors (batch window {}s)",
            self.config.actors.len(),
            window.as_secs()
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutting down...");
        let _ = shutdown_tx.send(());

        // Close what is still accumulating instead of dropping it
        for batch in accumulator.flush_all().await {
            self.schedule(batch).await;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.shutdown().await;
        info!("postline stopped");
        Ok(())
    }

    fn jobs(&self) -> Result<Vec<Job>> {
        let dispatcher = self.dispatcher.clone();
        let monitor = self.monitor.clone();
        let risk = self.risk.clone();
        let learner = self.learner.clone();

        Ok(vec![
            Job::new(
                "dispatch",
                JobSchedule::every_secs(self.config.executor.dispatch_interval_secs),
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        let report = dispatcher.dispatch_due().await?;
                        Ok(format!("{:?}", report))
                    }
                },
            ),
            Job::new(
                "monitor",
                JobSchedule::every_secs(self.config.monitor.interval_secs),
                move || {
                    let monitor = monitor.clone();
                    async move {
                        let report = monitor.run_cycle().await?;
                        Ok(format!("{:?}", report))
                    }
                },
            ),
            Job::new("risk-sweep", JobSchedule::cron(&self.config.monitor.risk_sweep_cron)?, move || {
                let risk = risk.clone();
                async move { Ok(format!("{} profiles", risk.sweep().await?)) }
            }),
            Job::new(
                "learner",
                JobSchedule::every_secs(self.config.learner.interval_secs),
                move || {
                    let learner = learner.clone();
                    async move { Ok(format!("{} actors", learner.recompute_all().await?)) }
                },
            ),
        ])
    }

    /// Move intake rows into the accumulator
    fn spawn_intake(
        &self,
        accumulator: Arc<BatchAccumulator>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let every = Duration::from_secs(self.config.scheduler.intake_poll_secs.max(1));
        tokio::spawn(async move {
            loop {
                match store.take_intake(INTAKE_BATCH).await {
                    Ok(entries) => {
                        for entry in entries {
                            debug!("Intake {} for {}: {}", entry.id, entry.actor, entry.content.id);
                            accumulator.push(entry.actor, entry.content).await;
                        }
                    }
                    Err(e) => warn!("Intake poll failed: {}", e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(every) => {}
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Schedule closed batches as they arrive
    fn spawn_batches(
        &self,
        mut batches: tokio::sync::mpsc::Receiver<Batch>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    batch = batches.recv() => match batch {
                        Some(batch) => schedule_batch(&scheduler, batch).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    async fn schedule(&self, batch: Batch) {
        schedule_batch(&self.scheduler, batch).await
    }
}

async fn schedule_batch(scheduler: &CalendarScheduler, batch: Batch) {
    let count = batch.items.len();
    match scheduler.schedule_batch(&batch.actor, batch.items).await {
        Ok(outcome) => info!(
            "Batch of {} for {}: {} queued, {} duplicates, {} overflow",
            count,
            batch.actor,
            outcome.queued.len(),
            outcome.duplicates,
            outcome.overflow.len()
        ),
        Err(e) => error!("Scheduling a batch of {} for {} failed: {:#}", count, batch.actor, e),
    }
}
