//! Periodic background jobs
//!
//! Each job runs in its own task and awaits its own run before sleeping
//! again, so a slow run delays the next one instead of overlapping it.

use anyhow::Result;
use chrono::Utc;
use cron::Schedule;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Fixed delay between the end of one run and the start of the next
    Interval(Duration),
    /// Six-field cron expression (seconds first), in UTC
    Cron(Schedule),
}

impl JobSchedule {
    pub fn every_secs(secs: u64) -> Self {
        JobSchedule::Interval(Duration::from_secs(secs.max(1)))
    }

    pub fn cron(expr: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expr)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))?;
        Ok(JobSchedule::Cron(schedule))
    }

    /// Time to wait before the next run
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            JobSchedule::Interval(every) => Some(*every),
            JobSchedule::Cron(schedule) => {
                let next = schedule.upcoming(Utc).next()?;
                Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Job body; the returned string is logged as the run summary
pub type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

pub struct Job {
    pub name: String,
    pub schedule: JobSchedule,
    run: JobFn,
}

impl Job {
    pub fn new<F, Fut>(name: &str, schedule: JobSchedule, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            schedule,
            run: Arc::new(move || Box::pin(run())),
        }
    }

    /// Run until shutdown is signalled
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Job '{}' started ({:?})", self.name, self.schedule);
            let mut failures = 0u32;
            loop {
                let Some(delay) = self.schedule.next_delay() else {
                    warn!("Job '{}' has no upcoming run", self.name);
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => break,
                }

                let start = Instant::now();
                match (self.run)().await {
                    Ok(summary) => {
                        failures = 0;
                        debug!("Job '{}' done in {}ms: {}", self.name, start.elapsed().as_millis(), summary);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!("Job '{}' failed ({} in a row): {}", self.name, failures, e);
                    }
                }
            }
            info!("Job '{}' stopped", self.name);
        })
    }
}
