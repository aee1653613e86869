//! Interval Scheduler.
//!
//! Every job runs in its own task and ticks at `start + k * period`. Ticks that
//! are missed while a callback is still running are skipped, so a slow callback
//! delays only its own job.

use crate::device::{Callback, WeakDeviceHandle};
use crate::validate::ValidationError;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval(Duration);

impl Interval {
    pub fn every(period: Duration) -> Self {
        Self(period)
    }

    pub fn seconds(seconds: u64) -> Self {
        Self(Duration::from_secs(seconds))
    }

    pub fn minutes(minutes: u64) -> Self {
        Self(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn hours(hours: u64) -> Self {
        Self(Duration::from_secs(hours.saturating_mul(3600)))
    }

    pub fn period(&self) -> Duration {
        self.0
    }

    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.0.is_zero() {
            Err(ValidationError::InvalidInterval(
                "period must be greater than zero".to_string(),
            ))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every {:?}", self.0)
    }
}

struct Job {
    interval: Interval,
    callback: Callback,
}

struct Running {
    device: WeakDeviceHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
    running: Option<Running>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Adds a job. Jobs added while the scheduler runs start right away.
    pub fn add(&mut self, interval: Interval, callback: Callback) -> Result<(), ValidationError> {
        let interval = interval.validate()?;
        if let Some(running) = &mut self.running {
            running.tasks.push(spawn_job(
                interval,
                callback.clone(),
                running.device.clone(),
                running.cancel.child_token(),
            ));
        }
        self.jobs.push(Job { interval, callback });
        Ok(())
    }

    pub fn start(&mut self, device: WeakDeviceHandle) {
        if self.running.is_some() {
            debug!("Scheduler already running");
            return;
        }
        let cancel = CancellationToken::new();
        let tasks = self
            .jobs
            .iter()
            .map(|job| {
                spawn_job(
                    job.interval,
                    job.callback.clone(),
                    device.clone(),
                    cancel.child_token(),
                )
            })
            .collect();
        info!("Scheduler started with {} job(s)", self.jobs.len());
        self.running = Some(Running {
            device,
            cancel,
            tasks,
        });
    }

    /// Cancels every job and waits for the job tasks to finish.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            let _ = task.await;
        }
        info!("Scheduler stopped");
    }
}

fn spawn_job(
    interval: Interval,
    callback: Callback,
    device: WeakDeviceHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = interval.period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(device) = device.upgrade() else {
                debug!("Device dropped, ending interval job");
                break;
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = callback.run(device, ()) => {}
            }
        }
    })
}
