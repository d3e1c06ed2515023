use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{truncate_to_minute, Clock};

/// When a job becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Second :00 of every minute.
    EveryMinute,
    /// Second :00 of the given minute of every hour.
    HourlyAt { minute: u32 },
}

impl Cadence {
    /// First boundary strictly after `now`.
    pub fn next_after(self, now: NaiveDateTime) -> NaiveDateTime {
        let minute_start = truncate_to_minute(now);
        match self {
            Self::EveryMinute => minute_start + TimeDelta::minutes(1),
            Self::HourlyAt { minute } => {
                let hour_start = minute_start - TimeDelta::minutes(i64::from(minute_start.minute()));
                let candidate = hour_start + TimeDelta::minutes(i64::from(minute % 60));
                if candidate > now {
                    candidate
                } else {
                    candidate + TimeDelta::hours(1)
                }
            }
        }
    }
}

/// Job callback; receives the poll time that found it due.
pub type JobFn = Box<dyn FnMut(NaiveDateTime) + Send>;

struct Job {
    name: &'static str,
    cadence: Cadence,
    next_run: NaiveDateTime,
    callback: JobFn,
}

/// Cooperative wall-clock scheduler.
///
/// Due jobs run one after another in registration order. Under [`Scheduler::run`]
/// they run on the blocking pool, so jobs may do file I/O.
pub struct Scheduler {
    poll: Duration,
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new(poll: Duration) -> Self {
        Self {
            poll,
            jobs: Vec::new(),
        }
    }

    /// Register a job whose first run is the first boundary after `now`.
    pub fn add(&mut self, name: &'static str, cadence: Cadence, now: NaiveDateTime, callback: JobFn) {
        let next_run = cadence.next_after(now);
        debug!(job = name, next_run = %next_run, "job registered");
        self.jobs.push(Job {
            name,
            cadence,
            next_run,
            callback,
        });
    }

    pub fn every_minute<F>(&mut self, name: &'static str, now: NaiveDateTime, callback: F)
    where
        F: FnMut(NaiveDateTime) + Send + 'static,
    {
        self.add(name, Cadence::EveryMinute, now, Box::new(callback));
    }

    pub fn hourly_at<F>(&mut self, name: &'static str, minute: u32, now: NaiveDateTime, callback: F)
    where
        F: FnMut(NaiveDateTime) + Send + 'static,
    {
        self.add(name, Cadence::HourlyAt { minute }, now, Box::new(callback));
    }

    /// Run every job due at `now` and reschedule it. Returns how many ran.
    ///
    /// A job that missed several boundaries runs once and moves to the first
    /// boundary after `now`.
    pub fn run_pending(&mut self, now: NaiveDateTime) -> usize {
        let mut ran = 0;
        for job in self.jobs.iter_mut().filter(|job| job.next_run <= now) {
            (job.callback)(now);
            job.next_run = job.cadence.next_after(now);
            ran += 1;
        }
        ran
    }

    /// Whether any job is due at `now`.
    pub fn has_due(&self, now: NaiveDateTime) -> bool {
        self.jobs.iter().any(|job| job.next_run <= now)
    }

    pub fn next_run(&self, name: &str) -> Option<NaiveDateTime> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .map(|job| job.next_run)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Poll until `cancel` fires.
    pub async fn run<C: Clock>(mut self, clock: &C, cancel: CancellationToken) {
        info!(jobs = self.jobs.len(), poll = ?self.poll, "scheduler started");

        loop {
            let now = clock.now();
            if self.has_due(now) {
                let handle = tokio::task::spawn_blocking(move || {
                    let ran = self.run_pending(now);
                    (self, ran)
                });
                match handle.await {
                    Ok((scheduler, ran)) => {
                        self = scheduler;
                        debug!(ran, now = %now, "jobs ran");
                    }
                    Err(e) => {
                        error!(error = %e, "scheduled jobs panicked");
                        break;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = clock.sleep(self.poll) => {}
            }
        }

        info!("scheduler stopped");
    }
}
