//! Periodic job scheduler
//!
//! Single cooperative tick loop. Jobs declare a schedule (fixed period or
//! a daily UTC wall-clock time) and run sequentially within a tick, each
//! behind its own recover boundary: a job that errors or panics is logged
//! and the remaining due jobs still run. Graceful shutdown lands at the
//! next tick boundary.

use chrono::{DateTime, Timelike, Utc};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

type JobFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Run every `period`, first run one period after startup.
    Every(Duration),
    /// Run once per UTC day at hh:mm.
    DailyAtUtc { hour: u32, minute: u32 },
}

/// Pure due-check so the policy is testable without a clock.
fn is_due(schedule: Schedule, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match schedule {
        Schedule::Every(period) => match last_run {
            Some(last) => {
                now.signed_duration_since(last).to_std().unwrap_or_default() >= period
            }
            None => false, // anchored at registration
        },
        Schedule::DailyAtUtc { hour, minute } => {
            let past_wall_clock = (now.hour(), now.minute()) >= (hour, minute);
            let already_ran_today = last_run.is_some_and(|last| last.date_naive() == now.date_naive());
            past_wall_clock && !already_ran_today
        }
    }
}

struct Job {
    name: &'static str,
    schedule: Schedule,
    last_run: Option<DateTime<Utc>>,
    run: JobFn,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    tick: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            tick: Duration::from_secs(1),
        }
    }

    pub fn register<F, Fut>(&mut self, name: &'static str, schedule: Schedule, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!(job = name, ?schedule, "job registered");
        self.jobs.push(Job {
            name,
            schedule,
            // Every(...) jobs anchor here; DailyAtUtc jobs key off the date
            last_run: Some(Utc::now()),
            run: Box::new(move || Box::pin(job())),
        });
    }

    /// Run all currently due jobs sequentially, isolated from each other.
    /// Returns how many ran.
    pub async fn tick_once(&mut self) -> usize {
        let now = Utc::now();
        let mut ran = 0;
        for job in &mut self.jobs {
            if !is_due(job.schedule, job.last_run, now) {
                continue;
            }
            job.last_run = Some(now);
            ran += 1;
            // spawn so a panicking job surfaces as a JoinError instead of
            // unwinding through the scheduler
            let fut = (job.run)();
            match tokio::spawn(fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job = job.name, "job failed: {}", e),
                Err(e) => error!(job = job.name, "job panicked: {}", e),
            }
        }
        ran
    }

    /// Tick until shutdown. Jobs must be short or delegate heavy work.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler started with {} jobs", self.jobs.len());
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_every_schedule_due_after_period() {
        let schedule = Schedule::Every(Duration::from_secs(60));
        assert!(!is_due(schedule, Some(at(12, 0)), at(12, 0)));
        assert!(!is_due(schedule, Some(at(12, 0)), at(12, 0) + chrono::Duration::seconds(59)));
        assert!(is_due(schedule, Some(at(12, 0)), at(12, 1)));
    }

    #[test]
    fn test_daily_schedule_runs_once_per_day() {
        let schedule = Schedule::DailyAtUtc { hour: 0, minute: 0 };
        let yesterday = Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 30).unwrap();
        // past midnight, last ran yesterday -> due
        assert!(is_due(schedule, Some(yesterday), at(0, 0)));
        // already ran today -> not due again
        assert!(!is_due(schedule, Some(at(0, 0)), at(15, 30)));
    }

    #[tokio::test]
    async fn test_failing_job_does_not_skip_later_jobs() {
        let mut scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register("boom", Schedule::Every(Duration::ZERO), || async {
            anyhow::bail!("exploded")
        });
        scheduler.register("panic", Schedule::Every(Duration::ZERO), || async {
            panic!("hard crash")
        });
        let seen = counter.clone();
        scheduler.register("count", Schedule::Every(Duration::ZERO), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // zero-period jobs are due from the first tick onward
        tokio::time::sleep(Duration::from_millis(5)).await;
        let ran = scheduler.tick_once().await;
        assert_eq!(ran, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // and again next tick
        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler.tick_once().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
