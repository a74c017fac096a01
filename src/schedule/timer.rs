//! Daily trigger
//!
//! The schedule is stored in civil time; the trigger runs in UTC. The hosting
//! platform's scheduler is modelled by [`Scheduler`]; [`TokioScheduler`] is the
//! in-process implementation used when the service runs standalone.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const MINUTES_PER_DAY: i32 = 24 * 60;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid time of day {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Registers the single recurring backup trigger
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Replace any existing trigger; `enabled == false` removes it
    async fn register_daily(
        &self,
        utc_hour: u32,
        utc_minute: u32,
        token: &str,
        enabled: bool,
    ) -> Result<(), SchedulerError>;
}

/// Work invoked when the trigger fires
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run_scheduled(&self, token: &str);
}

/// Convert a civil time at `offset_minutes` east of UTC to UTC
pub fn civil_to_utc(hour: u32, minute: u32, offset_minutes: i32) -> (u32, u32) {
    let civil = (hour * 60 + minute) as i32;
    let utc = (civil - offset_minutes).rem_euclid(MINUTES_PER_DAY) as u32;
    (utc / 60, utc % 60)
}

/// Next instant strictly after `now` at `hour:minute` UTC
pub fn next_occurrence(now: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        Some(today)
    } else {
        today.checked_add_days(Days::new(1))
    }
}

/// Sleeps until the next occurrence, starts the job, repeats
pub struct TokioScheduler {
    job: Arc<dyn ScheduledJob>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new(job: Arc<dyn ScheduledJob>) -> Self {
        Self {
            job,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn register_daily(
        &self,
        utc_hour: u32,
        utc_minute: u32,
        token: &str,
        enabled: bool,
    ) -> Result<(), SchedulerError> {
        if NaiveTime::from_hms_opt(utc_hour, utc_minute, 0).is_none() {
            return Err(SchedulerError::InvalidTime {
                hour: utc_hour,
                minute: utc_minute,
            });
        }

        let mut slot = self
            .handle
            .lock()
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        if !enabled {
            info!("Daily backup trigger disabled");
            return Ok(());
        }

        let job = Arc::clone(&self.job);
        let token = token.to_string();
        *slot = Some(tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = next_occurrence(now, utc_hour, utc_minute) else {
                    warn!("No next occurrence for {:02}:{:02} UTC", utc_hour, utc_minute);
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                info!("Next scheduled backup at {}", next.to_rfc3339());
                tokio::time::sleep(wait).await;

                // Runs outside the trigger task; re-registering only stops future triggers
                let job = Arc::clone(&job);
                let token = token.clone();
                tokio::spawn(async move { job.run_scheduled(&token).await });
            }
        }));

        info!("Daily backup trigger set for {:02}:{:02} UTC", utc_hour, utc_minute);
        Ok(())
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_civil_to_utc_wraps_to_previous_day() {
        // 02:00 at UTC+05:30 is 20:30 UTC the day before
        assert_eq!(civil_to_utc(2, 0, 330), (20, 30));
        assert_eq!(civil_to_utc(12, 15, 330), (6, 45));
        assert_eq!(civil_to_utc(23, 0, -120), (1, 0));
        assert_eq!(civil_to_utc(9, 0, 0), (9, 0));
    }

    #[test]
    fn test_next_occurrence_rolls_over_midnight() {
        let now: DateTime<Utc> = "2026-10-15T21:00:00Z".parse().unwrap();

        let later_today = next_occurrence(now, 22, 0).unwrap();
        let tomorrow = next_occurrence(now, 20, 30).unwrap();
        let exactly_now = next_occurrence(now, 21, 0).unwrap();

        assert_eq!(later_today.to_rfc3339(), "2026-10-15T22:00:00+00:00");
        assert_eq!(tomorrow.to_rfc3339(), "2026-10-16T20:30:00+00:00");
        assert_eq!(exactly_now.to_rfc3339(), "2026-10-16T21:00:00+00:00");
    }

    struct CountingJob(AtomicUsize);

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn run_scheduled(&self, _token: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_time() {
        let scheduler = TokioScheduler::new(Arc::new(CountingJob(AtomicUsize::new(0))));
        assert!(matches!(
            scheduler.register_daily(24, 0, "token", true).await,
            Err(SchedulerError::InvalidTime { hour: 24, minute: 0 })
        ));
    }

    #[derive(Default)]
    struct SlowJob {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl ScheduledJob for SlowJob {
        async fn run_scheduled(&self, _token: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_lets_a_running_backup_finish() {
        let job = Arc::new(SlowJob::default());
        let scheduler = TokioScheduler::new(job.clone());

        scheduler.register_daily(3, 0, "token", true).await.unwrap();
        while job.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        scheduler.register_daily(4, 0, "token", false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;

        assert_eq!(job.started.load(Ordering::SeqCst), 1);
        assert_eq!(job.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disable_clears_trigger() {
        let scheduler = TokioScheduler::new(Arc::new(CountingJob(AtomicUsize::new(0))));

        scheduler.register_daily(3, 0, "token", true).await.unwrap();
        assert!(scheduler.handle.lock().unwrap().is_some());

        scheduler.register_daily(3, 0, "token", false).await.unwrap();
        assert!(scheduler.handle.lock().unwrap().is_none());
    }
}
