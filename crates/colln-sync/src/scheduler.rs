//! Periodic driver of collection runs. At most one run is in flight; a run
//! becomes due one period after the previous start.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::run::{Collection, RunError, RunReport};

type RunHandle = JoinHandle<Result<RunReport, RunError>>;

/// Source of run futures for the scheduler.
pub trait RunFactory: Send + Sync {
    fn start(&self) -> BoxFuture<'static, Result<RunReport, RunError>>;
}

impl RunFactory for Arc<Collection> {
    fn start(&self) -> BoxFuture<'static, Result<RunReport, RunError>> {
        let collection = Arc::clone(self);
        Box::pin(async move { collection.run_once().await })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub runs_started: usize,
    pub runs_completed: usize,
}

pub struct Scheduler<F> {
    factory: F,
    period: Duration,
    drain_timeout: Duration,
    tick: Duration,
}

impl<F: RunFactory> Scheduler<F> {
    pub fn new(factory: F, period: Duration, drain_timeout: Duration) -> Self {
        Self {
            factory,
            period: period.max(Duration::from_secs(1)),
            drain_timeout,
            tick: Duration::from_secs(1),
        }
    }

    /// Runs until `shutdown` resolves or a run fails. On shutdown the in-flight
    /// run gets `drain_timeout` to finish before it is aborted.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<SchedulerSummary, RunError> {
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut summary = SchedulerSummary::default();
        let mut in_flight: Option<RunHandle> = None;
        let mut next_due = Instant::now();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("stopping collection on signal");
                    if let Some(handle) = in_flight.take() {
                        self.drain(handle).await;
                    }
                    return Ok(summary);
                }
                joined = join_run(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    let report = joined
                        .map_err(|err| RunError::Panicked(err.to_string()))
                        .and_then(|result| result);
                    if let Err(err) = report {
                        error!(error = %err, "failed to collect, stopping scheduler");
                        return Err(err);
                    }
                    summary.runs_completed += 1;

                    let now = Instant::now();
                    while next_due <= now {
                        next_due += self.period;
                    }
                    info!(
                        next_in = %humantime::format_duration(next_due - now),
                        "next collection scheduled"
                    );
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if in_flight.is_none() && now >= next_due {
                        next_due = now + self.period;
                        summary.runs_started += 1;
                        info!(run = summary.runs_started, "starting collection run");
                        in_flight = Some(tokio::spawn(self.factory.start()));
                    }
                }
            }
        }
    }

    async fn drain(&self, mut handle: RunHandle) {
        match time::timeout(self.drain_timeout, &mut handle).await {
            Ok(Ok(Ok(report))) => info!(run_id = %report.run_id, "in-flight run finished before shutdown"),
            Ok(Ok(Err(err))) => warn!(error = %err, "in-flight run failed during shutdown"),
            Ok(Err(err)) => warn!(error = %err, "in-flight run did not complete"),
            Err(_) => {
                warn!(
                    drain_timeout = %humantime::format_duration(self.drain_timeout),
                    "in-flight run did not finish in time, aborting"
                );
                handle.abort();
            }
        }
    }
}

async fn join_run(handle: &mut Option<RunHandle>) -> Result<Result<RunReport, RunError>, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    struct TimedRuns {
        base: Instant,
        run_time: Duration,
        fail_on: Option<usize>,
        starts: Arc<Mutex<Vec<Duration>>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl TimedRuns {
        fn new(run_time: Duration) -> Self {
            Self {
                base: Instant::now(),
                run_time,
                fail_on: None,
                starts: Arc::default(),
                active: Arc::default(),
                max_active: Arc::default(),
            }
        }
    }

    fn report() -> RunReport {
        let at: DateTime<chrono::FixedOffset> = Utc::now().fixed_offset();
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: at,
            finished_at: at,
            top_count: 0,
            home_count: 0,
            extracted: 0,
            cached: 0,
            skipped: 0,
            ignored_errors: 0,
            fatal_errors: 0,
            dump_file: PathBuf::from("dump.json.gz"),
            dump_sha256: String::new(),
            list_files: Vec::new(),
        }
    }

    impl RunFactory for TimedRuns {
        fn start(&self) -> BoxFuture<'static, Result<RunReport, RunError>> {
            let run_no = {
                let mut starts = self.starts.lock().expect("starts");
                starts.push(self.base.elapsed());
                starts.len()
            };
            let active = Arc::clone(&self.active);
            let max_active = Arc::clone(&self.max_active);
            let run_time = self.run_time;
            let fail = self.fail_on == Some(run_no);
            Box::pin(async move {
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now_active, Ordering::SeqCst);
                time::sleep(run_time).await;
                active.fetch_sub(1, Ordering::SeqCst);
                if fail {
                    return Err(RunError::Panicked("boom".into()));
                }
                Ok(report())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_runs_skip_overdue_slots_instead_of_queueing() {
        let runs = TimedRuns::new(Duration::from_secs(25));
        let starts = Arc::clone(&runs.starts);
        let max_active = Arc::clone(&runs.max_active);

        let scheduler = Scheduler::new(runs, Duration::from_secs(10), Duration::from_secs(1));
        let summary = scheduler
            .run(time::sleep(Duration::from_secs(65)))
            .await
            .expect("scheduler");

        let starts: Vec<u64> = starts.lock().expect("starts").iter().map(Duration::as_secs).collect();
        assert_eq!(starts, vec![0, 30, 60]);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(summary.runs_started, 3);
        assert_eq!(summary.runs_completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_runs_start_once_per_period() {
        let runs = TimedRuns::new(Duration::from_secs(2));
        let starts = Arc::clone(&runs.starts);

        let scheduler = Scheduler::new(runs, Duration::from_secs(10), Duration::from_secs(1));
        let summary = scheduler
            .run(time::sleep(Duration::from_secs(25)))
            .await
            .expect("scheduler");

        let starts: Vec<u64> = starts.lock().expect("starts").iter().map(Duration::as_secs).collect();
        assert_eq!(starts, vec![0, 10, 20]);
        assert_eq!(summary.runs_completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_stops_the_scheduler() {
        let mut runs = TimedRuns::new(Duration::from_secs(2));
        runs.fail_on = Some(2);
        let starts = Arc::clone(&runs.starts);

        let scheduler = Scheduler::new(runs, Duration::from_secs(10), Duration::from_secs(1));
        let err = scheduler
            .run(std::future::pending())
            .await
            .expect_err("failure");

        assert!(matches!(err, RunError::Panicked(_)));
        assert_eq!(starts.lock().expect("starts").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_a_run_that_finishes_in_time() {
        let runs = TimedRuns::new(Duration::from_secs(5));
        let active = Arc::clone(&runs.active);

        let scheduler = Scheduler::new(runs, Duration::from_secs(60), Duration::from_secs(10));
        let summary = scheduler
            .run(time::sleep(Duration::from_secs(2)))
            .await
            .expect("scheduler");

        assert_eq!(summary.runs_started, 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_a_run_past_the_drain_window() {
        let runs = TimedRuns::new(Duration::from_secs(600));
        let active = Arc::clone(&runs.active);
        let base = Instant::now();

        let scheduler = Scheduler::new(runs, Duration::from_secs(60), Duration::from_secs(10));
        scheduler
            .run(time::sleep(Duration::from_secs(2)))
            .await
            .expect("scheduler");

        assert_eq!(base.elapsed().as_secs(), 12);
        assert_eq!(active.load(Ordering::SeqCst), 1);
    }
}
