//! Cron-driven maintenance scheduler
//!
//! Each job has a cron cadence (seconds-resolution, UTC). The scheduler
//! ticks, finds due jobs, and runs them user by user, checking the
//! cancellation token between users. Transient failures retry with
//! exponential backoff capped at the configured attempt limit; fatal
//! failures are logged against the affected user and the job moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::deadline::{CancelToken, Deadline};
use crate::error::{CoreError, CoreResult};

/// Retained job-run history entries
const HISTORY_CAP: usize = 100;

/// Per-user consolidation deadline
const CONSOLIDATION_DEADLINE: Duration = Duration::from_secs(600);

/// The maintenance jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Nightly CRS batch recompute
    CrsRecompute,
    /// Nightly tier evaluation, after recompute
    TierEvaluation,
    /// Nightly consolidation, after evaluation
    Consolidation,
    /// Weekly topic key rotation
    KeyRotation,
    /// Daily archive purge
    ArchivePurge,
}

impl JobKind {
    /// Stable job name for logs and history
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::CrsRecompute => "crs_recompute",
            JobKind::TierEvaluation => "tier_evaluation",
            JobKind::Consolidation => "consolidation",
            JobKind::KeyRotation => "key_rotation",
            JobKind::ArchivePurge => "archive_purge",
        }
    }

    /// All jobs in their nightly execution order
    pub fn ordered() -> [JobKind; 5] {
        [
            JobKind::CrsRecompute,
            JobKind::TierEvaluation,
            JobKind::Consolidation,
            JobKind::KeyRotation,
            JobKind::ArchivePurge,
        ]
    }
}

/// How one job run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Ran to completion
    Completed,
    /// Cancelled mid-run; work already committed stays
    Cancelled,
    /// Failed after retries
    Failed {
        /// Final error description
        error: String,
        /// Whether the failure was classified fatal (no retry)
        fatal: bool,
    },
}

/// One recorded job run
#[derive(Debug, Clone)]
pub struct JobRun {
    /// Which job
    pub job: JobKind,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Outcome
    pub outcome: JobOutcome,
    /// Users processed before finishing
    pub users_processed: usize,
    /// Items/units the job reported touching
    pub units: usize,
    /// Retries consumed across users
    pub retries: u32,
}

/// The operations the scheduler drives, implemented by the core
#[async_trait]
pub trait MaintenanceTarget: Send + Sync {
    /// Users with stored items
    fn user_ids(&self) -> CoreResult<Vec<String>>;

    /// Recompute CRS scores for one user; returns items rescored
    async fn recompute_user(&self, user_id: &str, cancel: &CancelToken) -> CoreResult<usize>;

    /// Evaluate tier transitions for one user, applying demotions and
    /// queueing promotions for consolidation; returns transitions planned
    async fn evaluate_user(&self, user_id: &str, cancel: &CancelToken) -> CoreResult<usize>;

    /// Consolidate one user's queued promotions; returns items moved.
    /// Idempotent: groups whose sources are already archived are skipped.
    async fn consolidate_user(
        &self,
        user_id: &str,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> CoreResult<usize>;

    /// Rotate every topic's keys; returns topics rotated
    async fn rotate_keys(&self, cancel: &CancelToken) -> CoreResult<usize>;

    /// Purge one user's expired archives; returns items erased
    async fn purge_user(&self, user_id: &str, cancel: &CancelToken) -> CoreResult<usize>;
}

struct JobState {
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
}

/// The scheduler
pub struct Scheduler {
    target: Arc<dyn MaintenanceTarget>,
    jobs: Mutex<HashMap<JobKind, JobState>>,
    history: Mutex<VecDeque<JobRun>>,
    max_retries: u32,
    cancel: CancelToken,
}

impl Scheduler {
    /// Build a scheduler from the configured cadences
    pub fn new(target: Arc<dyn MaintenanceTarget>, config: &SchedulerConfig) -> CoreResult<Self> {
        let mut jobs = HashMap::new();
        for (kind, expr) in [
            (JobKind::CrsRecompute, &config.crs_recompute),
            (JobKind::TierEvaluation, &config.tier_evaluation),
            (JobKind::Consolidation, &config.consolidation),
            (JobKind::KeyRotation, &config.key_rotation),
            (JobKind::ArchivePurge, &config.archive_purge),
        ] {
            let schedule = Schedule::from_str(expr).map_err(|e| {
                CoreError::Validation(format!("invalid cron '{expr}' for {}: {e}", kind.name()))
            })?;
            let next_run = schedule.upcoming(Utc).next();
            jobs.insert(kind, JobState { schedule, next_run });
        }
        Ok(Self {
            target,
            jobs: Mutex::new(jobs),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            max_retries: config.max_retries,
            cancel: CancelToken::new(),
        })
    }

    /// The scheduler-wide cancellation handle
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Recent job runs, newest last
    pub fn history(&self) -> Vec<JobRun> {
        self.history.lock().iter().cloned().collect()
    }

    fn record(&self, run: JobRun) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(run);
    }

    /// Run the tick loop until cancelled. Due jobs execute in their
    /// nightly order so evaluation follows recompute and consolidation
    /// follows evaluation.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if self.cancel.is_cancelled() {
                tracing::info!("scheduler stopped");
                return;
            }
            let now = Utc::now();
            for kind in JobKind::ordered() {
                let due = {
                    let mut jobs = self.jobs.lock();
                    let state = match jobs.get_mut(&kind) {
                        Some(state) => state,
                        None => continue,
                    };
                    match state.next_run {
                        Some(at) if at <= now => {
                            state.next_run = state.schedule.upcoming(Utc).next();
                            true
                        }
                        _ => false,
                    }
                };
                if due {
                    self.run_job(kind).await;
                }
            }
        }
    }

    /// Run one job immediately (on-demand trigger)
    pub async fn run_job(&self, kind: JobKind) -> JobRun {
        let started_at = Utc::now();
        tracing::info!(job = kind.name(), "job started");

        let outcome = match kind {
            JobKind::KeyRotation => self.run_global(kind).await,
            _ => self.run_per_user(kind).await,
        };

        let run = JobRun {
            job: kind,
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.0,
            users_processed: outcome.1,
            units: outcome.2,
            retries: outcome.3,
        };
        tracing::info!(
            job = kind.name(),
            outcome = ?run.outcome,
            users = run.users_processed,
            units = run.units,
            "job finished"
        );
        self.record(run.clone());
        run
    }

    async fn run_global(&self, kind: JobKind) -> (JobOutcome, usize, usize, u32) {
        let mut retries = 0;
        match self
            .with_retries(kind, "-", &mut retries, || async {
                self.target.rotate_keys(&self.cancel).await
            })
            .await
        {
            Ok(units) => (JobOutcome::Completed, 0, units, retries),
            Err(CoreError::DeadlineExceeded(_)) if self.cancel.is_cancelled() => {
                (JobOutcome::Cancelled, 0, 0, retries)
            }
            Err(e) => (
                JobOutcome::Failed {
                    error: e.to_string(),
                    fatal: !is_transient(&e),
                },
                0,
                0,
                retries,
            ),
        }
    }

    async fn run_per_user(&self, kind: JobKind) -> (JobOutcome, usize, usize, u32) {
        let users = match self.target.user_ids() {
            Ok(users) => users,
            Err(e) => {
                return (
                    JobOutcome::Failed {
                        error: e.to_string(),
                        fatal: true,
                    },
                    0,
                    0,
                    0,
                )
            }
        };

        let mut units = 0;
        let mut processed = 0;
        let mut retries = 0;
        for user_id in users {
            if self.cancel.is_cancelled() {
                return (JobOutcome::Cancelled, processed, units, retries);
            }
            let result = self
                .with_retries(kind, &user_id, &mut retries, || async {
                    self.dispatch(kind, &user_id).await
                })
                .await;
            match result {
                Ok(n) => {
                    units += n;
                    processed += 1;
                }
                Err(e) => {
                    // Per-user isolation: one user's failure never blocks
                    // the rest of the fleet.
                    tracing::error!(
                        job = kind.name(),
                        %user_id,
                        error = %e,
                        fatal = !is_transient(&e),
                        "job failed for user"
                    );
                }
            }
        }
        (JobOutcome::Completed, processed, units, retries)
    }

    async fn dispatch(&self, kind: JobKind, user_id: &str) -> CoreResult<usize> {
        match kind {
            JobKind::CrsRecompute => self.target.recompute_user(user_id, &self.cancel).await,
            JobKind::TierEvaluation => self.target.evaluate_user(user_id, &self.cancel).await,
            JobKind::Consolidation => {
                self.target
                    .consolidate_user(
                        user_id,
                        Deadline::after(CONSOLIDATION_DEADLINE),
                        &self.cancel,
                    )
                    .await
            }
            JobKind::ArchivePurge => self.target.purge_user(user_id, &self.cancel).await,
            JobKind::KeyRotation => self.target.rotate_keys(&self.cancel).await,
        }
    }

    async fn with_retries<F, Fut>(
        &self,
        kind: JobKind,
        user_id: &str,
        retries: &mut u32,
        operation: F,
    ) -> CoreResult<usize>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = CoreResult<usize>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(n) => return Ok(n),
                Err(e) if is_transient(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    *retries += 1;
                    let backoff = Duration::from_secs(1u64 << attempt.min(6));
                    tracing::warn!(
                        job = kind.name(),
                        user_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "transient job failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Transient failures retry; everything else is fatal for that user
fn is_transient(error: &CoreError) -> bool {
    matches!(
        error,
        CoreError::BackendUnavailable { .. }
            | CoreError::Overloaded(_)
            | CoreError::RateLimited { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTarget {
        recompute_calls: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl FakeTarget {
        fn new(fail_first: usize) -> Self {
            Self {
                recompute_calls: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(fail_first),
            }
        }
    }

    #[async_trait]
    impl MaintenanceTarget for FakeTarget {
        fn user_ids(&self) -> CoreResult<Vec<String>> {
            Ok(vec!["u1".to_string(), "u2".to_string()])
        }

        async fn recompute_user(&self, _user: &str, _cancel: &CancelToken) -> CoreResult<usize> {
            self.recompute_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(CoreError::BackendUnavailable {
                    backend: "fake".to_string(),
                    reason: "transient".to_string(),
                });
            }
            Ok(3)
        }

        async fn evaluate_user(&self, _user: &str, _cancel: &CancelToken) -> CoreResult<usize> {
            Ok(0)
        }

        async fn consolidate_user(
            &self,
            _user: &str,
            _deadline: Deadline,
            _cancel: &CancelToken,
        ) -> CoreResult<usize> {
            Ok(0)
        }

        async fn rotate_keys(&self, _cancel: &CancelToken) -> CoreResult<usize> {
            Ok(2)
        }

        async fn purge_user(&self, _user: &str, _cancel: &CancelToken) -> CoreResult<usize> {
            Ok(0)
        }
    }

    fn scheduler(target: Arc<FakeTarget>) -> Scheduler {
        Scheduler::new(target, &SchedulerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_per_user_job_processes_all_users() {
        let target = Arc::new(FakeTarget::new(0));
        let sched = scheduler(target.clone());
        let run = sched.run_job(JobKind::CrsRecompute).await;
        assert_eq!(run.outcome, JobOutcome::Completed);
        assert_eq!(run.users_processed, 2);
        assert_eq!(run.units, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_with_backoff() {
        let target = Arc::new(FakeTarget::new(1));
        let sched = scheduler(target.clone());
        let run = sched.run_job(JobKind::CrsRecompute).await;
        assert_eq!(run.outcome, JobOutcome::Completed);
        assert_eq!(run.retries, 1);
        // first user retried once, second succeeded directly
        assert_eq!(target.recompute_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_users() {
        let target = Arc::new(FakeTarget::new(0));
        let sched = scheduler(target);
        sched.cancel_token().cancel();
        let run = sched.run_job(JobKind::CrsRecompute).await;
        assert_eq!(run.outcome, JobOutcome::Cancelled);
        assert_eq!(run.users_processed, 0);
    }

    #[tokio::test]
    async fn test_global_rotation_job() {
        let target = Arc::new(FakeTarget::new(0));
        let sched = scheduler(target);
        let run = sched.run_job(JobKind::KeyRotation).await;
        assert_eq!(run.outcome, JobOutcome::Completed);
        assert_eq!(run.units, 2);
    }

    #[tokio::test]
    async fn test_history_records_runs() {
        let target = Arc::new(FakeTarget::new(0));
        let sched = scheduler(target);
        sched.run_job(JobKind::ArchivePurge).await;
        sched.run_job(JobKind::KeyRotation).await;
        let history = sched.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].job, JobKind::ArchivePurge);
        assert_eq!(history[1].job, JobKind::KeyRotation);
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let mut config = SchedulerConfig::default();
        config.crs_recompute = "not a cron".to_string();
        let target = Arc::new(FakeTarget::new(0));
        assert!(Scheduler::new(target, &config).is_err());
    }
}
