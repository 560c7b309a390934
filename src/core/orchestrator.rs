use crate::core::rate_limit::{EmployerRateLimiter, RateLimit};
use crate::core::retry::BackoffPolicy;
use crate::core::shutdown::ShutdownSignal;
use crate::models::{ApplicationState, DedupKey, EligibleJob, SubmissionOutcome};
use crate::services::ledger::{start_of_tomorrow, ApplicationLedger, Claim, ClaimToken, LedgerError};
use crate::services::submission::SubmissionClient;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Tunables for the submission worker pool
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of concurrent submission workers
    pub workers: usize,
    /// Capacity of the bounded work queue between dispatcher and workers
    pub queue_capacity: usize,
    /// Total submission attempts allowed per key, including the first
    pub max_retries: u32,
    pub retry_backoff: BackoffPolicy,
    /// Backoff used while the ledger is unreachable
    pub ledger_backoff: BackoffPolicy,
    pub rate_limit: RateLimit,
    pub submission_timeout: Duration,
    pub shutdown_grace: Duration,
    /// SUBMITTING claims older than this are rolled back by `reclaim_stale`
    pub claim_lease: Duration,
    pub max_applications_per_day: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            max_retries: 3,
            retry_backoff: BackoffPolicy::default(),
            ledger_backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(5), 0.25),
            rate_limit: RateLimit::default(),
            submission_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(20),
            claim_lease: Duration::from_secs(120),
            max_applications_per_day: None,
        }
    }
}

/// What happened to one eligible job within a run
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Submitted,
    Failed { reason: String, attempts: u32 },
    SkippedDuplicate,
    /// Daily cap reached; the job may be offered again at `resume_at`
    Deferred { resume_at: DateTime<Utc> },
    /// Stopped by shutdown; the ledger record, if any, is back in PENDING
    Interrupted,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Submitted => "submitted",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::SkippedDuplicate => "skipped_duplicate",
            JobOutcome::Deferred { .. } => "deferred",
            JobOutcome::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub job: EligibleJob,
    pub outcome: JobOutcome,
}

/// Per-key outcomes of one orchestrator run
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<CompletedJob>,
}

impl RunReport {
    fn count(&self, predicate: impl Fn(&JobOutcome) -> bool) -> usize {
        self.completed.iter().filter(|c| predicate(&c.outcome)).count()
    }

    pub fn total(&self) -> usize {
        self.completed.len()
    }

    pub fn submitted(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Submitted))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::SkippedDuplicate))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Deferred { .. }))
    }

    pub fn interrupted(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Interrupted))
    }

    /// Outcome for a key; the last one wins if the key appeared more than once
    pub fn outcome(&self, key: &DedupKey) -> Option<&JobOutcome> {
        self.completed
            .iter()
            .rev()
            .find(|c| &c.job.key() == key)
            .map(|c| &c.outcome)
    }

    pub fn into_deferred(self) -> Vec<(EligibleJob, DateTime<Utc>)> {
        self.completed
            .into_iter()
            .filter_map(|c| match c.outcome {
                JobOutcome::Deferred { resume_at } => Some((c.job, resume_at)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug)]
struct WorkItem {
    job: EligibleJob,
    /// Retries already hold the in-process key claim
    owns_key: bool,
}

enum Step {
    Done(JobOutcome),
    Retry { failures: u32 },
}

enum Processed {
    Done(CompletedJob),
    Retry { item: WorkItem, failures: u32 },
}

enum LedgerFault {
    Interrupted,
    Error(LedgerError),
}

impl LedgerFault {
    fn into_step(self, attempts: u32) -> Step {
        match self {
            LedgerFault::Interrupted => Step::Done(JobOutcome::Interrupted),
            LedgerFault::Error(e) => Step::Done(JobOutcome::Failed {
                reason: format!("ledger error: {}", e),
                attempts,
            }),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    job: EligibleJob,
    claim: Option<ClaimToken>,
}

/// Keys currently held by this run's workers, used to roll back on abort
#[derive(Debug, Default)]
struct RunState {
    inflight: Mutex<HashMap<DedupKey, InFlight>>,
}

impl RunState {
    fn track(&self, key: DedupKey, job: EligibleJob) {
        self.inflight.lock().insert(
            key,
            InFlight { job, claim: None },
        );
    }

    fn set_claim(&self, key: &DedupKey, claim: Option<ClaimToken>) {
        if let Some(entry) = self.inflight.lock().get_mut(key) {
            entry.claim = claim;
        }
    }

    fn take(&self, key: &DedupKey) -> Option<InFlight> {
        self.inflight.lock().remove(key)
    }

    fn drain(&self) -> Vec<InFlight> {
        self.inflight.lock().drain().map(|(_, entry)| entry).collect()
    }
}

struct OrchestratorInner {
    ledger: Arc<dyn ApplicationLedger>,
    client: Arc<dyn SubmissionClient>,
    limiter: EmployerRateLimiter,
    config: OrchestratorConfig,
    /// Keys being processed by any run of this orchestrator
    active_keys: Mutex<HashSet<DedupKey>>,
}

/// Drives eligible jobs through the submission state machine
///
/// A single dispatcher feeds a bounded queue drained by a fixed pool of
/// workers. The ledger's atomic acquire is the source of truth for
/// deduplication and the daily cap; the in-process key set only
/// short-circuits duplicates that arrive while the first copy is still in
/// flight.
pub struct AutoApplyOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl AutoApplyOrchestrator {
    pub fn new(
        ledger: Arc<dyn ApplicationLedger>,
        client: Arc<dyn SubmissionClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                ledger,
                client,
                limiter: EmployerRateLimiter::new(config.rate_limit),
                config,
                active_keys: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn ledger(&self) -> &Arc<dyn ApplicationLedger> {
        &self.inner.ledger
    }

    /// Roll back SUBMITTING claims older than the claim lease
    ///
    /// Claims held by live workers are renewed before each submission and
    /// stay untouched, so this is safe while other processes share the ledger.
    pub async fn reclaim_stale(&self) -> Result<u64, LedgerError> {
        self.inner.ledger.reset_in_flight(self.inner.config.claim_lease).await
    }

    /// Process every job received until the input closes or shutdown fires
    ///
    /// On shutdown no further jobs are taken from `jobs`. Submissions already
    /// in progress get `shutdown_grace` to finish; anything still holding a
    /// ledger claim after that is rolled back to PENDING and reported as
    /// interrupted.
    pub async fn run(&self, mut jobs: mpsc::Receiver<EligibleJob>, mut shutdown: ShutdownSignal) -> RunReport {
        let config = &self.inner.config;
        let workers = config.workers.max(1);

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(config.queue_capacity.max(1));
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CompletedJob>();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<WorkItem>();
        let run = Arc::new(RunState::default());

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            pool.spawn(worker_loop(
                worker_id,
                self.inner.clone(),
                run.clone(),
                work_rx.clone(),
                done_tx.clone(),
                retry_tx.clone(),
                shutdown.clone(),
            ));
        }
        drop(retry_tx);

        tracing::info!("Orchestrator run started with {} worker(s)", workers);

        let mut completed = Vec::new();
        let mut outstanding = 0usize;
        let mut input_open = true;

        loop {
            if !input_open && outstanding == 0 {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    tracing::info!("Shutdown requested with {} job(s) outstanding", outstanding);
                    break;
                }
                Some(done) = done_rx.recv() => {
                    outstanding -= 1;
                    completed.push(done);
                }
                Some(item) = retry_rx.recv() => {
                    if let Err(item) = dispatch(&work_tx, &mut shutdown, item).await {
                        outstanding -= 1;
                        completed.push(self.inner.interrupt(item));
                    }
                }
                next = jobs.recv(), if input_open => match next {
                    Some(job) => {
                        outstanding += 1;
                        let item = WorkItem { job, owns_key: false };
                        if let Err(item) = dispatch(&work_tx, &mut shutdown, item).await {
                            outstanding -= 1;
                            completed.push(self.inner.interrupt(item));
                        }
                    }
                    None => input_open = false,
                }
            }
        }

        drop(work_tx);

        let grace = config.shutdown_grace;
        if tokio::time::timeout(grace, join_workers(&mut pool)).await.is_err() {
            tracing::warn!("Shutdown grace of {:?} elapsed, aborting {} worker(s)", grace, pool.len());
            pool.abort_all();
            join_workers(&mut pool).await;
        }

        {
            let mut queue = work_rx.lock().await;
            queue.close();
            while let Ok(item) = queue.try_recv() {
                completed.push(self.inner.interrupt(item));
            }
        }

        retry_rx.close();
        while let Ok(item) = retry_rx.try_recv() {
            completed.push(self.inner.interrupt(item));
        }

        for entry in run.drain() {
            completed.push(self.inner.roll_back(entry).await);
        }

        drop(done_tx);
        while let Some(done) = done_rx.recv().await {
            completed.push(done);
        }

        let report = RunReport { completed };
        tracing::info!(
            "Orchestrator run finished: {} submitted, {} failed, {} skipped, {} deferred, {} interrupted",
            report.submitted(),
            report.failed(),
            report.skipped(),
            report.deferred(),
            report.interrupted()
        );

        report
    }

    /// Run a fixed batch of jobs
    pub async fn run_jobs(&self, jobs: Vec<EligibleJob>, shutdown: ShutdownSignal) -> RunReport {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));

        tokio::spawn(async move {
            for job in jobs {
                if tx.send(job).await.is_err() {
                    break;
                }
            }
        });

        self.run(rx, shutdown).await
    }
}

async fn dispatch(
    work_tx: &mpsc::Sender<WorkItem>,
    shutdown: &mut ShutdownSignal,
    item: WorkItem,
) -> Result<(), WorkItem> {
    tokio::select! {
        biased;
        _ = shutdown.wait() => Err(item),
        permit = work_tx.reserve() => match permit {
            Ok(permit) => {
                permit.send(item);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }
}

async fn join_workers(pool: &mut JoinSet<()>) {
    while let Some(result) = pool.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("Submission worker panicked: {}", e);
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<OrchestratorInner>,
    run: Arc<RunState>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    done_tx: mpsc::UnboundedSender<CompletedJob>,
    retry_tx: mpsc::UnboundedSender<WorkItem>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let next = {
            let mut queue = work_rx.lock().await;
            queue.recv().await
        };
        let Some(item) = next else {
            break;
        };

        if shutdown.is_triggered() {
            let _ = done_tx.send(inner.interrupt(item));
            continue;
        }

        match inner.process(item, &run, &mut shutdown).await {
            Processed::Done(completed) => {
                let _ = done_tx.send(completed);
            }
            Processed::Retry { item, failures } => {
                inner.schedule_retry(item, failures, done_tx.clone(), retry_tx.clone(), shutdown.clone());
            }
        }
    }

    tracing::debug!("Submission worker {} stopped", worker_id);
}

impl OrchestratorInner {
    fn claim_key(&self, key: &DedupKey) -> bool {
        self.active_keys.lock().insert(key.clone())
    }

    fn release_key(&self, key: &DedupKey) {
        self.active_keys.lock().remove(key);
    }

    /// Report an undispatched item as interrupted; its ledger record is untouched
    fn interrupt(&self, item: WorkItem) -> CompletedJob {
        if item.owns_key {
            self.release_key(&item.job.key());
        }
        tracing::debug!("{} not processed before shutdown", item.job.key());
        CompletedJob {
            job: item.job,
            outcome: JobOutcome::Interrupted,
        }
    }

    /// Undo whatever an aborted worker was holding for a key
    async fn roll_back(&self, entry: InFlight) -> CompletedJob {
        let key = entry.job.key();

        if let Some(claim) = entry.claim {
            match self.ledger.release(&key.resume_id, &key.job_id, claim).await {
                Ok(()) => tracing::info!("{} SUBMITTING -> PENDING (interrupted)", key),
                Err(e) => tracing::error!(
                    "Failed to roll back {} after shutdown, it stays SUBMITTING until its lease expires: {}",
                    key,
                    e
                ),
            }
        }
        self.release_key(&key);

        CompletedJob {
            job: entry.job,
            outcome: JobOutcome::Interrupted,
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        item: WorkItem,
        failures: u32,
        done_tx: mpsc::UnboundedSender<CompletedJob>,
        retry_tx: mpsc::UnboundedSender<WorkItem>,
        mut shutdown: ShutdownSignal,
    ) {
        let delay = self.config.retry_backoff.delay(failures);
        tracing::info!(
            "Retrying {} in {:?} after {} failed attempt(s)",
            item.job.key(),
            delay,
            failures
        );

        let inner = self.clone();
        tokio::spawn(async move {
            let fired = tokio::select! {
                biased;
                _ = shutdown.wait() => false,
                _ = tokio::time::sleep(delay) => true,
            };

            let item = if fired {
                match retry_tx.send(item) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(item)) => item,
                }
            } else {
                item
            };

            let _ = done_tx.send(inner.interrupt(item));
        });
    }

    async fn process(&self, item: WorkItem, run: &RunState, shutdown: &mut ShutdownSignal) -> Processed {
        let key = item.job.key();

        if !item.owns_key && !self.claim_key(&key) {
            tracing::debug!("{} is already in flight, skipping", key);
            log_outcome(&item.job, &JobOutcome::SkippedDuplicate);
            return Processed::Done(CompletedJob {
                job: item.job,
                outcome: JobOutcome::SkippedDuplicate,
            });
        }
        run.track(key.clone(), item.job.clone());

        let step = self.attempt(&item.job, &key, run, shutdown).await;
        run.take(&key);

        match step {
            Step::Retry { failures } => Processed::Retry {
                item: WorkItem {
                    job: item.job,
                    owns_key: true,
                },
                failures,
            },
            Step::Done(outcome) => {
                self.release_key(&key);
                log_outcome(&item.job, &outcome);
                Processed::Done(CompletedJob {
                    job: item.job,
                    outcome,
                })
            }
        }
    }

    /// One pass of the state machine for a key this worker has claimed in-process
    async fn attempt(
        &self,
        job: &EligibleJob,
        key: &DedupKey,
        run: &RunState,
        shutdown: &mut ShutdownSignal,
    ) -> Step {
        let ledger = self.ledger.as_ref();
        let resume_id = key.resume_id.as_str();
        let job_id = key.job_id.as_str();
        let max_retries = self.config.max_retries;

        let daily_cap = self.config.max_applications_per_day;
        let claim = match self
            .with_ledger("try_acquire", key, shutdown, true, move || {
                ledger.try_acquire(resume_id, job_id, daily_cap)
            })
            .await
        {
            Ok(Claim::Acquired(claim)) => claim,
            Ok(Claim::Held) => {
                tracing::debug!("{} already has a ledger record, skipping", key);
                return Step::Done(JobOutcome::SkippedDuplicate);
            }
            Ok(Claim::CapReached) => {
                tracing::debug!("Daily cap of {:?} reached for {}", daily_cap, resume_id);
                return Step::Done(JobOutcome::Deferred {
                    resume_at: start_of_tomorrow(),
                });
            }
            Err(fault) => return fault.into_step(0),
        };
        run.set_claim(key, Some(claim));
        tracing::debug!("{} PENDING -> SUBMITTING", key);

        let prior_attempts = match self
            .with_ledger("get", key, shutdown, true, move || ledger.get(resume_id, job_id))
            .await
        {
            Ok(record) => record.map(|r| r.attempt_count).unwrap_or(0),
            Err(fault) => return self.abandon(key, claim, run, shutdown, fault.into_step(0)).await,
        };

        if prior_attempts >= max_retries {
            tracing::warn!(
                "{} already used {} of {} attempts, not submitting",
                key,
                prior_attempts,
                max_retries
            );
            let step = Step::Done(JobOutcome::Failed {
                reason: "retry budget exhausted".to_string(),
                attempts: prior_attempts,
            });
            return self.abandon(key, claim, run, shutdown, step).await;
        }

        tokio::select! {
            _ = shutdown.wait() => {
                return self.abandon(key, claim, run, shutdown, Step::Done(JobOutcome::Interrupted)).await;
            }
            _ = self.limiter.acquire(job.employer_id()) => {}
        }

        // The rate-limit wait is unbounded; the lease only has to cover what follows
        match self
            .with_ledger("renew", key, shutdown, true, move || ledger.renew(resume_id, job_id, claim))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Claim on {} was reclaimed before submission, leaving it to its new holder", key);
                run.set_claim(key, None);
                return Step::Done(JobOutcome::SkippedDuplicate);
            }
            Err(fault) => return self.abandon(key, claim, run, shutdown, fault.into_step(0)).await,
        }

        let attempt = prior_attempts + 1;
        tracing::debug!(
            "Submitting {} to employer {} (attempt {}/{})",
            key,
            job.employer_id(),
            attempt,
            max_retries
        );

        let timeout = self.config.submission_timeout;
        let outcome = match tokio::time::timeout(timeout, self.client.submit(resume_id, job_id)).await {
            Ok(outcome) => outcome,
            Err(_) => SubmissionOutcome::TransientFailure(format!("submission timed out after {:?}", timeout)),
        };

        let (state, error, step) = match outcome {
            SubmissionOutcome::Success => (ApplicationState::Submitted, None, Step::Done(JobOutcome::Submitted)),
            SubmissionOutcome::TransientFailure(reason) if attempt < max_retries => {
                tracing::warn!("{} attempt {} failed transiently: {}", key, attempt, reason);
                (ApplicationState::Pending, Some(reason), Step::Retry { failures: attempt })
            }
            SubmissionOutcome::TransientFailure(reason) => {
                let reason = format!("retries exhausted: {}", reason);
                (
                    ApplicationState::Failed,
                    Some(reason.clone()),
                    Step::Done(JobOutcome::Failed { reason, attempts: attempt }),
                )
            }
            SubmissionOutcome::PermanentFailure(reason) => (
                ApplicationState::Failed,
                Some(reason.clone()),
                Step::Done(JobOutcome::Failed { reason, attempts: attempt }),
            ),
        };

        let error = error.as_deref();
        let recorded = self
            .with_ledger("record_outcome", key, shutdown, false, move || {
                ledger.record_outcome(resume_id, job_id, claim, state, error)
            })
            .await;
        run.set_claim(key, None);

        match recorded {
            Ok(()) => {
                tracing::debug!("{} SUBMITTING -> {}", key, state);
                step
            }
            Err(fault) => {
                if let LedgerFault::Error(e) = &fault {
                    tracing::error!("Failed to record {} for {}: {}", state, key, e);
                }
                fault.into_step(attempt)
            }
        }
    }

    /// Return a claimed key to PENDING without counting an attempt
    async fn abandon(
        &self,
        key: &DedupKey,
        claim: ClaimToken,
        run: &RunState,
        shutdown: &mut ShutdownSignal,
        step: Step,
    ) -> Step {
        let ledger = self.ledger.as_ref();
        let resume_id = key.resume_id.as_str();
        let job_id = key.job_id.as_str();

        match self
            .with_ledger("release", key, shutdown, false, move || ledger.release(resume_id, job_id, claim))
            .await
        {
            Ok(()) => tracing::debug!("{} SUBMITTING -> PENDING", key),
            Err(_) => tracing::error!("Failed to release {}, it stays SUBMITTING until its lease expires", key),
        }
        run.set_claim(key, None);

        step
    }

    /// Run a ledger operation, backing off while the ledger is unavailable
    async fn with_ledger<T, F, Fut>(
        &self,
        operation: &str,
        key: &DedupKey,
        shutdown: &mut ShutdownSignal,
        interruptible: bool,
        mut call: F,
    ) -> Result<T, LedgerFault>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut failures = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_unavailable() => {
                    failures += 1;
                    let delay = self.config.ledger_backoff.delay(failures);
                    tracing::warn!(
                        "Ledger unavailable during {} for {} (failure {}), retrying in {:?}: {}",
                        operation,
                        key,
                        failures,
                        delay,
                        e
                    );

                    if interruptible {
                        tokio::select! {
                            _ = shutdown.wait() => return Err(LedgerFault::Interrupted),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(LedgerFault::Error(e)),
            }
        }
    }
}

fn log_outcome(job: &EligibleJob, outcome: &JobOutcome) {
    let key = job.key();
    match outcome {
        JobOutcome::Submitted => {
            tracing::info!("Submitted {} to employer {}", key, job.employer_id())
        }
        JobOutcome::Failed { reason, attempts } => tracing::warn!(
            "Application {} to employer {} failed after {} attempt(s): {}",
            key,
            job.employer_id(),
            attempts,
            reason
        ),
        JobOutcome::SkippedDuplicate => tracing::info!("Skipped duplicate application {}", key),
        JobOutcome::Deferred { resume_at } => {
            tracing::info!("Deferred {} until {} (daily cap reached)", key, resume_at)
        }
        JobOutcome::Interrupted => tracing::warn!("Application {} interrupted by shutdown", key),
    }
}
