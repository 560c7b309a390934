use crate::core::filters::evaluate_eligibility;
use crate::core::matcher::MatchScorer;
use crate::core::orchestrator::{AutoApplyOrchestrator, RunReport};
use crate::core::shutdown::ShutdownSignal;
use crate::models::{EligibleJob, JobPosting, ProfileModel, ThresholdConfig};
use crate::services::catalog::{CatalogError, JobCatalog};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Counters from one pass of the eligibility stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub scored: usize,
    pub eligible: usize,
    pub rejected: usize,
    pub errors: usize,
}

/// Score postings and stream the eligible ones, best match first
///
/// The returned channel is bounded by `capacity`, so the stage waits whenever
/// the orchestrator falls behind. Postings that fail to score are logged and
/// counted; they never stop the batch.
pub fn spawn_eligibility_stage(
    profile: Arc<ProfileModel>,
    postings: Vec<JobPosting>,
    scorer: MatchScorer,
    threshold: ThresholdConfig,
    capacity: usize,
) -> (mpsc::Receiver<EligibleJob>, JoinHandle<StageStats>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        let mut stats = StageStats::default();
        let computed_at = Utc::now();
        let mut eligible = Vec::new();

        for posting in postings {
            let score = match scorer.score_at(&profile, &posting, computed_at) {
                Ok(score) => score,
                Err(e) => {
                    tracing::warn!("Skipping posting {} for {}: {}", posting.job_id, profile.resume_id, e);
                    stats.errors += 1;
                    continue;
                }
            };
            stats.scored += 1;

            let verdict = evaluate_eligibility(&score, &threshold);
            if verdict.is_eligible() {
                eligible.push(EligibleJob { posting, score });
            } else {
                tracing::debug!("{} not eligible: {}", score.key(), verdict);
                stats.rejected += 1;
            }
        }

        eligible.sort_by(|a, b| a.score.rank_cmp(&b.score));
        stats.eligible = eligible.len();

        for job in eligible {
            if tx.send(job).await.is_err() {
                tracing::debug!("Orchestrator stopped reading eligible jobs for {}", profile.resume_id);
                break;
            }
        }

        stats
    });

    (rx, handle)
}

/// Errors that can occur when starting or running a background auto-apply run
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Auto-apply is already running for {0}")]
    AlreadyRunning(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Totals for a complete auto-apply run, across deferral passes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub resume_id: String,
    pub passes: u32,
    pub scored: usize,
    pub eligible: usize,
    pub rejected: usize,
    pub scoring_errors: usize,
    pub submitted: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Jobs still waiting on the daily cap when the run stopped
    pub deferred: usize,
    pub interrupted: usize,
}

impl RunSummary {
    fn new(resume_id: &str) -> Self {
        Self {
            resume_id: resume_id.to_string(),
            ..Default::default()
        }
    }

    fn absorb_stage(&mut self, stats: StageStats) {
        self.scored += stats.scored;
        self.eligible += stats.eligible;
        self.rejected += stats.rejected;
        self.scoring_errors += stats.errors;
    }

    fn absorb_report(&mut self, report: &RunReport) {
        self.passes += 1;
        self.submitted += report.submitted();
        self.failed += report.failed();
        self.skipped += report.skipped();
        self.interrupted += report.interrupted();
        self.deferred = report.deferred();
    }
}

/// Background driver for auto-apply runs
///
/// Polls the catalog, streams eligible postings into the orchestrator and
/// re-offers deferred jobs once their resume time arrives. At most one run
/// is active per resume.
pub struct AutoApplyRunner {
    orchestrator: Arc<AutoApplyOrchestrator>,
    catalog: Arc<dyn JobCatalog>,
    scorer: MatchScorer,
    threshold: ThresholdConfig,
    handle: tokio::runtime::Handle,
    shutdown: ShutdownSignal,
    active: Mutex<HashSet<String>>,
}

/// Removes a resume from the active set when its run ends, however it ends
struct ActiveRun {
    runner: Arc<AutoApplyRunner>,
    resume_id: String,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.runner.active.lock().remove(&self.resume_id);
    }
}

impl AutoApplyRunner {
    pub fn new(
        orchestrator: Arc<AutoApplyOrchestrator>,
        catalog: Arc<dyn JobCatalog>,
        scorer: MatchScorer,
        threshold: ThresholdConfig,
        handle: tokio::runtime::Handle,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            orchestrator,
            catalog,
            scorer,
            threshold,
            handle,
            shutdown,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<AutoApplyOrchestrator> {
        &self.orchestrator
    }

    pub fn is_running(&self, resume_id: &str) -> bool {
        self.active.lock().contains(resume_id)
    }

    pub fn active_runs(&self) -> usize {
        self.active.lock().len()
    }

    /// Claim the resume and spawn a run on the runner's runtime
    pub fn start(
        self: &Arc<Self>,
        profile: ProfileModel,
    ) -> Result<JoinHandle<Result<RunSummary, RunnerError>>, RunnerError> {
        let resume_id = profile.resume_id.clone();
        if !self.active.lock().insert(resume_id.clone()) {
            return Err(RunnerError::AlreadyRunning(resume_id));
        }

        let guard = ActiveRun {
            runner: self.clone(),
            resume_id,
        };

        Ok(self.handle.spawn(async move {
            let result = guard.runner.run(profile).await;
            match &result {
                Ok(summary) => tracing::info!(
                    "Auto-apply run for {} finished: {} submitted, {} failed, {} skipped, {} deferred",
                    summary.resume_id,
                    summary.submitted,
                    summary.failed,
                    summary.skipped,
                    summary.deferred
                ),
                Err(e) => tracing::error!("Auto-apply run for {} failed: {}", guard.resume_id, e),
            }
            drop(guard);
            result
        }))
    }

    /// Run auto-apply for a profile to completion in the current task
    pub async fn run(&self, profile: ProfileModel) -> Result<RunSummary, RunnerError> {
        let profile = Arc::new(profile);
        let mut summary = RunSummary::new(&profile.resume_id);

        tracing::info!("Auto-apply run for {} started", profile.resume_id);

        let postings = self.catalog.poll().await?;
        tracing::debug!("Catalog returned {} postings for {}", postings.len(), profile.resume_id);

        let (jobs, stage) = spawn_eligibility_stage(
            profile.clone(),
            postings,
            self.scorer.clone(),
            self.threshold.clone(),
            self.orchestrator.config().queue_capacity,
        );
        let mut report = self.orchestrator.run(jobs, self.shutdown.clone()).await;
        match stage.await {
            Ok(stats) => summary.absorb_stage(stats),
            Err(e) => tracing::error!("Eligibility stage for {} failed: {}", profile.resume_id, e),
        }
        summary.absorb_report(&report);

        loop {
            let deferred = report.into_deferred();
            let Some(resume_at) = deferred.iter().map(|(_, at)| *at).min() else {
                break;
            };

            let wait = (resume_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(
                "{} job(s) for {} deferred by the daily cap, resuming in {:?}",
                deferred.len(),
                profile.resume_id,
                wait
            );

            let mut shutdown = self.shutdown.clone();
            let resumed = tokio::select! {
                _ = shutdown.wait() => false,
                _ = tokio::time::sleep(wait) => true,
            };
            if !resumed {
                tracing::info!("Shutdown while {} job(s) for {} were deferred", deferred.len(), profile.resume_id);
                break;
            }

            let jobs = deferred.into_iter().map(|(job, _)| job).collect();
            report = self.orchestrator.run_jobs(jobs, self.shutdown.clone()).await;
            summary.absorb_report(&report);
        }

        Ok(summary)
    }

    /// Wait for active runs to finish; false if some were still running at the deadline
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_runs() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("{} auto-apply run(s) still active after {:?}", self.active_runs(), grace);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::orchestrator::OrchestratorConfig;
    use crate::core::rate_limit::RateLimit;
    use crate::core::retry::BackoffPolicy;
    use crate::models::{RequiredSkill, Skill, SubmissionOutcome};
    use crate::services::catalog::StaticJobCatalog;
    use crate::services::ledger::{ApplicationLedger, InMemoryLedger};
    use crate::services::submission::SubmissionClient;
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl SubmissionClient for AcceptAll {
        async fn submit(&self, _resume_id: &str, _job_id: &str) -> SubmissionOutcome {
            SubmissionOutcome::Success
        }
    }

    /// Catalog that takes a while to answer
    struct SlowCatalog(StaticJobCatalog);

    #[async_trait]
    impl JobCatalog for SlowCatalog {
        async fn poll(&self) -> Result<Vec<JobPosting>, CatalogError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.poll().await
        }
    }

    fn profile() -> ProfileModel {
        ProfileModel {
            resume_id: "r1".to_string(),
            skills: vec![Skill::new("python", 1.0), Skill::new("fastapi", 0.8)],
            seniority: None,
            location_preferences: Default::default(),
            desired_compensation: None,
        }
    }

    fn posting(job_id: &str, employer_id: &str, skills: &[(&str, f64)]) -> JobPosting {
        JobPosting {
            job_id: job_id.to_string(),
            employer_id: employer_id.to_string(),
            title: None,
            required_skills: skills.iter().map(|(t, w)| RequiredSkill::new(t, *w)).collect(),
            location: None,
            seniority: None,
            compensation: None,
            posted_at: Utc::now(),
        }
    }

    fn postings() -> Vec<JobPosting> {
        vec![
            // 62.5: below the default threshold
            posting("partial", "acme", &[("python", 1.0), ("postgresql", 0.6)]),
            posting("exact", "acme", &[("python", 1.0)]),
            posting("strong", "globex", &[("python", 1.0), ("fastapi", 1.0)]),
            posting("blocked", "initech", &[("python", 1.0)]),
            posting("broken", "", &[("python", 1.0)]),
        ]
    }

    fn threshold() -> ThresholdConfig {
        ThresholdConfig {
            blocked_employers: ["initech".to_string()].into_iter().collect(),
            ..ThresholdConfig::default()
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            retry_backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 0.0),
            rate_limit: RateLimit::new(1000.0, 100),
            ..OrchestratorConfig::default()
        }
    }

    fn runner(ledger: Arc<InMemoryLedger>, catalog: Arc<dyn JobCatalog>, config: OrchestratorConfig, shutdown: ShutdownSignal) -> Arc<AutoApplyRunner> {
        let orchestrator = Arc::new(AutoApplyOrchestrator::new(ledger, Arc::new(AcceptAll), config));
        Arc::new(AutoApplyRunner::new(
            orchestrator,
            catalog,
            MatchScorer::default(),
            threshold(),
            tokio::runtime::Handle::current(),
            shutdown,
        ))
    }

    #[tokio::test]
    async fn test_stage_streams_eligible_postings_by_rank() {
        let (mut rx, stage) = spawn_eligibility_stage(
            Arc::new(profile()),
            postings(),
            MatchScorer::default(),
            threshold(),
            1,
        );

        let mut received = Vec::new();
        while let Some(job) = rx.recv().await {
            received.push(job.posting.job_id.clone());
        }
        let stats = stage.await.unwrap();

        assert_eq!(received, vec!["exact", "strong"]);
        assert_eq!(
            stats,
            StageStats {
                scored: 4,
                eligible: 2,
                rejected: 2,
                errors: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_runner_applies_to_eligible_jobs() {
        let ledger = Arc::new(InMemoryLedger::new());
        let catalog = Arc::new(StaticJobCatalog::new(postings()));
        let runner = runner(ledger.clone(), catalog, config(), ShutdownSignal::never());

        let summary = runner.run(profile()).await.unwrap();

        assert_eq!(summary.passes, 1);
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.scoring_errors, 1);
        assert_eq!(ledger.count_submitted_today("r1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_one_active_run_per_resume() {
        let ledger = Arc::new(InMemoryLedger::new());
        let catalog = Arc::new(SlowCatalog(StaticJobCatalog::new(postings())));
        let runner = runner(ledger, catalog, config(), ShutdownSignal::never());

        let first = runner.start(profile()).unwrap();
        assert!(runner.is_running("r1"));
        assert!(matches!(runner.start(profile()), Err(RunnerError::AlreadyRunning(_))));

        first.await.unwrap().unwrap();
        assert!(!runner.is_running("r1"));
        assert!(runner.drain(Duration::from_millis(10)).await);

        // Second run finds every eligible job already submitted
        let summary = runner.start(profile()).unwrap().await.unwrap().unwrap();
        assert_eq!(summary.submitted, 0);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn test_deferred_jobs_wait_for_next_day() {
        let ledger = Arc::new(InMemoryLedger::new());
        let catalog = Arc::new(StaticJobCatalog::new(postings()));
        let config = OrchestratorConfig {
            max_applications_per_day: Some(1),
            ..config()
        };
        let (trigger, signal) = ShutdownSignal::new();
        let runner = runner(ledger.clone(), catalog, config, signal);

        let run = runner.start(profile()).unwrap();

        // The run now sleeps until tomorrow; stop it once the first pass is recorded
        while ledger.count_submitted_today("r1").await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.failed, 0);
    }
}
