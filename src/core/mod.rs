// Core algorithm exports
pub mod filters;
pub mod matcher;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod scoring;
pub mod shutdown;

pub use filters::{evaluate_eligibility, is_eligible, meets_min_score, Eligibility};
pub use matcher::{MatchScorer, RankResult, ScoredPosting};
pub use orchestrator::{AutoApplyOrchestrator, CompletedJob, JobOutcome, OrchestratorConfig, RunReport};
pub use pipeline::{spawn_eligibility_stage, AutoApplyRunner, RunSummary, RunnerError, StageStats};
pub use rate_limit::{EmployerRateLimiter, RateLimit, TokenBucket};
pub use retry::BackoffPolicy;
pub use scoring::{calculate_match_score, ScoringError};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
