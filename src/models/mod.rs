// Model exports
pub mod domain;
pub mod requests;
pub mod responses;

pub use domain::{
    normalize_token, ApplicationRecord, ApplicationState, CompensationRange, DedupKey, EligibleJob,
    JobPosting, LocationFit, ProfileModel, RequiredSkill, ScoreResult, ScoringPenalties,
    SeniorityFit, SeniorityLevel, Skill, SubmissionOutcome, ThresholdConfig,
};
pub use requests::{AutoApplyRequest, CalculateMatchRequest, ListApplicationsQuery, ListJobsQuery};
pub use responses::{
    ApplicationsResponse, AutoApplyResponse, CalculateMatchResponse, ErrorResponse, HealthResponse,
    ListJobsResponse, RankedJob, UploadResumeResponse,
};
