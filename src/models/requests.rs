use serde::{Deserialize, Serialize};
use validator::Validate;

/// Query for the ranked jobs listing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ListJobsQuery {
    #[validate(length(min = 1))]
    #[serde(alias = "resume_id", rename = "resumeId")]
    pub resume_id: String,
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_limit")]
    pub limit: u16,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u16 {
    10
}

/// Query for a resume's applications
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ListApplicationsQuery {
    #[validate(length(min = 1))]
    #[serde(alias = "resume_id", rename = "resumeId")]
    pub resume_id: String,
}

/// Request to score one resume against one posting
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CalculateMatchRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "resume_id", rename = "resumeId")]
    pub resume_id: String,
    #[validate(length(min = 1))]
    #[serde(alias = "job_id", rename = "jobId")]
    pub job_id: String,
}

/// Request to start an auto-apply run
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AutoApplyRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "resume_id", rename = "resumeId")]
    pub resume_id: String,
}
