use serde::{Deserialize, Serialize};
use crate::models::domain::ApplicationRecord;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

/// Response for resume upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResumeResponse {
    pub resume_id: String,
    pub filename: Option<String>,
    pub size: usize,
    pub skill_count: usize,
    pub message: String,
}

/// A posting ranked against a resume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedJob {
    pub id: String,
    pub title: Option<String>,
    pub company: String,
    pub location: Option<String>,
    pub match_score: f64,
    pub matched_keywords: Vec<String>,
}

/// Response for the jobs listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub total: usize,
    pub limit: u16,
    pub offset: u32,
    pub jobs: Vec<RankedJob>,
}

/// Response for the applications listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationsResponse {
    pub total_applications: usize,
    pub applied: usize,
    pub pending: usize,
    pub failed: usize,
    pub skipped: usize,
    pub applications: Vec<ApplicationRecord>,
}

/// Response for a single match calculation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateMatchResponse {
    pub resume_id: String,
    pub job_id: String,
    pub match_score: f64,
    pub matched_keywords: Vec<String>,
    pub threshold_met: bool,
    pub auto_apply_eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// Response for starting an auto-apply run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApplyResponse {
    pub status: String,
    pub resume_id: String,
    pub message: String,
}
