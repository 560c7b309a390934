use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Normalize a skill name or location tag into its comparison token
#[inline]
pub fn normalize_token(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// A single candidate skill with its extracted strength
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub name: String,
    pub token: String,
    pub weight: f64,
}

impl Skill {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        let name = name.into();
        let token = normalize_token(&name);
        Self { name, token, weight }
    }
}

/// Seniority bands, ordered from least to most senior
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeniorityLevel {
    Intern,
    Junior,
    Mid,
    Senior,
    Lead,
    Principal,
}

impl SeniorityLevel {
    pub fn band(self) -> u8 {
        match self {
            SeniorityLevel::Intern => 0,
            SeniorityLevel::Junior => 1,
            SeniorityLevel::Mid => 2,
            SeniorityLevel::Senior => 3,
            SeniorityLevel::Lead => 4,
            SeniorityLevel::Principal => 5,
        }
    }

    /// Number of bands between two levels
    pub fn distance(self, other: SeniorityLevel) -> u8 {
        self.band().abs_diff(other.band())
    }
}

/// Yearly compensation range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRange {
    pub min: u32,
    pub max: u32,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String { "USD".to_string() }

/// Normalized candidate profile produced by the resume extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileModel {
    pub resume_id: String,
    pub skills: Vec<Skill>,
    #[serde(default)]
    pub seniority: Option<SeniorityLevel>,
    #[serde(default)]
    pub location_preferences: BTreeSet<String>,
    #[serde(default)]
    pub desired_compensation: Option<CompensationRange>,
}

/// Skill token a posting asks for, with its importance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredSkill {
    pub token: String,
    pub weight: f64,
}

impl RequiredSkill {
    pub fn new(token: impl AsRef<str>, weight: f64) -> Self {
        Self {
            token: normalize_token(token.as_ref()),
            weight,
        }
    }
}

/// Open job posting sourced from the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPosting {
    pub job_id: String,
    pub employer_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<RequiredSkill>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub seniority: Option<SeniorityLevel>,
    #[serde(default)]
    pub compensation: Option<CompensationRange>,
    pub posted_at: DateTime<Utc>,
}

impl JobPosting {
    pub fn is_remote(&self) -> bool {
        self.location
            .as_deref()
            .map(|loc| normalize_token(loc) == "remote")
            .unwrap_or(false)
    }
}

/// How the posting's location relates to the candidate's preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationFit {
    Match,
    Unconstrained,
    Mismatch,
}

/// How the posting's seniority relates to the candidate's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeniorityFit {
    WithinBand,
    Unconstrained,
    Mismatch,
}

/// Computed fitness of a resume against a posting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreResult {
    pub resume_id: String,
    pub job_id: String,
    pub employer_id: String,
    pub score: f64,
    pub matched_skills: Vec<String>,
    pub raw_overlap: f64,
    pub location_fit: LocationFit,
    pub seniority_fit: SeniorityFit,
    pub computed_at: DateTime<Utc>,
}

impl ScoreResult {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(&self.resume_id, &self.job_id)
    }

    /// Ranking order: higher score first, then more matched skills, then job id
    pub fn rank_cmp(&self, other: &ScoreResult) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.matched_skills.len().cmp(&self.matched_skills.len()))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

/// The (resume, job) pair identifying one application lifecycle
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupKey {
    pub resume_id: String,
    pub job_id: String,
}

impl DedupKey {
    pub fn new(resume_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            resume_id: resume_id.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resume_id, self.job_id)
    }
}

/// Lifecycle state of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationState {
    Pending,
    Submitting,
    Submitted,
    Failed,
    SkippedDuplicate,
}

impl ApplicationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationState::Submitted | ApplicationState::Failed | ApplicationState::SkippedDuplicate
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationState::Pending => "PENDING",
            ApplicationState::Submitting => "SUBMITTING",
            ApplicationState::Submitted => "SUBMITTED",
            ApplicationState::Failed => "FAILED",
            ApplicationState::SkippedDuplicate => "SKIPPED_DUPLICATE",
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent submission state for one (resume, job) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub resume_id: String,
    pub job_id: String,
    pub state: ApplicationState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationRecord {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(&self.resume_id, &self.job_id)
    }
}

/// Result of a single submission call, as classified by the submission endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionOutcome {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
}

/// A posting that cleared the threshold policy, ready for submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibleJob {
    pub posting: JobPosting,
    pub score: ScoreResult,
}

impl EligibleJob {
    pub fn key(&self) -> DedupKey {
        self.score.key()
    }

    pub fn employer_id(&self) -> &str {
        &self.posting.employer_id
    }
}

/// Multiplicative penalty factors applied on top of the skill overlap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringPenalties {
    pub seniority_mismatch_factor: f64,
    pub location_mismatch_factor: f64,
}

impl Default for ScoringPenalties {
    fn default() -> Self {
        Self {
            seniority_mismatch_factor: 0.5,
            location_mismatch_factor: 0.0,
        }
    }
}

/// Auto-apply eligibility options
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default)]
    pub require_location_match: bool,
    #[serde(default)]
    pub blocked_employers: BTreeSet<String>,
    #[serde(default)]
    pub max_applications_per_day: Option<u32>,
}

pub(crate) fn default_min_score() -> f64 { 70.0 }

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            require_location_match: false,
            blocked_employers: BTreeSet::new(),
            max_applications_per_day: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skill_token_normalized() {
        let skill = Skill::new("  PostgreSQL ", 0.6);
        assert_eq!(skill.token, "postgresql");
        assert_eq!(skill.name, "  PostgreSQL ");
    }

    #[test]
    fn test_seniority_distance() {
        assert_eq!(SeniorityLevel::Junior.distance(SeniorityLevel::Senior), 2);
        assert_eq!(SeniorityLevel::Lead.distance(SeniorityLevel::Senior), 1);
        assert!(SeniorityLevel::Intern < SeniorityLevel::Principal);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ApplicationState::Submitted.is_terminal());
        assert!(ApplicationState::Failed.is_terminal());
        assert!(ApplicationState::SkippedDuplicate.is_terminal());
        assert!(!ApplicationState::Pending.is_terminal());
        assert!(!ApplicationState::Submitting.is_terminal());
    }

    #[test]
    fn test_submission_outcome_wire_format() {
        let json = serde_json::to_value(SubmissionOutcome::TransientFailure("503".into())).unwrap();
        assert_eq!(json["kind"], "TRANSIENT_FAILURE");
        assert_eq!(json["reason"], "503");
    }

    #[test]
    fn test_profile_deserializes_camel_case() {
        let profile: ProfileModel = serde_json::from_value(serde_json::json!({
            "resumeId": "r1",
            "skills": [{"name": "Rust", "token": "rust", "weight": 0.9}],
            "seniority": "senior",
            "locationPreferences": ["berlin", "remote"]
        }))
        .unwrap();

        assert_eq!(profile.resume_id, "r1");
        assert_eq!(profile.seniority, Some(SeniorityLevel::Senior));
        assert!(profile.location_preferences.contains("remote"));
        assert!(profile.desired_compensation.is_none());
    }
}
