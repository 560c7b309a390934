//! Auto Apply - resume-to-job match scoring and automated applications
//!
//! Scores extracted resume profiles against job postings, filters the
//! results through an eligibility policy and submits applications through a
//! bounded worker pool backed by an idempotent application ledger.

pub mod config;
pub mod core;
pub mod models;
pub mod routes;
pub mod services;

// Re-export commonly used types
pub use core::{calculate_match_score, AutoApplyOrchestrator, AutoApplyRunner, MatchScorer, OrchestratorConfig};
pub use models::{EligibleJob, JobPosting, ProfileModel, ScoreResult, ScoringPenalties, ThresholdConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RequiredSkill, Skill};

    #[test]
    fn test_library_exports() {
        let profile = ProfileModel {
            resume_id: "r1".to_string(),
            skills: vec![Skill::new("Rust", 1.0)],
            seniority: None,
            location_preferences: Default::default(),
            desired_compensation: None,
        };
        let posting = JobPosting {
            job_id: "j1".to_string(),
            employer_id: "acme".to_string(),
            title: None,
            required_skills: vec![RequiredSkill::new("rust", 1.0)],
            location: None,
            seniority: None,
            compensation: None,
            posted_at: chrono::Utc::now(),
        };

        let result = MatchScorer::default().score(&profile, &posting).unwrap();
        assert_eq!(result.score, 100.0);
    }
}
