use crate::models::{LocationFit, ScoreResult, ThresholdConfig};
use std::fmt;

/// Outcome of the threshold policy for one scored posting
#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    Eligible,
    BlockedEmployer(String),
    BelowThreshold { score: f64, min_score: f64 },
    LocationMismatch,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::Eligible => write!(f, "eligible"),
            Eligibility::BlockedEmployer(employer) => write!(f, "employer {} is blocked", employer),
            Eligibility::BelowThreshold { score, min_score } => {
                write!(f, "score {:.1} is below minimum {:.1}", score, min_score)
            }
            Eligibility::LocationMismatch => write!(f, "location does not match preferences"),
        }
    }
}

/// Decide auto-apply eligibility for a scored posting
///
/// Checks run in a fixed order: blocked employer, minimum score, then the
/// optional location requirement. The policy is stateless; the daily cap
/// needs cross-job state and is enforced by the orchestrator.
#[inline]
pub fn evaluate_eligibility(score: &ScoreResult, config: &ThresholdConfig) -> Eligibility {
    if config.blocked_employers.contains(&score.employer_id) {
        return Eligibility::BlockedEmployer(score.employer_id.clone());
    }

    if !meets_min_score(score, config) {
        return Eligibility::BelowThreshold {
            score: score.score,
            min_score: config.min_score,
        };
    }

    if config.require_location_match && score.location_fit == LocationFit::Mismatch {
        return Eligibility::LocationMismatch;
    }

    Eligibility::Eligible
}

#[inline]
pub fn is_eligible(score: &ScoreResult, config: &ThresholdConfig) -> bool {
    evaluate_eligibility(score, config).is_eligible()
}

#[inline]
pub fn meets_min_score(score: &ScoreResult, config: &ThresholdConfig) -> bool {
    score.score >= config.min_score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeniorityFit;
    use chrono::Utc;

    fn create_test_score(employer: &str, score: f64, location_fit: LocationFit) -> ScoreResult {
        ScoreResult {
            resume_id: "r1".to_string(),
            job_id: "j1".to_string(),
            employer_id: employer.to_string(),
            score,
            matched_skills: vec!["python".to_string()],
            raw_overlap: 1.0,
            location_fit,
            seniority_fit: SeniorityFit::Unconstrained,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_eligible_above_threshold() {
        let score = create_test_score("acme", 85.0, LocationFit::Match);
        assert!(is_eligible(&score, &ThresholdConfig::default()));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let score = create_test_score("acme", 70.0, LocationFit::Unconstrained);
        assert!(is_eligible(&score, &ThresholdConfig::default()));
    }

    #[test]
    fn test_below_threshold_rejected() {
        let score = create_test_score("acme", 62.5, LocationFit::Unconstrained);
        let result = evaluate_eligibility(&score, &ThresholdConfig::default());

        assert_eq!(
            result,
            Eligibility::BelowThreshold { score: 62.5, min_score: 70.0 }
        );
    }

    #[test]
    fn test_blocked_employer_checked_first() {
        let mut config = ThresholdConfig::default();
        config.blocked_employers.insert("acme".to_string());
        let score = create_test_score("acme", 10.0, LocationFit::Unconstrained);

        assert_eq!(
            evaluate_eligibility(&score, &config),
            Eligibility::BlockedEmployer("acme".to_string())
        );
    }

    #[test]
    fn test_location_requirement() {
        let mut config = ThresholdConfig::default();
        config.min_score = 0.0;
        let score = create_test_score("acme", 90.0, LocationFit::Mismatch);

        assert!(is_eligible(&score, &config));

        config.require_location_match = true;
        assert_eq!(evaluate_eligibility(&score, &config), Eligibility::LocationMismatch);

        let unconstrained = create_test_score("acme", 90.0, LocationFit::Unconstrained);
        assert!(is_eligible(&unconstrained, &config));
    }
}
