use crate::core::scoring::{calculate_match_score, ScoringError};
use crate::models::{JobPosting, ProfileModel, ScoreResult, ScoringPenalties};
use chrono::{DateTime, Utc};

/// A posting together with its score against one profile
#[derive(Debug, Clone)]
pub struct ScoredPosting {
    pub posting: JobPosting,
    pub result: ScoreResult,
}

/// Result of ranking a batch of postings
#[derive(Debug)]
pub struct RankResult {
    pub matches: Vec<ScoredPosting>,
    pub total_candidates: usize,
    pub rejected: usize,
}

/// Scores postings against candidate profiles
///
/// Scoring is a pure function of its inputs: the only state is the penalty
/// configuration, so one scorer can be shared across workers.
#[derive(Debug, Clone)]
pub struct MatchScorer {
    penalties: ScoringPenalties,
}

impl MatchScorer {
    pub fn new(penalties: ScoringPenalties) -> Self {
        Self { penalties }
    }

    pub fn with_default_penalties() -> Self {
        Self {
            penalties: ScoringPenalties::default(),
        }
    }

    pub fn penalties(&self) -> &ScoringPenalties {
        &self.penalties
    }

    /// Score a posting, stamping the result with the current time
    pub fn score(&self, profile: &ProfileModel, posting: &JobPosting) -> Result<ScoreResult, ScoringError> {
        self.score_at(profile, posting, Utc::now())
    }

    /// Score a posting with an explicit timestamp; identical inputs give identical results
    pub fn score_at(
        &self,
        profile: &ProfileModel,
        posting: &JobPosting,
        computed_at: DateTime<Utc>,
    ) -> Result<ScoreResult, ScoringError> {
        calculate_match_score(profile, posting, &self.penalties, computed_at)
    }

    /// Score and rank postings for a profile
    ///
    /// # Arguments
    /// * `profile` - The candidate profile
    /// * `postings` - Postings from the catalog
    /// * `offset` - Number of ranked postings to skip
    /// * `limit` - Maximum number of postings to return
    ///
    /// Postings that fail to score are logged and left out.
    pub fn rank(
        &self,
        profile: &ProfileModel,
        postings: Vec<JobPosting>,
        offset: usize,
        limit: usize,
    ) -> RankResult {
        let total_candidates = postings.len();
        let computed_at = Utc::now();
        let mut rejected = 0;

        let mut scored: Vec<ScoredPosting> = postings
            .into_iter()
            .filter_map(|posting| match self.score_at(profile, &posting, computed_at) {
                Ok(result) => Some(ScoredPosting { posting, result }),
                Err(e) => {
                    tracing::warn!("Skipping posting {} for {}: {}", posting.job_id, profile.resume_id, e);
                    rejected += 1;
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| a.result.rank_cmp(&b.result));

        let matches = scored.into_iter().skip(offset).take(limit).collect();

        RankResult {
            matches,
            total_candidates,
            rejected,
        }
    }
}

impl Default for MatchScorer {
    fn default() -> Self {
        Self::with_default_penalties()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RequiredSkill, Skill};
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn create_profile() -> ProfileModel {
        ProfileModel {
            resume_id: "r1".to_string(),
            skills: vec![Skill::new("rust", 1.0), Skill::new("tokio", 0.8), Skill::new("sql", 0.5)],
            seniority: None,
            location_preferences: BTreeSet::new(),
            desired_compensation: None,
        }
    }

    fn create_posting(id: &str, required: &[(&str, f64)]) -> JobPosting {
        JobPosting {
            job_id: id.to_string(),
            employer_id: "acme".to_string(),
            title: None,
            required_skills: required.iter().map(|(t, w)| RequiredSkill::new(t, *w)).collect(),
            location: None,
            seniority: None,
            compensation: None,
            posted_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_score_is_deterministic() {
        let scorer = MatchScorer::with_default_penalties();
        let profile = create_profile();
        let posting = create_posting("j1", &[("rust", 1.0), ("kafka", 0.5)]);
        let at = Utc.with_ymd_and_hms(2026, 2, 2, 8, 0, 0).unwrap();

        let first = scorer.score_at(&profile, &posting, at).unwrap();
        let second = scorer.score_at(&profile, &posting, at).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_rank_sorted_by_score_then_overlap() {
        let scorer = MatchScorer::with_default_penalties();
        let profile = create_profile();

        let postings = vec![
            create_posting("low", &[("rust", 0.2), ("kafka", 0.8)]),
            // Duplicate requirement tokens count once, so "two" ties "one" on score and overlap
            create_posting("one", &[("rust", 1.0)]),
            create_posting("two", &[("rust", 1.0), ("rust", 0.3)]),
            create_posting("three", &[("tokio", 1.0), ("rust", 1.0)]),
        ];

        let result = scorer.rank(&profile, postings, 0, 10);
        let ids: Vec<&str> = result.matches.iter().map(|m| m.posting.job_id.as_str()).collect();

        assert_eq!(result.total_candidates, 4);
        assert_eq!(ids, vec!["one", "two", "three", "low"]);
    }

    #[test]
    fn test_rank_breaks_ties_by_matched_count() {
        let scorer = MatchScorer::with_default_penalties();
        let mut profile = create_profile();
        profile.skills = vec![Skill::new("rust", 1.0), Skill::new("tokio", 1.0)];

        let postings = vec![
            create_posting("a-single", &[("rust", 1.0)]),
            create_posting("b-double", &[("rust", 1.0), ("tokio", 1.0)]),
        ];

        let result = scorer.rank(&profile, postings, 0, 10);

        assert_eq!(result.matches[0].posting.job_id, "b-double");
    }

    #[test]
    fn test_rank_skips_malformed_postings() {
        let scorer = MatchScorer::with_default_penalties();
        let profile = create_profile();

        let postings = vec![
            create_posting("ok", &[("rust", 1.0)]),
            create_posting("bad", &[("rust", 2.0)]),
        ];

        let result = scorer.rank(&profile, postings, 0, 10);

        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.rejected, 1);
    }

    #[test]
    fn test_rank_respects_offset_and_limit() {
        let scorer = MatchScorer::with_default_penalties();
        let profile = create_profile();

        let postings: Vec<JobPosting> = (0..20)
            .map(|i| create_posting(&format!("job-{:02}", i), &[("rust", 1.0)]))
            .collect();

        let result = scorer.rank(&profile, postings, 5, 5);

        assert_eq!(result.matches.len(), 5);
        assert_eq!(result.matches[0].posting.job_id, "job-05");
    }
}
