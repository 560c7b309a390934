use crate::models::{
    normalize_token, JobPosting, LocationFit, ProfileModel, ScoreResult, ScoringPenalties,
    SeniorityFit,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors raised for profile or posting data that cannot be scored
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error("missing identifier: {0}")]
    MissingIdentifier(&'static str),

    #[error("skill weight for '{token}' must be within [0, 1], got {weight}")]
    InvalidWeight { token: String, weight: f64 },

    #[error("empty skill token in {0}")]
    EmptyToken(&'static str),
}

/// Weighted overlap between the profile's skills and a posting's requirements
#[derive(Debug, Clone, PartialEq)]
pub struct SkillOverlap {
    pub raw: f64,
    pub total_weight: f64,
    pub matched: Vec<String>,
}

impl SkillOverlap {
    /// Overlap normalized to [0, 1]; a posting without weighted requirements scores 0
    pub fn normalized(&self) -> f64 {
        if self.total_weight > 0.0 {
            (self.raw / self.total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Calculate a match score (0-100) for a posting against a candidate profile
///
/// Scoring formula:
/// score = (
///     Σ posting_weight(t) × profile_weight(t)   # for every required token t the profile has
///     / Σ posting_weight(t)                     # over all required tokens
/// ) × 100
///   × location_factor                           # 1.0 unless the location is excluded
///   × seniority_factor                          # 1.0 unless more than one band apart
///
/// Penalties multiply the skill score, so no amount of overlap can lift a
/// disqualified posting back above the threshold.
pub fn calculate_match_score(
    profile: &ProfileModel,
    posting: &JobPosting,
    penalties: &ScoringPenalties,
    computed_at: DateTime<Utc>,
) -> Result<ScoreResult, ScoringError> {
    validate_identifiers(profile, posting)?;

    let overlap = calculate_skill_overlap(profile, posting)?;
    let location_fit = calculate_location_fit(profile, posting);
    let seniority_fit = calculate_seniority_fit(profile, posting);

    let location_factor = match location_fit {
        LocationFit::Mismatch => penalties.location_mismatch_factor,
        LocationFit::Match | LocationFit::Unconstrained => 1.0,
    };
    let seniority_factor = match seniority_fit {
        SeniorityFit::Mismatch => penalties.seniority_mismatch_factor,
        SeniorityFit::WithinBand | SeniorityFit::Unconstrained => 1.0,
    };

    let score = (overlap.normalized() * 100.0 * location_factor * seniority_factor).clamp(0.0, 100.0);

    Ok(ScoreResult {
        resume_id: profile.resume_id.clone(),
        job_id: posting.job_id.clone(),
        employer_id: posting.employer_id.clone(),
        score,
        matched_skills: overlap.matched,
        raw_overlap: overlap.raw,
        location_fit,
        seniority_fit,
        computed_at,
    })
}

fn validate_identifiers(profile: &ProfileModel, posting: &JobPosting) -> Result<(), ScoringError> {
    if profile.resume_id.trim().is_empty() {
        return Err(ScoringError::MissingIdentifier("resume_id"));
    }
    if posting.job_id.trim().is_empty() {
        return Err(ScoringError::MissingIdentifier("job_id"));
    }
    if posting.employer_id.trim().is_empty() {
        return Err(ScoringError::MissingIdentifier("employer_id"));
    }
    Ok(())
}

#[inline]
fn validate_weight(token: &str, weight: f64) -> Result<(), ScoringError> {
    if weight.is_finite() && (0.0..=1.0).contains(&weight) {
        Ok(())
    } else {
        Err(ScoringError::InvalidWeight {
            token: token.to_string(),
            weight,
        })
    }
}

/// Calculate the weighted overlap of required tokens present in the profile
///
/// Duplicate profile tokens keep their highest weight; duplicate posting
/// tokens count once, at their first position.
pub fn calculate_skill_overlap(
    profile: &ProfileModel,
    posting: &JobPosting,
) -> Result<SkillOverlap, ScoringError> {
    let mut profile_weights: HashMap<String, f64> = HashMap::with_capacity(profile.skills.len());
    for skill in &profile.skills {
        let token = normalize_token(&skill.token);
        if token.is_empty() {
            return Err(ScoringError::EmptyToken("profile"));
        }
        validate_weight(&token, skill.weight)?;
        let entry = profile_weights.entry(token).or_insert(skill.weight);
        if skill.weight > *entry {
            *entry = skill.weight;
        }
    }

    let mut seen = HashSet::with_capacity(posting.required_skills.len());
    let mut raw = 0.0;
    let mut total_weight = 0.0;
    let mut matched = Vec::new();

    for required in &posting.required_skills {
        let token = normalize_token(&required.token);
        if token.is_empty() {
            return Err(ScoringError::EmptyToken("posting"));
        }
        validate_weight(&token, required.weight)?;
        if !seen.insert(token.clone()) {
            continue;
        }

        total_weight += required.weight;
        if let Some(profile_weight) = profile_weights.get(&token) {
            raw += required.weight * profile_weight;
            matched.push(token);
        }
    }

    Ok(SkillOverlap {
        raw,
        total_weight,
        matched,
    })
}

/// Remote postings match any preference set; an empty side imposes no constraint
#[inline]
pub fn calculate_location_fit(profile: &ProfileModel, posting: &JobPosting) -> LocationFit {
    let location = match posting.location.as_deref().map(normalize_token) {
        Some(loc) if !loc.is_empty() => loc,
        _ => return LocationFit::Unconstrained,
    };

    let preferences: HashSet<String> = profile
        .location_preferences
        .iter()
        .map(|tag| normalize_token(tag))
        .filter(|tag| !tag.is_empty())
        .collect();

    if preferences.is_empty() {
        LocationFit::Unconstrained
    } else if location == "remote" || preferences.contains(&location) {
        LocationFit::Match
    } else {
        LocationFit::Mismatch
    }
}

#[inline]
pub fn calculate_seniority_fit(profile: &ProfileModel, posting: &JobPosting) -> SeniorityFit {
    match (profile.seniority, posting.seniority) {
        (Some(candidate), Some(required)) if candidate.distance(required) > 1 => SeniorityFit::Mismatch,
        (Some(_), Some(_)) => SeniorityFit::WithinBand,
        _ => SeniorityFit::Unconstrained,
    }
}
