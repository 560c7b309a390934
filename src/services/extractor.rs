use crate::models::{CompensationRange, ProfileModel, SeniorityLevel, Skill};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Largest resume upload accepted
pub const MAX_RESUME_BYTES: usize = 5 * 1024 * 1024;

pub const CONTENT_TYPE_PDF: &str = "application/pdf";
pub const CONTENT_TYPE_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Errors raised while turning an uploaded resume into a profile
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Resume is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Resume is empty")]
    Empty,

    #[error("Unsupported resume format: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed extraction result: {0}")]
    Malformed(String),

    #[error("Extraction service error: {0}")]
    ServiceError(String),

    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
}

/// Turns raw resume bytes into a normalized profile
#[async_trait]
pub trait ResumeExtractor: Send + Sync {
    async fn extract(
        &self,
        resume_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ProfileModel, ExtractionError>;
}

/// Strip parameters such as `; charset=utf-8` and lowercase the media type
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Check an upload's size and type before extraction
pub fn validate_upload(content_type: &str, size: usize) -> Result<(), ExtractionError> {
    if size == 0 {
        return Err(ExtractionError::Empty);
    }
    if size > MAX_RESUME_BYTES {
        return Err(ExtractionError::TooLarge {
            size,
            max: MAX_RESUME_BYTES,
        });
    }

    match media_type(content_type).as_str() {
        CONTENT_TYPE_PDF | CONTENT_TYPE_DOCX | CONTENT_TYPE_JSON => Ok(()),
        other => Err(ExtractionError::UnsupportedFormat(other.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractedSkill {
    name: String,
    #[serde(default = "default_skill_weight")]
    weight: f64,
}

fn default_skill_weight() -> f64 { 1.0 }

/// Structured signals produced by an extraction service
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractedResume {
    #[serde(default)]
    skills: Vec<ExtractedSkill>,
    #[serde(default)]
    seniority: Option<SeniorityLevel>,
    #[serde(default)]
    location_preferences: Vec<String>,
    #[serde(default)]
    desired_compensation: Option<CompensationRange>,
}

impl ExtractedResume {
    fn into_profile(self, resume_id: &str) -> Result<ProfileModel, ExtractionError> {
        let mut skills = Vec::with_capacity(self.skills.len());
        for extracted in self.skills {
            if !(extracted.weight.is_finite() && (0.0..=1.0).contains(&extracted.weight)) {
                return Err(ExtractionError::Malformed(format!(
                    "skill '{}' has weight {}",
                    extracted.name, extracted.weight
                )));
            }
            let skill = Skill::new(extracted.name, extracted.weight);
            if !skill.token.is_empty() {
                skills.push(skill);
            }
        }

        let location_preferences: BTreeSet<String> = self
            .location_preferences
            .iter()
            .map(|tag| crate::models::normalize_token(tag))
            .filter(|tag| !tag.is_empty())
            .collect();

        Ok(ProfileModel {
            resume_id: resume_id.to_string(),
            skills,
            seniority: self.seniority,
            location_preferences,
            desired_compensation: self.desired_compensation,
        })
    }
}

fn parse_extracted(bytes: &[u8], resume_id: &str) -> Result<ProfileModel, ExtractionError> {
    let extracted: ExtractedResume =
        serde_json::from_slice(bytes).map_err(|e| ExtractionError::Malformed(e.to_string()))?;
    extracted.into_profile(resume_id)
}

/// Accepts resumes that were already reduced to structured JSON signals
#[derive(Debug, Clone, Default)]
pub struct JsonResumeExtractor;

#[async_trait]
impl ResumeExtractor for JsonResumeExtractor {
    async fn extract(
        &self,
        resume_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ProfileModel, ExtractionError> {
        if media_type(content_type) != CONTENT_TYPE_JSON {
            return Err(ExtractionError::UnsupportedFormat(media_type(content_type)));
        }
        parse_extracted(bytes, resume_id)
    }
}

/// Forwards PDF/DOCX documents to an external extraction service
pub struct HttpResumeExtractor {
    endpoint: String,
    client: Client,
}

impl HttpResumeExtractor {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl ResumeExtractor for HttpResumeExtractor {
    async fn extract(
        &self,
        resume_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ProfileModel, ExtractionError> {
        let url = format!("{}/extract", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, media_type(content_type))
            .body(bytes.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Extraction failed for {}: {} - {}", resume_id, status, body);
            return Err(ExtractionError::ServiceError(format!("{}: {}", status, body)));
        }

        let body = response.bytes().await?;
        parse_extracted(&body, resume_id)
    }
}

/// Routes uploads to the JSON extractor or the document extraction service
pub struct ResumeIntake {
    json: JsonResumeExtractor,
    documents: Option<HttpResumeExtractor>,
}

impl ResumeIntake {
    pub fn new(documents: Option<HttpResumeExtractor>) -> Self {
        Self {
            json: JsonResumeExtractor,
            documents,
        }
    }
}

#[async_trait]
impl ResumeExtractor for ResumeIntake {
    async fn extract(
        &self,
        resume_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<ProfileModel, ExtractionError> {
        validate_upload(content_type, bytes.len())?;

        if media_type(content_type) == CONTENT_TYPE_JSON {
            return self.json.extract(resume_id, content_type, bytes).await;
        }

        match &self.documents {
            Some(extractor) => extractor.extract(resume_id, content_type, bytes).await,
            None => Err(ExtractionError::UnsupportedFormat(format!(
                "{} (no extraction service configured)",
                media_type(content_type)
            ))),
        }
    }
}
