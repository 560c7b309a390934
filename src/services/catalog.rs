use crate::models::JobPosting;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when polling the job catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("API returned error: {0}")]
    ApiError(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
}

/// Source of open job postings
///
/// Each poll returns a finite snapshot and starts again from the beginning,
/// so a failed poll can simply be repeated.
#[async_trait]
pub trait JobCatalog: Send + Sync {
    async fn poll(&self) -> Result<Vec<JobPosting>, CatalogError>;

    async fn find(&self, job_id: &str) -> Result<Option<JobPosting>, CatalogError> {
        Ok(self.poll().await?.into_iter().find(|p| p.job_id == job_id))
    }
}

/// Fixed set of postings
#[derive(Debug, Clone, Default)]
pub struct StaticJobCatalog {
    postings: Vec<JobPosting>,
}

impl StaticJobCatalog {
    pub fn new(postings: Vec<JobPosting>) -> Self {
        Self { postings }
    }

    /// Load postings from a JSON file holding an array or `{"jobs": [...]}`
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::InvalidResponse(format!("{}: {}", path.display(), e)))?;
        let json: Value = serde_json::from_str(&raw)
            .map_err(|e| CatalogError::InvalidResponse(format!("{}: {}", path.display(), e)))?;

        Ok(Self::new(parse_postings(&json)?))
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }
}

#[async_trait]
impl JobCatalog for StaticJobCatalog {
    async fn poll(&self) -> Result<Vec<JobPosting>, CatalogError> {
        Ok(self.postings.clone())
    }
}

/// Catalog client for an HTTP job feed
///
/// Pages through `GET {base_url}/jobs?limit=..&offset=..` until a short page
/// is returned.
pub struct HttpJobCatalog {
    base_url: String,
    api_key: Option<String>,
    keywords: Option<String>,
    page_size: usize,
    client: Client,
}

impl HttpJobCatalog {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        keywords: Option<String>,
        page_size: usize,
        timeout: Duration,
    ) -> Result<Self, CatalogError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url,
            api_key,
            keywords,
            page_size: page_size.max(1),
            client,
        })
    }

    fn page_url(&self, offset: usize) -> String {
        let mut url = format!(
            "{}/jobs?limit={}&offset={}",
            self.base_url.trim_end_matches('/'),
            self.page_size,
            offset
        );
        if let Some(keywords) = &self.keywords {
            url.push_str("&q=");
            url.push_str(&urlencoding::encode(keywords));
        }
        url
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>, CatalogError> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CatalogError::ApiError(format!(
                "Catalog request failed: {}",
                response.status()
            )));
        }

        Ok(Some(response.json().await?))
    }
}

/// Parse a page of postings, skipping entries that do not deserialize
fn parse_postings(json: &Value) -> Result<Vec<JobPosting>, CatalogError> {
    let documents = json
        .get("jobs")
        .or(Some(json))
        .and_then(|d| d.as_array())
        .ok_or_else(|| CatalogError::InvalidResponse("Missing jobs array".into()))?;

    Ok(documents
        .iter()
        .filter_map(|doc| match serde_json::from_value::<JobPosting>(doc.clone()) {
            Ok(posting) => Some(posting),
            Err(e) => {
                tracing::warn!("Skipping malformed posting: {}", e);
                None
            }
        })
        .collect())
}

#[async_trait]
impl JobCatalog for HttpJobCatalog {
    async fn poll(&self) -> Result<Vec<JobPosting>, CatalogError> {
        let mut postings = Vec::new();
        let mut offset = 0;

        loop {
            let url = self.page_url(offset);
            let json = self
                .get_json(&url)
                .await?
                .ok_or_else(|| CatalogError::ApiError("Catalog jobs endpoint not found".into()))?;

            let page_len = json
                .get("jobs")
                .or(Some(&json))
                .and_then(|d| d.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            postings.extend(parse_postings(&json)?);

            if page_len < self.page_size {
                break;
            }
            offset += page_len;
        }

        tracing::debug!("Polled {} postings from catalog", postings.len());

        Ok(postings)
    }

    async fn find(&self, job_id: &str) -> Result<Option<JobPosting>, CatalogError> {
        let url = format!(
            "{}/jobs/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(job_id)
        );

        match self.get_json(&url).await? {
            Some(json) => serde_json::from_value(json)
                .map(Some)
                .map_err(|e| CatalogError::InvalidResponse(format!("Failed to parse posting: {}", e))),
            None => Ok(None),
        }
    }
}
