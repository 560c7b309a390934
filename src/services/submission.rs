use crate::models::SubmissionOutcome;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while building the submission client
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),
}

/// Performs the actual application submission against an employer portal
///
/// Implementations classify every result as success, transient or permanent;
/// the orchestrator never inspects transport details.
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    async fn submit(&self, resume_id: &str, job_id: &str) -> SubmissionOutcome;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionPayload<'a> {
    resume_id: &'a str,
    job_id: &'a str,
}

/// Submission client for an HTTP application gateway
pub struct HttpSubmissionClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSubmissionClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self, SubmissionError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }
}

/// Map a gateway response status onto the outcome trichotomy
pub fn classify_status(status: StatusCode, body: &str) -> SubmissionOutcome {
    if status.is_success() {
        return SubmissionOutcome::Success;
    }

    let reason = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        SubmissionOutcome::TransientFailure(reason)
    } else {
        SubmissionOutcome::PermanentFailure(reason)
    }
}

#[async_trait]
impl SubmissionClient for HttpSubmissionClient {
    async fn submit(&self, resume_id: &str, job_id: &str) -> SubmissionOutcome {
        let url = format!("{}/applications", self.base_url.trim_end_matches('/'));

        let mut request = self
            .client
            .post(&url)
            .json(&SubmissionPayload { resume_id, job_id });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Submission transport error for {}/{}: {}", resume_id, job_id, e);
                return SubmissionOutcome::TransientFailure(e.to_string());
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let outcome = classify_status(status, &body);

        tracing::debug!("Submission {}/{} returned {} -> {:?}", resume_id, job_id, status, outcome);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::CREATED, ""), SubmissionOutcome::Success);
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            SubmissionOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            SubmissionOutcome::TransientFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GONE, "posting closed"),
            SubmissionOutcome::PermanentFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            SubmissionOutcome::PermanentFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_submit_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/applications")
            .match_body(mockito::Matcher::Json(serde_json::json!({"resumeId": "r1", "jobId": "j1"})))
            .with_status(201)
            .create_async()
            .await;

        let client = HttpSubmissionClient::new(server.url(), None, Duration::from_secs(5)).unwrap();
        let outcome = client.submit("r1", "j1").await;

        assert_eq!(outcome, SubmissionOutcome::Success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_rate_limited_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/applications")
            .with_status(429)
            .with_body("too many requests")
            .create_async()
            .await;

        let client = HttpSubmissionClient::new(server.url(), Some("key".to_string()), Duration::from_secs(5)).unwrap();
        let outcome = client.submit("r1", "j1").await;

        assert!(matches!(outcome, SubmissionOutcome::TransientFailure(reason) if reason.contains("too many requests")));
    }

    #[tokio::test]
    async fn test_submit_closed_posting_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/applications")
            .with_status(410)
            .create_async()
            .await;

        let client = HttpSubmissionClient::new(server.url(), None, Duration::from_secs(5)).unwrap();

        assert!(matches!(
            client.submit("r1", "j1").await,
            SubmissionOutcome::PermanentFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let client = HttpSubmissionClient::new(
            "http://127.0.0.1:1".to_string(),
            None,
            Duration::from_secs(2),
        )
        .unwrap();

        assert!(matches!(
            client.submit("r1", "j1").await,
            SubmissionOutcome::TransientFailure(_)
        ));
    }
}
