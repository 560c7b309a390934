use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use validator::Validate;
use crate::core::{evaluate_eligibility, meets_min_score, AutoApplyRunner, MatchScorer, RunnerError};
use crate::models::{
    ApplicationState, ApplicationsResponse, AutoApplyRequest, AutoApplyResponse, CalculateMatchRequest,
    CalculateMatchResponse, ErrorResponse, HealthResponse, ListApplicationsQuery, ListJobsQuery,
    ListJobsResponse, ProfileModel, RankedJob, ThresholdConfig, UploadResumeResponse,
};
use crate::services::{
    validate_upload, ApplicationLedger, CacheManager, ExtractionError, JobCatalog, ResumeExtractor,
};
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn ApplicationLedger>,
    pub cache: Arc<CacheManager>,
    pub catalog: Arc<dyn JobCatalog>,
    pub extractor: Arc<dyn ResumeExtractor>,
    pub scorer: MatchScorer,
    pub threshold: ThresholdConfig,
    pub runner: Arc<AutoApplyRunner>,
}

/// Routes mounted at the server root
pub fn configure_root(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/", web::get().to(index))
        .route("/health", web::get().to(health_check));
}

/// Routes mounted under `/api`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/resume/upload", web::post().to(upload_resume))
        .route("/jobs", web::get().to(list_jobs))
        .route("/applications", web::get().to(list_applications))
        .route("/matching/calculate", web::post().to(calculate_match))
        .route("/auto-apply", web::post().to(start_auto_apply));
}

fn error_json(status: StatusCode, error: &str, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: error.to_string(),
        message: message.into(),
        status_code: status.as_u16(),
    })
}

/// Fetch an uploaded profile or the response to return instead
async fn load_profile(state: &AppState, resume_id: &str) -> Result<ProfileModel, HttpResponse> {
    match state.cache.get_profile(resume_id).await {
        Ok(Some(profile)) => Ok(profile),
        Ok(None) => Err(error_json(
            StatusCode::NOT_FOUND,
            "Resume not found",
            format!("No uploaded resume with id {}", resume_id),
        )),
        Err(e) => {
            tracing::error!("Failed to load profile {}: {}", resume_id, e);
            Err(error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load resume", e.to_string()))
        }
    }
}

async fn index() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /health",
            "POST /api/resume/upload",
            "GET /api/jobs?resumeId=",
            "GET /api/applications?resumeId=",
            "POST /api/matching/calculate",
            "POST /api/auto-apply",
        ],
    }))
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let ledger_healthy = state.ledger.health_check().await.unwrap_or(false);
    let cache_healthy = state.cache.health_check().await;

    let status = if ledger_healthy && cache_healthy { "healthy" } else { "degraded" };

    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// Upload a resume
///
/// POST /api/resume/upload
///
/// The body is the raw document. `Content-Type` selects the format (PDF,
/// DOCX or pre-extracted JSON) and the optional `X-Filename` header is
/// echoed back.
async fn upload_resume(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> impl Responder {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let filename = req
        .headers()
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Err(e) = validate_upload(&content_type, body.len()) {
        tracing::info!("Rejected resume upload ({} bytes, {}): {}", body.len(), content_type, e);
        return extraction_error_response(e);
    }

    let resume_id = format!("resume_{}", uuid::Uuid::new_v4().simple());

    let profile = match state.extractor.extract(&resume_id, &content_type, &body).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!("Extraction failed for {}: {}", resume_id, e);
            return extraction_error_response(e);
        }
    };

    if let Err(e) = state.cache.put_profile(&profile).await {
        tracing::error!("Failed to store profile {}: {}", resume_id, e);
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store resume", e.to_string());
    }

    tracing::info!(
        "Stored resume {} ({} bytes, {} skills)",
        resume_id,
        body.len(),
        profile.skills.len()
    );

    HttpResponse::Ok().json(UploadResumeResponse {
        resume_id,
        filename,
        size: body.len(),
        skill_count: profile.skills.len(),
        message: "Resume uploaded and parsed".to_string(),
    })
}

fn extraction_error_response(err: ExtractionError) -> HttpResponse {
    let (status, error) = match &err {
        ExtractionError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "Resume too large"),
        ExtractionError::Empty => (StatusCode::BAD_REQUEST, "Empty resume"),
        ExtractionError::UnsupportedFormat(_) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported format"),
        ExtractionError::Malformed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "Extraction failed"),
        ExtractionError::ServiceError(_) | ExtractionError::RequestError(_) => {
            (StatusCode::BAD_GATEWAY, "Extraction service error")
        }
    };
    error_json(status, error, err.to_string())
}

/// Ranked postings for a resume
///
/// GET /api/jobs?resumeId={resumeId}&limit=10&offset=0
async fn list_jobs(state: web::Data<AppState>, query: web::Query<ListJobsQuery>) -> impl Responder {
    if let Err(errors) = query.validate() {
        return error_json(StatusCode::BAD_REQUEST, "Validation failed", errors.to_string());
    }

    let profile = match load_profile(&state, &query.resume_id).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };

    let postings = match state.catalog.poll().await {
        Ok(postings) => postings,
        Err(e) => {
            tracing::error!("Failed to poll catalog for {}: {}", query.resume_id, e);
            return error_json(StatusCode::BAD_GATEWAY, "Failed to fetch jobs", e.to_string());
        }
    };

    let result = state
        .scorer
        .rank(&profile, postings, query.offset as usize, query.limit as usize);

    let jobs: Vec<RankedJob> = result
        .matches
        .into_iter()
        .map(|scored| RankedJob {
            id: scored.posting.job_id,
            title: scored.posting.title,
            company: scored.posting.employer_id,
            location: scored.posting.location,
            match_score: scored.result.score,
            matched_keywords: scored.result.matched_skills,
        })
        .collect();

    tracing::info!(
        "Returning {} jobs for {} (from {} postings)",
        jobs.len(),
        query.resume_id,
        result.total_candidates
    );

    HttpResponse::Ok().json(ListJobsResponse {
        total: result.total_candidates - result.rejected,
        limit: query.limit,
        offset: query.offset,
        jobs,
    })
}

/// Application records and totals for a resume
///
/// GET /api/applications?resumeId={resumeId}
async fn list_applications(
    state: web::Data<AppState>,
    query: web::Query<ListApplicationsQuery>,
) -> impl Responder {
    if let Err(errors) = query.validate() {
        return error_json(StatusCode::BAD_REQUEST, "Validation failed", errors.to_string());
    }

    let applications = match state.ledger.list_for_resume(&query.resume_id).await {
        Ok(records) => records,
        Err(e) if e.is_unavailable() => {
            return error_json(StatusCode::SERVICE_UNAVAILABLE, "Ledger unavailable", e.to_string());
        }
        Err(e) => {
            tracing::error!("Failed to list applications for {}: {}", query.resume_id, e);
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list applications", e.to_string());
        }
    };

    let count = |states: &[ApplicationState]| {
        applications.iter().filter(|r| states.contains(&r.state)).count()
    };

    HttpResponse::Ok().json(ApplicationsResponse {
        total_applications: applications.len(),
        applied: count(&[ApplicationState::Submitted]),
        pending: count(&[ApplicationState::Pending, ApplicationState::Submitting]),
        failed: count(&[ApplicationState::Failed]),
        skipped: count(&[ApplicationState::SkippedDuplicate]),
        applications,
    })
}

/// Score one resume against one posting
///
/// POST /api/matching/calculate
///
/// Request body:
/// ```json
/// { "resumeId": "string", "jobId": "string" }
/// ```
async fn calculate_match(
    state: web::Data<AppState>,
    req: web::Json<CalculateMatchRequest>,
) -> impl Responder {
    if let Err(errors) = req.validate() {
        return error_json(StatusCode::BAD_REQUEST, "Validation failed", errors.to_string());
    }

    let profile = match load_profile(&state, &req.resume_id).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };

    let posting = match state.catalog.find(&req.job_id).await {
        Ok(Some(posting)) => posting,
        Ok(None) => {
            return error_json(
                StatusCode::NOT_FOUND,
                "Job not found",
                format!("No open posting with id {}", req.job_id),
            );
        }
        Err(e) => {
            tracing::error!("Failed to fetch posting {}: {}", req.job_id, e);
            return error_json(StatusCode::BAD_GATEWAY, "Failed to fetch job", e.to_string());
        }
    };

    let result = match state.scorer.score(&profile, &posting) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("Failed to score {} against {}: {}", req.resume_id, req.job_id, e);
            return error_json(StatusCode::UNPROCESSABLE_ENTITY, "Scoring failed", e.to_string());
        }
    };

    let eligibility = evaluate_eligibility(&result, &state.threshold);

    HttpResponse::Ok().json(CalculateMatchResponse {
        resume_id: result.resume_id.clone(),
        job_id: result.job_id.clone(),
        match_score: result.score,
        threshold_met: meets_min_score(&result, &state.threshold),
        auto_apply_eligible: eligibility.is_eligible(),
        rejection_reason: (!eligibility.is_eligible()).then(|| eligibility.to_string()),
        matched_keywords: result.matched_skills,
    })
}

/// Start a background auto-apply run
///
/// POST /api/auto-apply
///
/// Request body:
/// ```json
/// { "resumeId": "string" }
/// ```
async fn start_auto_apply(
    state: web::Data<AppState>,
    req: web::Json<AutoApplyRequest>,
) -> impl Responder {
    if let Err(errors) = req.validate() {
        return error_json(StatusCode::BAD_REQUEST, "Validation failed", errors.to_string());
    }

    let profile = match load_profile(&state, &req.resume_id).await {
        Ok(profile) => profile,
        Err(response) => return response,
    };

    match state.runner.start(profile) {
        Ok(_) => {
            tracing::info!("Auto-apply started for {}", req.resume_id);
            HttpResponse::Accepted().json(AutoApplyResponse {
                status: "processing".to_string(),
                resume_id: req.resume_id.clone(),
                message: "Auto-apply started; check /api/applications for progress".to_string(),
            })
        }
        Err(RunnerError::AlreadyRunning(resume_id)) => error_json(
            StatusCode::CONFLICT,
            "Auto-apply already running",
            format!("An auto-apply run for {} is still in progress", resume_id),
        ),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to start auto-apply", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AutoApplyOrchestrator, OrchestratorConfig, RateLimit, ShutdownSignal};
    use crate::models::{JobPosting, RequiredSkill, SubmissionOutcome};
    use crate::services::{
        InMemoryLedger, ResumeIntake, StaticJobCatalog, SubmissionClient, MAX_RESUME_BYTES,
    };
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::time::Duration;

    struct AcceptAll;

    #[async_trait]
    impl SubmissionClient for AcceptAll {
        async fn submit(&self, _resume_id: &str, _job_id: &str) -> SubmissionOutcome {
            SubmissionOutcome::Success
        }
    }

    fn posting(job_id: &str, skills: &[&str]) -> JobPosting {
        JobPosting {
            job_id: job_id.to_string(),
            employer_id: "acme".to_string(),
            title: Some("Backend Engineer".to_string()),
            required_skills: skills.iter().map(|s| RequiredSkill::new(s, 1.0)).collect(),
            location: Some("remote".to_string()),
            seniority: None,
            compensation: None,
            posted_at: chrono::Utc::now(),
        }
    }

    fn state() -> AppState {
        let ledger = Arc::new(InMemoryLedger::new());
        let catalog: Arc<dyn JobCatalog> = Arc::new(StaticJobCatalog::new(vec![
            posting("py-api", &["python", "fastapi"]),
            posting("py-db", &["python", "postgresql"]),
            posting("go", &["go"]),
        ]));
        let config = OrchestratorConfig {
            rate_limit: RateLimit::new(1000.0, 100),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Arc::new(AutoApplyOrchestrator::new(ledger.clone(), Arc::new(AcceptAll), config));
        let runner = Arc::new(AutoApplyRunner::new(
            orchestrator,
            catalog.clone(),
            MatchScorer::default(),
            ThresholdConfig::default(),
            tokio::runtime::Handle::current(),
            ShutdownSignal::never(),
        ));

        AppState {
            ledger,
            cache: Arc::new(CacheManager::in_memory(100, 60)),
            catalog,
            extractor: Arc::new(ResumeIntake::new(None)),
            scorer: MatchScorer::default(),
            threshold: ThresholdConfig::default(),
            runner,
        }
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .app_data(web::PayloadConfig::new(MAX_RESUME_BYTES + 64 * 1024))
                    .configure(configure_root)
                    .service(web::scope("/api").configure(configure)),
            )
            .await
        };
    }

    const RESUME_JSON: &str = r#"{"skills": [{"name": "Python", "weight": 1.0}, {"name": "FastAPI", "weight": 1.0}]}"#;

    macro_rules! upload {
        ($app:expr) => {{
            let req = test::TestRequest::post()
                .uri("/api/resume/upload")
                .insert_header((header::CONTENT_TYPE, "application/json"))
                .insert_header(("x-filename", "resume.json"))
                .set_payload(RESUME_JSON)
                .to_request();
            let body: serde_json::Value = test::call_and_read_body_json($app, req).await;
            body["resume_id"].as_str().unwrap().to_string()
        }};
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = app!(state());
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
    }

    #[actix_web::test]
    async fn test_upload_and_calculate_match() {
        let app = app!(state());
        let resume_id = upload!(&app);
        assert!(resume_id.starts_with("resume_"));

        let req = test::TestRequest::post()
            .uri("/api/matching/calculate")
            .set_json(serde_json::json!({"resumeId": resume_id, "jobId": "py-db"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["match_score"], 50.0);
        assert_eq!(body["matched_keywords"], serde_json::json!(["python"]));
        assert_eq!(body["threshold_met"], false);
        assert_eq!(body["auto_apply_eligible"], false);
        assert!(body["rejection_reason"].as_str().unwrap().contains("below minimum"));
    }

    #[actix_web::test]
    async fn test_upload_rejects_unsupported_type() {
        let app = app!(state());
        let req = test::TestRequest::post()
            .uri("/api/resume/upload")
            .insert_header((header::CONTENT_TYPE, "image/png"))
            .set_payload(vec![1u8; 16])
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[actix_web::test]
    async fn test_upload_rejects_oversized_resume() {
        let app = app!(state());
        let req = test::TestRequest::post()
            .uri("/api/resume/upload")
            .insert_header((header::CONTENT_TYPE, "application/pdf"))
            .set_payload(vec![0u8; MAX_RESUME_BYTES + 1])
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[actix_web::test]
    async fn test_list_jobs_ranks_postings() {
        let app = app!(state());
        let resume_id = upload!(&app);

        let req = test::TestRequest::get()
            .uri(&format!("/api/jobs?resumeId={}&limit=2", resume_id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["total"], 3);
        let ids: Vec<&str> = body["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|j| j["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["py-api", "py-db"]);
    }

    #[actix_web::test]
    async fn test_unknown_resume_is_not_found() {
        let app = app!(state());
        let req = test::TestRequest::get().uri("/api/jobs?resumeId=resume_missing").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_invalid_limit_is_rejected() {
        let app = app!(state());
        let req = test::TestRequest::get().uri("/api/jobs?resumeId=r1&limit=500").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_auto_apply_submits_eligible_jobs() {
        let app = app!(state());
        let resume_id = upload!(&app);

        let req = test::TestRequest::post()
            .uri("/api/auto-apply")
            .set_json(serde_json::json!({"resumeId": resume_id}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let mut applied = 0;
        for _ in 0..100 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/applications?resumeId={}", resume_id))
                .to_request();
            let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
            applied = body["applied"].as_u64().unwrap();
            if applied == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Only py-api clears the default threshold of 70
        assert_eq!(applied, 1);
    }
}
