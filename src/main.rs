use actix_cors::Cors;
use actix_web::{web, App, HttpServer, HttpResponse, middleware, error, http::StatusCode};
use auto_apply::config::Settings;
use auto_apply::core::{AutoApplyOrchestrator, AutoApplyRunner, MatchScorer, ShutdownSignal};
use auto_apply::routes::{self, AppState};
use auto_apply::services::{
    ApplicationLedger, CacheManager, HttpJobCatalog, HttpResumeExtractor, HttpSubmissionClient,
    InMemoryLedger, JobCatalog, PostgresLedger, ResumeIntake, StaticJobCatalog, MAX_RESUME_BYTES,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, error};
use tracing_subscriber::EnvFilter;

/// JSON error response for JSON payload errors
#[derive(Debug, serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for JsonError {}

impl error::ResponseError for JsonError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST))
            .json(self)
    }
}

/// Handle JSON payload errors
pub fn handle_json_payload_error(err: error::JsonPayloadError, req: &actix_web::HttpRequest) -> actix_web::Error {
    tracing::info!("JSON payload error on {}: {}", req.path(), err);
    JsonError {
        error: "invalid_json".to_string(),
        message: format!("Invalid JSON: {}", err),
        status_code: 400,
    }
    .into()
}

/// Handle query payload errors
pub fn handle_query_payload_error(err: error::QueryPayloadError, req: &actix_web::HttpRequest) -> actix_web::Error {
    tracing::info!("Query error on {}: {}", req.path(), err);
    JsonError {
        error: "invalid_query".to_string(),
        message: format!("Invalid query: {}", err),
        status_code: 400,
    }
    .into()
}

fn startup_error(context: &str, err: impl std::fmt::Display) -> std::io::Error {
    error!("{}: {}", context, err);
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, err))
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    if format == "pretty" {
        subscriber.pretty().init();
    } else {
        subscriber.init();
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenv::dotenv().ok();

    let loaded = Settings::load();

    // LOG_LEVEL and LOG_FORMAT win over the config file
    let (file_level, file_format) = match &loaded {
        Ok(settings) => (settings.logging.level.clone(), settings.logging.format.clone()),
        Err(_) => ("info".to_string(), "json".to_string()),
    };
    let log_level = std::env::var("LOG_LEVEL").unwrap_or(file_level);
    let log_format = std::env::var("LOG_FORMAT").unwrap_or(file_format);
    init_logging(&log_level, &log_format);

    info!("Starting auto-apply service...");

    let settings = loaded.map_err(|e| startup_error("Failed to load configuration", e))?;

    info!("Configuration loaded successfully");

    // Application ledger
    let ledger: Arc<dyn ApplicationLedger> = match &settings.database {
        Some(db) => {
            let ledger = PostgresLedger::from_settings(
                &db.url,
                db.max_connections,
                db.min_connections,
                db.acquire_timeout_secs,
                db.idle_timeout_secs,
            )
            .await
            .map_err(|e| startup_error("Failed to connect to PostgreSQL", e))?;
            info!("PostgreSQL ledger initialized");
            Arc::new(ledger)
        }
        None => {
            warn!("No database configured, application ledger is in-memory and will not survive restarts");
            Arc::new(InMemoryLedger::new())
        }
    };

    // Profile cache (Redis is optional)
    let cache_ttl = settings.cache.ttl_secs.unwrap_or(86_400);
    let l1_cache_size = settings.cache.l1_cache_size.unwrap_or(1000);

    let cache = match &settings.cache.redis_url {
        Some(url) => match CacheManager::new(url, l1_cache_size, cache_ttl).await {
            Ok(c) => {
                info!("Cache manager initialized (L1: {} entries, TTL: {}s)", l1_cache_size, cache_ttl);
                c
            }
            Err(e) => {
                error!("Failed to connect to Redis ({}), profiles are cached in-process only", e);
                CacheManager::in_memory(l1_cache_size, cache_ttl)
            }
        },
        None => CacheManager::in_memory(l1_cache_size, cache_ttl),
    };
    let cache = Arc::new(cache);

    // Job catalog
    let catalog: Arc<dyn JobCatalog> = match (&settings.catalog.endpoint, &settings.catalog.postings_file) {
        (Some(endpoint), _) => {
            let catalog = HttpJobCatalog::new(
                endpoint.clone(),
                settings.catalog.api_key.clone(),
                settings.catalog.keywords.clone(),
                settings.catalog.page_size,
                Duration::from_secs(settings.catalog.timeout_secs),
            )
            .map_err(|e| startup_error("Failed to build catalog client", e))?;
            info!("Polling job catalog at {}", endpoint);
            Arc::new(catalog)
        }
        (None, Some(path)) => {
            let catalog = StaticJobCatalog::from_file(path)
                .map_err(|e| startup_error("Failed to load postings file", e))?;
            info!("Loaded {} postings from {}", catalog.len(), path);
            Arc::new(catalog)
        }
        (None, None) => {
            warn!("No job catalog configured, serving an empty catalog");
            Arc::new(StaticJobCatalog::default())
        }
    };

    let submission = HttpSubmissionClient::new(
        settings.submission.endpoint.clone(),
        settings.submission.api_key.clone(),
        Duration::from_secs(settings.submission.timeout_secs),
    )
    .map_err(|e| startup_error("Failed to build submission client", e))?;

    let documents = match &settings.extractor.endpoint {
        Some(endpoint) => Some(
            HttpResumeExtractor::new(endpoint.clone(), Duration::from_secs(settings.extractor.timeout_secs))
                .map_err(|e| startup_error("Failed to build extraction client", e))?,
        ),
        None => {
            warn!("No extraction service configured, only JSON resumes are accepted");
            None
        }
    };

    let scorer = MatchScorer::new(settings.scoring.penalties());
    info!("Scorer initialized with penalties: {:?}", scorer.penalties());

    // Background auto-apply runs live on their own runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.orchestrator.workers.max(1))
        .thread_name("auto-apply")
        .enable_all()
        .build()?;

    let orchestrator_config = settings
        .orchestrator
        .to_config(settings.threshold.max_applications_per_day);
    let shutdown_grace = orchestrator_config.shutdown_grace;
    info!(
        "Orchestrator: {} workers, {} retries, daily cap {:?}, claim lease {:?}",
        orchestrator_config.workers,
        orchestrator_config.max_retries,
        orchestrator_config.max_applications_per_day,
        orchestrator_config.claim_lease
    );

    let orchestrator = Arc::new(AutoApplyOrchestrator::new(
        ledger.clone(),
        Arc::new(submission),
        orchestrator_config,
    ));

    // Claims left SUBMITTING past their lease belong to a process that died
    match orchestrator.reclaim_stale().await {
        Ok(0) => {}
        Ok(n) => warn!("Reset {} stale in-flight application(s) to PENDING", n),
        Err(e) => {
            runtime.shutdown_background();
            return Err(startup_error("Failed to reset in-flight applications", e));
        }
    }

    let (trigger, shutdown) = ShutdownSignal::new();
    let runner = Arc::new(AutoApplyRunner::new(
        orchestrator,
        catalog.clone(),
        scorer.clone(),
        settings.threshold.clone(),
        runtime.handle().clone(),
        shutdown,
    ));

    // Build application state
    let app_state = AppState {
        ledger,
        cache,
        catalog,
        extractor: Arc::new(ResumeIntake::new(documents)),
        scorer,
        threshold: settings.threshold.clone(),
        runner: runner.clone(),
    };

    // Configure HTTP server
    let host = settings.server.host.clone();
    let port = settings.server.port;
    let workers = settings.server.workers.unwrap_or(4);

    info!("Starting HTTP server on {}:{}", host, port);

    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::PayloadConfig::new(MAX_RESUME_BYTES + 64 * 1024))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .app_data(web::QueryConfig::default().error_handler(handle_query_payload_error))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes::configure_routes)
    })
    .workers(workers)
    .bind((host, port));

    // The runs' runtime must be shut down explicitly on every path
    let served = match server {
        Ok(server) => server.run().await,
        Err(e) => {
            error!("Failed to bind HTTP server: {}", e);
            Err(e)
        }
    };

    info!("HTTP server stopped, draining auto-apply runs");
    trigger.trigger();

    let drain_runner = runner.clone();
    let drained = runtime
        .spawn(async move { drain_runner.drain(shutdown_grace + Duration::from_secs(5)).await })
        .await
        .unwrap_or(false);
    if !drained {
        warn!("Exiting with auto-apply runs still active");
    }

    runtime.shutdown_background();
    served
}
