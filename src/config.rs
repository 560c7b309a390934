use crate::core::{BackoffPolicy, OrchestratorConfig, RateLimit};
use crate::models::{ScoringPenalties, ThresholdConfig};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    /// Absent means the process-local ledger is used
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub submission: SubmissionSettings,
    #[serde(default)]
    pub extractor: ExtractorSettings,
    #[serde(default)]
    pub scoring: ScoringSettings,
    #[serde(default)]
    pub threshold: ThresholdConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub workers: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
        }
    }
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
    /// Absent means profiles live only in the in-process cache
    pub redis_url: Option<String>,
    pub ttl_secs: Option<u64>,
    pub l1_cache_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub keywords: Option<String>,
    /// JSON array of postings used when no endpoint is configured
    pub postings_file: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            keywords: None,
            postings_file: None,
            page_size: default_page_size(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_page_size() -> usize { 50 }
fn default_request_timeout_secs() -> u64 { 30 }

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionSettings {
    #[serde(default = "default_submission_endpoint")]
    pub endpoint: String,
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            endpoint: default_submission_endpoint(),
            api_key: None,
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_submission_endpoint() -> String { "http://localhost:8081".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorSettings {
    /// Document extraction service; without it only JSON resumes are accepted
    pub endpoint: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringSettings {
    #[serde(default = "default_seniority_mismatch_factor")]
    pub seniority_mismatch_factor: f64,
    #[serde(default = "default_location_mismatch_factor")]
    pub location_mismatch_factor: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            seniority_mismatch_factor: default_seniority_mismatch_factor(),
            location_mismatch_factor: default_location_mismatch_factor(),
        }
    }
}

impl ScoringSettings {
    pub fn penalties(&self) -> ScoringPenalties {
        ScoringPenalties {
            seniority_mismatch_factor: self.seniority_mismatch_factor,
            location_mismatch_factor: self.location_mismatch_factor,
        }
    }
}

fn default_seniority_mismatch_factor() -> f64 { 0.5 }
fn default_location_mismatch_factor() -> f64 { 0.0 }

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
    #[serde(default = "default_ledger_retry_base_ms")]
    pub ledger_retry_base_ms: u64,
    #[serde(default = "default_ledger_retry_max_ms")]
    pub ledger_retry_max_ms: u64,
    #[serde(default = "default_employer_rate_per_sec")]
    pub employer_rate_per_sec: f64,
    #[serde(default = "default_employer_burst")]
    pub employer_burst: u32,
    #[serde(default = "default_submission_timeout_secs")]
    pub submission_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Age after which a SUBMITTING claim is treated as abandoned by a dead process
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_jitter: default_retry_jitter(),
            ledger_retry_base_ms: default_ledger_retry_base_ms(),
            ledger_retry_max_ms: default_ledger_retry_max_ms(),
            employer_rate_per_sec: default_employer_rate_per_sec(),
            employer_burst: default_employer_burst(),
            submission_timeout_secs: default_submission_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl OrchestratorSettings {
    /// Build the orchestrator configuration; the daily cap comes from the threshold policy
    pub fn to_config(&self, max_applications_per_day: Option<u32>) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            retry_backoff: BackoffPolicy::new(
                Duration::from_millis(self.retry_base_ms),
                Duration::from_millis(self.retry_max_ms),
                self.retry_jitter,
            ),
            ledger_backoff: BackoffPolicy::new(
                Duration::from_millis(self.ledger_retry_base_ms),
                Duration::from_millis(self.ledger_retry_max_ms),
                self.retry_jitter,
            ),
            rate_limit: RateLimit::new(self.employer_rate_per_sec, self.employer_burst),
            submission_timeout: Duration::from_secs(self.submission_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            claim_lease: Duration::from_secs(self.claim_lease_secs),
            max_applications_per_day,
        }
    }
}

fn default_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 64 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_ms() -> u64 { 500 }
fn default_retry_max_ms() -> u64 { 30_000 }
fn default_retry_jitter() -> f64 { 0.25 }
fn default_ledger_retry_base_ms() -> u64 { 200 }
fn default_ledger_retry_max_ms() -> u64 { 5_000 }
fn default_employer_rate_per_sec() -> f64 { 0.2 }
fn default_employer_burst() -> u32 { 2 }
fn default_submission_timeout_secs() -> u64 { 30 }
fn default_shutdown_grace_secs() -> u64 { 20 }
fn default_claim_lease_secs() -> u64 { 120 }

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Settings {
    /// Load configuration from file and environment variables
    ///
    /// Configuration is loaded in the following order (later overrides earlier):
    /// 1. Default values in the struct
    /// 2. Configuration file (config/default.toml)
    /// 3. Local overrides (config/local.toml)
    /// 4. Environment variables (prefixed with AUTOAPPLY__)
    /// 5. DATABASE_URL and REDIS_URL
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g., AUTOAPPLY__ORCHESTRATOR__WORKERS -> orchestrator.workers
            .add_source(
                Environment::with_prefix("AUTOAPPLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = substitute_env_vars(settings)?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load configuration from a custom path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("AUTOAPPLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let orchestrator = &self.orchestrator;

        if orchestrator.workers == 0 {
            return Err(ConfigError::Message("orchestrator.workers must be at least 1".into()));
        }
        if orchestrator.max_retries == 0 {
            return Err(ConfigError::Message("orchestrator.max_retries must be at least 1".into()));
        }
        if !(orchestrator.employer_rate_per_sec.is_finite() && orchestrator.employer_rate_per_sec > 0.0) {
            return Err(ConfigError::Message(
                "orchestrator.employer_rate_per_sec must be positive".into(),
            ));
        }
        if orchestrator.claim_lease_secs
            <= orchestrator.submission_timeout_secs.saturating_add(orchestrator.shutdown_grace_secs)
        {
            return Err(ConfigError::Message(
                "orchestrator.claim_lease_secs must exceed submission_timeout_secs + shutdown_grace_secs".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.threshold.min_score) {
            return Err(ConfigError::Message("threshold.min_score must be within 0-100".into()));
        }
        for factor in [self.scoring.seniority_mismatch_factor, self.scoring.location_mismatch_factor] {
            if !(0.0..=1.0).contains(&factor) {
                return Err(ConfigError::Message("scoring penalty factors must be within 0-1".into()));
            }
        }

        Ok(())
    }
}

/// Apply the conventional DATABASE_URL / REDIS_URL variables on top of the layered config
fn substitute_env_vars(settings: Config) -> Result<Config, ConfigError> {
    use std::env;

    let mut builder = Config::builder().add_source(settings);

    if let Ok(database_url) = env::var("DATABASE_URL") {
        builder = builder.set_override("database.url", database_url)?;
    }
    if let Ok(redis_url) = env::var("REDIS_URL") {
        builder = builder.set_override("cache.redis_url", redis_url)?;
    }

    builder.build()
}
