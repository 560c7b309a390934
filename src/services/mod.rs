// Service exports
pub mod cache;
pub mod catalog;
pub mod extractor;
pub mod ledger;
pub mod postgres;
pub mod submission;

pub use cache::{CacheError, CacheKey, CacheManager};
pub use catalog::{CatalogError, HttpJobCatalog, JobCatalog, StaticJobCatalog};
pub use extractor::{
    validate_upload, ExtractionError, HttpResumeExtractor, JsonResumeExtractor, ResumeExtractor,
    ResumeIntake, MAX_RESUME_BYTES,
};
pub use ledger::{
    stale_cutoff, start_of_today, start_of_tomorrow, ApplicationLedger, Claim, ClaimToken, InMemoryLedger, LedgerError,
};
pub use postgres::{LedgerState, PostgresLedger};
pub use submission::{classify_status, HttpSubmissionClient, SubmissionClient, SubmissionError};
