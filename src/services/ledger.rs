use crate::models::{ApplicationRecord, ApplicationState, DedupKey};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when reading or updating the application ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(DedupKey),

    #[error("Claim on {0} is no longer held")]
    ClaimLost(DedupKey),

    #[error("Invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: DedupKey,
        from: ApplicationState,
        to: ApplicationState,
    },
}

impl LedgerError {
    /// Whether the operation may succeed if retried later
    pub fn is_unavailable(&self) -> bool {
        match self {
            LedgerError::Unavailable(_) => true,
            LedgerError::SqlxError(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Proof of ownership of a SUBMITTING claim
///
/// Issued by `try_acquire`. A claim rolled back by `reset_in_flight` and taken
/// again by another worker carries a new token, so the old holder can no
/// longer renew, record or release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Acquired(ClaimToken),
    /// The key is SUBMITTING elsewhere or already terminal
    Held,
    /// Submissions today plus live claims for the resume already reach the cap
    CapReached,
}

/// Durable store of submission state, the source of truth for deduplication
///
/// Every mutation is a single atomic step so several orchestrators (or a
/// restarted one) can share the ledger without in-process locking.
#[async_trait]
pub trait ApplicationLedger: Send + Sync {
    /// Atomically claim a key for submission
    ///
    /// Creates the record in SUBMITTING, or moves an existing PENDING record
    /// to SUBMITTING. With a daily cap, SUBMITTED-today and SUBMITTING records
    /// of the resume are counted in the same step, so concurrent claimers in
    /// any process cannot overshoot it. A capped claim leaves no record.
    async fn try_acquire(&self, resume_id: &str, job_id: &str, daily_cap: Option<u32>) -> Result<Claim, LedgerError>;

    /// Refresh a claim before submitting; false when the claim is no longer ours
    async fn renew(&self, resume_id: &str, job_id: &str, claim: ClaimToken) -> Result<bool, LedgerError>;

    /// Record the result of a submission attempt for a claimed key
    ///
    /// Counts the attempt. SUBMITTED stamps `submitted_at`.
    async fn record_outcome(
        &self,
        resume_id: &str,
        job_id: &str,
        claim: ClaimToken,
        state: ApplicationState,
        error: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Return a claimed key to PENDING without counting an attempt
    async fn release(&self, resume_id: &str, job_id: &str, claim: ClaimToken) -> Result<(), LedgerError>;

    async fn count_submitted_today(&self, resume_id: &str) -> Result<u32, LedgerError>;

    async fn get(&self, resume_id: &str, job_id: &str) -> Result<Option<ApplicationRecord>, LedgerError>;

    async fn list_for_resume(&self, resume_id: &str) -> Result<Vec<ApplicationRecord>, LedgerError>;

    /// Roll SUBMITTING records untouched for at least `stale_after` back to PENDING
    ///
    /// Live claims are renewed right before every submission, so a lease
    /// longer than the submission timeout plus shutdown grace only catches
    /// claims whose process died.
    async fn reset_in_flight(&self, stale_after: Duration) -> Result<u64, LedgerError>;

    async fn health_check(&self) -> Result<bool, LedgerError> {
        Ok(true)
    }
}

/// Start of the current UTC day
pub fn start_of_today() -> DateTime<Utc> {
    Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Start of the next UTC day
pub fn start_of_tomorrow() -> DateTime<Utc> {
    start_of_today() + chrono::Duration::days(1)
}

/// Latest `updated_at` a claim may carry and still count as stale
pub fn stale_cutoff(stale_after: Duration) -> Option<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(stale_after).ok()?;
    Utc::now().checked_sub_signed(lease)
}

#[derive(Debug, Clone)]
struct Entry {
    record: ApplicationRecord,
    claim: Option<ClaimToken>,
}

impl Entry {
    fn counts_against_cap(&self, since: DateTime<Utc>) -> bool {
        match self.record.state {
            ApplicationState::Submitting => true,
            ApplicationState::Submitted => self.record.submitted_at.map(|at| at >= since).unwrap_or(false),
            _ => false,
        }
    }

    fn holds(&self, claim: ClaimToken) -> bool {
        self.record.state == ApplicationState::Submitting && self.claim == Some(claim)
    }
}

/// Process-local ledger
///
/// Used when no database is configured and as the ledger in tests. The
/// availability switch lets tests simulate an outage.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<DedupKey, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record directly, bypassing the state machine
    ///
    /// An inserted SUBMITTING record has no live owner.
    pub fn insert(&self, record: ApplicationRecord) {
        self.records.lock().insert(record.key(), Entry { record, claim: None });
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<ApplicationRecord> {
        let mut records: Vec<ApplicationRecord> =
            self.records.lock().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::Unavailable("in-memory ledger marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ApplicationLedger for InMemoryLedger {
    async fn try_acquire(&self, resume_id: &str, job_id: &str, daily_cap: Option<u32>) -> Result<Claim, LedgerError> {
        self.check_available()?;
        let key = DedupKey::new(resume_id, job_id);
        let mut records = self.records.lock();

        if let Some(entry) = records.get(&key) {
            if entry.record.state != ApplicationState::Pending {
                return Ok(Claim::Held);
            }
        }

        if let Some(cap) = daily_cap {
            let since = start_of_today();
            let used = records
                .values()
                .filter(|e| e.record.resume_id == resume_id && e.counts_against_cap(since))
                .count();
            if used >= cap as usize {
                return Ok(Claim::CapReached);
            }
        }

        let claim = ClaimToken::new();
        let now = Utc::now();
        let entry = records.entry(key).or_insert_with(|| Entry {
            record: ApplicationRecord {
                resume_id: resume_id.to_string(),
                job_id: job_id.to_string(),
                state: ApplicationState::Submitting,
                attempt_count: 0,
                last_error: None,
                submitted_at: None,
                updated_at: now,
            },
            claim: None,
        });
        entry.record.state = ApplicationState::Submitting;
        entry.record.updated_at = now;
        entry.claim = Some(claim);

        Ok(Claim::Acquired(claim))
    }

    async fn renew(&self, resume_id: &str, job_id: &str, claim: ClaimToken) -> Result<bool, LedgerError> {
        self.check_available()?;
        let mut records = self.records.lock();

        match records.get_mut(&DedupKey::new(resume_id, job_id)) {
            Some(entry) if entry.holds(claim) => {
                entry.record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_outcome(
        &self,
        resume_id: &str,
        job_id: &str,
        claim: ClaimToken,
        state: ApplicationState,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.check_available()?;
        let key = DedupKey::new(resume_id, job_id);
        let mut records = self.records.lock();
        let entry = records
            .get_mut(&key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;

        if state == ApplicationState::Submitting {
            return Err(LedgerError::InvalidTransition {
                key,
                from: entry.record.state,
                to: state,
            });
        }
        if !entry.holds(claim) {
            return Err(LedgerError::ClaimLost(key));
        }

        let now = Utc::now();
        let record = &mut entry.record;
        record.state = state;
        record.attempt_count += 1;
        record.last_error = error.map(str::to_string);
        record.updated_at = now;
        if state == ApplicationState::Submitted {
            record.submitted_at = Some(now);
        }
        entry.claim = None;
        Ok(())
    }

    async fn release(&self, resume_id: &str, job_id: &str, claim: ClaimToken) -> Result<(), LedgerError> {
        self.check_available()?;
        let key = DedupKey::new(resume_id, job_id);
        let mut records = self.records.lock();
        let entry = records
            .get_mut(&key)
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?;

        if entry.holds(claim) {
            entry.record.state = ApplicationState::Pending;
            entry.record.updated_at = Utc::now();
            entry.claim = None;
        }
        Ok(())
    }

    async fn count_submitted_today(&self, resume_id: &str) -> Result<u32, LedgerError> {
        self.check_available()?;
        let since = start_of_today();
        let count = self
            .records
            .lock()
            .values()
            .map(|e| &e.record)
            .filter(|r| r.resume_id == resume_id && r.state == ApplicationState::Submitted)
            .filter(|r| r.submitted_at.map(|at| at >= since).unwrap_or(false))
            .count();
        Ok(count as u32)
    }

    async fn get(&self, resume_id: &str, job_id: &str) -> Result<Option<ApplicationRecord>, LedgerError> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .get(&DedupKey::new(resume_id, job_id))
            .map(|e| e.record.clone()))
    }

    async fn list_for_resume(&self, resume_id: &str) -> Result<Vec<ApplicationRecord>, LedgerError> {
        self.check_available()?;
        let mut records: Vec<ApplicationRecord> = self
            .records
            .lock()
            .values()
            .filter(|e| e.record.resume_id == resume_id)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.job_id.cmp(&b.job_id)));
        Ok(records)
    }

    async fn reset_in_flight(&self, stale_after: Duration) -> Result<u64, LedgerError> {
        self.check_available()?;
        let Some(cutoff) = stale_cutoff(stale_after) else {
            return Ok(0);
        };

        let mut reset = 0;
        for entry in self.records.lock().values_mut() {
            let record = &mut entry.record;
            if record.state == ApplicationState::Submitting && record.updated_at <= cutoff {
                record.state = ApplicationState::Pending;
                record.last_error = Some("interrupted before completion".to_string());
                record.updated_at = Utc::now();
                entry.claim = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn health_check(&self) -> Result<bool, LedgerError> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn acquire(ledger: &InMemoryLedger, resume_id: &str, job_id: &str) -> ClaimToken {
        match ledger.try_acquire(resume_id, job_id, None).await.unwrap() {
            Claim::Acquired(claim) => claim,
            other => panic!("expected to acquire {}/{}, got {:?}", resume_id, job_id, other),
        }
    }

    fn submitting(job_id: &str, updated_at: DateTime<Utc>) -> ApplicationRecord {
        ApplicationRecord {
            resume_id: "r1".to_string(),
            job_id: job_id.to_string(),
            state: ApplicationState::Submitting,
            attempt_count: 1,
            last_error: None,
            submitted_at: None,
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let ledger = InMemoryLedger::new();

        acquire(&ledger, "r1", "j1").await;
        assert_eq!(ledger.try_acquire("r1", "j1", None).await.unwrap(), Claim::Held);
        acquire(&ledger, "r1", "j2").await;
    }

    #[tokio::test]
    async fn test_pending_can_be_reacquired() {
        let ledger = InMemoryLedger::new();
        let claim = acquire(&ledger, "r1", "j1").await;
        ledger
            .record_outcome("r1", "j1", claim, ApplicationState::Pending, Some("503"))
            .await
            .unwrap();

        let again = acquire(&ledger, "r1", "j1").await;
        assert_ne!(again, claim);

        let record = ledger.get("r1", "j1").await.unwrap().unwrap();
        assert_eq!(record.state, ApplicationState::Submitting);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn test_terminal_records_block_acquire() {
        let ledger = InMemoryLedger::new();
        let claim = acquire(&ledger, "r1", "j1").await;
        ledger
            .record_outcome("r1", "j1", claim, ApplicationState::Submitted, None)
            .await
            .unwrap();

        assert_eq!(ledger.try_acquire("r1", "j1", None).await.unwrap(), Claim::Held);
        assert_eq!(ledger.count_submitted_today("r1").await.unwrap(), 1);
        assert!(ledger.get("r1", "j1").await.unwrap().unwrap().submitted_at.is_some());
    }

    #[tokio::test]
    async fn test_outcome_requires_live_claim() {
        let ledger = InMemoryLedger::new();

        let missing = ledger
            .record_outcome("r1", "j1", ClaimToken::new(), ApplicationState::Submitted, None)
            .await;
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));

        let claim = acquire(&ledger, "r1", "j1").await;
        let forged = ledger
            .record_outcome("r1", "j1", ClaimToken::new(), ApplicationState::Submitted, None)
            .await;
        assert!(matches!(forged, Err(LedgerError::ClaimLost(_))));

        ledger
            .record_outcome("r1", "j1", claim, ApplicationState::Failed, Some("closed"))
            .await
            .unwrap();
        let again = ledger
            .record_outcome("r1", "j1", claim, ApplicationState::Submitted, None)
            .await;
        assert!(matches!(again, Err(LedgerError::ClaimLost(_))));
    }

    #[tokio::test]
    async fn test_daily_cap_counts_live_claims() {
        let ledger = InMemoryLedger::new();

        let first = match ledger.try_acquire("r1", "j1", Some(2)).await.unwrap() {
            Claim::Acquired(claim) => claim,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(ledger.try_acquire("r1", "j2", Some(2)).await.unwrap(), Claim::Acquired(_)));
        assert_eq!(ledger.try_acquire("r1", "j3", Some(2)).await.unwrap(), Claim::CapReached);
        assert!(ledger.get("r1", "j3").await.unwrap().is_none());

        // Other resumes have their own budget
        assert!(matches!(ledger.try_acquire("r2", "j3", Some(2)).await.unwrap(), Claim::Acquired(_)));

        // A transient failure gives the slot back
        ledger
            .record_outcome("r1", "j1", first, ApplicationState::Pending, Some("503"))
            .await
            .unwrap();
        assert!(matches!(ledger.try_acquire("r1", "j3", Some(2)).await.unwrap(), Claim::Acquired(_)));
    }

    #[tokio::test]
    async fn test_daily_cap_reports_duplicates_first() {
        let ledger = InMemoryLedger::new();
        acquire(&ledger, "r1", "j1").await;

        assert_eq!(ledger.try_acquire("r1", "j1", Some(1)).await.unwrap(), Claim::Held);
        assert_eq!(ledger.try_acquire("r1", "j2", Some(1)).await.unwrap(), Claim::CapReached);
    }

    #[tokio::test]
    async fn test_reset_in_flight_only_touches_stale_claims() {
        let ledger = InMemoryLedger::new();
        ledger.insert(submitting("stale", Utc::now() - chrono::Duration::minutes(10)));
        let live = acquire(&ledger, "r1", "live").await;

        assert_eq!(ledger.reset_in_flight(Duration::from_secs(120)).await.unwrap(), 1);

        let stale = ledger.get("r1", "stale").await.unwrap().unwrap();
        assert_eq!(stale.state, ApplicationState::Pending);
        assert_eq!(stale.attempt_count, 1);

        assert!(ledger.renew("r1", "live", live).await.unwrap());
        ledger
            .record_outcome("r1", "live", live, ApplicationState::Submitted, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reset_claim_cannot_be_renewed() {
        let ledger = InMemoryLedger::new();
        let old = acquire(&ledger, "r1", "j1").await;

        assert_eq!(ledger.reset_in_flight(Duration::ZERO).await.unwrap(), 1);
        let new = acquire(&ledger, "r1", "j1").await;

        assert!(!ledger.renew("r1", "j1", old).await.unwrap());
        assert!(ledger.renew("r1", "j1", new).await.unwrap());

        // Releasing with the old claim leaves the new holder untouched
        ledger.release("r1", "j1", old).await.unwrap();
        assert_eq!(
            ledger.get("r1", "j1").await.unwrap().unwrap().state,
            ApplicationState::Submitting
        );
    }

    #[tokio::test]
    async fn test_release_does_not_count_attempt() {
        let ledger = InMemoryLedger::new();
        let claim = acquire(&ledger, "r1", "j1").await;
        ledger.release("r1", "j1", claim).await.unwrap();

        let record = ledger.get("r1", "j1").await.unwrap().unwrap();
        assert_eq!(record.state, ApplicationState::Pending);
        assert_eq!(record.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_unavailable_ledger_errors() {
        let ledger = InMemoryLedger::new();
        ledger.set_unavailable(true);

        let err = ledger.try_acquire("r1", "j1", None).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(!ledger.health_check().await.unwrap());
    }

    #[test]
    fn test_day_boundaries() {
        let today = start_of_today();
        let tomorrow = start_of_tomorrow();

        assert!(today <= Utc::now());
        assert_eq!(tomorrow - today, chrono::Duration::days(1));
    }

    #[test]
    fn test_stale_cutoff() {
        let cutoff = stale_cutoff(Duration::from_secs(60)).unwrap();
        assert!(cutoff < Utc::now() - chrono::Duration::seconds(59));
        assert!(stale_cutoff(Duration::MAX).is_none());
    }
}
