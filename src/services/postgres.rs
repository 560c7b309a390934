use crate::models::{ApplicationRecord, ApplicationState, DedupKey};
use crate::services::ledger::{stale_cutoff, start_of_today, ApplicationLedger, Claim, ClaimToken, LedgerError};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Application states as stored in PostgreSQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "application_state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerState {
    Pending,
    Submitting,
    Submitted,
    Failed,
    SkippedDuplicate,
}

impl From<ApplicationState> for LedgerState {
    fn from(value: ApplicationState) -> Self {
        match value {
            ApplicationState::Pending => LedgerState::Pending,
            ApplicationState::Submitting => LedgerState::Submitting,
            ApplicationState::Submitted => LedgerState::Submitted,
            ApplicationState::Failed => LedgerState::Failed,
            ApplicationState::SkippedDuplicate => LedgerState::SkippedDuplicate,
        }
    }
}

impl From<LedgerState> for ApplicationState {
    fn from(value: LedgerState) -> Self {
        match value {
            LedgerState::Pending => ApplicationState::Pending,
            LedgerState::Submitting => ApplicationState::Submitting,
            LedgerState::Submitted => ApplicationState::Submitted,
            LedgerState::Failed => ApplicationState::Failed,
            LedgerState::SkippedDuplicate => ApplicationState::SkippedDuplicate,
        }
    }
}

/// PostgreSQL-backed application ledger
///
/// Each ledger primitive is a single statement, so the check-and-set in
/// `try_acquire` is atomic across every process sharing the database.
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a new ledger from a connection string
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(idle_timeout)
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        // Run migrations on startup
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a new ledger from settings
    pub async fn from_settings(
        url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
        acquire_timeout_secs: Option<u64>,
        idle_timeout_secs: Option<u64>,
    ) -> Result<Self, LedgerError> {
        tracing::info!("Connecting to PostgreSQL ledger");

        Self::new(
            url,
            max_connections.unwrap_or(10),
            min_connections.unwrap_or(1),
            Duration::from_secs(acquire_timeout_secs.unwrap_or(5)),
            Duration::from_secs(idle_timeout_secs.unwrap_or(600)),
        )
        .await
    }
}

fn row_to_record(row: &PgRow) -> Result<ApplicationRecord, sqlx::Error> {
    let state: LedgerState = row.try_get("state")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;

    Ok(ApplicationRecord {
        resume_id: row.try_get("resume_id")?,
        job_id: row.try_get("job_id")?,
        state: state.into(),
        attempt_count: attempt_count.max(0) as u32,
        last_error: row.try_get("last_error")?,
        submitted_at: row.try_get("submitted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ApplicationLedger for PostgresLedger {
    async fn try_acquire(&self, resume_id: &str, job_id: &str, daily_cap: Option<u32>) -> Result<Claim, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Claims for one resume are serialized so the cap count and the claim commit together
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(resume_id)
            .execute(&mut *tx)
            .await?;

        let existing: Option<LedgerState> =
            sqlx::query_scalar("SELECT state FROM applications WHERE resume_id = $1 AND job_id = $2")
                .bind(resume_id)
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        if matches!(existing, Some(state) if state != LedgerState::Pending) {
            tracing::debug!("Acquire {}/{}: held", resume_id, job_id);
            return Ok(Claim::Held);
        }

        if let Some(cap) = daily_cap {
            let query = r#"
                SELECT COUNT(*) AS used
                FROM applications
                WHERE resume_id = $1
                  AND (state = 'SUBMITTING' OR (state = 'SUBMITTED' AND submitted_at >= $2))
            "#;

            let row = sqlx::query(query)
                .bind(resume_id)
                .bind(start_of_today())
                .fetch_one(&mut *tx)
                .await?;
            let used: i64 = row.try_get("used")?;

            if used >= i64::from(cap) {
                tracing::debug!("Acquire {}/{}: daily cap of {} reached", resume_id, job_id, cap);
                return Ok(Claim::CapReached);
            }
        }

        let claim = ClaimToken::new();
        let query = r#"
            INSERT INTO applications (resume_id, job_id, state, attempt_count, claim_id, updated_at)
            VALUES ($1, $2, 'SUBMITTING', 0, $3, NOW())
            ON CONFLICT (resume_id, job_id)
            DO UPDATE SET
                state = 'SUBMITTING',
                claim_id = EXCLUDED.claim_id,
                updated_at = NOW()
            WHERE applications.state = 'PENDING'
            RETURNING job_id
        "#;

        let acquired = sqlx::query(query)
            .bind(resume_id)
            .bind(job_id)
            .bind(claim.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        tx.commit().await?;

        tracing::debug!("Acquire {}/{}: {}", resume_id, job_id, acquired);

        Ok(if acquired { Claim::Acquired(claim) } else { Claim::Held })
    }

    async fn renew(&self, resume_id: &str, job_id: &str, claim: ClaimToken) -> Result<bool, LedgerError> {
        let query = r#"
            UPDATE applications
            SET updated_at = NOW()
            WHERE resume_id = $1 AND job_id = $2 AND state = 'SUBMITTING' AND claim_id = $3
        "#;

        let result = sqlx::query(query)
            .bind(resume_id)
            .bind(job_id)
            .bind(claim.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        resume_id: &str,
        job_id: &str,
        claim: ClaimToken,
        state: ApplicationState,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        if state == ApplicationState::Submitting {
            return Err(LedgerError::InvalidTransition {
                key: DedupKey::new(resume_id, job_id),
                from: ApplicationState::Submitting,
                to: state,
            });
        }

        let query = r#"
            UPDATE applications
            SET state = $4,
                attempt_count = attempt_count + 1,
                last_error = $5,
                claim_id = NULL,
                submitted_at = CASE WHEN $4 = 'SUBMITTED'::application_state THEN NOW() ELSE submitted_at END,
                updated_at = NOW()
            WHERE resume_id = $1 AND job_id = $2 AND state = 'SUBMITTING' AND claim_id = $3
        "#;

        let result = sqlx::query(query)
            .bind(resume_id)
            .bind(job_id)
            .bind(claim.as_uuid())
            .bind(LedgerState::from(state))
            .bind(error)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let key = DedupKey::new(resume_id, job_id);
        match self.get(resume_id, job_id).await? {
            Some(_) => Err(LedgerError::ClaimLost(key)),
            None => Err(LedgerError::NotFound(key)),
        }
    }

    async fn release(&self, resume_id: &str, job_id: &str, claim: ClaimToken) -> Result<(), LedgerError> {
        let query = r#"
            UPDATE applications
            SET state = 'PENDING', claim_id = NULL, updated_at = NOW()
            WHERE resume_id = $1 AND job_id = $2 AND state = 'SUBMITTING' AND claim_id = $3
        "#;

        sqlx::query(query)
            .bind(resume_id)
            .bind(job_id)
            .bind(claim.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn count_submitted_today(&self, resume_id: &str) -> Result<u32, LedgerError> {
        let query = r#"
            SELECT COUNT(*) AS submitted
            FROM applications
            WHERE resume_id = $1
              AND state = 'SUBMITTED'
              AND submitted_at >= $2
        "#;

        let row = sqlx::query(query)
            .bind(resume_id)
            .bind(start_of_today())
            .fetch_one(&self.pool)
            .await?;

        let submitted: i64 = row.try_get("submitted")?;
        Ok(submitted.max(0) as u32)
    }

    async fn get(&self, resume_id: &str, job_id: &str) -> Result<Option<ApplicationRecord>, LedgerError> {
        let query = r#"
            SELECT resume_id, job_id, state, attempt_count, last_error, submitted_at, updated_at
            FROM applications
            WHERE resume_id = $1 AND job_id = $2
        "#;

        let row = sqlx::query(query)
            .bind(resume_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_record).transpose()?)
    }

    async fn list_for_resume(&self, resume_id: &str) -> Result<Vec<ApplicationRecord>, LedgerError> {
        let query = r#"
            SELECT resume_id, job_id, state, attempt_count, last_error, submitted_at, updated_at
            FROM applications
            WHERE resume_id = $1
            ORDER BY updated_at DESC, job_id
        "#;

        let rows = sqlx::query(query).bind(resume_id).fetch_all(&self.pool).await?;

        let records: Result<Vec<ApplicationRecord>, _> = rows.iter().map(row_to_record).collect();

        Ok(records?)
    }

    async fn reset_in_flight(&self, stale_after: Duration) -> Result<u64, LedgerError> {
        let Some(cutoff) = stale_cutoff(stale_after) else {
            return Ok(0);
        };

        let query = r#"
            UPDATE applications
            SET state = 'PENDING',
                claim_id = NULL,
                last_error = 'interrupted before completion',
                updated_at = NOW()
            WHERE state = 'SUBMITTING' AND updated_at <= $1
        "#;

        let result = sqlx::query(query).bind(cutoff).execute(&self.pool).await?;

        tracing::info!(
            "Rolled back {} stale submission claim(s) older than {:?} to PENDING",
            result.rows_affected(),
            stale_after
        );

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<bool, LedgerError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| true)
            .map_err(Into::into)
    }
}
