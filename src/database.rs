use crate::errors::Result;
use crate::models::{CreditGrant, CreditOperation, CreditOperationGrant};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub type PgTx<'a> = sqlx::Transaction<'a, Postgres>;

pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Begin a read-committed transaction. Every mutating ledger action runs
    /// inside exactly one of these.
    pub async fn begin(&self) -> Result<PgTx<'static>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Spendable grants for a license/asset in FIFO order, locked `FOR UPDATE`.
    /// Pending grants participate equally with confirmed ones.
    pub async fn list_active_grants(
        &self,
        tx: &mut PgTx<'_>,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<CreditGrant>> {
        let grants = sqlx::query_as::<_, CreditGrant>(
            r#"
            SELECT * FROM credit_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status IN ('confirmed', 'pending')
              AND remaining_amount > 0
              AND expires_at > now()
            ORDER BY expires_at ASC, created_at ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .fetch_all(&mut **tx)
        .await?;

        Ok(grants)
    }

    /// Failed grants that still carry debt, oldest first, locked `FOR UPDATE`.
    pub async fn list_failed_grants_with_debt(
        &self,
        tx: &mut PgTx<'_>,
        license_id: &str,
        asset_did: &str,
    ) -> Result<Vec<CreditGrant>> {
        let grants = sqlx::query_as::<_, CreditGrant>(
            r#"
            SELECT * FROM credit_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status = 'failed'
              AND remaining_amount < initial_amount
            ORDER BY created_at ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .fetch_all(&mut **tx)
        .await?;

        Ok(grants)
    }

    /// Sum of spendable credits over the same predicate as
    /// [`Self::list_active_grants`], without locking.
    pub async fn sum_active_balance(
        &self,
        tx: &mut PgTx<'_>,
        license_id: &str,
        asset_did: &str,
    ) -> Result<i64> {
        let sum = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(remaining_amount), 0)::BIGINT FROM credit_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status IN ('confirmed', 'pending')
              AND remaining_amount > 0
              AND expires_at > now()
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .fetch_one(&mut **tx)
        .await?;

        Ok(sum)
    }

    /// Debt from failed grants (`initial_amount - remaining_amount`).
    /// Non-transactional; debt is a slowly-changing bound and the
    /// authoritative checks happen under row locks.
    pub async fn sum_outstanding_debt(&self, license_id: &str, asset_did: &str) -> Result<i64> {
        let debt = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(initial_amount - remaining_amount), 0)::BIGINT
            FROM credit_grants
            WHERE license_id = $1 AND asset_did = $2
              AND status = 'failed'
              AND remaining_amount < initial_amount
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .fetch_one(&self.pool)
        .await?;

        Ok(debt)
    }

    /// Oldest pending grant for a burn transaction, locked `FOR UPDATE`.
    pub async fn find_pending_grant(
        &self,
        tx: &mut PgTx<'_>,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<Option<CreditGrant>> {
        let grant = sqlx::query_as::<_, CreditGrant>(
            r#"
            SELECT * FROM credit_grants
            WHERE license_id = $1 AND asset_did = $2
              AND tx_hash = $3
              AND status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(license_id)
        .bind(asset_did)
        .bind(tx_hash)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(grant)
    }

    pub async fn insert_grant(&self, tx: &mut PgTx<'_>, grant: &CreditGrant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_grants
                (id, license_id, asset_did, initial_amount, remaining_amount,
                 status, tx_hash, log_index, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(grant.id)
        .bind(&grant.license_id)
        .bind(&grant.asset_did)
        .bind(grant.initial_amount)
        .bind(grant.remaining_amount)
        .bind(grant.status)
        .bind(&grant.tx_hash)
        .bind(grant.log_index)
        .bind(grant.expires_at)
        .bind(grant.created_at)
        .bind(grant.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn update_grant_remaining(
        &self,
        tx: &mut PgTx<'_>,
        grant_id: Uuid,
        new_remaining: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credit_grants
            SET remaining_amount = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(grant_id)
        .bind(new_remaining)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Bind a pending grant to its on-chain log and flip it to confirmed.
    pub async fn update_grant_confirmed(
        &self,
        tx: &mut PgTx<'_>,
        grant_id: Uuid,
        log_index: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credit_grants
            SET status = 'confirmed', log_index = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(grant_id)
        .bind(log_index)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Mark a grant as failed (chain reverted). Any spent portion becomes
    /// outstanding debt.
    pub async fn mark_grant_failed(&self, tx: &mut PgTx<'_>, grant_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credit_grants
            SET status = 'failed', updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(grant_id)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Insert an operation row. A `(app_name, reference_id, operation_type)`
    /// conflict surfaces as `CreditTrackerError::DuplicateKey`.
    pub async fn insert_operation(
        &self,
        tx: &mut PgTx<'_>,
        operation: &CreditOperation,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_operations
                (app_name, reference_id, operation_type, license_id, asset_did,
                 total_amount, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&operation.app_name)
        .bind(&operation.reference_id)
        .bind(operation.operation_type)
        .bind(&operation.license_id)
        .bind(&operation.asset_did)
        .bind(operation.total_amount)
        .bind(operation.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn insert_operation_grant(
        &self,
        tx: &mut PgTx<'_>,
        operation_grant: &CreditOperationGrant,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_operation_grants
                (id, app_name, reference_id, operation_type, grant_id,
                 amount_used, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(operation_grant.id)
        .bind(&operation_grant.app_name)
        .bind(&operation_grant.reference_id)
        .bind(operation_grant.operation_type)
        .bind(operation_grant.grant_id)
        .bind(operation_grant.amount_used)
        .bind(operation_grant.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Load a deduction operation together with its grant-level rows and the
    /// referenced grants. Used by refund; the grants are locked `FOR UPDATE`
    /// since the caller is about to credit them back.
    pub async fn load_operation_with_grants(
        &self,
        tx: &mut PgTx<'_>,
        app_name: &str,
        reference_id: &str,
    ) -> Result<Option<(CreditOperation, Vec<(CreditOperationGrant, CreditGrant)>)>> {
        let operation = sqlx::query_as::<_, CreditOperation>(
            r#"
            SELECT * FROM credit_operations
            WHERE app_name = $1 AND reference_id = $2 AND operation_type = 'deduction'
            "#,
        )
        .bind(app_name)
        .bind(reference_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(operation) = operation else {
            return Ok(None);
        };

        let operation_grants = sqlx::query_as::<_, CreditOperationGrant>(
            r#"
            SELECT * FROM credit_operation_grants
            WHERE app_name = $1 AND reference_id = $2 AND operation_type = 'deduction'
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(app_name)
        .bind(reference_id)
        .fetch_all(&mut **tx)
        .await?;

        let grant_ids: Vec<Uuid> = operation_grants.iter().map(|og| og.grant_id).collect();
        let grants = sqlx::query_as::<_, CreditGrant>(
            r#"
            SELECT * FROM credit_grants
            WHERE id = ANY($1)
            FOR UPDATE
            "#,
        )
        .bind(&grant_ids)
        .fetch_all(&mut **tx)
        .await?;

        let mut by_id: HashMap<Uuid, CreditGrant> =
            grants.into_iter().map(|g| (g.id, g)).collect();

        let mut pairs = Vec::with_capacity(operation_grants.len());
        for og in operation_grants {
            let grant = by_id
                .remove(&og.grant_id)
                .ok_or(crate::errors::CreditTrackerError::NotFound)?;
            pairs.push((og, grant));
        }

        Ok(Some((operation, pairs)))
    }
}
