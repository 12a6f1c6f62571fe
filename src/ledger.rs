use crate::database::{Database, PgTx};
use crate::errors::{CreditTrackerError, Result};
use crate::models::{
    grant_expiration, CreditGrant, CreditOperation, CreditOperationGrant, GrantStatus,
    OperationType, TRACKER_APP_NAME,
};
use crate::retry::with_deadlock_retry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// FIFO credit ledger over the store. All mutual exclusion is via row locks
/// taken inside one read-committed transaction per public call; no in-memory
/// state is held, so multiple instances can run against the same database.
pub struct Ledger {
    pub(crate) db: Arc<Database>,
    shutdown: CancellationToken,
}

/// One planned movement against a locked grant snapshot. `amount` is always
/// positive; the caller picks the sign of the recorded `amount_used`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDraw {
    pub grant_id: Uuid,
    pub amount: i64,
    pub remaining_after: i64,
}

/// Output of [`plan_settlement`]: grant movements in insertion order and the
/// total amount moved from active grants into failed ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementPlan {
    pub moves: Vec<GrantDraw>,
    pub total_settled: i64,
}

/// Walk `grants` in the order given (the store returns them FIFO) and take
/// from each until `amount` is covered. The caller has already verified that
/// the grants hold at least `amount` in total.
pub fn allocate_fifo(grants: &[CreditGrant], amount: i64) -> Vec<GrantDraw> {
    let mut remaining_to_deduct = amount;
    let mut draws = Vec::new();

    for grant in grants {
        if remaining_to_deduct <= 0 {
            break;
        }
        let take = remaining_to_deduct.min(grant.remaining_amount);
        if take <= 0 {
            continue;
        }
        draws.push(GrantDraw {
            grant_id: grant.id,
            amount: take,
            remaining_after: grant.remaining_amount - take,
        });
        remaining_to_deduct -= take;
    }

    draws
}

/// For each failed grant (oldest first), move credits out of active grants
/// (FIFO by expiry) until its debt is cleared or the active balance runs dry.
/// Both sides of each transfer are emitted as positive movements: debits of
/// active grants followed by one credit of the failed grant. Processing stops
/// at the first failed grant nothing could be moved into.
pub fn plan_settlement(
    failed_grants: &[CreditGrant],
    active_grants: &[CreditGrant],
) -> Result<SettlementPlan> {
    let mut active: Vec<(Uuid, i64)> = active_grants
        .iter()
        .map(|g| (g.id, g.remaining_amount))
        .collect();
    let mut moves = Vec::new();
    let mut total_settled: i64 = 0;

    for failed in failed_grants {
        let grant_debt = failed.debt();
        if grant_debt <= 0 {
            continue;
        }

        let mut remaining_to_settle = grant_debt;
        for (grant_id, remaining) in active.iter_mut() {
            if remaining_to_settle <= 0 {
                break;
            }
            let take = remaining_to_settle.min(*remaining);
            if take <= 0 {
                continue;
            }
            *remaining -= take;
            moves.push(GrantDraw {
                grant_id: *grant_id,
                amount: take,
                remaining_after: *remaining,
            });
            remaining_to_settle -= take;
        }

        if remaining_to_settle >= grant_debt {
            // no active grant could contribute anything this round
            break;
        }

        let settled = grant_debt - remaining_to_settle;
        let new_remaining = failed
            .remaining_amount
            .checked_add(settled)
            .ok_or(CreditTrackerError::ArithmeticOverflow)?;
        moves.push(GrantDraw {
            grant_id: failed.id,
            amount: settled,
            remaining_after: new_remaining,
        });
        total_settled += settled;
    }

    Ok(SettlementPlan {
        moves,
        total_settled,
    })
}

fn signed_amount(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| CreditTrackerError::InvalidAmount(amount))
}

fn positive_amount(amount: u64) -> Result<i64> {
    if amount == 0 {
        return Err(CreditTrackerError::InvalidAmount(amount));
    }
    signed_amount(amount)
}

fn duplicate_as_already_performed(err: CreditTrackerError) -> CreditTrackerError {
    match err {
        CreditTrackerError::DuplicateKey(_) => CreditTrackerError::AlreadyPerformed,
        other => other,
    }
}

impl Ledger {
    pub fn new(db: Arc<Database>, shutdown: CancellationToken) -> Self {
        Ledger { db, shutdown }
    }

    /// Deduct credits FIFO across active grants.
    ///
    /// 1. Refuse while outstanding debt exists.
    /// 2. Lock active grants in FIFO order and check sufficiency.
    /// 3. Record the operation; a replayed `(app_name, reference_id)` fails
    ///    with `AlreadyPerformed`.
    /// 4. Walk the grants, updating each and recording a negative
    ///    `amount_used` per grant consumed.
    pub async fn deduct(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<CreditOperation> {
        with_deadlock_retry(&self.shutdown, "deduct", || {
            self.deduct_internal(license_id, asset_did, amount, app_name, reference_id)
        })
        .await
    }

    async fn deduct_internal(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<CreditOperation> {
        let amount = signed_amount(amount)?;

        let debt = self.db.sum_outstanding_debt(license_id, asset_did).await?;
        if debt > 0 {
            return Err(CreditTrackerError::OutstandingDebt { debt });
        }

        let mut tx = self.db.begin().await?;

        let grants = self
            .db
            .list_active_grants(&mut tx, license_id, asset_did)
            .await?;
        let available: i64 = grants.iter().map(|g| g.remaining_amount).sum();
        if available < amount {
            return Err(CreditTrackerError::InsufficientCredits {
                current: available,
                required: amount,
            });
        }

        let operation = CreditOperation::new(
            OperationType::Deduction,
            license_id,
            asset_did,
            amount,
            app_name,
            reference_id,
        );
        self.db
            .insert_operation(&mut tx, &operation)
            .await
            .map_err(duplicate_as_already_performed)?;

        for draw in allocate_fifo(&grants, amount) {
            self.db
                .update_grant_remaining(&mut tx, draw.grant_id, draw.remaining_after)
                .await?;
            self.db
                .insert_operation_grant(
                    &mut tx,
                    &CreditOperationGrant::new(&operation, draw.grant_id, -draw.amount),
                )
                .await?;
        }

        tx.commit().await?;

        Ok(operation)
    }

    /// Refund a previous deduction, restoring each grant by exactly the
    /// amount the deduction took from it, then settle any outstanding debt.
    pub async fn refund(&self, app_name: &str, reference_id: &str) -> Result<CreditOperation> {
        with_deadlock_retry(&self.shutdown, "refund", || {
            self.refund_internal(app_name, reference_id)
        })
        .await
    }

    async fn refund_internal(&self, app_name: &str, reference_id: &str) -> Result<CreditOperation> {
        let mut tx = self.db.begin().await?;

        let Some((deduction, grant_pairs)) = self
            .db
            .load_operation_with_grants(&mut tx, app_name, reference_id)
            .await?
        else {
            return Err(CreditTrackerError::ReferencedOperationNotFound);
        };

        let operation = CreditOperation::new(
            OperationType::Refund,
            &deduction.license_id,
            &deduction.asset_did,
            deduction.total_amount,
            app_name,
            reference_id,
        );
        self.db
            .insert_operation(&mut tx, &operation)
            .await
            .map_err(duplicate_as_already_performed)?;

        for (op_grant, grant) in &grant_pairs {
            let refund_amount = -op_grant.amount_used;
            let new_remaining = grant
                .remaining_amount
                .checked_add(refund_amount)
                .ok_or(CreditTrackerError::ArithmeticOverflow)?;

            self.db
                .update_grant_remaining(&mut tx, grant.id, new_remaining)
                .await?;
            self.db
                .insert_operation_grant(
                    &mut tx,
                    &CreditOperationGrant::new(&operation, grant.id, refund_amount),
                )
                .await?;
        }

        self.settle_debt(
            &mut tx,
            &deduction.license_id,
            &deduction.asset_did,
            app_name,
            reference_id,
        )
        .await?;

        tx.commit().await?;

        Ok(operation)
    }

    /// Create a pending grant for an initiated burn. The grant is spendable
    /// immediately; a later chain event confirms or fails it.
    pub async fn create_grant(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
        tx_hash: &str,
        mint_time: DateTime<Utc>,
    ) -> Result<CreditOperation> {
        with_deadlock_retry(&self.shutdown, "create_grant", || {
            self.create_grant_internal(license_id, asset_did, amount, tx_hash, mint_time)
        })
        .await
    }

    async fn create_grant_internal(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
        tx_hash: &str,
        mint_time: DateTime<Utc>,
    ) -> Result<CreditOperation> {
        let amount = positive_amount(amount)?;
        let expires_at = grant_expiration(mint_time)?;

        let mut tx = self.db.begin().await?;

        let grant = CreditGrant::new(
            license_id,
            asset_did,
            amount,
            GrantStatus::Pending,
            tx_hash,
            None,
            expires_at,
        );
        self.db.insert_grant(&mut tx, &grant).await?;

        let reference_id = grant.id.to_string();
        let operation = CreditOperation::new(
            OperationType::GrantPurchase,
            license_id,
            asset_did,
            amount,
            TRACKER_APP_NAME,
            &reference_id,
        );
        self.db.insert_operation(&mut tx, &operation).await?;
        self.db
            .insert_operation_grant(
                &mut tx,
                &CreditOperationGrant::new(&operation, grant.id, amount),
            )
            .await?;

        self.settle_debt(&mut tx, license_id, asset_did, TRACKER_APP_NAME, &reference_id)
            .await?;

        tx.commit().await?;

        Ok(operation)
    }

    /// Bind an observed on-chain burn to its pending grant, or insert a
    /// confirmed grant outright when the burn was never initiated by us.
    pub async fn confirm_grant(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
        log_index: u32,
        amount: u64,
        mint_time: DateTime<Utc>,
    ) -> Result<CreditOperation> {
        with_deadlock_retry(&self.shutdown, "confirm_grant", || {
            self.confirm_grant_internal(license_id, asset_did, tx_hash, log_index, amount, mint_time)
        })
        .await
    }

    async fn confirm_grant_internal(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
        log_index: u32,
        amount: u64,
        mint_time: DateTime<Utc>,
    ) -> Result<CreditOperation> {
        let amount = positive_amount(amount)?;
        let log_index = i64::from(log_index);

        let mut tx = self.db.begin().await?;

        let grant = match self
            .db
            .find_pending_grant(&mut tx, license_id, asset_did, tx_hash)
            .await?
        {
            Some(grant) => {
                self.db
                    .update_grant_confirmed(&mut tx, grant.id, log_index)
                    .await?;
                grant
            }
            None => {
                let expires_at = grant_expiration(mint_time)?;
                let grant = CreditGrant::new(
                    license_id,
                    asset_did,
                    amount,
                    GrantStatus::Confirmed,
                    tx_hash,
                    Some(log_index),
                    expires_at,
                );
                self.db.insert_grant(&mut tx, &grant).await?;
                grant
            }
        };

        let reference_id = grant.id.to_string();
        let operation = CreditOperation::new(
            OperationType::GrantConfirm,
            license_id,
            asset_did,
            amount,
            TRACKER_APP_NAME,
            &reference_id,
        );
        // A replayed confirmation hits the idempotency key of the first one.
        self.db
            .insert_operation(&mut tx, &operation)
            .await
            .map_err(duplicate_as_already_performed)?;
        self.db
            .insert_operation_grant(
                &mut tx,
                &CreditOperationGrant::new(&operation, grant.id, amount),
            )
            .await?;

        self.settle_debt(&mut tx, license_id, asset_did, TRACKER_APP_NAME, &reference_id)
            .await?;

        tx.commit().await?;

        Ok(operation)
    }

    /// Mark the pending grant for a reverted burn transaction as failed. Any
    /// already-spent portion becomes outstanding debt; settlement happens on
    /// the next credit inflow rather than here.
    pub async fn fail_grant(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<()> {
        with_deadlock_retry(&self.shutdown, "fail_grant", || {
            self.fail_grant_internal(license_id, asset_did, tx_hash)
        })
        .await
    }

    async fn fail_grant_internal(
        &self,
        license_id: &str,
        asset_did: &str,
        tx_hash: &str,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let grant = self
            .db
            .find_pending_grant(&mut tx, license_id, asset_did, tx_hash)
            .await?
            .ok_or(CreditTrackerError::NotFound)?;
        self.db.mark_grant_failed(&mut tx, grant.id).await?;

        tx.commit().await?;

        Ok(())
    }

    /// Signed balance: a partition in debt reports the debt as a negative
    /// number so callers can tell "no credits" from "in the hole".
    pub async fn get_balance(&self, license_id: &str, asset_did: &str) -> Result<i64> {
        with_deadlock_retry(&self.shutdown, "get_balance", || {
            self.get_balance_internal(license_id, asset_did)
        })
        .await
    }

    async fn get_balance_internal(&self, license_id: &str, asset_did: &str) -> Result<i64> {
        let debt = self.db.sum_outstanding_debt(license_id, asset_did).await?;
        if debt > 0 {
            return Ok(-debt);
        }

        let mut tx = self.db.begin().await?;
        let balance = self
            .db
            .sum_active_balance(&mut tx, license_id, asset_did)
            .await?;
        tx.commit().await?;

        Ok(balance)
    }

    /// Move credits from active grants into failed grants carrying debt,
    /// inside the caller's transaction and under the caller's operation
    /// reference.
    async fn settle_debt(
        &self,
        tx: &mut PgTx<'_>,
        license_id: &str,
        asset_did: &str,
        app_name: &str,
        reference_id: &str,
    ) -> Result<()> {
        let debt = self.db.sum_outstanding_debt(license_id, asset_did).await?;
        if debt == 0 {
            return Ok(());
        }

        let balance = self
            .db
            .sum_active_balance(tx, license_id, asset_did)
            .await?;
        if balance == 0 {
            debug!(license_id, asset_did, debt, "no active balance to settle debt from");
            return Ok(());
        }

        // Either all the debt is settled or all the balance is used.
        let operation = CreditOperation::new(
            OperationType::DebtSettlement,
            license_id,
            asset_did,
            debt.min(balance),
            app_name,
            reference_id,
        );
        self.db.insert_operation(tx, &operation).await?;

        let failed_grants = self
            .db
            .list_failed_grants_with_debt(tx, license_id, asset_did)
            .await?;
        let active_grants = self
            .db
            .list_active_grants(tx, license_id, asset_did)
            .await?;

        let plan = plan_settlement(&failed_grants, &active_grants)?;
        for mv in &plan.moves {
            self.db
                .update_grant_remaining(tx, mv.grant_id, mv.remaining_after)
                .await?;
            self.db
                .insert_operation_grant(
                    tx,
                    &CreditOperationGrant::new(&operation, mv.grant_id, mv.amount),
                )
                .await?;
        }

        debug!(
            license_id,
            asset_did,
            settled = plan.total_settled,
            "settled outstanding debt"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(initial: i64, remaining: i64, status: GrantStatus) -> CreditGrant {
        let mut g = CreditGrant::new(
            "0xlicense",
            "did:asset:1",
            initial,
            status,
            "0xhash",
            None,
            Utc::now() + Duration::days(30),
        );
        g.remaining_amount = remaining;
        g
    }

    #[test]
    fn allocate_spans_grants_in_order() {
        let g1 = grant(50_000, 5, GrantStatus::Confirmed);
        let g2 = grant(50_000, 50_000, GrantStatus::Confirmed);

        let draws = allocate_fifo(&[g1.clone(), g2.clone()], 10);

        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0], GrantDraw { grant_id: g1.id, amount: 5, remaining_after: 0 });
        assert_eq!(draws[1], GrantDraw { grant_id: g2.id, amount: 5, remaining_after: 49_995 });
    }

    #[test]
    fn allocate_takes_only_from_first_grant_when_it_suffices() {
        let g1 = grant(50_000, 50_000, GrantStatus::Pending);
        let g2 = grant(50_000, 50_000, GrantStatus::Pending);

        let draws = allocate_fifo(&[g1.clone(), g2], 10);

        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].grant_id, g1.id);
        assert_eq!(draws[0].amount, 10);
        assert_eq!(draws[0].remaining_after, 49_990);
    }

    #[test]
    fn allocate_zero_amount_touches_nothing() {
        let g = grant(100, 100, GrantStatus::Confirmed);
        assert!(allocate_fifo(&[g], 0).is_empty());
    }

    #[test]
    fn allocate_drains_a_grant_exactly() {
        let g = grant(100, 100, GrantStatus::Confirmed);
        let draws = allocate_fifo(std::slice::from_ref(&g), 100);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].remaining_after, 0);
    }

    #[test]
    fn settlement_moves_debt_into_failed_grant() {
        let failed = grant(50_000, 49_900, GrantStatus::Failed);
        let active = grant(50_000, 50_000, GrantStatus::Pending);

        let plan = plan_settlement(
            std::slice::from_ref(&failed),
            std::slice::from_ref(&active),
        )
        .unwrap();

        assert_eq!(plan.total_settled, 100);
        assert_eq!(plan.moves.len(), 2);
        assert_eq!(
            plan.moves[0],
            GrantDraw { grant_id: active.id, amount: 100, remaining_after: 49_900 }
        );
        assert_eq!(
            plan.moves[1],
            GrantDraw { grant_id: failed.id, amount: 100, remaining_after: 50_000 }
        );
    }

    #[test]
    fn settlement_is_capped_by_active_balance() {
        let failed = grant(1_000, 0, GrantStatus::Failed);
        let active = grant(300, 300, GrantStatus::Confirmed);

        let plan = plan_settlement(
            std::slice::from_ref(&failed),
            std::slice::from_ref(&active),
        )
        .unwrap();

        assert_eq!(plan.total_settled, 300);
        assert_eq!(plan.moves[0].remaining_after, 0);
        assert_eq!(plan.moves[1].remaining_after, 300);
    }

    #[test]
    fn settlement_serves_failed_grants_oldest_first() {
        let failed_old = grant(500, 0, GrantStatus::Failed);
        let failed_new = grant(500, 300, GrantStatus::Failed);
        let active = grant(600, 600, GrantStatus::Confirmed);

        let plan =
            plan_settlement(&[failed_old.clone(), failed_new.clone()], &[active.clone()]).unwrap();

        assert_eq!(plan.total_settled, 600);
        // 500 clears the older grant entirely, 100 goes toward the newer one
        assert_eq!(plan.moves.len(), 4);
        assert_eq!(plan.moves[0].grant_id, active.id);
        assert_eq!(plan.moves[0].amount, 500);
        assert_eq!(plan.moves[1].grant_id, failed_old.id);
        assert_eq!(plan.moves[1].remaining_after, 500);
        assert_eq!(plan.moves[2].grant_id, active.id);
        assert_eq!(plan.moves[2].amount, 100);
        assert_eq!(plan.moves[2].remaining_after, 0);
        assert_eq!(plan.moves[3].grant_id, failed_new.id);
        assert_eq!(plan.moves[3].remaining_after, 400);
    }

    #[test]
    fn settlement_stops_once_active_grants_are_dry() {
        let failed_first = grant(500, 200, GrantStatus::Failed);
        let failed_second = grant(500, 100, GrantStatus::Failed);
        let active = grant(100, 100, GrantStatus::Confirmed);

        let plan = plan_settlement(
            &[failed_first.clone(), failed_second.clone()],
            std::slice::from_ref(&active),
        )
        .unwrap();

        // the first grant absorbs the whole active balance, the second gets
        // nothing and no credit row
        assert_eq!(plan.total_settled, 100);
        assert_eq!(plan.moves.len(), 2);
        assert_eq!(plan.moves[1].grant_id, failed_first.id);
        assert_eq!(plan.moves[1].remaining_after, 300);
    }

    #[test]
    fn settlement_with_no_debt_is_a_no_op() {
        let active = grant(100, 100, GrantStatus::Confirmed);
        let plan = plan_settlement(&[], std::slice::from_ref(&active)).unwrap();
        assert_eq!(plan.total_settled, 0);
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn settlement_emits_only_positive_movements() {
        let failed = grant(400, 100, GrantStatus::Failed);
        let active_a = grant(200, 150, GrantStatus::Confirmed);
        let active_b = grant(200, 200, GrantStatus::Pending);

        let plan = plan_settlement(&[failed], &[active_a, active_b]).unwrap();

        assert!(plan.moves.iter().all(|m| m.amount > 0));
        assert!(plan.moves.iter().all(|m| m.remaining_after >= 0));
        // both sides recorded: |sum of amounts| = 2 * settled
        let total: i64 = plan.moves.iter().map(|m| m.amount).sum();
        assert_eq!(total, 2 * plan.total_settled);
    }

    #[test]
    fn oversized_amounts_are_rejected() {
        assert!(matches!(
            signed_amount(u64::MAX),
            Err(CreditTrackerError::InvalidAmount(_))
        ));
        assert!(matches!(
            positive_amount(0),
            Err(CreditTrackerError::InvalidAmount(0))
        ));
        assert_eq!(positive_amount(50_000).unwrap(), 50_000);
    }

    #[test]
    fn duplicate_key_maps_to_already_performed() {
        let err = duplicate_as_already_performed(CreditTrackerError::DuplicateKey(
            sqlx::Error::PoolClosed,
        ));
        assert!(matches!(err, CreditTrackerError::AlreadyPerformed));

        let err = duplicate_as_already_performed(CreditTrackerError::NotFound);
        assert!(matches!(err, CreditTrackerError::NotFound));
    }
}
