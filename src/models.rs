use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{CreditTrackerError, Result};

/// App name recorded on operations the tracker performs on its own behalf
/// (grant purchases, confirmations, and the settlements they trigger).
pub const TRACKER_APP_NAME: &str = "credit_tracker";

/// Grant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "grant_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Ledger operation kind; part of the idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "operation_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Deduction,
    Refund,
    GrantPurchase,
    GrantConfirm,
    DebtSettlement,
}

/// A batch of credits acquired from a single on-chain token burn
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditGrant {
    pub id: Uuid,
    pub license_id: String,
    pub asset_did: String,
    pub initial_amount: i64,
    pub remaining_amount: i64,
    pub status: GrantStatus,
    pub tx_hash: String,
    pub log_index: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditGrant {
    pub fn new(
        license_id: &str,
        asset_did: &str,
        amount: i64,
        status: GrantStatus,
        tx_hash: &str,
        log_index: Option<i64>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        CreditGrant {
            id: Uuid::new_v4(),
            license_id: license_id.to_string(),
            asset_did: asset_did.to_string(),
            initial_amount: amount,
            remaining_amount: amount,
            status,
            tx_hash: tx_hash.to_string(),
            log_index,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Outstanding debt carried by a failed grant
    pub fn debt(&self) -> i64 {
        self.initial_amount - self.remaining_amount
    }
}

/// One caller-visible ledger action, unique per
/// `(app_name, reference_id, operation_type)`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditOperation {
    pub app_name: String,
    pub reference_id: String,
    pub operation_type: OperationType,
    pub license_id: String,
    pub asset_did: String,
    pub total_amount: i64,
    pub created_at: DateTime<Utc>,
}

impl CreditOperation {
    pub fn new(
        operation_type: OperationType,
        license_id: &str,
        asset_did: &str,
        total_amount: i64,
        app_name: &str,
        reference_id: &str,
    ) -> Self {
        CreditOperation {
            app_name: app_name.to_string(),
            reference_id: reference_id.to_string(),
            operation_type,
            license_id: license_id.to_string(),
            asset_did: asset_did.to_string(),
            total_amount,
            created_at: Utc::now(),
        }
    }
}

/// Grant-level accounting row of an operation. `amount_used` is negative for
/// deductions and positive for refunds, grant credits, and settlements.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditOperationGrant {
    pub id: Uuid,
    pub app_name: String,
    pub reference_id: String,
    pub operation_type: OperationType,
    pub grant_id: Uuid,
    pub amount_used: i64,
    pub created_at: DateTime<Utc>,
}

impl CreditOperationGrant {
    pub fn new(operation: &CreditOperation, grant_id: Uuid, amount_used: i64) -> Self {
        CreditOperationGrant {
            id: Uuid::new_v4(),
            app_name: operation.app_name.clone(),
            reference_id: operation.reference_id.clone(),
            operation_type: operation.operation_type,
            grant_id,
            amount_used,
            created_at: Utc::now(),
        }
    }
}

/// Grants expire on the same date in the next calendar month (UTC).
pub fn grant_expiration(mint_time: DateTime<Utc>) -> Result<DateTime<Utc>> {
    mint_time
        .checked_add_months(Months::new(1))
        .ok_or(CreditTrackerError::ArithmeticOverflow)
}

/// Credit deduction request
#[derive(Debug, Deserialize, Serialize, validator::Validate)]
pub struct DeductRequest {
    #[validate(length(min = 1))]
    pub license_id: String,
    #[validate(length(min = 1))]
    pub asset_did: String,
    pub amount: u64,
    #[validate(length(min = 1))]
    pub app_name: String,
    #[validate(length(min = 1))]
    pub reference_id: String,
}

/// Credit refund request
#[derive(Debug, Deserialize, Serialize, validator::Validate)]
pub struct RefundRequest {
    #[validate(length(min = 1))]
    pub app_name: String,
    #[validate(length(min = 1))]
    pub reference_id: String,
}

/// Grant creation request (pending grant for an initiated burn)
#[derive(Debug, Deserialize, Serialize, validator::Validate)]
pub struct CreateGrantRequest {
    #[validate(length(min = 1))]
    pub license_id: String,
    #[validate(length(min = 1))]
    pub asset_did: String,
    pub amount: u64,
    #[validate(length(min = 1))]
    pub tx_hash: String,
    pub mint_time: DateTime<Utc>,
}

/// Grant confirmation request (observed on-chain burn)
#[derive(Debug, Deserialize, Serialize, validator::Validate)]
pub struct ConfirmGrantRequest {
    #[validate(length(min = 1))]
    pub license_id: String,
    #[validate(length(min = 1))]
    pub asset_did: String,
    #[validate(length(min = 1))]
    pub tx_hash: String,
    pub log_index: u32,
    pub amount: u64,
    pub mint_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub license_id: String,
    pub asset_did: String,
    /// Negative value encodes outstanding debt
    pub remaining_credits: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OperationResponse {
    pub app_name: String,
    pub reference_id: String,
    pub operation_type: OperationType,
    pub total_amount: i64,
    pub created_at: DateTime<Utc>,
}

impl From<CreditOperation> for OperationResponse {
    fn from(op: CreditOperation) -> Self {
        OperationResponse {
            app_name: op.app_name,
            reference_id: op.reference_id,
            operation_type: op.operation_type,
            total_amount: op.total_amount,
            created_at: op.created_at,
        }
    }
}
