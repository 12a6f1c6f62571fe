// Usage report aggregations over the operations table. The sign conventions
// on operations let these queries compute net usage without joining to the
// grant-level rows.

use crate::errors::{CreditTrackerError, Result};
use crate::ledger::Ledger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage of a license across all of its assets over a time period.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseUsageReport {
    pub license_id: String,
    pub from_date: DateTime<Utc>,
    pub to_date: Option<DateTime<Utc>>,
    /// Number of distinct assets touched by any operation in the period
    pub num_of_assets: i64,
    /// Number of grant confirmations in the period
    pub num_of_credit_grants_purchased: i64,
    /// Net credits used: deductions minus refunds
    pub num_of_credits_used: i64,
}

/// Usage of a single (license, asset) pair over a time period.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseAssetUsageReport {
    pub license_id: String,
    pub asset_did: String,
    pub from_date: DateTime<Utc>,
    pub to_date: Option<DateTime<Utc>>,
    pub num_of_credits_used: i64,
    pub num_of_credit_grants_purchased: i64,
    /// Remaining credits right now; not bounded by the report period
    pub current_credits_remaining: i64,
}

/// A `to_date` of `None` means no upper bound.
pub(crate) fn validate_report_range(
    license_id: &str,
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    if license_id.is_empty() {
        return Err(CreditTrackerError::InvalidArguments(
            "license id is required".to_string(),
        ));
    }
    let from_date = from_date.ok_or_else(|| {
        CreditTrackerError::InvalidArguments("from date is required".to_string())
    })?;
    if let Some(to_date) = to_date {
        if from_date > to_date {
            return Err(CreditTrackerError::InvalidArguments(
                "from date must be before to date".to_string(),
            ));
        }
    }
    if from_date > Utc::now() {
        return Err(CreditTrackerError::InvalidArguments(
            "from date cannot be in the future".to_string(),
        ));
    }
    Ok(from_date)
}

impl Ledger {
    pub async fn license_usage_report(
        &self,
        license_id: &str,
        from_date: Option<DateTime<Utc>>,
        to_date: Option<DateTime<Utc>>,
    ) -> Result<LicenseUsageReport> {
        let from_date = validate_report_range(license_id, from_date, to_date)?;
        let pool = self.db.pool();

        let assets = async {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(DISTINCT asset_did) FROM credit_operations
                WHERE license_id = $1
                  AND created_at >= $2
                  AND ($3::timestamptz IS NULL OR created_at <= $3)
                "#,
            )
            .bind(license_id)
            .bind(from_date)
            .bind(to_date)
            .fetch_one(pool)
            .await
            .map_err(CreditTrackerError::from)
        };

        let credits_used = async {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT (
                    COALESCE(SUM(CASE WHEN operation_type = 'deduction' THEN total_amount ELSE 0 END), 0)
                    - COALESCE(SUM(CASE WHEN operation_type = 'refund' THEN total_amount ELSE 0 END), 0)
                )::BIGINT
                FROM credit_operations
                WHERE license_id = $1
                  AND created_at >= $2
                  AND ($3::timestamptz IS NULL OR created_at <= $3)
                "#,
            )
            .bind(license_id)
            .bind(from_date)
            .bind(to_date)
            .fetch_one(pool)
            .await
            .map_err(CreditTrackerError::from)
        };

        let grants_purchased = async {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM credit_operations
                WHERE license_id = $1
                  AND operation_type = 'grant_confirm'
                  AND created_at >= $2
                  AND ($3::timestamptz IS NULL OR created_at <= $3)
                "#,
            )
            .bind(license_id)
            .bind(from_date)
            .bind(to_date)
            .fetch_one(pool)
            .await
            .map_err(CreditTrackerError::from)
        };

        let (num_of_assets, num_of_credits_used, num_of_credit_grants_purchased) =
            tokio::try_join!(assets, credits_used, grants_purchased)?;

        Ok(LicenseUsageReport {
            license_id: license_id.to_string(),
            from_date,
            to_date,
            num_of_assets,
            num_of_credit_grants_purchased,
            num_of_credits_used,
        })
    }

    pub async fn license_asset_usage_report(
        &self,
        license_id: &str,
        asset_did: &str,
        from_date: Option<DateTime<Utc>>,
        to_date: Option<DateTime<Utc>>,
    ) -> Result<LicenseAssetUsageReport> {
        if asset_did.is_empty() {
            return Err(CreditTrackerError::InvalidArguments(
                "asset did is required".to_string(),
            ));
        }
        let from_date = validate_report_range(license_id, from_date, to_date)?;
        let pool = self.db.pool();

        let credits_used = async {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT (
                    COALESCE(SUM(CASE WHEN operation_type = 'deduction' THEN total_amount ELSE 0 END), 0)
                    - COALESCE(SUM(CASE WHEN operation_type = 'refund' THEN total_amount ELSE 0 END), 0)
                )::BIGINT
                FROM credit_operations
                WHERE license_id = $1
                  AND asset_did = $2
                  AND created_at >= $3
                  AND ($4::timestamptz IS NULL OR created_at <= $4)
                "#,
            )
            .bind(license_id)
            .bind(asset_did)
            .bind(from_date)
            .bind(to_date)
            .fetch_one(pool)
            .await
            .map_err(CreditTrackerError::from)
        };

        let grants_purchased = async {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM credit_operations
                WHERE license_id = $1
                  AND asset_did = $2
                  AND operation_type = 'grant_confirm'
                  AND created_at >= $3
                  AND ($4::timestamptz IS NULL OR created_at <= $4)
                "#,
            )
            .bind(license_id)
            .bind(asset_did)
            .bind(from_date)
            .bind(to_date)
            .fetch_one(pool)
            .await
            .map_err(CreditTrackerError::from)
        };

        let (num_of_credits_used, num_of_credit_grants_purchased, current_credits_remaining) =
            tokio::try_join!(
                credits_used,
                grants_purchased,
                self.get_balance(license_id, asset_did)
            )?;

        Ok(LicenseAssetUsageReport {
            license_id: license_id.to_string(),
            asset_did: asset_did.to_string(),
            from_date,
            to_date,
            num_of_credits_used,
            num_of_credit_grants_purchased,
            current_credits_remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn from_date_is_required() {
        let result = validate_report_range("0xlicense", None, None);
        assert!(matches!(result, Err(CreditTrackerError::InvalidArguments(_))));
    }

    #[test]
    fn license_is_required() {
        let result = validate_report_range("", Some(Utc::now()), None);
        assert!(matches!(result, Err(CreditTrackerError::InvalidArguments(_))));
    }

    #[test]
    fn from_after_to_is_rejected() {
        let now = Utc::now();
        let result =
            validate_report_range("0xlicense", Some(now), Some(now - Duration::hours(1)));
        assert!(matches!(result, Err(CreditTrackerError::InvalidArguments(_))));
    }

    #[test]
    fn future_from_is_rejected() {
        let result =
            validate_report_range("0xlicense", Some(Utc::now() + Duration::hours(1)), None);
        assert!(matches!(result, Err(CreditTrackerError::InvalidArguments(_))));
    }

    #[test]
    fn open_ended_range_is_allowed() {
        let from = Utc::now() - Duration::days(7);
        let validated = validate_report_range("0xlicense", Some(from), None).unwrap();
        assert_eq!(validated, from);
    }
}
