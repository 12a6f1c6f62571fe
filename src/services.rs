use crate::errors::{CreditTrackerError, Result};
use crate::ledger::Ledger;
use crate::metrics;
use crate::models::CreditOperation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};

/// Caller-facing ledger operations. The orchestrator recovers only from
/// `InsufficientCredits`; everything else passes through unchanged.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn deduct(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<CreditOperation>;

    async fn refund(&self, app_name: &str, reference_id: &str) -> Result<CreditOperation>;

    async fn get_balance(&self, license_id: &str, asset_did: &str) -> Result<i64>;
}

#[async_trait]
impl CreditLedger for Ledger {
    async fn deduct(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<CreditOperation> {
        Ledger::deduct(self, license_id, asset_did, amount, app_name, reference_id).await
    }

    async fn refund(&self, app_name: &str, reference_id: &str) -> Result<CreditOperation> {
        Ledger::refund(self, app_name, reference_id).await
    }

    async fn get_balance(&self, license_id: &str, asset_did: &str) -> Result<i64> {
        Ledger::get_balance(self, license_id, asset_did).await
    }
}

/// Receipt for a burn transaction submitted to the chain.
#[derive(Debug, Clone)]
pub struct BurnReceipt {
    pub tx_hash: String,
    pub initiated_at: DateTime<Utc>,
}

/// Submits a token burn that mints additional credits. Implementations must
/// make the resulting grant visible to the ledger (as a pending grant) before
/// returning, so a retried deduction can overdraft on it.
#[async_trait]
pub trait BurnInitiator: Send + Sync {
    async fn initiate_burn(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
    ) -> Result<BurnReceipt>;
}

pub struct CreditService {
    ledger: Arc<dyn CreditLedger>,
    burn_initiator: Arc<dyn BurnInitiator>,
    default_burn_amount: u64,
}

impl CreditService {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        burn_initiator: Arc<dyn BurnInitiator>,
        default_burn_amount: u64,
    ) -> Self {
        CreditService {
            ledger,
            burn_initiator,
            default_burn_amount,
        }
    }

    /// Deduct credits, minting more through a burn when the balance runs dry.
    /// Exactly one burn retry is allowed per call; a second
    /// `InsufficientCredits` after the burn is fatal so a malfunctioning burn
    /// pipeline cannot trigger runaway minting.
    pub async fn deduct_with_auto_burn(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
        app_name: &str,
        reference_id: &str,
    ) -> Result<CreditOperation> {
        let first_attempt = self
            .ledger
            .deduct(license_id, asset_did, amount, app_name, reference_id)
            .await;

        let operation = match first_attempt {
            Err(err) if err.is_insufficient_credits() => {
                self.add_burn_credits(license_id, asset_did).await?;

                match self
                    .ledger
                    .deduct(license_id, asset_did, amount, app_name, reference_id)
                    .await
                {
                    Err(err) if err.is_insufficient_credits() => {
                        warn!(license_id, asset_did, %err, "balance still insufficient after burn");
                        return Err(CreditTrackerError::BurnDidNotRestoreBalance);
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        metrics::CREDIT_OPERATIONS
            .with_label_values(&["deduct", license_id, metrics::amount_bucket(operation.total_amount)])
            .inc();

        Ok(operation)
    }

    pub async fn refund(&self, app_name: &str, reference_id: &str) -> Result<CreditOperation> {
        let operation = self.ledger.refund(app_name, reference_id).await?;

        metrics::CREDIT_OPERATIONS
            .with_label_values(&[
                "refund",
                &operation.license_id,
                metrics::amount_bucket(operation.total_amount),
            ])
            .inc();

        Ok(operation)
    }

    pub async fn get_balance(&self, license_id: &str, asset_did: &str) -> Result<i64> {
        let credits = self.ledger.get_balance(license_id, asset_did).await?;

        metrics::CREDIT_OPERATIONS
            .with_label_values(&["get_balance", license_id, metrics::amount_bucket(credits)])
            .inc();
        metrics::CREDIT_BALANCE
            .with_label_values(&[license_id])
            .set(credits);

        Ok(credits)
    }

    async fn add_burn_credits(&self, license_id: &str, asset_did: &str) -> Result<()> {
        match self
            .burn_initiator
            .initiate_burn(license_id, asset_did, self.default_burn_amount)
            .await
        {
            Ok(receipt) => {
                info!(license_id, asset_did, tx_hash = %receipt.tx_hash, "initiated credit burn");
            }
            Err(CreditTrackerError::GrantAlreadyInFlight) => {
                // another flow already initiated the burn; its pending grant
                // covers the retry
                info!(license_id, asset_did, "burn already in flight");
            }
            Err(err) => return Err(CreditTrackerError::BurnFailed(err.to_string())),
        }

        metrics::CREDIT_OPERATIONS
            .with_label_values(&[
                "burn",
                license_id,
                metrics::amount_bucket(self.default_burn_amount as i64),
            ])
            .inc();

        Ok(())
    }
}

/// Stand-in for the on-chain burn submitter: synthesizes a transaction hash
/// and registers the pending grant directly with the ledger. One burn per
/// (license, asset) may be in flight at a time.
pub struct MockBurnInitiator {
    ledger: Arc<Ledger>,
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl MockBurnInitiator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        MockBurnInitiator {
            ledger,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn fake_tx_hash() -> String {
        format!(
            "0x{:032x}{:032x}",
            rand::random::<u128>(),
            rand::random::<u128>()
        )
    }
}

#[async_trait]
impl BurnInitiator for MockBurnInitiator {
    async fn initiate_burn(
        &self,
        license_id: &str,
        asset_did: &str,
        amount: u64,
    ) -> Result<BurnReceipt> {
        let key = (license_id.to_string(), asset_did.to_string());
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if !in_flight.insert(key.clone()) {
                return Err(CreditTrackerError::GrantAlreadyInFlight);
            }
        }

        let tx_hash = Self::fake_tx_hash();
        let result = self
            .ledger
            .create_grant(license_id, asset_did, amount, &tx_hash, Utc::now())
            .await;

        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&key);

        result.map(|_| BurnReceipt {
            tx_hash,
            initiated_at: Utc::now(),
        })
    }
}
