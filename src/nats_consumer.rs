// Contract event consumer: turns observed on-chain token burns into grant
// confirmations. Stream progress is only committed once the ledger has
// recorded the confirmation (or already had it).

use crate::errors::{CreditTrackerError, Result};
use crate::ledger::Ledger;
use async_nats::jetstream;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CloudEvent type emitted by the chain indexer for contract logs.
pub const CONTRACT_EVENT_TYPE: &str = "contract.event";

/// Envelope of a contract event message.
#[derive(Debug, Deserialize)]
pub struct ContractEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ContractEventData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractEventData {
    #[serde(default)]
    pub event_signature: String,
    pub tx_hash: String,
    pub log_index: u32,
    pub arguments: serde_json::Value,
}

/// Arguments of a token-burn log.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBurnedData {
    pub license_id: String,
    pub asset_did: String,
    pub amount: u64,
}

pub struct ContractEventConsumer {
    client: async_nats::Client,
    stream_name: String,
    consumer_name: String,
    subject: String,
    burn_event_signature: String,
    revert_event_signature: String,
    ledger: Arc<Ledger>,
    shutdown: CancellationToken,
}

impl ContractEventConsumer {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        nats_url: &str,
        stream_name: String,
        consumer_name: String,
        subject: String,
        burn_event_signature: String,
        revert_event_signature: String,
        ledger: Arc<Ledger>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| CreditTrackerError::Nats(e.to_string()))?;

        info!("Connected to NATS at {} for stream {}", nats_url, stream_name);

        Ok(Self {
            client,
            stream_name,
            consumer_name,
            subject,
            burn_event_signature,
            revert_event_signature,
            ledger,
            shutdown,
        })
    }

    /// Consume contract events until the stream errors or shutdown fires.
    async fn consume(&self) -> Result<()> {
        let jetstream = jetstream::new(self.client.clone());

        // Get or create stream
        let stream = match jetstream.get_stream(&self.stream_name).await {
            Ok(stream) => stream,
            Err(_) => {
                info!("Stream {} not found, creating...", self.stream_name);
                jetstream
                    .create_stream(jetstream::stream::Config {
                        name: self.stream_name.clone(),
                        subjects: vec![self.subject.clone()],
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| CreditTrackerError::Nats(e.to_string()))?
            }
        };

        // Get or create consumer
        let consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config> =
            match stream.get_consumer(&self.consumer_name).await {
                Ok(consumer) => consumer,
                Err(_) => {
                    info!("Consumer {} not found, creating...", self.consumer_name);
                    stream
                        .create_consumer(jetstream::consumer::pull::Config {
                            durable_name: Some(self.consumer_name.clone()),
                            ack_policy: jetstream::consumer::AckPolicy::Explicit,
                            ..Default::default()
                        })
                        .await
                        .map_err(|e| CreditTrackerError::Nats(e.to_string()))?
                }
            };

        info!(
            "Contract event consumer ready: stream={}, consumer={}",
            self.stream_name, self.consumer_name
        );

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| CreditTrackerError::Nats(e.to_string()))?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = messages.next() => {
                    match next {
                        Some(Ok(message)) => {
                            if self.process_message(&message).await {
                                if let Err(e) = message.ack().await {
                                    error!("Failed to ack message: {}", e);
                                }
                            }
                            // not acked: the message redelivers and the
                            // ledger's idempotency key absorbs any replay
                        }
                        Some(Err(e)) => {
                            error!("Error receiving message: {}", e);
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Process one message; returns whether it may be acked.
    async fn process_message(&self, message: &jetstream::Message) -> bool {
        let event = match serde_json::from_slice::<ContractEvent>(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Failed to parse contract event: {}. Acking to avoid redelivery of bad message",
                    e
                );
                return true;
            }
        };

        if event.event_type != CONTRACT_EVENT_TYPE {
            return true;
        }

        let signature = event.data.event_signature.as_str();
        if signature == self.burn_event_signature {
            self.handle_burn(&event.data).await
        } else if signature == self.revert_event_signature {
            self.handle_revert(&event.data).await
        } else {
            true
        }
    }

    async fn handle_burn(&self, data: &ContractEventData) -> bool {
        let burn = match serde_json::from_value::<TokenBurnedData>(data.arguments.clone()) {
            Ok(burn) => burn,
            Err(e) => {
                warn!("Failed to parse token burn arguments: {}. Acking bad message", e);
                return true;
            }
        };

        match self
            .ledger
            .confirm_grant(
                &burn.license_id,
                &burn.asset_did,
                &data.tx_hash,
                data.log_index,
                burn.amount,
                Utc::now(),
            )
            .await
        {
            Ok(_) => {
                info!(
                    license_id = %burn.license_id,
                    asset_did = %burn.asset_did,
                    tx_hash = %data.tx_hash,
                    amount = burn.amount,
                    "confirmed credit grant from burn event"
                );
                true
            }
            Err(CreditTrackerError::AlreadyPerformed) => {
                info!(tx_hash = %data.tx_hash, "burn event already confirmed");
                true
            }
            Err(e) => {
                error!(
                    tx_hash = %data.tx_hash,
                    "Failed to confirm grant: {}. Will retry (message not acked)",
                    e
                );
                false
            }
        }
    }

    async fn handle_revert(&self, data: &ContractEventData) -> bool {
        let burn = match serde_json::from_value::<TokenBurnedData>(data.arguments.clone()) {
            Ok(burn) => burn,
            Err(e) => {
                warn!("Failed to parse burn revert arguments: {}. Acking bad message", e);
                return true;
            }
        };

        match self
            .ledger
            .fail_grant(&burn.license_id, &burn.asset_did, &data.tx_hash)
            .await
        {
            Ok(()) => {
                warn!(
                    license_id = %burn.license_id,
                    asset_did = %burn.asset_did,
                    tx_hash = %data.tx_hash,
                    "marked grant as failed after reverted burn"
                );
                true
            }
            Err(CreditTrackerError::NotFound) => {
                // no pending grant left for this transaction; already failed
                // or never tracked
                info!(tx_hash = %data.tx_hash, "revert event without a pending grant");
                true
            }
            Err(e) => {
                error!(
                    tx_hash = %data.tx_hash,
                    "Failed to mark grant as failed: {}. Will retry (message not acked)",
                    e
                );
                false
            }
        }
    }

    /// Run the consumer until shutdown, restarting the stream on errors.
    pub async fn run(self) {
        loop {
            if self.shutdown.is_cancelled() {
                info!("Contract event consumer shutting down");
                return;
            }

            if let Err(e) = self.consume().await {
                error!("Contract event consumer error: {}. Restarting in 5 seconds...", e);
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            } else if !self.shutdown.is_cancelled() {
                warn!("Contract event stream ended, reconnecting in 5 seconds...");
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_burn_event_payload() {
        let payload = serde_json::json!({
            "type": CONTRACT_EVENT_TYPE,
            "data": {
                "eventSignature": "TokenBurned",
                "txHash": "0xabc123",
                "logIndex": 7,
                "arguments": {
                    "licenseId": "0xlicense",
                    "assetDid": "did:asset:42",
                    "amount": 50_000
                }
            }
        });

        let event: ContractEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.event_type, CONTRACT_EVENT_TYPE);
        assert_eq!(event.data.event_signature, "TokenBurned");
        assert_eq!(event.data.tx_hash, "0xabc123");
        assert_eq!(event.data.log_index, 7);

        let burn: TokenBurnedData = serde_json::from_value(event.data.arguments).unwrap();
        assert_eq!(burn.license_id, "0xlicense");
        assert_eq!(burn.asset_did, "did:asset:42");
        assert_eq!(burn.amount, 50_000);
    }

    #[test]
    fn unknown_event_signature_is_tolerated() {
        let payload = serde_json::json!({
            "type": CONTRACT_EVENT_TYPE,
            "data": {
                "txHash": "0xdef",
                "logIndex": 0,
                "arguments": {}
            }
        });

        let event: ContractEvent = serde_json::from_value(payload).unwrap();
        assert!(event.data.event_signature.is_empty());
    }
}
