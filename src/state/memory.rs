//! In-memory intent store for tests and single-process development

use super::{ClaimedPayload, IntentStatus, IntentStore, TransactionIntent};
use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ethers::types::H256;

#[derive(Default)]
pub struct MemoryIntentStore {
    intents: DashMap<String, TransactionIntent>,
}

impl MemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, request_id: &str, f: F) -> SubmitResult<()>
    where
        F: FnOnce(&mut TransactionIntent) -> SubmitResult<()>,
    {
        let mut intent = self
            .intents
            .get_mut(request_id)
            .ok_or_else(|| SubmitError::IntentNotFound {
                request_id: request_id.to_string(),
            })?;
        f(&mut *intent)?;
        intent.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl IntentStore for MemoryIntentStore {
    async fn begin(&self, request_id: &str) -> SubmitResult<TransactionIntent> {
        Ok(self
            .intents
            .entry(request_id.to_string())
            .or_insert_with(|| TransactionIntent::new(request_id))
            .clone())
    }

    async fn get(&self, request_id: &str) -> SubmitResult<Option<TransactionIntent>> {
        Ok(self.intents.get(request_id).map(|i| i.clone()))
    }

    async fn claim(&self, request_id: &str, payload: ClaimedPayload) -> SubmitResult<ClaimedPayload> {
        let mut claimed = None;
        self.update(request_id, |intent| {
            if let Some(existing) = &intent.payload {
                claimed = Some(existing.clone());
                return Ok(());
            }
            if intent.status != IntentStatus::Created {
                return Err(SubmitError::InvalidStateTransition {
                    from: intent.status.to_string(),
                    to: "claimed".to_string(),
                });
            }
            intent.nonce = Some(payload.nonce);
            intent.payload = Some(payload.clone());
            claimed = Some(payload);
            Ok(())
        })?;
        claimed.ok_or_else(|| SubmitError::Internal(format!("claim for {} not stored", request_id)))
    }

    async fn record_sent(&self, request_id: &str, tx_hash: H256, nonce: u64) -> SubmitResult<H256> {
        let mut winner = tx_hash;
        self.update(request_id, |intent| {
            if let Some(existing) = intent.tx_hash {
                winner = existing;
                return Ok(());
            }
            intent.status = intent.status.transition(IntentStatus::Sent)?;
            intent.tx_hash = Some(tx_hash);
            intent.nonce = Some(nonce);
            Ok(())
        })?;
        Ok(winner)
    }

    async fn record_attempt(&self, request_id: &str, error: &str) -> SubmitResult<()> {
        self.update(request_id, |intent| {
            intent.retry_count += 1;
            intent.last_error = Some(error.to_string());
            Ok(())
        })
    }

    async fn mark_confirmed(&self, request_id: &str) -> SubmitResult<()> {
        self.update(request_id, |intent| {
            intent.status = intent.status.transition(IntentStatus::Confirmed)?;
            intent.confirmed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn mark_failed(&self, request_id: &str, reason: &str) -> SubmitResult<()> {
        self.update(request_id, |intent| {
            intent.status = intent.status.transition(IntentStatus::Failed)?;
            intent.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    async fn health_check(&self) -> SubmitResult<()> {
        Ok(())
    }
}
