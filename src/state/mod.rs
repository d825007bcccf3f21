//! Intent persistence: one record per request id
//!
//! Handles:
//! - The request id → transaction hash mapping that makes sends at-most-once
//! - Lifecycle status (CREATED → SENT → CONFIRMED / FAILED)
//! - Retry count and last error for operators

mod manager;
mod memory;

pub use manager::PgIntentStore;
pub use memory::MemoryIntentStore;

use crate::error::{SubmitError, SubmitResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Bytes, H256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a request. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Created,
    Sent,
    Confirmed,
    Failed,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Created => "created",
            IntentStatus::Sent => "sent",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Confirmed | IntentStatus::Failed)
    }

    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        matches!(
            (self, next),
            (IntentStatus::Created, IntentStatus::Sent)
                | (IntentStatus::Created, IntentStatus::Failed)
                | (IntentStatus::Sent, IntentStatus::Confirmed)
                | (IntentStatus::Sent, IntentStatus::Failed)
        )
    }

    /// Validate a move to `next`
    pub fn transition(&self, next: IntentStatus) -> SubmitResult<IntentStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SubmitError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = SubmitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(IntentStatus::Created),
            "sent" => Ok(IntentStatus::Sent),
            "confirmed" => Ok(IntentStatus::Confirmed),
            "failed" => Ok(IntentStatus::Failed),
            other => Err(SubmitError::Internal(format!("unknown intent status {}", other))),
        }
    }
}

/// Signed bytes bound to a request id before the first send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedPayload {
    pub tx_hash: H256,
    pub nonce: u64,
    pub raw: Bytes,
}

/// Durable record for one request id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionIntent {
    pub request_id: String,
    pub status: IntentStatus,
    /// Set once; never changes afterwards
    pub tx_hash: Option<H256>,
    /// Payload every sender for this id must use; set once
    #[serde(skip)]
    pub payload: Option<ClaimedPayload>,
    pub nonce: Option<u64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl TransactionIntent {
    pub fn new(request_id: &str) -> Self {
        let now = Utc::now();
        Self {
            request_id: request_id.to_string(),
            status: IntentStatus::Created,
            tx_hash: None,
            payload: None,
            nonce: None,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
        }
    }
}

/// Storage for transaction intents
#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Create the intent if it does not exist; return the stored record either way
    async fn begin(&self, request_id: &str) -> SubmitResult<TransactionIntent>;

    async fn get(&self, request_id: &str) -> SubmitResult<Option<TransactionIntent>>;

    /// Bind `payload` to a CREATED intent before it is sent.
    ///
    /// Only the first claim is stored. Every caller gets the stored payload
    /// back, so all senders for one id submit the same bytes.
    async fn claim(&self, request_id: &str, payload: ClaimedPayload) -> SubmitResult<ClaimedPayload>;

    /// Record the hash for a CREATED intent and move it to SENT.
    ///
    /// The first recorded hash wins: if one is already stored it is returned
    /// unchanged.
    async fn record_sent(&self, request_id: &str, tx_hash: H256, nonce: u64) -> SubmitResult<H256>;

    /// Count a failed attempt
    async fn record_attempt(&self, request_id: &str, error: &str) -> SubmitResult<()>;

    /// SENT → CONFIRMED
    async fn mark_confirmed(&self, request_id: &str) -> SubmitResult<()>;

    /// CREATED or SENT → FAILED
    async fn mark_failed(&self, request_id: &str, reason: &str) -> SubmitResult<()>;

    async fn health_check(&self) -> SubmitResult<()>;
}
