//! Intent keys: deterministic request ids from business parameters
//!
//! Two calls with the same parameters inside one time bucket produce the same
//! key, so a double-click or a retried HTTP call lands on one intent instead of
//! reserving two nonces.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Business parameters that identify one trading intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentParams {
    pub caller_id: String,
    pub action: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
}

/// Hex SHA3-256 digest over the parameters and the bucket containing `at`.
///
/// Decimals are normalized first, so `1.50` and `1.5` hash the same.
pub fn intent_key(params: &IntentParams, at: DateTime<Utc>, bucket_secs: u64) -> String {
    let bucket = at.timestamp().max(0) as u64 / bucket_secs.max(1);
    let price = params
        .price
        .map(|p| p.normalize().to_string())
        .unwrap_or_default();

    let quantity = params.quantity.normalize().to_string();
    let bucket = bucket.to_string();

    let mut hasher = Sha3_256::new();
    for field in [
        params.caller_id.as_str(),
        params.action.as_str(),
        params.symbol.as_str(),
        params.side.as_str(),
        quantity.as_str(),
        price.as_str(),
        bucket.as_str(),
    ] {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }

    hex::encode(hasher.finalize())
}
