//! Fee policy: EIP-1559 bids with a hard cap and a bump path for replacements

use crate::chain::ChainClient;
use crate::config::GasConfig;
use crate::error::{SubmitError, SubmitResult};

use ethers::types::U256;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

const BPS: u64 = 10_000;

/// Where a quote came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteSource {
    FeeMarket,
    Legacy,
    /// RPC failed; cap-level values
    Fallback,
    Bumped,
}

impl QuoteSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteSource::FeeMarket => "fee_market",
            QuoteSource::Legacy => "legacy",
            QuoteSource::Fallback => "fallback",
            QuoteSource::Bumped => "bumped",
        }
    }
}

/// Fee bid for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasQuote {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub source: QuoteSource,
}

/// Computes fee bids from chain state. Holds no mutable state.
pub struct GasPolicy {
    chain: Arc<dyn ChainClient>,
    /// Ceiling for maxFeePerGas, in wei
    cap: U256,
    priority_fee: U256,
    min_priority_fee: U256,
    surge_bps: u64,
    legacy_bps: u64,
    bump_percent: u64,
}

pub fn gwei_to_wei(gwei: f64) -> U256 {
    U256::from((gwei * 1e9).round() as u128)
}

fn multiplier_to_bps(multiplier: f64) -> u64 {
    (multiplier * BPS as f64).round() as u64
}

impl GasPolicy {
    pub fn new(chain: Arc<dyn ChainClient>, config: &GasConfig) -> Self {
        Self {
            chain,
            cap: gwei_to_wei(config.max_fee_cap_gwei),
            priority_fee: gwei_to_wei(config.priority_fee_gwei),
            min_priority_fee: gwei_to_wei(config.min_priority_fee_gwei),
            surge_bps: multiplier_to_bps(config.surge_multiplier),
            legacy_bps: multiplier_to_bps(config.legacy_multiplier),
            bump_percent: config.bump_percent,
        }
    }

    pub fn cap(&self) -> U256 {
        self.cap
    }

    /// Default bump percentage for replacements
    pub fn bump_percent(&self) -> u64 {
        self.bump_percent
    }

    /// Quote fees for a new transaction. Never fails and never exceeds the cap.
    pub async fn quote(&self) -> GasQuote {
        let quote = match self.chain.latest_base_fee().await {
            Ok(Some(base_fee)) => self.fee_market_quote(base_fee),
            Ok(None) => match self.chain.gas_price().await {
                Ok(price) => self.legacy_quote(price),
                Err(e) => {
                    warn!("Gas price lookup failed, using cap-level fees: {}", e);
                    self.fallback_quote()
                }
            },
            Err(e) => {
                warn!("Latest block lookup failed, using cap-level fees: {}", e);
                self.fallback_quote()
            }
        };

        crate::metrics::record_gas_quote(quote.source);
        debug!(
            "Gas quote ({}): max fee {} wei, priority {} wei",
            quote.source.as_str(),
            quote.max_fee_per_gas,
            quote.max_priority_fee_per_gas
        );
        quote
    }

    fn floored_priority(&self) -> U256 {
        std::cmp::max(self.priority_fee, self.min_priority_fee)
    }

    fn fee_market_quote(&self, base_fee: U256) -> GasQuote {
        let priority = self.floored_priority();
        let max_fee = base_fee.saturating_add(priority).saturating_mul(U256::from(self.surge_bps))
            / U256::from(BPS);
        let max_fee = std::cmp::min(max_fee, self.cap);

        GasQuote {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: std::cmp::min(priority, max_fee),
            source: QuoteSource::FeeMarket,
        }
    }

    fn legacy_quote(&self, gas_price: U256) -> GasQuote {
        let max_fee = gas_price.saturating_mul(U256::from(self.legacy_bps)) / U256::from(BPS);
        let max_fee = std::cmp::min(max_fee, self.cap);

        GasQuote {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_fee / 10,
            source: QuoteSource::Legacy,
        }
    }

    fn fallback_quote(&self) -> GasQuote {
        GasQuote {
            max_fee_per_gas: self.cap,
            max_priority_fee_per_gas: std::cmp::min(self.floored_priority(), self.cap),
            source: QuoteSource::Fallback,
        }
    }

    /// Raise a max fee by `percent`, capped.
    ///
    /// Strictly greater than `current` whenever `current` is below the cap;
    /// at the cap it returns the cap.
    pub fn bump_fee(&self, current: U256, percent: u64) -> U256 {
        let bumped = bump(current, percent);
        std::cmp::min(bumped, self.cap)
    }

    /// Bump both fee fields for a replacement transaction
    pub fn bump_quote(&self, previous: &GasQuote, percent: u64) -> SubmitResult<GasQuote> {
        let max_fee = self.bump_fee(previous.max_fee_per_gas, percent);
        if max_fee <= previous.max_fee_per_gas {
            return Err(SubmitError::GasCapReached {
                cap: self.cap.to_string(),
            });
        }

        let priority = std::cmp::min(bump(previous.max_priority_fee_per_gas, percent), max_fee);

        Ok(GasQuote {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
            source: QuoteSource::Bumped,
        })
    }
}

fn bump(value: U256, percent: u64) -> U256 {
    let bumped = value.saturating_mul(U256::from(100 + percent)) / U256::from(100u64);
    if bumped > value {
        bumped
    } else {
        value.saturating_add(U256::one())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChain;

    fn gwei(v: f64) -> U256 {
        gwei_to_wei(v)
    }

    fn policy(chain: Arc<FakeChain>) -> GasPolicy {
        let config = GasConfig {
            max_fee_cap_gwei: 150.0,
            priority_fee_gwei: 2.0,
            min_priority_fee_gwei: 1.0,
            surge_multiplier: 1.2,
            legacy_multiplier: 1.2,
            bump_percent: 15,
        };
        GasPolicy::new(chain, &config)
    }

    #[tokio::test]
    async fn test_fee_market_scenario() {
        let chain = Arc::new(FakeChain::new(1));
        chain.set_base_fee(Some(gwei(1.0)));
        let quote = policy(chain).quote().await;

        assert_eq!(quote.max_fee_per_gas, U256::from(3_600_000_000u64));
        assert_eq!(quote.max_priority_fee_per_gas, U256::from(2_000_000_000u64));
        assert_eq!(quote.source, QuoteSource::FeeMarket);
    }

    #[tokio::test]
    async fn test_quote_never_exceeds_cap() {
        let chain = Arc::new(FakeChain::new(1));
        let policy = policy(chain.clone());

        for base in [0u64, 1, 50, 124, 125, 126, 1_000, 1_000_000] {
            chain.set_base_fee(Some(gwei(base as f64)));
            let quote = policy.quote().await;
            assert!(quote.max_fee_per_gas <= policy.cap(), "base {} gwei", base);
            assert!(quote.max_priority_fee_per_gas <= quote.max_fee_per_gas);
        }

        chain.set_base_fee(Some(U256::MAX));
        assert_eq!(policy.quote().await.max_fee_per_gas, policy.cap());
    }

    #[tokio::test]
    async fn test_priority_floor_applies() {
        let chain = Arc::new(FakeChain::new(1));
        chain.set_base_fee(Some(gwei(10.0)));
        let config = GasConfig {
            priority_fee_gwei: 0.5,
            min_priority_fee_gwei: 1.5,
            ..GasConfig::default()
        };
        let quote = GasPolicy::new(chain, &config).quote().await;
        assert_eq!(quote.max_priority_fee_per_gas, gwei(1.5));
    }

    #[tokio::test]
    async fn test_legacy_chain_heuristic() {
        let chain = Arc::new(FakeChain::new(56));
        chain.set_base_fee(None);
        chain.set_gas_price(gwei(5.0));
        let quote = policy(chain).quote().await;

        assert_eq!(quote.source, QuoteSource::Legacy);
        assert_eq!(quote.max_fee_per_gas, gwei(6.0));
        assert_eq!(quote.max_priority_fee_per_gas, gwei(0.6));
    }

    #[tokio::test]
    async fn test_rpc_failure_falls_back_to_cap() {
        let chain = Arc::new(FakeChain::new(1));
        chain.fail_fee_reads(true);
        let quote = policy(chain).quote().await;

        assert_eq!(quote.source, QuoteSource::Fallback);
        assert_eq!(quote.max_fee_per_gas, gwei(150.0));
        assert_eq!(quote.max_priority_fee_per_gas, gwei(2.0));
    }

    #[test]
    fn test_bump_invariant() {
        let policy = policy(Arc::new(FakeChain::new(1)));
        let cap = policy.cap();

        for x in [U256::zero(), U256::one(), U256::from(9u64), gwei(1.0), gwei(149.9), cap - U256::one()] {
            let bumped = policy.bump_fee(x, 10);
            assert!(bumped > x, "bump of {} did not increase", x);
            assert!(bumped <= cap);
        }
        assert_eq!(policy.bump_fee(cap, 10), cap);
        assert_eq!(policy.bump_fee(gwei(10.0), 10), gwei(11.0));
    }

    #[test]
    fn test_bump_quote_at_cap_is_refused() {
        let policy = policy(Arc::new(FakeChain::new(1)));
        let at_cap = GasQuote {
            max_fee_per_gas: policy.cap(),
            max_priority_fee_per_gas: gwei(2.0),
            source: QuoteSource::Fallback,
        };
        assert!(matches!(
            policy.bump_quote(&at_cap, 15),
            Err(SubmitError::GasCapReached { .. })
        ));
    }

    #[test]
    fn test_bump_quote_raises_both_fields() {
        let policy = policy(Arc::new(FakeChain::new(1)));
        let previous = GasQuote {
            max_fee_per_gas: gwei(10.0),
            max_priority_fee_per_gas: gwei(2.0),
            source: QuoteSource::FeeMarket,
        };
        let bumped = policy.bump_quote(&previous, 15).unwrap();
        assert_eq!(bumped.max_fee_per_gas, gwei(11.5));
        assert_eq!(bumped.max_priority_fee_per_gas, gwei(2.3));
        assert_eq!(bumped.source, QuoteSource::Bumped);
    }
}
