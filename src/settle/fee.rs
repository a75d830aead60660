//! Fee quoting for batch settlement transactions
//!
//! Fees here are operator policy, not live congestion samples: the priority
//! and max fee are configured floors/ceilings, and the gas limit is the
//! node's estimate plus a fixed safety margin. Sampling the fee market per
//! submission is a deliberate non-feature for a low-frequency scheduled job;
//! tune the policy instead.

use crate::config::FeeConfig;
use crate::error::{SettlerError, SettlerResult};

use ethers::types::U256;

/// Gas units added on top of the node's estimate.
pub const DEFAULT_GAS_LIMIT_MARGIN: u64 = 100_000;
/// Default priority fee, in gwei.
pub const DEFAULT_MAX_PRIORITY_FEE_GWEI: u64 = 30;
/// Default total fee ceiling, in gwei.
pub const DEFAULT_MAX_FEE_GWEI: u64 = 60;

/// Operator-tunable fee bounds applied to every submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeePolicy {
    /// Safety margin added to the simulated gas cost. Must be nonzero so the
    /// resulting limit is strictly above the estimate.
    pub gas_limit_margin: U256,
    /// Priority fee per gas unit, in wei.
    pub max_priority_fee_per_gas: U256,
    /// Total fee ceiling per gas unit, in wei.
    pub max_fee_per_gas: U256,
}

/// Per-submission fee parameters, computed once and consumed once by the
/// broadcast step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeQuote {
    pub gas_limit: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
}

impl FeePolicy {
    pub fn from_config(config: &FeeConfig) -> Self {
        Self {
            gas_limit_margin: U256::from(config.gas_limit_margin),
            max_priority_fee_per_gas: gwei(config.max_priority_fee_gwei),
            max_fee_per_gas: gwei(config.max_fee_gwei),
        }
    }

    /// Reject policies that can never produce a valid quote.
    pub fn validate(&self) -> SettlerResult<()> {
        if self.max_fee_per_gas < self.max_priority_fee_per_gas {
            return Err(SettlerError::InvalidFeePolicy(format!(
                "max fee {} below priority fee {}",
                self.max_fee_per_gas, self.max_priority_fee_per_gas
            )));
        }
        if self.gas_limit_margin.is_zero() {
            return Err(SettlerError::InvalidFeePolicy(
                "gas limit margin must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive the quote for one submission from the simulated gas cost.
    ///
    /// The gas limit is strictly greater than `simulated_gas`, and the fee
    /// bounds always satisfy max >= priority.
    pub fn quote(&self, simulated_gas: U256) -> SettlerResult<FeeQuote> {
        self.validate()?;
        Ok(FeeQuote {
            gas_limit: simulated_gas + self.gas_limit_margin,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            max_fee_per_gas: self.max_fee_per_gas,
        })
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            gas_limit_margin: U256::from(DEFAULT_GAS_LIMIT_MARGIN),
            max_priority_fee_per_gas: gwei(DEFAULT_MAX_PRIORITY_FEE_GWEI),
            max_fee_per_gas: gwei(DEFAULT_MAX_FEE_GWEI),
        }
    }
}

fn gwei(value: u64) -> U256 {
    U256::from(value) * U256::exp10(9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_adds_margin_over_estimate() {
        let policy = FeePolicy::default();
        let quote = policy.quote(U256::from(800_000)).unwrap();

        assert_eq!(quote.gas_limit, U256::from(900_000));
        assert_eq!(quote.max_priority_fee_per_gas, U256::from(30_000_000_000u64));
        assert_eq!(quote.max_fee_per_gas, U256::from(60_000_000_000u64));
    }

    #[test]
    fn test_quote_invariants() {
        let policy = FeePolicy::default();
        for gas in [0u64, 1, 21_000, 800_000, 30_000_000] {
            let quote = policy.quote(U256::from(gas)).unwrap();
            assert!(quote.gas_limit > U256::from(gas));
            assert!(quote.max_fee_per_gas >= quote.max_priority_fee_per_gas);
        }
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let policy = FeePolicy {
            gas_limit_margin: U256::from(100_000),
            max_priority_fee_per_gas: gwei(60),
            max_fee_per_gas: gwei(30),
        };
        let err = policy.quote(U256::from(100_000)).unwrap_err();
        assert!(matches!(err, SettlerError::InvalidFeePolicy(_)));
    }

    #[test]
    fn test_zero_margin_rejected() {
        let policy = FeePolicy {
            gas_limit_margin: U256::zero(),
            max_priority_fee_per_gas: gwei(30),
            max_fee_per_gas: gwei(60),
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_equal_bounds_accepted() {
        let policy = FeePolicy {
            gas_limit_margin: U256::from(1),
            max_priority_fee_per_gas: gwei(30),
            max_fee_per_gas: gwei(30),
        };
        let quote = policy.quote(U256::from(500)).unwrap();
        assert_eq!(quote.max_fee_per_gas, quote.max_priority_fee_per_gas);
        assert_eq!(quote.gas_limit, U256::from(501));
    }

    #[test]
    fn test_config_conversion_uses_wei() {
        let config = FeeConfig {
            gas_limit_margin: 50_000,
            max_priority_fee_gwei: 2,
            max_fee_gwei: 4,
        };
        let policy = FeePolicy::from_config(&config);
        assert_eq!(policy.max_priority_fee_per_gas, U256::from(2_000_000_000u64));
        assert_eq!(policy.max_fee_per_gas, U256::from(4_000_000_000u64));
    }
}
