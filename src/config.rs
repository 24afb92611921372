//! Wallet configuration (SPEC_FULL.md §A).

use serde::{Deserialize, Serialize};

use crate::money::DEFAULT_FEE_PER_KB;

/// Minimum confirmations before a coinbase output may be spent.
pub const DEFAULT_COINBASE_MATURITY: u32 = 100;
pub const DEFAULT_EXTERNAL_GAP_LIMIT: u32 = 10;
pub const DEFAULT_INTERNAL_GAP_LIMIT: u32 = 5;

/// Everything a [`crate::wallet::Wallet`] needs besides its key provider and
/// persistence collaborator, grown from the teacher crate's bare
/// `{ network }` into the knobs the rest of the spec depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Identifies the sidechain this wallet tracks (e.g. `"did"`, `"eth"`).
    pub chain_id: String,
    pub fee_per_kb: u64,
    pub external_gap_limit: u32,
    pub internal_gap_limit: u32,
    pub coinbase_maturity: u32,
}

impl Default for WalletConfig {
    fn default() -> WalletConfig {
        WalletConfig {
            chain_id: "main".to_string(),
            fee_per_kb: DEFAULT_FEE_PER_KB,
            external_gap_limit: DEFAULT_EXTERNAL_GAP_LIMIT,
            internal_gap_limit: DEFAULT_INTERNAL_GAP_LIMIT,
            coinbase_maturity: DEFAULT_COINBASE_MATURITY,
        }
    }
}

impl WalletConfig {
    pub fn new(chain_id: impl Into<String>) -> WalletConfig {
        WalletConfig {
            chain_id: chain_id.into(),
            ..WalletConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = WalletConfig::default();
        assert_eq!(cfg.fee_per_kb, 10_000);
        assert_eq!(cfg.external_gap_limit, 10);
        assert_eq!(cfg.internal_gap_limit, 5);
        assert_eq!(cfg.coinbase_maturity, 100);
    }
}
