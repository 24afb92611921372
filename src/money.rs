//! Fixed-point integer money (spec §4.1).
//!
//! Amounts are exact integers in the smallest subdivision ("sats"); no
//! floating point ever enters a balance or a fee calculation.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use crate::error::{WalletError, WalletResult};

/// Standard fee rate, sats per kilobyte.
pub const DEFAULT_FEE_PER_KB: u64 = 10_000;
/// bitcoind 0.12-era default min-relay fee.
pub const MIN_FEE_PER_KB: u64 = 1_000;
/// Slightly higher than a 10,000-bit fee on a 191 byte tx.
pub const MAX_FEE_PER_KB: u64 = (MIN_FEE_PER_KB * 1_000_100 + 190) / 191;

/// Estimated serialized size of a typical output.
pub const OUTPUT_SIZE: u64 = 34;
/// Estimated serialized size of a typical compact-pubkey input.
pub const INPUT_SIZE: u64 = 148;
/// No transaction may exceed this size.
pub const TX_MAX_SIZE: usize = 100_000;

/// An unsigned, overflow-checked monetary amount in sats.
///
/// Represented as `u128` rather than a bignum: no sidechain asset supply
/// comes close to exhausting it, and none of the reference crates reach
/// for arbitrary precision for a currency amount (see SPEC_FULL.md §C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_sats(sats: u128) -> Amount {
        Amount(sats)
    }

    pub fn sats(self) -> u128 {
        self.0
    }

    pub fn checked_add(self, other: Amount) -> WalletResult<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or(WalletError::ArithmeticOverflow)
    }

    /// Saturating-detect subtraction: fails rather than wrapping.
    pub fn checked_sub(self, other: Amount) -> WalletResult<Amount> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or(WalletError::InsufficientFunds(other.saturating_sub(self)))
    }

    fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn checked_mul_u64(self, factor: u64) -> WalletResult<Amount> {
        self.0
            .checked_mul(factor as u128)
            .map(Amount)
            .ok_or(WalletError::ArithmeticOverflow)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |a, b| a + b)
    }
}

/// `ceil(size_bytes * fee_per_kb / 1000)`.
pub fn estimate_fee(size_bytes: usize, fee_per_kb: u64) -> Amount {
    let size = size_bytes as u128;
    let rate = fee_per_kb as u128;
    Amount((size * rate + 999) / 1000)
}

/// Estimated serialized size for `n_inputs`/`n_outputs`, used to iterate fee
/// convergence during selection (spec §4.6).
pub fn estimate_size(n_inputs: usize, n_outputs: usize) -> usize {
    (n_inputs as u64 * INPUT_SIZE + n_outputs as u64 * OUTPUT_SIZE) as usize
}

/// `fee_per_kb * 3 * (OUTPUT_SIZE + INPUT_SIZE) / 1000` — any output below
/// this in a non-special transaction type is dust.
pub fn min_output_amount(fee_per_kb: u64) -> Amount {
    let rate = fee_per_kb as u128;
    Amount(rate * 3 * (OUTPUT_SIZE + INPUT_SIZE) as u128 / 1000)
}

pub fn validate_fee_per_kb(fee_per_kb: u64) -> WalletResult<()> {
    if fee_per_kb == 0 {
        return Err(WalletError::InvalidArgument("fee_per_kb must not be zero".into()));
    }
    if fee_per_kb < MIN_FEE_PER_KB || fee_per_kb > MAX_FEE_PER_KB {
        return Err(WalletError::InvalidArgument(format!(
            "fee_per_kb {} out of range [{}, {}]",
            fee_per_kb, MIN_FEE_PER_KB, MAX_FEE_PER_KB
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_rounds_up() {
        assert_eq!(estimate_fee(1, 10_000), Amount(10));
        assert_eq!(estimate_fee(3, 1), Amount(1));
        assert_eq!(estimate_fee(0, 10_000), Amount(0));
    }

    #[test]
    fn min_output_amount_default_rate() {
        // 10000 * 3 * 182 / 1000 = 5460
        assert_eq!(min_output_amount(DEFAULT_FEE_PER_KB), Amount(5460));
    }

    #[test]
    fn overflow_is_detected() {
        let max = Amount(u128::MAX);
        assert!(matches!(max.checked_add(Amount(1)), Err(WalletError::ArithmeticOverflow)));
    }

    #[test]
    fn checked_sub_reports_shortfall() {
        let err = Amount(100).checked_sub(Amount(150)).unwrap_err();
        match err {
            WalletError::InsufficientFunds(shortfall) => assert_eq!(shortfall, Amount(50)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn fee_per_kb_bounds() {
        assert!(validate_fee_per_kb(0).is_err());
        assert!(validate_fee_per_kb(MIN_FEE_PER_KB).is_ok());
        assert!(validate_fee_per_kb(MIN_FEE_PER_KB - 1).is_err());
        assert!(validate_fee_per_kb(MAX_FEE_PER_KB).is_ok());
        assert!(validate_fee_per_kb(MAX_FEE_PER_KB + 1).is_err());
    }
}
