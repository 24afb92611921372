//! Error taxonomy for the wallet core (spec §7).

use std::result;

use crate::money::Amount;

/// Every public operation on [`crate::wallet::Wallet`] returns this error
/// type or succeeds. `InvariantViolated` is non-recoverable: callers should
/// treat it as a signal to abort the wallet instance, not retry (see
/// [`crate::wallet::Wallet::is_poisoned`]).
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("payload does not match transaction type or fails self-check: {0}")]
    InvalidPayload(String),

    #[error("insufficient funds, short by {0}")]
    InsufficientFunds(Amount),

    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("output amount {amount} is below the dust threshold {minimum}")]
    DustOutput { amount: Amount, minimum: Amount },

    #[error("transaction size {size} exceeds the maximum of {max}")]
    TxTooLarge { size: usize, max: usize },

    #[error("no key available for a required input")]
    MissingKey,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("date is not a valid RFC3339 timestamp: {0}")]
    InvalidDate(String),

    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    #[error("internal invariant violated: {0}")]
    InvariantViolated(&'static str),

    #[error("operation refused after shutdown")]
    Shutdown,

    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error(transparent)]
    Secp256k1(#[from] secp256k1::Error),
}

pub type WalletResult<T> = result::Result<T, WalletError>;
