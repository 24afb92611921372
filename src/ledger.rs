//! Per-asset grouped ledger: isolated UTXO index, cached balance, and
//! input selection (spec §4.6).

use std::collections::HashMap;

use crate::address::{Address, AddressBook};
use crate::asset::AssetId;
use crate::error::{WalletError, WalletResult};
use crate::money::{self, Amount};
use crate::transaction::Outpoint;
use crate::utxo::{Utxo, UtxoSet};

/// Selected inputs plus the change amount left over after covering the
/// target and the converged fee.
#[derive(Debug, Clone)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub fee: Amount,
    pub change: Amount,
}

/// The read-only slice of wallet state a ledger needs to make selection
/// decisions, handed in per call rather than held as a back-reference
/// (spec §9: "re-architect... no back-cycle").
pub struct SelectionContext<'a> {
    pub utxo_set: &'a UtxoSet,
    pub current_height: u32,
    pub coinbase_maturity: u32,
    pub vote_locked: &'a dyn Fn(&Outpoint) -> bool,
}

/// Per-asset slice of the ledger: its own UTXO index, a cached balance
/// invalidated on every delta, and the locked-balance view over
/// immature coinbase and vote-locked outputs.
#[derive(Debug, Clone)]
pub struct GroupedAssetLedger {
    asset: AssetId,
    cached_balance: Option<Amount>,
    cached_locked: Option<Amount>,
}

impl GroupedAssetLedger {
    pub fn new(asset: AssetId) -> GroupedAssetLedger {
        GroupedAssetLedger {
            asset,
            cached_balance: None,
            cached_locked: None,
        }
    }

    pub fn asset(&self) -> AssetId {
        self.asset
    }

    /// Invalidates the cached balance/locked figures; called on every
    /// UTXO delta for this asset.
    pub fn invalidate(&mut self) {
        self.cached_balance = None;
        self.cached_locked = None;
    }

    /// Non-coinbase UTXOs are always mature; coinbase UTXOs need
    /// `current_height - height >= coinbase_maturity` (spec §4.6 step 1).
    fn is_mature_coinbase(utxo: &Utxo, current_height: u32, coinbase_maturity: u32) -> bool {
        !utxo.is_coinbase || current_height.saturating_sub(utxo.height) >= coinbase_maturity
    }

    /// Total value of every own, available UTXO of this asset, recomputed
    /// and cached on first access after invalidation.
    pub fn balance(&mut self, ctx: &SelectionContext<'_>) -> WalletResult<Amount> {
        if let Some(b) = self.cached_balance {
            return Ok(b);
        }
        let total: Amount = ctx
            .utxo_set
            .available_for_asset(&self.asset)
            .map(|u| u.output.amount)
            .sum::<Amount>();
        self.cached_balance = Some(total);
        Ok(total)
    }

    /// Sum of available-but-unspendable value: immature coinbase and
    /// vote-locked outputs.
    pub fn locked_balance(&mut self, ctx: &SelectionContext<'_>) -> WalletResult<Amount> {
        if let Some(l) = self.cached_locked {
            return Ok(l);
        }
        let mut total = Amount::ZERO;
        for utxo in ctx.utxo_set.available_for_asset(&self.asset) {
            let immature = !Self::is_mature_coinbase(utxo, ctx.current_height, ctx.coinbase_maturity);
            let vote_locked = (ctx.vote_locked)(&utxo.outpoint);
            if immature || vote_locked {
                total = total.checked_add(utxo.output.amount)?;
            }
        }
        self.cached_locked = Some(total);
        Ok(total)
    }

    fn spendable_candidates<'a>(
        &self,
        ctx: &'a SelectionContext<'a>,
        from_address: Option<&Address>,
        allow_vote_consume: bool,
    ) -> Vec<&'a Utxo> {
        ctx.utxo_set
            .available_for_asset(&self.asset)
            .filter(|u| !ctx.utxo_set.is_spending(&u.outpoint))
            .filter(|u| Self::is_mature_coinbase(u, ctx.current_height, ctx.coinbase_maturity))
            .filter(|u| allow_vote_consume || !(ctx.vote_locked)(&u.outpoint))
            .filter(|u| from_address.map_or(true, |a| &u.output.address == a))
            .collect()
    }

    /// Largest-first selection with a cleanup swap pass, re-estimating the
    /// fee after each added candidate (spec §4.6).
    ///
    /// `n_outputs` is the number of non-change outputs the caller intends
    /// to emit; the loop accounts for one additional change output until
    /// change is known to collapse into the fee.
    pub fn select(
        &self,
        ctx: &SelectionContext<'_>,
        target: Amount,
        fee_per_kb: u64,
        n_outputs: usize,
        from_address: Option<&Address>,
        allow_vote_consume: bool,
    ) -> WalletResult<Selection> {
        let mut candidates = self.spendable_candidates(ctx, from_address, allow_vote_consume);
        candidates.sort_by(|a, b| b.output.amount.cmp(&a.output.amount));

        let mut selected: Vec<Utxo> = Vec::new();
        let mut fee = Amount::ZERO;
        let mut change = Amount::ZERO;

        loop {
            let size = money::estimate_size(selected.len(), n_outputs + 1);
            let needed_fee = money::estimate_fee(size, fee_per_kb);
            let required = target.checked_add(needed_fee)?;
            let selected_total: Amount = selected.iter().map(|u| u.output.amount).sum();

            if selected_total >= required {
                fee = needed_fee;
                change = selected_total.checked_sub(required)?;
                break;
            }

            let next = candidates
                .get(selected.len())
                .ok_or_else(|| WalletError::InsufficientFunds(required.checked_sub(selected_total).unwrap_or(Amount::ZERO)))?;
            selected.push((*next).clone());
        }

        let overfund = change.checked_sub(money::min_output_amount(fee_per_kb));
        if let Ok(excess) = overfund {
            if excess.sats() > 0 {
                self.try_cleanup_swap(&candidates, &mut selected, target, fee_per_kb, n_outputs, &mut fee, &mut change);
            }
        }

        if change < money::min_output_amount(fee_per_kb) {
            fee = fee.checked_add(change)?;
            change = Amount::ZERO;
        }

        Ok(Selection {
            inputs: selected,
            fee,
            change,
        })
    }

    /// Attempts to swap the largest selected input for the smallest
    /// remaining candidate that still closes the gap, if doing so
    /// reduces change by at least one output-size unit (spec §4.6 step 4).
    fn try_cleanup_swap(
        &self,
        candidates: &[&Utxo],
        selected: &mut Vec<Utxo>,
        target: Amount,
        fee_per_kb: u64,
        n_outputs: usize,
        fee: &mut Amount,
        change: &mut Amount,
    ) {
        if selected.is_empty() {
            return;
        }
        let selected_outpoints: std::collections::HashSet<Outpoint> = selected.iter().map(|u| u.outpoint).collect();
        let (largest_idx, _) = selected
            .iter()
            .enumerate()
            .max_by_key(|(_, u)| u.output.amount)
            .map(|(i, u)| (i, u.clone()))
            .unwrap();

        let mut unselected: Vec<&&Utxo> = candidates.iter().filter(|u| !selected_outpoints.contains(&u.outpoint)).collect();
        unselected.sort_by_key(|u| u.output.amount);

        for candidate in unselected {
            let mut trial: Vec<Utxo> = selected.clone();
            trial.remove(largest_idx);
            trial.push((**candidate).clone());

            let size = money::estimate_size(trial.len(), n_outputs + 1);
            let needed_fee = match money::estimate_fee(size, fee_per_kb).checked_add(target) {
                Ok(req) => req,
                Err(_) => continue,
            };
            let trial_total: Amount = trial.iter().map(|u| u.output.amount).sum();
            if trial_total < needed_fee {
                continue;
            }
            let trial_change = match trial_total.checked_sub(needed_fee) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if change.checked_sub(trial_change).map(|d| d.sats() >= money::OUTPUT_SIZE as u128).unwrap_or(false) {
                *selected = trial;
                *fee = needed_fee.checked_sub(target).unwrap_or(Amount::ZERO);
                *change = trial_change;
                return;
            }
        }
    }

    /// Every own, spendable UTXO of this asset, for a consolidating
    /// transaction into a single fresh receive address (spec §4.6).
    pub fn consolidate_inputs(&self, ctx: &SelectionContext<'_>) -> Vec<Utxo> {
        self.spendable_candidates(ctx, None, true).into_iter().cloned().collect()
    }
}

/// Owns one [`GroupedAssetLedger`] per known asset, lazily creating them
/// on first touch (spec §4.6 "one per asset").
#[derive(Debug, Clone, Default)]
pub struct LedgerGroups {
    groups: HashMap<AssetId, GroupedAssetLedger>,
}

impl LedgerGroups {
    pub fn new() -> LedgerGroups {
        LedgerGroups::default()
    }

    pub fn get_mut(&mut self, asset: AssetId) -> &mut GroupedAssetLedger {
        self.groups.entry(asset).or_insert_with(|| GroupedAssetLedger::new(asset))
    }

    pub fn invalidate(&mut self, asset: &AssetId) {
        if let Some(group) = self.groups.get_mut(asset) {
            group.invalidate();
        }
    }

    pub fn invalidate_all(&mut self) {
        for group in self.groups.values_mut() {
            group.invalidate();
        }
    }

    /// Every asset that has had a ledger materialized so far (spec §4.8
    /// `SetBlockHeight`: recomputes locked balance for each known asset).
    pub fn asset_ids(&self) -> Vec<AssetId> {
        self.groups.keys().copied().collect()
    }
}

/// A synthetic receive-address view used only to validate change logic
/// without pulling in the whole address book in unit tests.
pub fn change_address(book: &mut AddressBook) -> Address {
    book.change_address()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subaccount::Bip32SubAccount;
    use crate::transaction::{Output, Payload, Transaction, TxType};
    use bitcoin::bip32::Xpriv;
    use bitcoin::Network;
    use bitcoin_hashes::{sha256d, Hash};
    use std::sync::Arc;

    fn book() -> AddressBook {
        let seed = [5u8; 32];
        let xpriv = Xpriv::new_master(Network::Testnet, &seed).unwrap();
        let sub = Arc::new(Bip32SubAccount::from_xpriv(xpriv, "m/44'/0'/0'".parse().unwrap()));
        AddressBook::new(sub, 10, 5)
    }

    fn asset_id() -> AssetId {
        sha256d::Hash::from_byte_array([0u8; 32])
    }

    fn fund_typed(set: &mut UtxoSet, book: &mut AddressBook, amount: u128, height: u32, confirmed: bool, asset: AssetId, tx_type: TxType) {
        let addr = book.receive_address();
        let payload = if tx_type == TxType::Coinbase {
            Payload::Coinbase(vec![])
        } else {
            Payload::Normal
        };
        let tx = Transaction {
            version: 0,
            tx_type,
            payload,
            attributes: vec![],
            inputs: vec![],
            outputs: vec![Output {
                amount: Amount::from_sats(amount),
                address: addr,
                asset,
                payload: None,
            }],
            lock_time: 0,
            programs: vec![],
        };
        set.add(&tx, height, confirmed, book);
    }

    fn fund(set: &mut UtxoSet, book: &mut AddressBook, amount: u128, height: u32, confirmed: bool, asset: AssetId) {
        fund_typed(set, book, amount, height, confirmed, asset, TxType::Normal);
    }

    #[test]
    fn selection_accumulates_largest_first_until_target_covered() {
        let asset = asset_id();
        let mut book = book();
        let mut set = UtxoSet::new();
        for amount in [5_000_000u128, 3_000_000, 1_000_000] {
            fund(&mut set, &mut book, amount, 0, true, asset);
        }
        let ledger = GroupedAssetLedger::new(asset);
        let no_lock = |_: &Outpoint| false;
        let ctx = SelectionContext {
            utxo_set: &set,
            current_height: 1000,
            coinbase_maturity: 100,
            vote_locked: &no_lock,
        };
        let selection = ledger.select(&ctx, Amount::from_sats(4_000_000), 10_000, 1, None, false).unwrap();
        assert!(selection.inputs.iter().map(|u| u.output.amount).sum::<Amount>() >= Amount::from_sats(4_000_000));
    }

    #[test]
    fn selection_fails_with_shortfall_when_funds_insufficient() {
        let asset = asset_id();
        let mut book = book();
        let mut set = UtxoSet::new();
        fund(&mut set, &mut book, 1_000, 0, true, asset);
        let ledger = GroupedAssetLedger::new(asset);
        let no_lock = |_: &Outpoint| false;
        let ctx = SelectionContext {
            utxo_set: &set,
            current_height: 1000,
            coinbase_maturity: 100,
            vote_locked: &no_lock,
        };
        let err = ledger.select(&ctx, Amount::from_sats(10_000), 10_000, 1, None, false).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds(_)));
    }

    #[test]
    fn immature_coinbase_is_excluded_unless_old_enough() {
        let asset = asset_id();
        let mut book = book();
        let mut set = UtxoSet::new();
        fund_typed(&mut set, &mut book, 1_000_000, 950, true, asset, TxType::Coinbase);
        let ledger = GroupedAssetLedger::new(asset);
        let no_lock = |_: &Outpoint| false;
        let ctx = SelectionContext {
            utxo_set: &set,
            current_height: 1000,
            coinbase_maturity: 100,
            vote_locked: &no_lock,
        };
        let candidates = ledger.spendable_candidates(&ctx, None, false);
        assert!(candidates.is_empty());
    }

    #[test]
    fn consolidate_inputs_covers_every_own_utxo() {
        let asset = asset_id();
        let mut book = book();
        let mut set = UtxoSet::new();
        for amount in [1_000_000u128, 2_000_000, 3_000_000] {
            fund(&mut set, &mut book, amount, 0, true, asset);
        }
        let ledger = GroupedAssetLedger::new(asset);
        let no_lock = |_: &Outpoint| false;
        let ctx = SelectionContext {
            utxo_set: &set,
            current_height: 1000,
            coinbase_maturity: 100,
            vote_locked: &no_lock,
        };
        assert_eq!(ledger.consolidate_inputs(&ctx).len(), 3);
    }
}
