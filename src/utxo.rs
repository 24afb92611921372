//! UTXO set and spending view (spec §4.3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressBook};
use crate::asset::AssetId;
use crate::transaction::{Output, Outpoint, Transaction, TxType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: Outpoint,
    pub output: Output,
    pub height: u32,
    pub is_coinbase: bool,
}

/// The delta produced by applying one transaction: outpoints that became
/// newly available, and outpoints that left the available set (either
/// spent or moved to `spending`).
#[derive(Debug, Clone, Default)]
pub struct UtxoDelta {
    pub added: Vec<Utxo>,
    pub removed: Vec<Outpoint>,
}

/// `available`/`spending` maps keyed by outpoint (spec §3 InvariantS 1: no
/// outpoint is ever in both at once).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoSet {
    available: HashMap<Outpoint, Utxo>,
    spending: HashMap<Outpoint, Utxo>,
}

impl UtxoSet {
    pub fn new() -> UtxoSet {
        UtxoSet::default()
    }

    pub fn get(&self, outpoint: &Outpoint) -> Option<&Utxo> {
        self.available.get(outpoint)
    }

    pub fn is_spending(&self, outpoint: &Outpoint) -> bool {
        self.spending.contains_key(outpoint)
    }

    pub fn available_for_asset(&self, asset: &AssetId) -> impl Iterator<Item = &Utxo> {
        self.available.values().filter(move |u| &u.output.asset == asset)
    }

    pub fn available_at_address(&self, address: &Address) -> Vec<&Utxo> {
        self.available.values().filter(|u| &u.output.address == address).collect()
    }

    pub fn all_available(&self) -> impl Iterator<Item = &Utxo> {
        self.available.values()
    }

    /// Applies `tx`'s effect on this set (spec §4.3 step-by-step delta).
    /// `confirmed` controls whether spent inputs are dropped outright
    /// (confirmed) or parked in `spending` (pending).
    pub fn add(&mut self, tx: &Transaction, height: u32, confirmed: bool, book: &AddressBook) -> UtxoDelta {
        let mut delta = UtxoDelta::default();

        for input in &tx.inputs {
            if let Some(utxo) = self.available.remove(&input.outpoint) {
                delta.removed.push(input.outpoint);
                if !confirmed {
                    self.spending.insert(input.outpoint, utxo);
                }
            }
        }

        let tx_hash = tx.tx_hash();
        let is_coinbase = tx.tx_type == TxType::Coinbase;
        for (idx, output) in tx.outputs.iter().enumerate() {
            if book.contains(&output.address) {
                let outpoint = Outpoint {
                    tx_hash,
                    index: idx as u16,
                };
                let utxo = Utxo {
                    outpoint,
                    output: output.clone(),
                    height,
                    is_coinbase,
                };
                self.available.insert(outpoint, utxo.clone());
                delta.added.push(utxo);
            }
        }

        delta
    }

    /// Inverse of [`UtxoSet::add`] (spec §4.3): outputs of `tx` are
    /// removed, inputs it consumed are restored iff their producing
    /// transaction is still known to the caller (checked via
    /// `restore_input`, which looks the outpoint's output back up in the
    /// store).
    pub fn remove<F>(&mut self, tx: &Transaction, mut restore_input: F) -> UtxoDelta
    where
        F: FnMut(&Outpoint) -> Option<(Output, bool)>,
    {
        let mut delta = UtxoDelta::default();
        let tx_hash = tx.tx_hash();

        for (idx, _) in tx.outputs.iter().enumerate() {
            let outpoint = Outpoint {
                tx_hash,
                index: idx as u16,
            };
            if self.available.remove(&outpoint).is_some() {
                delta.removed.push(outpoint);
            }
            self.spending.remove(&outpoint);
        }

        for input in &tx.inputs {
            self.spending.remove(&input.outpoint);
            if let Some((output, is_coinbase)) = restore_input(&input.outpoint) {
                let utxo = Utxo {
                    outpoint: input.outpoint,
                    output,
                    height: u32::MAX,
                    is_coinbase,
                };
                self.available.insert(input.outpoint, utxo.clone());
                delta.added.push(utxo);
            }
        }

        delta
    }

    /// Moves a pending spend's inputs from `spending` to permanently
    /// removed, called once the spending transaction confirms.
    pub fn finalize_spend(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            self.spending.remove(&input.outpoint);
        }
    }

    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetId;
    use crate::money::Amount;
    use crate::subaccount::Bip32SubAccount;
    use crate::transaction::{AttributeKind, Input, Payload, Program, Transaction, TxType};
    use bitcoin::bip32::Xpriv;
    use bitcoin::Network;
    use bitcoin_hashes::Hash;
    use std::sync::Arc;

    fn book() -> AddressBook {
        let seed = [3u8; 32];
        let xpriv = Xpriv::new_master(Network::Testnet, &seed).unwrap();
        let sub = Arc::new(Bip32SubAccount::from_xpriv(xpriv, "m/44'/0'/0'".parse().unwrap()));
        AddressBook::new(sub, 10, 5)
    }

    fn funding_tx(to: Address) -> Transaction {
        Transaction {
            version: 0,
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            attributes: vec![],
            inputs: vec![],
            outputs: vec![Output {
                amount: Amount::from_sats(1000),
                address: to,
                asset: AssetId::from_byte_array([0u8; 32]),
                payload: None,
            }],
            lock_time: 0,
            programs: vec![],
        }
    }

    #[test]
    fn add_then_remove_restores_empty_set() {
        let mut book = book();
        let addr = book.receive_address();
        let mut set = UtxoSet::new();
        let tx = funding_tx(addr);

        let delta = set.add(&tx, 10, true, &book);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(set.len(), 1);

        let delta = set.remove(&tx, |_| None);
        assert_eq!(delta.removed.len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn pending_spend_parks_input_in_spending() {
        let mut book = book();
        let addr = book.receive_address();
        let mut set = UtxoSet::new();
        let funding = funding_tx(addr);
        set.add(&funding, 10, true, &book);

        let outpoint = Outpoint {
            tx_hash: funding.tx_hash(),
            index: 0,
        };
        let spend = Transaction {
            version: 0,
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            attributes: vec![crate::transaction::Attribute {
                kind: AttributeKind::Memo,
                data: vec![],
            }],
            inputs: vec![Input { outpoint, sequence: 0 }],
            outputs: vec![],
            lock_time: 0,
            programs: vec![Program {
                code: vec![],
                parameter: vec![],
            }],
        };
        set.add(&spend, crate::transaction::TX_UNCONFIRMED, false, &book);
        assert!(set.is_spending(&outpoint));
        assert!(set.get(&outpoint).is_none());
    }
}
