//! Persistence collaborator contract (spec §6) and an in-memory reference
//! implementation used by tests and as a documented example of the
//! contract's idempotence requirements.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::WalletResult;
use crate::transaction::{Partition, Transaction, TxHash};

/// The only persistence interface the wallet core requires. Every mutating
/// method must be idempotent: the core may call `save_txn`/`update_txn` more
/// than once for the same transaction (e.g. after a retried ingress event)
/// and the stored state must converge to the same result either way.
pub trait Database: Send + Sync {
    fn load_txn(&self, chain_id: &str, partition: Partition) -> WalletResult<Vec<Transaction>>;
    fn load_txn_after(&self, chain_id: &str, height: u32) -> WalletResult<Vec<Transaction>>;
    fn load_txn_by_hash(&self, chain_id: &str, hash: &TxHash) -> WalletResult<Option<Transaction>>;
    fn contains_txn(&self, chain_id: &str, hash: &TxHash) -> WalletResult<bool>;
    fn load_utxo_txn(&self, chain_id: &str) -> WalletResult<Vec<Transaction>>;

    fn save_txn(&self, chain_id: &str, tx: &Transaction, height: u32, arrival_timestamp: u64) -> WalletResult<()>;
    fn update_txn(&self, chain_id: &str, hash: &TxHash, height: u32) -> WalletResult<()>;
    fn delete_txn(&self, chain_id: &str, hash: &TxHash) -> WalletResult<()>;
    fn save_used_address(&self, chain_id: &str, address: &str) -> WalletResult<()>;
}

#[derive(Debug, Clone)]
struct StoredTx {
    tx: Transaction,
    height: u32,
    arrival_timestamp: u64,
}

/// In-memory [`Database`] used by `tests/scenarios.rs` and unit tests that
/// need a collaborator without standing up real storage. Not exported as a
/// production persistence layer.
#[derive(Default)]
pub struct MemoryDatabase {
    txns: Mutex<HashMap<String, HashMap<TxHash, StoredTx>>>,
    used_addresses: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryDatabase {
    pub fn new() -> MemoryDatabase {
        MemoryDatabase::default()
    }
}

impl Database for MemoryDatabase {
    fn load_txn(&self, chain_id: &str, partition: Partition) -> WalletResult<Vec<Transaction>> {
        let txns = self.txns.lock().unwrap();
        let out = txns
            .get(chain_id)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|stored| {
                crate::transaction::TxRecord::partition_for(stored.tx.tx_type, stored.height) == partition
            })
            .map(|stored| stored.tx.clone())
            .collect();
        Ok(out)
    }

    fn load_txn_after(&self, chain_id: &str, height: u32) -> WalletResult<Vec<Transaction>> {
        let txns = self.txns.lock().unwrap();
        let out = txns
            .get(chain_id)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|stored| stored.height >= height)
            .map(|stored| stored.tx.clone())
            .collect();
        Ok(out)
    }

    fn load_txn_by_hash(&self, chain_id: &str, hash: &TxHash) -> WalletResult<Option<Transaction>> {
        let txns = self.txns.lock().unwrap();
        Ok(txns.get(chain_id).and_then(|m| m.get(hash)).map(|s| s.tx.clone()))
    }

    fn contains_txn(&self, chain_id: &str, hash: &TxHash) -> WalletResult<bool> {
        let txns = self.txns.lock().unwrap();
        Ok(txns.get(chain_id).map(|m| m.contains_key(hash)).unwrap_or(false))
    }

    fn load_utxo_txn(&self, chain_id: &str) -> WalletResult<Vec<Transaction>> {
        let txns = self.txns.lock().unwrap();
        let out = txns.get(chain_id).into_iter().flat_map(|m| m.values()).map(|s| s.tx.clone()).collect();
        Ok(out)
    }

    fn save_txn(&self, chain_id: &str, tx: &Transaction, height: u32, arrival_timestamp: u64) -> WalletResult<()> {
        let mut txns = self.txns.lock().unwrap();
        txns.entry(chain_id.to_string()).or_default().insert(
            tx.tx_hash(),
            StoredTx { tx: tx.clone(), height, arrival_timestamp },
        );
        Ok(())
    }

    fn update_txn(&self, chain_id: &str, hash: &TxHash, height: u32) -> WalletResult<()> {
        let mut txns = self.txns.lock().unwrap();
        if let Some(stored) = txns.get_mut(chain_id).and_then(|m| m.get_mut(hash)) {
            stored.height = height;
        }
        Ok(())
    }

    fn delete_txn(&self, chain_id: &str, hash: &TxHash) -> WalletResult<()> {
        let mut txns = self.txns.lock().unwrap();
        if let Some(m) = txns.get_mut(chain_id) {
            m.remove(hash);
        }
        Ok(())
    }

    fn save_used_address(&self, chain_id: &str, address: &str) -> WalletResult<()> {
        let mut used = self.used_addresses.lock().unwrap();
        let list = used.entry(chain_id.to_string()).or_default();
        if !list.iter().any(|a| a == address) {
            list.push(address.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Payload, TxType};

    fn simple_tx() -> Transaction {
        Transaction {
            version: 0,
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            attributes: vec![],
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
            programs: vec![],
        }
    }

    #[test]
    fn save_then_delete_is_idempotent() {
        let db = MemoryDatabase::new();
        let tx = simple_tx();
        db.save_txn("main", &tx, 10, 1).unwrap();
        db.save_txn("main", &tx, 10, 1).unwrap();
        assert!(db.contains_txn("main", &tx.tx_hash()).unwrap());

        db.delete_txn("main", &tx.tx_hash()).unwrap();
        db.delete_txn("main", &tx.tx_hash()).unwrap();
        assert!(!db.contains_txn("main", &tx.tx_hash()).unwrap());
    }

    #[test]
    fn save_used_address_deduplicates() {
        let db = MemoryDatabase::new();
        db.save_used_address("main", "addr1").unwrap();
        db.save_used_address("main", "addr1").unwrap();
        let used = db.used_addresses.lock().unwrap();
        assert_eq!(used.get("main").unwrap().len(), 1);
    }
}
