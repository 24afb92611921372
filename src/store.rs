//! Transaction store: partitions, canonical ordering, cascading removal
//! (spec §4.5).

use std::collections::HashMap;

use crate::error::{WalletError, WalletResult};
use crate::transaction::{Partition, Transaction, TxHash, TxRecord, TxType, TX_UNCONFIRMED};

#[derive(Debug, Clone, Default)]
pub struct TransactionStore {
    records: HashMap<TxHash, TxRecord>,
    confirmed_order: Vec<TxHash>,
    coinbase_order: Vec<TxHash>,
    pending_order: Vec<TxHash>,
}

impl TransactionStore {
    pub fn new() -> TransactionStore {
        TransactionStore::default()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.records.contains_key(hash)
    }

    pub fn get(&self, hash: &TxHash) -> Option<&TxRecord> {
        self.records.get(hash)
    }

    fn order_for(&mut self, partition: Partition) -> &mut Vec<TxHash> {
        match partition {
            Partition::Confirmed => &mut self.confirmed_order,
            Partition::Coinbase => &mut self.coinbase_order,
            Partition::Pending => &mut self.pending_order,
        }
    }

    fn resort(&mut self, partition: Partition) {
        match partition {
            Partition::Confirmed => {
                let records = &self.records;
                self.confirmed_order
                    .sort_by_key(|h| (records[h].height, records[h].arrival_timestamp));
            }
            Partition::Coinbase => {
                let records = &self.records;
                self.coinbase_order
                    .sort_by_key(|h| (records[h].height, records[h].arrival_timestamp));
            }
            Partition::Pending => {
                let records = &self.records;
                self.pending_order.sort_by_key(|h| records[h].arrival_timestamp);
            }
        }
    }

    /// Rejects if the hash already exists; otherwise partitions by
    /// type/height (spec §4.5).
    pub fn register(&mut self, tx: Transaction, height: u32, arrival_timestamp: u64) -> WalletResult<TxHash> {
        let hash = tx.tx_hash();
        if self.records.contains_key(&hash) {
            return Err(WalletError::Duplicate(format!("transaction {}", hash)));
        }
        let partition = TxRecord::partition_for(tx.tx_type, height);
        let record = TxRecord {
            tx,
            height,
            arrival_timestamp,
            origin_partition: partition,
        };
        self.records.insert(hash, record);
        self.order_for(partition).push(hash);
        self.resort(partition);
        log::debug!("transaction registered: {} ({:?})", hash, partition);
        Ok(hash)
    }

    fn remove_from_orders(&mut self, hash: &TxHash, partition: Partition) {
        self.order_for(partition).retain(|h| h != hash);
    }

    /// Removes `hash` and cascades to every transaction whose inputs
    /// reference one of `hash`'s outputs (spec §4.5). Returns the removed
    /// records in removal order (descendants first to keep invariants
    /// intact at every intermediate step is not required here since the
    /// caller applies UTXO deltas after the whole cascade).
    pub fn remove(&mut self, hash: TxHash) -> WalletResult<Vec<TxRecord>> {
        let mut to_remove = vec![hash];
        let mut removed = Vec::new();
        let mut seen = std::collections::HashSet::new();

        while let Some(h) = to_remove.pop() {
            if !seen.insert(h) {
                continue;
            }
            let descendants: Vec<TxHash> = self
                .records
                .values()
                .filter(|r| r.tx.inputs.iter().any(|i| i.outpoint.tx_hash == h))
                .map(|r| r.hash())
                .collect();
            to_remove.extend(descendants);

            if let Some(record) = self.records.remove(&h) {
                self.remove_from_orders(&h, record.origin_partition);
                removed.push(record);
            }
        }

        Ok(removed)
    }

    /// Moves listed pending transactions to confirmed at `height`. A
    /// `height` of 0 means "unconfirm" (spec §4.5).
    pub fn update(&mut self, hashes: &[TxHash], height: u32, timestamp: u64) -> WalletResult<Vec<TxRecord>> {
        let mut updated = Vec::new();
        for hash in hashes {
            let record = self
                .records
                .get(hash)
                .ok_or_else(|| WalletError::NotFound(format!("transaction {}", hash)))?;
            let old_partition = record.origin_partition;
            let new_height = if height == 0 { TX_UNCONFIRMED } else { height };
            let new_partition = TxRecord::partition_for(record.tx.tx_type, new_height);

            self.remove_from_orders(hash, old_partition);
            let record = self.records.get_mut(hash).unwrap();
            record.height = new_height;
            record.arrival_timestamp = timestamp;
            record.origin_partition = new_partition;
            self.order_for(new_partition).push(*hash);
            self.resort(new_partition);
            updated.push(self.records[hash].clone());
        }
        Ok(updated)
    }

    /// Pending transactions, or confirmed ones whose arrival timestamp
    /// predates `height` (interpreted as a cutoff timestamp by the
    /// reorg-handling caller, spec §4.5).
    pub fn unconfirmed_before(&self, height: u64) -> Vec<TxHash> {
        let mut out: Vec<TxHash> = self.pending_order.clone();
        out.extend(
            self.confirmed_order
                .iter()
                .filter(|h| self.records[h].arrival_timestamp < height)
                .copied(),
        );
        out
    }

    /// Confirmed and coinbase transactions interleaved by height, then
    /// pending by arrival (spec §4.5 "canonical ordering").
    pub fn all_transactions(&self) -> Vec<&TxRecord> {
        let mut confirmed_like: Vec<&TxRecord> = self
            .confirmed_order
            .iter()
            .chain(self.coinbase_order.iter())
            .map(|h| &self.records[h])
            .collect();
        confirmed_like.sort_by_key(|r| (r.height, r.arrival_timestamp));

        let pending: Vec<&TxRecord> = self.pending_order.iter().map(|h| &self.records[h]).collect();
        confirmed_like.into_iter().chain(pending).collect()
    }

    pub fn by_type(&self, ty: TxType) -> Vec<&TxRecord> {
        self.all_transactions().into_iter().filter(|r| r.tx.tx_type == ty).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Atomic bulk reload used by [`crate::wallet::Wallet::replace`] (spec
    /// §4.8 `Replace` event). `confirmed` and `coinbase` carry each
    /// transaction's own confirmation height, since a reload must preserve
    /// the canonical `(height, arrival_timestamp)` ordering and coinbase
    /// maturity depends on the real height, not the reload's batch
    /// timestamp. A duplicate hash within the batch aborts the whole
    /// reload rather than being silently dropped.
    pub fn replace(&mut self, confirmed: Vec<(Transaction, u32)>, pending: Vec<Transaction>, coinbase: Vec<(Transaction, u32)>, timestamp: u64) -> WalletResult<()> {
        self.records.clear();
        self.confirmed_order.clear();
        self.pending_order.clear();
        self.coinbase_order.clear();

        for (tx, height) in confirmed {
            self.register(tx, height, timestamp)?;
        }
        for tx in pending {
            self.register(tx, TX_UNCONFIRMED, timestamp)?;
        }
        for (tx, height) in coinbase {
            self.register(tx, height, timestamp)?;
        }
        Ok(())
    }
}
