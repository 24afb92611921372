//! Wallet core: the top-level coordinator (spec §4.8).
//!
//! Owns every piece of in-memory state behind one coarse lock and drives the
//! five ingress events (`RegisterTx`, `UpdateTxs`, `RemoveTx`,
//! `SetBlockHeight`, `Replace`) that the rest of the crate only reacts to.
//! Listener notifications are always built up while the lock is held and
//! fired only after it is released (spec §5).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::secp256k1::PublicKey;
use chrono::Utc;

use crate::address::{Address, AddressBook};
use crate::asset::{Asset, AssetId, AssetRegistry};
use crate::builder::{self, TxRequest};
use crate::config::WalletConfig;
use crate::database::Database;
use crate::error::{WalletError, WalletResult};
use crate::identity::{self, DIDDescriptor, DIDInfo};
use crate::ledger::{LedgerGroups, SelectionContext};
use crate::listener::{Listener, ListenerHandle, WalletEvent};
use crate::money::Amount;
use crate::store::TransactionStore;
use crate::subaccount::{Signature, SubAccount};
use crate::transaction::{
    Outpoint, Output, Payload, RetrievePayload, Transaction, TxHash, TxType, VoteContent, TX_UNCONFIRMED,
};
use crate::utxo::{Utxo, UtxoDelta, UtxoSet};

/// Everything the wallet owns behind its single lock (spec §5: "a single
/// coarse per-wallet lock").
struct WalletState {
    assets: AssetRegistry,
    utxos: UtxoSet,
    book: AddressBook,
    store: TransactionStore,
    ledgers: LedgerGroups,
    /// Outpoints of this wallet's own unspent `Vote` outputs (SPEC_FULL.md
    /// supplement: the spec only says selection may respect a vote lock, not
    /// how the wallet tracks which outpoints are locked). Populated when a
    /// `Vote` transaction's own outputs are added, cleared when those
    /// outpoints are later spent or restored.
    vote_locked: HashSet<Outpoint>,
    current_height: u32,
}

/// Looks a spent input's original output back up in the store, for
/// [`UtxoSet::remove`]'s `restore_input` callback during cascading removal.
fn lookup_output(store: &TransactionStore, outpoint: &Outpoint) -> Option<(Output, bool)> {
    let record = store.get(&outpoint.tx_hash)?;
    let output = record.tx.outputs.get(outpoint.index as usize)?.clone();
    let is_coinbase = record.tx.tx_type == TxType::Coinbase;
    Some((output, is_coinbase))
}

/// A single wallet's in-memory ledger, address book, and transaction store,
/// driven by chain-sync events and exposing query/build/sign operations over
/// the result (spec §4.8).
pub struct Wallet {
    config: WalletConfig,
    sub_account: Arc<dyn SubAccount>,
    db: Arc<dyn Database>,
    listener: Mutex<ListenerHandle>,
    state: Mutex<WalletState>,
    poisoned: AtomicBool,
    shutdown: AtomicBool,
}

impl Wallet {
    pub fn new(config: WalletConfig, sub_account: Arc<dyn SubAccount>, db: Arc<dyn Database>, native_asset: Asset) -> Wallet {
        let book = AddressBook::new(sub_account.clone(), config.external_gap_limit, config.internal_gap_limit);
        let state = WalletState {
            assets: AssetRegistry::new(native_asset),
            utxos: UtxoSet::new(),
            book,
            store: TransactionStore::new(),
            ledgers: LedgerGroups::new(),
            vote_locked: HashSet::new(),
            current_height: 0,
        };
        Wallet {
            config,
            sub_account,
            db,
            listener: Mutex::new(ListenerHandle::none()),
            state: Mutex::new(state),
            poisoned: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn set_listener(&self, listener: &Arc<dyn Listener>) {
        *self.listener.lock().unwrap() = ListenerHandle::new(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener.lock().unwrap() = ListenerHandle::none();
    }

    /// True once an `InvariantViolated` error has surfaced from some path
    /// (spec §7): every other public method then refuses to run.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn guard_active(&self) -> WalletResult<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(WalletError::InvariantViolated("wallet instance aborted by a prior invariant violation"));
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(WalletError::Shutdown);
        }
        Ok(())
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    fn notify(&self, events: Vec<WalletEvent>) {
        self.listener.lock().unwrap().notify(events);
    }

    /// Poisons the wallet if `result` carries an `InvariantViolated` error,
    /// then passes it through unchanged.
    fn track_invariant<T>(&self, result: WalletResult<T>) -> WalletResult<T> {
        if let Err(WalletError::InvariantViolated(_)) = &result {
            self.poison();
        }
        result
    }

    /// Runs one ingress event under the lock, poisoning on
    /// `InvariantViolated` before the error reaches the caller.
    fn run_mutation<F>(&self, f: F) -> WalletResult<Vec<WalletEvent>>
    where
        F: FnOnce(&mut WalletState) -> WalletResult<Vec<WalletEvent>>,
    {
        self.guard_active()?;
        let mut state = self.state.lock().unwrap();
        match f(&mut *state) {
            Ok(events) => Ok(events),
            Err(WalletError::InvariantViolated(msg)) => {
                drop(state);
                self.poison();
                Err(WalletError::InvariantViolated(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn balance_locked(&self, state: &mut WalletState, asset: AssetId) -> WalletResult<(Amount, Amount)> {
        state.assets.get(&asset)?;
        let WalletState { utxos, ledgers, current_height, vote_locked, .. } = state;
        let vl = |op: &Outpoint| vote_locked.contains(op);
        let ctx = SelectionContext {
            utxo_set: &*utxos,
            current_height: *current_height,
            coinbase_maturity: self.config.coinbase_maturity,
            vote_locked: &vl,
        };
        let ledger = ledgers.get_mut(asset);
        let balance = ledger.balance(&ctx)?;
        let locked = ledger.locked_balance(&ctx)?;
        Ok((balance, locked))
    }

    // ---- Query surface (spec §6) ----

    pub fn balance(&self, asset: AssetId) -> WalletResult<Amount> {
        self.guard_active()?;
        let mut state = self.state.lock().unwrap();
        self.balance_locked(&mut *state, asset).map(|(balance, _)| balance)
    }

    pub fn balance_info(&self, asset: AssetId) -> WalletResult<(Amount, Amount)> {
        self.guard_active()?;
        let mut state = self.state.lock().unwrap();
        self.balance_locked(&mut *state, asset)
    }

    pub fn receive_address(&self) -> Address {
        let mut state = self.state.lock().unwrap();
        state.book.receive_address()
    }

    pub fn all_addresses(&self, start: u32, count: u32, internal: bool) -> Vec<Address> {
        let state = self.state.lock().unwrap();
        state.book.all_addresses(start, count, internal)
    }

    pub fn all_utxo(&self, address: &Address) -> Vec<Utxo> {
        let state = self.state.lock().unwrap();
        state.utxos.available_at_address(address).into_iter().cloned().collect()
    }

    pub fn all_assets(&self) -> Vec<Asset> {
        let state = self.state.lock().unwrap();
        state.assets.list().into_iter().cloned().collect()
    }

    pub fn asset(&self, id: AssetId) -> WalletResult<Asset> {
        let state = self.state.lock().unwrap();
        state.assets.get(&id).map(|a| a.clone())
    }

    pub fn native_asset_id(&self) -> AssetId {
        let state = self.state.lock().unwrap();
        state.assets.native_asset_id()
    }

    // ---- Build surface (spec §4.7) ----

    #[allow(clippy::too_many_arguments)]
    pub fn create_transaction(
        &self,
        asset: AssetId,
        tx_type: TxType,
        payload: Payload,
        from_address: Option<Address>,
        outputs: Vec<(Address, Amount)>,
        memo: Option<&str>,
        max: bool,
    ) -> WalletResult<Transaction> {
        self.guard_active()?;
        let mut state = self.state.lock().unwrap();
        state.assets.get(&asset)?;
        let WalletState { utxos, book, ledgers, current_height, vote_locked, .. } = &mut *state;
        let vl = |op: &Outpoint| vote_locked.contains(op);
        let ctx = SelectionContext {
            utxo_set: &*utxos,
            current_height: *current_height,
            coinbase_maturity: self.config.coinbase_maturity,
            vote_locked: &vl,
        };
        let ledger = &*ledgers.get_mut(asset);
        let request = TxRequest {
            tx_type,
            payload,
            asset,
            from_address: from_address.as_ref(),
            outputs,
            memo,
            max,
        };
        let result = builder::create_tx(ledger, &ctx, book, self.config.fee_per_kb, request);
        self.track_invariant(result)
    }

    pub fn consolidate(&self, asset: AssetId, memo: Option<&str>) -> WalletResult<Transaction> {
        let destination = self.receive_address();
        self.create_transaction(asset, TxType::Normal, Payload::Normal, None, vec![(destination, Amount::ZERO)], memo, true)
    }

    /// Votes `content`'s candidates; a vote carries no separate spend amount,
    /// so the target is the sum of the candidates' amounts (SPEC_FULL.md
    /// §C), with `max` still able to consolidate everything into the vote
    /// output.
    pub fn vote(&self, content: VoteContent, memo: Option<&str>, max: bool) -> WalletResult<Transaction> {
        let destination = {
            let mut state = self.state.lock().unwrap();
            state.book.change_address()
        };
        let native = self.native_asset_id();
        let amount: Amount = content.candidates.iter().map(|(_, a)| *a).sum();
        self.create_transaction(native, TxType::Vote, Payload::Vote(vec![content]), None, vec![(destination, amount)], memo, max)
    }

    pub fn create_retrieve_transaction(
        &self,
        main_chain_tx_hash: TxHash,
        outputs: Vec<(Address, Amount)>,
        memo: Option<&str>,
        max: bool,
    ) -> WalletResult<Transaction> {
        let native = self.native_asset_id();
        let payload = Payload::Retrieve(RetrievePayload { main_chain_tx_hash });
        self.create_transaction(native, TxType::Retrieve, payload, None, outputs, memo, max)
    }

    /// Unlike ordinary transactions, a `did` transaction's proof is computed
    /// at build time (spec §4.9 steps 7-9), so this takes `password` directly
    /// rather than deferring to `sign_transaction`.
    pub fn create_did_transaction(&self, descriptor: DIDDescriptor, memo: Option<&str>, password: &str) -> WalletResult<Transaction> {
        self.guard_active()?;
        let (did_info, id_address) = identity::build_did_info(&descriptor, Utc::now(), self.sub_account.as_ref(), password)?;
        {
            let mut state = self.state.lock().unwrap();
            state.book.remember_did(id_address);
        }
        let native = self.native_asset_id();
        self.create_transaction(native, TxType::Did, Payload::Did(did_info), None, vec![(id_address, Amount::ZERO)], memo, false)
    }

    // ---- Sign surface (spec §4.7) ----

    pub fn sign_transaction(&self, tx: &Transaction, password: &str) -> WalletResult<Transaction> {
        self.guard_active()?;
        let state = self.state.lock().unwrap();
        let result = builder::sign(tx, &state.utxos, &state.book, self.sub_account.as_ref(), password);
        self.track_invariant(result)
    }

    pub fn sign_with_did(&self, did: &Address, msg: &[u8], password: &str) -> WalletResult<String> {
        self.guard_active()?;
        let Signature(bytes) = self.sub_account.sign_with_did(did, msg, password)?;
        Ok(BASE64.encode(bytes))
    }

    pub fn sign_digest_with_did(&self, did: &Address, digest: &[u8; 32], password: &str) -> WalletResult<Signature> {
        self.guard_active()?;
        self.sub_account.sign_digest_with_did(did, digest, password)
    }

    pub fn verify_signature(&self, pubkey: &PublicKey, msg: &[u8], signature: &[u8]) -> bool {
        crate::subaccount::verify_signature(pubkey, msg, signature)
    }

    // ---- Mutate-from-chain surface: the five ingress events (spec §4.8) ----

    pub fn register_transaction(&self, tx: Transaction, height: u32, arrival_timestamp: u64) -> WalletResult<()> {
        let events = self.run_mutation(|state| self.register_locked(state, tx, height, arrival_timestamp))?;
        self.notify(events);
        Ok(())
    }

    fn register_locked(&self, state: &mut WalletState, tx: Transaction, height: u32, arrival_timestamp: u64) -> WalletResult<Vec<WalletEvent>> {
        let mut events = Vec::new();

        if let Payload::RegisterAsset(ref reg) = tx.payload {
            state.assets.register(reg.asset.clone())?;
            events.push(WalletEvent::AssetRegistered(reg.asset.clone()));
        }

        let mut touched_assets: Vec<AssetId> = Vec::new();
        for input in &tx.inputs {
            if let Some(utxo) = state.utxos.get(&input.outpoint) {
                if !touched_assets.contains(&utxo.output.asset) {
                    touched_assets.push(utxo.output.asset);
                }
            }
        }

        let hash = state.store.register(tx.clone(), height, arrival_timestamp)?;
        self.db.save_txn(&self.config.chain_id, &tx, height, arrival_timestamp)?;
        events.push(WalletEvent::TxAdded(state.store.get(&hash).expect("just registered").clone()));

        let confirmed = height < TX_UNCONFIRMED;
        let delta = {
            let WalletState { utxos, book, .. } = &mut *state;
            utxos.add(&tx, height, confirmed, book)
        };

        if tx.tx_type == TxType::Vote {
            for utxo in &delta.added {
                state.vote_locked.insert(utxo.outpoint);
            }
        }
        for outpoint in &delta.removed {
            state.vote_locked.remove(outpoint);
        }

        for utxo in &delta.added {
            if !touched_assets.contains(&utxo.output.asset) {
                touched_assets.push(utxo.output.asset);
            }
            if !state.book.is_used(&utxo.output.address) {
                state.book.mark_used(utxo.output.address);
                self.db.save_used_address(&self.config.chain_id, &utxo.output.address.to_string())?;
                events.push(WalletEvent::UsedAddressAdded(utxo.output.address));
            }
        }

        if !delta.added.is_empty() || !delta.removed.is_empty() {
            events.push(WalletEvent::UtxoUpdated { delta, replace: false });
        }

        for asset in touched_assets {
            state.ledgers.invalidate(&asset);
            let (balance, locked) = self.balance_locked(&mut *state, asset)?;
            events.push(WalletEvent::BalanceChanged { asset, balance, locked });
        }

        Ok(events)
    }

    pub fn update_transactions(&self, hashes: &[TxHash], height: u32, timestamp: u64) -> WalletResult<()> {
        let events = self.run_mutation(|state| self.update_locked(state, hashes, height, timestamp))?;
        self.notify(events);
        Ok(())
    }

    fn update_locked(&self, state: &mut WalletState, hashes: &[TxHash], height: u32, timestamp: u64) -> WalletResult<Vec<WalletEvent>> {
        let updated = state.store.update(hashes, height, timestamp)?;

        let mut touched_assets: Vec<AssetId> = Vec::new();
        for record in &updated {
            self.db.update_txn(&self.config.chain_id, &record.hash(), record.height)?;
            if record.is_confirmed() {
                state.utxos.finalize_spend(&record.tx);
            }
            for output in &record.tx.outputs {
                if !touched_assets.contains(&output.asset) {
                    touched_assets.push(output.asset);
                }
            }
        }

        let mut events = vec![WalletEvent::TxUpdated(updated)];
        for asset in touched_assets {
            state.ledgers.invalidate(&asset);
            let (balance, locked) = self.balance_locked(&mut *state, asset)?;
            events.push(WalletEvent::BalanceChanged { asset, balance, locked });
        }
        Ok(events)
    }

    pub fn remove_transaction(&self, hash: TxHash) -> WalletResult<()> {
        let events = self.run_mutation(|state| self.remove_locked(state, hash))?;
        self.notify(events);
        Ok(())
    }

    fn remove_locked(&self, state: &mut WalletState, hash: TxHash) -> WalletResult<Vec<WalletEvent>> {
        let removed_records = state.store.remove(hash)?;

        let mut events = Vec::new();
        let mut touched_assets: Vec<AssetId> = Vec::new();
        let mut combined = UtxoDelta::default();

        for record in &removed_records {
            self.db.delete_txn(&self.config.chain_id, &record.hash())?;
            for output in &record.tx.outputs {
                if !touched_assets.contains(&output.asset) {
                    touched_assets.push(output.asset);
                }
            }

            let delta = {
                let WalletState { store, utxos, .. } = &mut *state;
                utxos.remove(&record.tx, |outpoint| lookup_output(&*store, outpoint))
            };
            for outpoint in &delta.removed {
                state.vote_locked.remove(outpoint);
            }
            for utxo in &delta.added {
                if !touched_assets.contains(&utxo.output.asset) {
                    touched_assets.push(utxo.output.asset);
                }
            }
            combined.added.extend(delta.added);
            combined.removed.extend(delta.removed);

            events.push(WalletEvent::TxDeleted(record.clone()));
        }

        if !combined.added.is_empty() || !combined.removed.is_empty() {
            events.push(WalletEvent::UtxoUpdated { delta: combined, replace: false });
        }

        for asset in touched_assets {
            state.ledgers.invalidate(&asset);
            let (balance, locked) = self.balance_locked(&mut *state, asset)?;
            events.push(WalletEvent::BalanceChanged { asset, balance, locked });
        }

        Ok(events)
    }

    pub fn set_block_height(&self, height: u32) -> WalletResult<()> {
        let events = self.run_mutation(|state| {
            state.current_height = height;
            let assets = state.ledgers.asset_ids();
            let mut events = Vec::new();
            for asset in assets {
                state.ledgers.invalidate(&asset);
                let (balance, locked) = self.balance_locked(&mut *state, asset)?;
                events.push(WalletEvent::BalanceChanged { asset, balance, locked });
            }
            Ok(events)
        })?;
        self.notify(events);
        Ok(())
    }

    pub fn replace(&self, confirmed: Vec<(Transaction, u32)>, pending: Vec<Transaction>, coinbase: Vec<(Transaction, u32)>, timestamp: u64) -> WalletResult<()> {
        let events = self.run_mutation(|state| {
            state.store.replace(confirmed, pending, coinbase, timestamp)?;
            state.vote_locked.clear();

            let mut combined = UtxoDelta::default();
            let WalletState { utxos, book, store, .. } = &mut *state;
            *utxos = UtxoSet::new();
            for record in store.all_transactions() {
                let confirmed_flag = record.is_confirmed();
                let delta = utxos.add(&record.tx, record.height, confirmed_flag, &*book);
                combined.added.extend(delta.added);
                combined.removed.extend(delta.removed);
            }

            state.ledgers.invalidate_all();

            Ok(vec![WalletEvent::TxnReplace, WalletEvent::UtxoUpdated { delta: combined, replace: true }])
        })?;
        self.notify(events);
        Ok(())
    }

    // ---- DID lookup surface (SPEC_FULL.md §B.1) ----

    pub fn did_info(&self, did: &str) -> Option<DIDInfo> {
        let state = self.state.lock().unwrap();
        state.store.by_type(TxType::Did).into_iter().rev().find_map(|record| {
            if let Payload::Did(info) = &record.tx.payload {
                if info.payload.id == did {
                    return Some(info.clone());
                }
            }
            None
        })
    }

    pub fn all_dids(&self, start: u32, count: u32) -> (Vec<Address>, usize) {
        let state = self.state.lock().unwrap();
        let mut addresses = state.book.all_did_addresses();
        addresses.sort();
        let total = addresses.len();
        let page = addresses.into_iter().skip(start as usize).take(count as usize).collect();
        (page, total)
    }

    pub fn did_public_key(&self, pubkey: &PublicKey) -> Address {
        self.sub_account.did_address_for_pubkey(pubkey)
    }
}
