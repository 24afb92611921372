//! Listener dispatch: event types and the weak, non-owning observer contract
//! (spec §4.8, §5).
//!
//! The wallet never owns its listener. It holds a [`std::sync::Weak`] handle
//! so that a listener which outlives the wallet is simply a dangling weak
//! reference, and a wallet whose last strong listener reference is dropped
//! elsewhere silently stops notifying (spec §5: "callbacks that outlive the
//! wallet silently drop").

use std::sync::{Arc, Weak};

use crate::address::Address;
use crate::asset::{Asset, AssetId};
use crate::money::Amount;
use crate::transaction::TxRecord;
use crate::utxo::UtxoDelta;

/// One observable state transition (spec §4.8 event table). The wallet core
/// constructs these after releasing its lock and hands them to [`dispatch`],
/// never one at a time, so that the ordering guarantee in spec §5 holds even
/// when several event kinds are produced by a single ingress event.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// Fired once, before anything else, when `replace` reloads every
    /// partition atomically.
    TxnReplace,
    TxAdded(TxRecord),
    TxUpdated(Vec<TxRecord>),
    TxDeleted(TxRecord),
    /// `replace` is set when this delta came from a `Replace` ingress event,
    /// so a single coalesced notification covers the whole reload.
    UtxoUpdated { delta: UtxoDelta, replace: bool },
    UsedAddressAdded(Address),
    AssetRegistered(Asset),
    BalanceChanged { asset: AssetId, balance: Amount, locked: Amount },
}

impl WalletEvent {
    /// Dispatch rank within a single ingress event, lowest first (spec §5:
    /// `TxnReplace` > `TxAdded`/`TxUpdated`/`TxDeleted` > `UTXOUpdated` >
    /// `UsedAddress*` > `AssetRegistered` > `BalanceChanged`).
    fn rank(&self) -> u8 {
        match self {
            WalletEvent::TxnReplace => 0,
            WalletEvent::TxAdded(_) | WalletEvent::TxUpdated(_) | WalletEvent::TxDeleted(_) => 1,
            WalletEvent::UtxoUpdated { .. } => 2,
            WalletEvent::UsedAddressAdded(_) => 3,
            WalletEvent::AssetRegistered(_) => 4,
            WalletEvent::BalanceChanged { .. } => 5,
        }
    }
}

/// Receives wallet state transitions. Implementations must not block or
/// re-enter the wallet: `on_event` runs with the wallet's lock already
/// released (spec §5 "Listener callbacks MUST run without holding the
/// lock"), but it still runs on the thread that drove the ingress event.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &WalletEvent);
}

/// A weak, non-owning handle to the wallet's listener (spec §4.1 ownership
/// table: "External Listeners hold a weak (non-owning) reference").
#[derive(Clone, Default)]
pub struct ListenerHandle {
    inner: Option<Weak<dyn Listener>>,
}

impl ListenerHandle {
    pub fn new(listener: &Arc<dyn Listener>) -> ListenerHandle {
        ListenerHandle { inner: Some(Arc::downgrade(listener)) }
    }

    /// No listener attached; every notification is a no-op.
    pub fn none() -> ListenerHandle {
        ListenerHandle { inner: None }
    }

    fn upgrade(&self) -> Option<Arc<dyn Listener>> {
        self.inner.as_ref().and_then(Weak::upgrade)
    }

    /// Sorts `events` into the spec §5 order and fires them one at a time.
    /// Called after the wallet's lock has been released; a dropped listener
    /// makes this a silent no-op rather than an error.
    pub fn notify(&self, mut events: Vec<WalletEvent>) {
        if events.is_empty() {
            return;
        }
        let Some(listener) = self.upgrade() else {
            return;
        };
        events.sort_by_key(WalletEvent::rank);
        for event in &events {
            listener.on_event(event);
        }
    }
}
