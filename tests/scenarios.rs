//! End-to-end scenarios exercising the wallet core as a single crate-level
//! black box: fund an address, build and sign a spend, feed it back through
//! the chain-sync surface, and watch balances settle.

use std::sync::{Arc, Mutex};

use bitcoin::bip32::Xpriv;
use bitcoin::Network;
use bitcoin_hashes::{sha256d, Hash};

use wallet_core::asset::Asset;
use wallet_core::config::WalletConfig;
use wallet_core::database::MemoryDatabase;
use wallet_core::identity::{CredentialSubject, DIDDescriptor, DIDOperation, PublicKeyInput};
use wallet_core::listener::{Listener, WalletEvent};
use wallet_core::money::Amount;
use wallet_core::subaccount::{Bip32SubAccount, SubAccount};
use wallet_core::transaction::{Output, Payload, Transaction, TxType};
use wallet_core::wallet::Wallet;

fn native_asset() -> Asset {
    Asset {
        id: sha256d::Hash::from_byte_array([0u8; 32]),
        name: "ELA".to_string(),
        precision: 8,
        controller: [0u8; 21],
        registration_amount: Amount::ZERO,
    }
}

fn new_wallet(seed_byte: u8) -> Wallet {
    let xpriv = Xpriv::new_master(Network::Testnet, &[seed_byte; 32]).unwrap();
    let sub = Arc::new(Bip32SubAccount::from_xpriv(xpriv, "m/44'/0'/0'".parse().unwrap()));
    let db = Arc::new(MemoryDatabase::new());
    Wallet::new(WalletConfig::new("main"), sub, db, native_asset())
}

fn funding_tx(to: wallet_core::address::Address, asset: wallet_core::asset::AssetId, sats: u128) -> Transaction {
    Transaction {
        version: 0,
        tx_type: TxType::Normal,
        payload: Payload::Normal,
        attributes: vec![],
        inputs: vec![],
        outputs: vec![Output {
            amount: Amount::from_sats(sats),
            address: to,
            asset,
            payload: None,
        }],
        lock_time: 0,
        programs: vec![],
    }
}

struct EventCounter {
    balance_changes: Mutex<u32>,
}

impl Listener for EventCounter {
    fn on_event(&self, event: &WalletEvent) {
        if let WalletEvent::BalanceChanged { .. } = event {
            *self.balance_changes.lock().unwrap() += 1;
        }
    }
}

/// Scenario A: receive funds, build+sign a spend, replay it back through
/// the chain-sync surface, and watch the spender's balance settle.
#[test]
fn build_sign_and_confirm_a_spend_between_two_wallets() {
    let sender = new_wallet(1);
    let receiver = new_wallet(2);
    let asset = sender.native_asset_id();

    let sender_addr = sender.receive_address();
    let funding = funding_tx(sender_addr, asset, 5_000_000);
    sender.register_transaction(funding, 10, 1000).unwrap();
    assert_eq!(sender.balance(asset).unwrap(), Amount::from_sats(5_000_000));

    let receiver_addr = receiver.receive_address();
    let unsigned = sender
        .create_transaction(asset, TxType::Normal, Payload::Normal, None, vec![(receiver_addr, Amount::from_sats(1_000_000))], Some("payment"), false)
        .unwrap();
    let signed = sender.sign_transaction(&unsigned, "pw").unwrap();
    assert!(signed.programs.iter().all(|p| !p.parameter.is_empty()));

    sender.register_transaction(signed.clone(), 11, 1001).unwrap();
    receiver.register_transaction(signed, 11, 1001).unwrap();

    assert_eq!(receiver.balance(asset).unwrap(), Amount::from_sats(1_000_000));
    let sender_balance = sender.balance(asset).unwrap();
    assert!(sender_balance.sats() < 4_000_000);
}

/// Scenario B: a reorg removes a previously-registered transaction and the
/// balance it funded disappears with it.
#[test]
fn removing_a_transaction_reverts_its_balance_effect() {
    let wallet = new_wallet(3);
    let asset = wallet.native_asset_id();
    let addr = wallet.receive_address();

    let tx = funding_tx(addr, asset, 2_500_000);
    let hash = tx.tx_hash();
    wallet.register_transaction(tx, 20, 2000).unwrap();
    assert_eq!(wallet.balance(asset).unwrap(), Amount::from_sats(2_500_000));

    wallet.remove_transaction(hash).unwrap();
    assert_eq!(wallet.balance(asset).unwrap(), Amount::ZERO);
}

/// Scenario C: a coinbase output is locked until it matures at
/// `coinbase_maturity` confirmations.
#[test]
fn coinbase_output_unlocks_only_after_maturity() {
    let wallet = new_wallet(4);
    let asset = wallet.native_asset_id();
    let addr = wallet.receive_address();

    let tx = Transaction {
        version: 0,
        tx_type: TxType::Coinbase,
        payload: Payload::Coinbase(vec![]),
        attributes: vec![],
        inputs: vec![],
        outputs: vec![Output {
            amount: Amount::from_sats(1_000_000),
            address: addr,
            asset,
            payload: None,
        }],
        lock_time: 0,
        programs: vec![],
    };
    wallet.register_transaction(tx, 100, 0).unwrap();

    let (_, locked) = wallet.balance_info(asset).unwrap();
    assert_eq!(locked, Amount::from_sats(1_000_000));

    wallet.set_block_height(100 + wallet_core::config::DEFAULT_COINBASE_MATURITY - 1).unwrap();
    let (_, still_locked) = wallet.balance_info(asset).unwrap();
    assert_eq!(still_locked, Amount::from_sats(1_000_000));

    wallet.set_block_height(100 + wallet_core::config::DEFAULT_COINBASE_MATURITY).unwrap();
    let (_, unlocked) = wallet.balance_info(asset).unwrap();
    assert_eq!(unlocked, Amount::ZERO);
}

/// Scenario D: consolidating (`max` spend) sweeps every UTXO for an asset
/// into a single output at the destination.
#[test]
fn consolidate_sweeps_every_utxo_into_one_output() {
    let wallet = new_wallet(5);
    let asset = wallet.native_asset_id();
    let addr = wallet.receive_address();

    for sats in [1_000_000, 2_000_000, 3_000_000] {
        wallet.register_transaction(funding_tx(addr, asset, sats), 10, 100).unwrap();
    }
    let total_before = wallet.balance(asset).unwrap();

    let swept = wallet.consolidate(asset, None).unwrap();
    assert_eq!(swept.outputs.len(), 1);
    assert!(swept.outputs[0].amount.sats() < total_before.sats());
    assert_eq!(swept.inputs.len(), 3);
}

/// Scenario E: issuing a `did` transaction produces a self-consistent
/// signed proof tied to the wallet's own identity address.
#[test]
fn create_did_transaction_signs_a_self_consistent_proof() {
    let wallet = new_wallet(6);
    let asset = wallet.native_asset_id();
    let addr = wallet.receive_address();
    wallet.register_transaction(funding_tx(addr, asset, 10_000_000), 10, 100).unwrap();

    // the descriptor id must decode to this wallet's own DID address,
    // derived the same way `new_wallet` built its `Bip32SubAccount`.
    let sub = Bip32SubAccount::from_xpriv(Xpriv::new_master(Network::Testnet, &[6u8; 32]).unwrap(), "m/44'/0'/0'".parse().unwrap());
    let own_did = sub.own_did_address();

    let descriptor = DIDDescriptor {
        id: format!("did:elastos:{}", own_did),
        operation: DIDOperation::Create,
        public_keys: vec![PublicKeyInput {
            id: "#primary".to_string(),
            public_key_hex: None,
            public_key_base58: Some("zdummy".to_string()),
            controller: None,
        }],
        credential_subject: CredentialSubject {
            email: "user@example.com".to_string(),
            ..CredentialSubject::default()
        },
        expires: "2099-01-01T00:00:00Z".to_string(),
    };

    let tx = wallet.create_did_transaction(descriptor, Some("identity claim"), "pw").unwrap();
    match &tx.payload {
        Payload::Did(info) => {
            assert!(info.proof.is_some());
            assert_eq!(info.payload.id, format!("did:elastos:{}", own_did));
        }
        _ => panic!("expected a did payload"),
    }
}

/// Scenario F: `replace` reloads every partition atomically and fires a
/// single coalesced `UtxoUpdated` rather than per-transaction events.
#[test]
fn replace_coalesces_into_one_reload_notification() {
    let wallet = new_wallet(7);
    let asset = wallet.native_asset_id();
    let addr = wallet.receive_address();

    let counter = Arc::new(EventCounter { balance_changes: Mutex::new(0) });
    wallet.set_listener(&(counter.clone() as Arc<dyn Listener>));

    let txs: Vec<(Transaction, u32)> = (0..3).map(|i| (funding_tx(addr, asset, 1_000_000 * (i + 1)), 40 + i as u32)).collect();
    wallet.replace(txs, vec![], vec![], 5000).unwrap();

    assert_eq!(wallet.balance(asset).unwrap(), Amount::from_sats(6_000_000));
    assert_eq!(*counter.balance_changes.lock().unwrap(), 1);
}
