//! Transaction builder: unsigned assembly and signing (spec §4.7).

use crate::address::{Address, AddressBook};
use crate::asset::AssetId;
use crate::error::{WalletError, WalletResult};
use crate::ledger::{GroupedAssetLedger, SelectionContext};
use crate::money::{self, Amount, TX_MAX_SIZE};
use crate::subaccount::{Signature, SubAccount};
use crate::transaction::{Attribute, AttributeKind, Input, Output, Payload, Program, Transaction, TxType};
use crate::utxo::UtxoSet;

/// Caller-facing request for [`create_tx`], one step removed from the raw
/// `Transaction` it assembles (spec §4.7 preamble).
pub struct TxRequest<'a> {
    pub tx_type: TxType,
    pub payload: Payload,
    pub asset: AssetId,
    pub from_address: Option<&'a Address>,
    pub outputs: Vec<(Address, Amount)>,
    pub memo: Option<&'a str>,
    pub max: bool,
}

const MAX_MEMO_BYTES: usize = 100;

/// Assembles an unsigned transaction (spec §4.7 steps 1-6).
pub fn create_tx(
    ledger: &GroupedAssetLedger,
    ctx: &SelectionContext<'_>,
    book: &mut AddressBook,
    fee_per_kb: u64,
    request: TxRequest<'_>,
) -> WalletResult<Transaction> {
    if !request.payload.matches_type(request.tx_type) {
        return Err(WalletError::InvalidPayload(format!(
            "payload variant does not match transaction type {:?}",
            request.tx_type
        )));
    }
    if request.outputs.is_empty() {
        return Err(WalletError::InvalidArgument("at least one output is required".into()));
    }

    let allow_zero_amount = request.tx_type == TxType::Did;
    let dust_floor = money::min_output_amount(fee_per_kb);

    let (outputs, selection_inputs, fee) = if request.max {
        if request.outputs.len() != 1 {
            return Err(WalletError::InvalidArgument("max spend takes exactly one destination".into()));
        }
        let inputs = ledger.consolidate_inputs(ctx);
        if inputs.is_empty() {
            return Err(WalletError::InsufficientFunds(Amount::ZERO));
        }
        let total: Amount = inputs.iter().map(|u| u.output.amount).sum();
        let size = money::estimate_size(inputs.len(), 1);
        let fee = money::estimate_fee(size, fee_per_kb);
        let amount = total.checked_sub(fee)?;
        let destination = request.outputs[0].0;
        (
            vec![Output {
                amount,
                address: destination,
                asset: request.asset,
                payload: None,
            }],
            inputs,
            fee,
        )
    } else {
        if !allow_zero_amount {
            for (_, amount) in &request.outputs {
                if *amount < dust_floor {
                    return Err(WalletError::DustOutput {
                        amount: *amount,
                        minimum: dust_floor,
                    });
                }
            }
        }
        let target: Amount = request.outputs.iter().map(|(_, a)| *a).sum::<Amount>();
        let selection = ledger.select(ctx, target, fee_per_kb, request.outputs.len(), request.from_address, false)?;

        let mut outputs: Vec<Output> = request
            .outputs
            .into_iter()
            .map(|(address, amount)| Output {
                amount,
                address,
                asset: request.asset,
                payload: None,
            })
            .collect();
        if selection.change.sats() > 0 {
            outputs.push(Output {
                amount: selection.change,
                address: book.change_address(),
                asset: request.asset,
                payload: None,
            });
        }
        (outputs, selection.inputs, selection.fee)
    };

    let mut signer_addresses: Vec<Address> = Vec::new();
    for utxo in &selection_inputs {
        if !signer_addresses.contains(&utxo.output.address) {
            signer_addresses.push(utxo.output.address);
        }
    }
    let programs: Vec<Program> = signer_addresses
        .iter()
        .map(|address| Program {
            code: address.program_hash().to_vec(),
            parameter: Vec::new(),
        })
        .collect();

    let mut attributes = Vec::new();
    if let Some(memo) = request.memo {
        if memo.as_bytes().len() > MAX_MEMO_BYTES {
            return Err(WalletError::InvalidArgument(format!(
                "memo of {} bytes exceeds the {}-byte limit",
                memo.as_bytes().len(),
                MAX_MEMO_BYTES
            )));
        }
        if !memo.is_empty() {
            attributes.push(Attribute {
                kind: AttributeKind::Description,
                data: memo.as_bytes().to_vec(),
            });
        }
    }

    let inputs: Vec<Input> = selection_inputs
        .iter()
        .map(|utxo| Input {
            outpoint: utxo.outpoint,
            sequence: 0xffff_ffff,
        })
        .collect();

    let tx = Transaction {
        version: 0,
        tx_type: request.tx_type,
        payload: request.payload,
        attributes,
        inputs,
        outputs,
        lock_time: 0,
        programs,
    };

    let size = tx.to_bytes(true).len();
    if size > TX_MAX_SIZE {
        return Err(WalletError::TxTooLarge { size, max: TX_MAX_SIZE });
    }

    let total_in: Amount = selection_inputs.iter().map(|u| u.output.amount).sum();
    let total_out = tx.total_output_amount()?;
    let required = total_out.checked_add(fee)?;
    if total_in < required {
        return Err(WalletError::InsufficientFunds(required.checked_sub(total_in).unwrap_or(Amount::ZERO)));
    }

    log::debug!("assembled {:?} tx: {} inputs, {} outputs, fee {}", request.tx_type, tx.inputs.len(), tx.outputs.len(), fee);

    Ok(tx)
}

/// Signs every program slot of `tx` (spec §4.7 `sign`): each slot
/// corresponds to one unique input-signer address, resolved against
/// `utxo_set`/`book` and signed over [`Transaction::signable_hash`].
pub fn sign(tx: &Transaction, utxo_set: &UtxoSet, book: &AddressBook, sub_account: &dyn SubAccount, password: &str) -> WalletResult<Transaction> {
    let digest = *tx.signable_hash().as_byte_array();

    let mut signer_addresses: Vec<Address> = Vec::new();
    for input in &tx.inputs {
        let utxo = utxo_set
            .get(&input.outpoint)
            .ok_or_else(|| WalletError::NotFound(format!("utxo for input {:?}", input.outpoint)))?;
        if !signer_addresses.contains(&utxo.output.address) {
            signer_addresses.push(utxo.output.address);
        }
    }

    if signer_addresses.len() != tx.programs.len() {
        return Err(WalletError::InvariantViolated("program count does not match unique input signers"));
    }

    let mut signed = tx.clone();
    for (program, address) in signed.programs.iter_mut().zip(signer_addresses.iter()) {
        let location = book.locate(address).ok_or(WalletError::MissingKey)?;
        let Signature(sig_bytes) = sub_account.sign_at(location, &digest, password)?;
        program.parameter = sig_bytes;
    }

    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subaccount::Bip32SubAccount;
    use crate::transaction::{Output as TxOutput, TxType};
    use bitcoin::bip32::Xpriv;
    use bitcoin::Network;
    use bitcoin_hashes::{sha256d, Hash};
    use std::sync::Arc;

    fn setup() -> (AddressBook, UtxoSet, Arc<Bip32SubAccount>, AssetId) {
        let seed = [6u8; 32];
        let xpriv = Xpriv::new_master(Network::Testnet, &seed).unwrap();
        let sub = Arc::new(Bip32SubAccount::from_xpriv(xpriv, "m/44'/0'/0'".parse().unwrap()));
        let mut book = AddressBook::new(sub.clone(), 10, 5);
        let asset = sha256d::Hash::from_byte_array([0u8; 32]);

        let mut set = UtxoSet::new();
        let addr = book.receive_address();
        let funding = Transaction {
            version: 0,
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            attributes: vec![],
            inputs: vec![],
            outputs: vec![TxOutput {
                amount: Amount::from_sats(10_000_000),
                address: addr,
                asset,
                payload: None,
            }],
            lock_time: 0,
            programs: vec![],
        };
        set.add(&funding, 10, true, &book);

        (book, set, sub, asset)
    }

    #[test]
    fn create_tx_produces_change_output_and_balances() {
        let (mut book, set, sub, asset) = setup();
        let no_lock = |_: &crate::transaction::Outpoint| false;
        let ctx = SelectionContext {
            utxo_set: &set,
            current_height: 1000,
            coinbase_maturity: 100,
            vote_locked: &no_lock,
        };
        let ledger = GroupedAssetLedger::new(asset);
        let dest = sub.owner_address();

        let request = TxRequest {
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            asset,
            from_address: None,
            outputs: vec![(dest, Amount::from_sats(1_000_000))],
            memo: Some("payment"),
            max: false,
        };
        let tx = create_tx(&ledger, &ctx, &mut book, 10_000, request).unwrap();
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.programs.len(), 1);
        let total_in = Amount::from_sats(10_000_000);
        let total_out = tx.total_output_amount().unwrap();
        assert!(total_out < total_in);
    }

    #[test]
    fn sign_fills_every_program_parameter() {
        let (mut book, set, sub, asset) = setup();
        let no_lock = |_: &crate::transaction::Outpoint| false;
        let ctx = SelectionContext {
            utxo_set: &set,
            current_height: 1000,
            coinbase_maturity: 100,
            vote_locked: &no_lock,
        };
        let ledger = GroupedAssetLedger::new(asset);
        let dest = sub.owner_address();

        let request = TxRequest {
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            asset,
            from_address: None,
            outputs: vec![(dest, Amount::from_sats(1_000_000))],
            memo: None,
            max: false,
        };
        let tx = create_tx(&ledger, &ctx, &mut book, 10_000, request).unwrap();
        let signed = sign(&tx, &set, &book, sub.as_ref(), "pw").unwrap();
        assert!(signed.programs.iter().all(|p| !p.parameter.is_empty()));
    }

    #[test]
    fn dust_output_is_rejected() {
        let (mut book, set, sub, asset) = setup();
        let no_lock = |_: &crate::transaction::Outpoint| false;
        let ctx = SelectionContext {
            utxo_set: &set,
            current_height: 1000,
            coinbase_maturity: 100,
            vote_locked: &no_lock,
        };
        let ledger = GroupedAssetLedger::new(asset);
        let dest = sub.owner_address();

        let request = TxRequest {
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            asset,
            from_address: None,
            outputs: vec![(dest, Amount::from_sats(1))],
            memo: None,
            max: false,
        };
        let err = create_tx(&ledger, &ctx, &mut book, 10_000, request).unwrap_err();
        assert!(matches!(err, WalletError::DustOutput { .. }));
    }
}
