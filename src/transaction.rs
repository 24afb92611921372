//! Transactions, outpoints, payloads, and the canonical store record
//! (spec §3, §6).

use std::convert::TryFrom;
use std::str::FromStr;

use bitcoin_hashes::{sha256d, Hash};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::asset::{Asset, AssetId, ProgramHash};
use crate::codec::*;
use crate::error::{WalletError, WalletResult};
use crate::identity::DIDInfo;
use crate::money::Amount;

pub type TxHash = sha256d::Hash;

/// `lock_time` below this is interpreted as a block height, otherwise a
/// timestamp (kept from the original's `TX_MAX_LOCK_HEIGHT`, unused by any
/// operation in scope here but part of the wire contract).
pub const TX_MAX_LOCK_HEIGHT: u32 = 500_000_000;

/// Sentinel height meaning "not yet confirmed" (`INT32_MAX`).
pub const TX_UNCONFIRMED: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    Normal,
    Coinbase,
    TransferCrossChain,
    RegisterProducer,
    Vote,
    Did,
    RegisterAsset,
    Retrieve,
}

impl TxType {
    fn tag(self) -> u8 {
        match self {
            TxType::Normal => 0,
            TxType::Coinbase => 1,
            TxType::TransferCrossChain => 2,
            TxType::RegisterProducer => 3,
            TxType::Vote => 4,
            TxType::Did => 5,
            TxType::RegisterAsset => 6,
            TxType::Retrieve => 7,
        }
    }

    fn from_tag(tag: u8) -> WalletResult<TxType> {
        Ok(match tag {
            0 => TxType::Normal,
            1 => TxType::Coinbase,
            2 => TxType::TransferCrossChain,
            3 => TxType::RegisterProducer,
            4 => TxType::Vote,
            5 => TxType::Did,
            6 => TxType::RegisterAsset,
            7 => TxType::Retrieve,
            other => return Err(WalletError::InvalidArgument(format!("unknown tx type tag {}", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteContent {
    pub vote_type: u8,
    pub candidates: Vec<(Vec<u8>, Amount)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterProducerPayload {
    pub owner_public_key: Vec<u8>,
    pub node_public_key: Vec<u8>,
    pub nickname: String,
    pub url: String,
    pub address: ProgramHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCrossChainPayload {
    pub target_address: String,
    pub target_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAssetPayload {
    pub asset: Asset,
    pub amount: Amount,
    pub controller: ProgramHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievePayload {
    pub main_chain_tx_hash: TxHash,
}

/// Tagged payload variant. Replaces the original's base-class polymorphism
/// (spec §9, "Dynamic payload dispatch") with one exhaustively-matched enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Normal,
    Coinbase(Vec<u8>),
    TransferCrossChain(TransferCrossChainPayload),
    RegisterProducer(RegisterProducerPayload),
    Vote(Vec<VoteContent>),
    Did(DIDInfo),
    RegisterAsset(RegisterAssetPayload),
    Retrieve(RetrievePayload),
}

impl Payload {
    /// Whether this payload variant is admissible for `ty` (spec §4.7:
    /// "mismatched variant → InvalidPayload").
    pub fn matches_type(&self, ty: TxType) -> bool {
        matches!(
            (self, ty),
            (Payload::Normal, TxType::Normal)
                | (Payload::Coinbase(_), TxType::Coinbase)
                | (Payload::TransferCrossChain(_), TxType::TransferCrossChain)
                | (Payload::RegisterProducer(_), TxType::RegisterProducer)
                | (Payload::Vote(_), TxType::Vote)
                | (Payload::Did(_), TxType::Did)
                | (Payload::RegisterAsset(_), TxType::RegisterAsset)
                | (Payload::Retrieve(_), TxType::Retrieve)
        )
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let bytes = bincode_like_encode(self);
        write_var_bytes(buf, &bytes);
    }

    fn decode(ty: TxType, bytes: &[u8]) -> WalletResult<Payload> {
        bincode_like_decode(ty, bytes)
    }
}

/// Payloads carry a handful of variable-length/optional fields that don't
/// map cleanly onto the var-int codec without a lot of boilerplate; since
/// they are never hashed independently of the outer transaction bytes
/// (only `Transaction::to_bytes` needs to be bit-exact), round-tripping
/// them through `serde_json` inside the var-int framing keeps the wire
/// format simple while the outer transaction stays a real binary codec.
fn bincode_like_encode(payload: &Payload) -> Vec<u8> {
    serde_json::to_vec(payload).expect("payload always serializes")
}

fn bincode_like_decode(ty: TxType, bytes: &[u8]) -> WalletResult<Payload> {
    let payload: Payload =
        serde_json::from_slice(bytes).map_err(|e| WalletError::InvalidPayload(e.to_string()))?;
    if !payload.matches_type(ty) {
        return Err(WalletError::InvalidPayload(format!(
            "payload variant does not match declared type {:?}",
            ty
        )));
    }
    Ok(payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    Description,
    Nonce,
    Memo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub kind: AttributeKind,
    pub data: Vec<u8>,
}

/// `(tx_hash, index)`. Total order via `(tx_hash lex, index)` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Outpoint {
    pub tx_hash: TxHash,
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: Amount,
    pub address: Address,
    pub asset: AssetId,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub outpoint: Outpoint,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<u8>,
    pub parameter: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub tx_type: TxType,
    pub payload: Payload,
    pub attributes: Vec<Attribute>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub lock_time: u32,
    pub programs: Vec<Program>,
}

impl Transaction {
    pub fn tx_hash(&self) -> TxHash {
        sha256d::Hash::hash(&self.to_bytes(true))
    }

    /// Double-SHA256 over the transaction excluding `programs` — this is
    /// what gets signed (spec §3).
    pub fn signable_hash(&self) -> TxHash {
        sha256d::Hash::hash(&self.to_bytes(false))
    }

    pub fn to_bytes(&self, include_programs: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.version);
        buf.push(self.tx_type.tag());
        self.payload.encode(&mut buf);

        write_var_int(&mut buf, self.attributes.len() as u64);
        for attr in &self.attributes {
            buf.push(match attr.kind {
                AttributeKind::Description => 0,
                AttributeKind::Nonce => 1,
                AttributeKind::Memo => 2,
            });
            write_var_bytes(&mut buf, &attr.data);
        }

        write_var_int(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(input.outpoint.tx_hash.as_byte_array());
            buf.extend_from_slice(&input.outpoint.index.to_le_bytes());
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_var_int(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.amount.sats().to_le_bytes());
            buf.extend_from_slice(&output.address.program_hash());
            buf.extend_from_slice(output.asset.as_byte_array());
            match &output.payload {
                Some(p) => {
                    buf.push(1);
                    write_var_bytes(&mut buf, p);
                }
                None => buf.push(0),
            }
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());

        if include_programs {
            write_var_int(&mut buf, self.programs.len() as u64);
            for program in &self.programs {
                write_var_bytes(&mut buf, &program.code);
                write_var_bytes(&mut buf, &program.parameter);
            }
        }

        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> WalletResult<Transaction> {
        let mut pos = 0usize;
        let version = read_u8(bytes, &mut pos)?;
        let tx_type = TxType::from_tag(read_u8(bytes, &mut pos)?)?;
        let payload_bytes = read_var_bytes(bytes, &mut pos)?;
        let payload = Payload::decode(tx_type, &payload_bytes)?;

        let n_attrs = read_var_int(bytes, &mut pos)?;
        let mut attributes = Vec::with_capacity(n_attrs as usize);
        for _ in 0..n_attrs {
            let kind = match read_u8(bytes, &mut pos)? {
                0 => AttributeKind::Description,
                1 => AttributeKind::Nonce,
                2 => AttributeKind::Memo,
                other => return Err(WalletError::InvalidArgument(format!("unknown attribute kind {}", other))),
            };
            let data = read_var_bytes(bytes, &mut pos)?;
            attributes.push(Attribute { kind, data });
        }

        let n_inputs = read_var_int(bytes, &mut pos)?;
        let mut inputs = Vec::with_capacity(n_inputs as usize);
        for _ in 0..n_inputs {
            let hash_bytes = read_exact(bytes, &mut pos, 32)?;
            let tx_hash = sha256d::Hash::from_slice(hash_bytes)
                .map_err(|e| WalletError::InvalidArgument(e.to_string()))?;
            let index = read_u16(bytes, &mut pos)?;
            let sequence = read_u32(bytes, &mut pos)?;
            inputs.push(Input {
                outpoint: Outpoint { tx_hash, index },
                sequence,
            });
        }

        let n_outputs = read_var_int(bytes, &mut pos)?;
        let mut outputs = Vec::with_capacity(n_outputs as usize);
        for _ in 0..n_outputs {
            let amount = Amount::from_sats(read_u128(bytes, &mut pos)?);
            let program_hash = read_exact(bytes, &mut pos, 21)?;
            let mut ph = [0u8; 21];
            ph.copy_from_slice(program_hash);
            let address = Address::from_program_hash(&ph)?;
            let asset_bytes = read_exact(bytes, &mut pos, 32)?;
            let asset = AssetId::from_slice(asset_bytes).map_err(|e| WalletError::InvalidArgument(e.to_string()))?;
            let has_payload = read_u8(bytes, &mut pos)?;
            let payload = if has_payload == 1 {
                Some(read_var_bytes(bytes, &mut pos)?)
            } else {
                None
            };
            outputs.push(Output {
                amount,
                address,
                asset,
                payload,
            });
        }

        let lock_time = read_u32(bytes, &mut pos)?;

        let n_programs = read_var_int(bytes, &mut pos)?;
        let mut programs = Vec::with_capacity(n_programs as usize);
        for _ in 0..n_programs {
            let code = read_var_bytes(bytes, &mut pos)?;
            let parameter = read_var_bytes(bytes, &mut pos)?;
            programs.push(Program { code, parameter });
        }

        Ok(Transaction {
            version,
            tx_type,
            payload,
            attributes,
            inputs,
            outputs,
            lock_time,
            programs,
        })
    }

    pub fn total_output_amount(&self) -> WalletResult<Amount> {
        let mut total = Amount::ZERO;
        for output in &self.outputs {
            total = total.checked_add(output.amount)?;
        }
        Ok(total)
    }
}

/// Which partition a [`TxRecord`] currently lives in (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partition {
    Confirmed,
    Pending,
    Coinbase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx: Transaction,
    pub height: u32,
    pub arrival_timestamp: u64,
    pub origin_partition: Partition,
}

impl TxRecord {
    pub fn hash(&self) -> TxHash {
        self.tx.tx_hash()
    }

    pub fn is_confirmed(&self) -> bool {
        self.height < TX_UNCONFIRMED
    }

    pub fn partition_for(tx_type: TxType, height: u32) -> Partition {
        if height >= TX_UNCONFIRMED {
            Partition::Pending
        } else if tx_type == TxType::Coinbase {
            Partition::Coinbase
        } else {
            Partition::Confirmed
        }
    }
}

impl Address {
    pub fn from_program_hash(bytes: &ProgramHash) -> WalletResult<Address> {
        let kind = crate::address::AddressKind::try_from(bytes[0])?;
        let mut hash160 = [0u8; 20];
        hash160.copy_from_slice(&bytes[1..]);
        Ok(Address::from_raw_parts(kind, hash160))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressKind;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn sample_tx() -> Transaction {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let address = Address::from_pubkey(AddressKind::ReceiveExternal, &pk);
        Transaction {
            version: 0,
            tx_type: TxType::Normal,
            payload: Payload::Normal,
            attributes: vec![Attribute {
                kind: AttributeKind::Description,
                data: b"hi".to_vec(),
            }],
            inputs: vec![Input {
                outpoint: Outpoint {
                    tx_hash: sha256d::Hash::from_byte_array([1u8; 32]),
                    index: 0,
                },
                sequence: 0xffff_ffff,
            }],
            outputs: vec![Output {
                amount: Amount::from_sats(100_000),
                address,
                asset: AssetId::from_byte_array([0u8; 32]),
                payload: None,
            }],
            lock_time: 0,
            programs: vec![Program {
                code: vec![0xAC],
                parameter: vec![],
            }],
        }
    }

    #[test]
    fn round_trips_every_field() {
        let tx = sample_tx();
        let bytes = tx.to_bytes(true);
        let parsed = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(tx, parsed);
    }

    #[test]
    fn signable_hash_excludes_programs() {
        let mut tx = sample_tx();
        let hash_before = tx.signable_hash();
        tx.programs.push(Program {
            code: vec![1, 2, 3],
            parameter: vec![4, 5, 6],
        });
        assert_eq!(hash_before, tx.signable_hash());
        assert_ne!(tx.tx_hash(), hash_before);
    }

    #[test]
    fn outpoint_orders_by_hash_then_index() {
        let a = Outpoint {
            tx_hash: sha256d::Hash::from_byte_array([1u8; 32]),
            index: 5,
        };
        let b = Outpoint {
            tx_hash: sha256d::Hash::from_byte_array([1u8; 32]),
            index: 6,
        };
        assert!(a < b);
    }

    #[test]
    fn payload_type_mismatch_is_rejected() {
        let tx_type = TxType::Did;
        let bytes = bincode_like_encode(&Payload::Normal);
        assert!(Payload::decode(tx_type, &bytes).is_err());
    }
}
