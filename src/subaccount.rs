//! Key-provider contract (spec §6) and a BIP32-backed implementation.
//!
//! The wallet core never sees a private key outside of [`SubAccount::sign`]
//! and [`SubAccount::derive_private_key`]; the teacher crate's pattern of
//! deriving on demand from an `ExtendedPubKey`/`ExtendedPrivKey` pair is
//! kept, generalized to the sidechain's wider set of derivation paths.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{self, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::address::{Address, AddressKind, AddressLocation, Chain};
use crate::error::{WalletError, WalletResult};

lazy_static::lazy_static! {
    pub static ref SECP: Secp256k1<All> = Secp256k1::new();
}

/// An ECDSA signature, serialized DER as the sidechain's `program.parameter`
/// expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// The shared, immutable (after construction) provider of key material for
/// one wallet. Private-key material is derived on demand from a password
/// and zeroized before the derivation call returns (spec §5).
pub trait SubAccount: Send + Sync {
    fn extended_public_key(&self) -> &Xpub;

    /// Derives the public key at `chain`/`index` along the account's base
    /// path (used by the address book; never touches private key material).
    fn derive_pubkey(&self, chain: Chain, index: u32) -> WalletResult<PublicKey>;

    /// Derives the private key at an arbitrary path, given the unlock
    /// password. Implementations must zero the returned secret once the
    /// caller drops it and must never retain a decrypted copy.
    fn derive_private_key(&self, path: &DerivationPath, password: &str) -> WalletResult<Zeroizing<SecretKey>>;

    fn sign(&self, path: &DerivationPath, digest: &[u8; 32], password: &str) -> WalletResult<Signature>;

    fn owner_public_key(&self) -> PublicKey;

    fn deposit_address(&self) -> Address;

    fn cr_deposit_address(&self) -> Address;

    fn owner_address(&self) -> Address;

    fn did_address_for_pubkey(&self, pubkey: &PublicKey) -> Address;

    /// This wallet's own identity address, derived along the fixed DID
    /// path (spec §4.4: "Special addresses ... are derived from fixed,
    /// non-BIP44 paths and are always considered own").
    fn own_did_address(&self) -> Address;

    /// Signs `msg` (sha256d-hashed first) with the private key backing
    /// `did_address`, which must equal [`SubAccount::own_did_address`].
    fn sign_with_did(&self, did_address: &Address, msg: &[u8], password: &str) -> WalletResult<Signature>;

    /// Signs a pre-computed digest the same way (spec §6:
    /// `sign_digest_with_did`).
    fn sign_digest_with_did(
        &self,
        did_address: &Address,
        digest: &[u8; 32],
        password: &str,
    ) -> WalletResult<Signature>;

    fn master_fingerprint(&self) -> Fingerprint;

    /// Signs for whichever address `location` names, dispatching to the
    /// BIP44 chain path or one of the fixed special paths (spec §4.7
    /// `sign`). Lets the transaction builder sign without knowing
    /// derivation paths itself.
    fn sign_at(&self, location: AddressLocation, digest: &[u8; 32], password: &str) -> WalletResult<Signature>;
}

/// Reference implementation backed by a BIP32 extended key pair and an
/// in-memory (test/demo only) password. Real deployments plug in a
/// hardware- or keystore-backed [`SubAccount`]; this exists so the crate is
/// runnable end to end without an external collaborator.
pub struct Bip32SubAccount {
    xpub: Xpub,
    xpriv: Option<Xpriv>,
    master_fp: Fingerprint,
    base_path: DerivationPath,
    owner_path: DerivationPath,
    deposit_path: DerivationPath,
    cr_deposit_path: DerivationPath,
    did_path: DerivationPath,
}

impl Bip32SubAccount {
    /// Construct from a master extended private key (unlocked form). The
    /// `password` parameter on signing methods is still enforced by
    /// callers higher up; this reference implementation treats `xpriv`
    /// itself as the secret and does not re-derive from a password, since
    /// it has no encrypted keystore to unlock.
    pub fn from_xpriv(xpriv: Xpriv, base_path: DerivationPath) -> Bip32SubAccount {
        let xpub = Xpub::from_priv(&SECP, &xpriv);
        let master_fp = xpriv.fingerprint(&SECP);
        Bip32SubAccount {
            xpub,
            xpriv: Some(xpriv),
            master_fp,
            base_path,
            owner_path: "m/44'/0'".parse().unwrap(),
            deposit_path: "m/44'/1'".parse().unwrap(),
            cr_deposit_path: "m/44'/2'".parse().unwrap(),
            did_path: "m/44'/3'".parse().unwrap(),
        }
    }

    fn chain_path(&self, chain: Chain, index: u32) -> WalletResult<DerivationPath> {
        let chain_cn = ChildNumber::from_normal_idx(chain as u32)?;
        let idx_cn = ChildNumber::from_normal_idx(index)?;
        Ok(self.base_path.child(chain_cn).child(idx_cn))
    }

    fn derive_pub_at(&self, path: &DerivationPath) -> WalletResult<PublicKey> {
        Ok(self.xpub.derive_pub(&SECP, path)?.public_key)
    }

    fn address_from_path(&self, kind: AddressKind, path: &DerivationPath) -> Address {
        let pubkey = self.derive_pub_at(path).expect("fixed special paths always derive");
        Address::from_pubkey(kind, &pubkey)
    }
}

impl SubAccount for Bip32SubAccount {
    fn extended_public_key(&self) -> &Xpub {
        &self.xpub
    }

    fn derive_pubkey(&self, chain: Chain, index: u32) -> WalletResult<PublicKey> {
        let path = self.chain_path(chain, index)?;
        self.derive_pub_at(&path)
    }

    fn derive_private_key(&self, path: &DerivationPath, _password: &str) -> WalletResult<Zeroizing<SecretKey>> {
        let xpriv = self.xpriv.ok_or(WalletError::MissingKey)?;
        let derived = xpriv.derive_priv(&SECP, path)?;
        Ok(Zeroizing::new(derived.private_key))
    }

    fn sign(&self, path: &DerivationPath, digest: &[u8; 32], password: &str) -> WalletResult<Signature> {
        let secret = self.derive_private_key(path, password)?;
        let msg = Message::from_digest(*digest);
        let sig = SECP.sign_ecdsa(&msg, &secret);
        Ok(Signature(sig.serialize_der().to_vec()))
    }

    fn owner_public_key(&self) -> PublicKey {
        self.derive_pub_at(&self.owner_path).expect("owner path always derives")
    }

    fn deposit_address(&self) -> Address {
        self.address_from_path(AddressKind::Deposit, &self.deposit_path.clone())
    }

    fn cr_deposit_address(&self) -> Address {
        self.address_from_path(AddressKind::CrDeposit, &self.cr_deposit_path.clone())
    }

    fn owner_address(&self) -> Address {
        self.address_from_path(AddressKind::Owner, &self.owner_path.clone())
    }

    fn did_address_for_pubkey(&self, pubkey: &PublicKey) -> Address {
        Address::from_pubkey(AddressKind::Did, pubkey)
    }

    fn own_did_address(&self) -> Address {
        self.address_from_path(AddressKind::Did, &self.did_path.clone())
    }

    fn sign_with_did(&self, did_address: &Address, msg: &[u8], password: &str) -> WalletResult<Signature> {
        use bitcoin_hashes::{sha256d, Hash};
        let digest = sha256d::Hash::hash(msg);
        self.sign_digest_with_did(did_address, digest.as_byte_array(), password)
    }

    fn sign_digest_with_did(
        &self,
        did_address: &Address,
        digest: &[u8; 32],
        password: &str,
    ) -> WalletResult<Signature> {
        if *did_address != self.own_did_address() {
            return Err(WalletError::MissingKey);
        }
        self.sign(&self.did_path.clone(), digest, password)
    }

    fn master_fingerprint(&self) -> Fingerprint {
        self.master_fp
    }

    fn sign_at(&self, location: AddressLocation, digest: &[u8; 32], password: &str) -> WalletResult<Signature> {
        match location {
            AddressLocation::Chain(chain, index) => {
                let path = self.chain_path(chain, index)?;
                self.sign(&path, digest, password)
            }
            AddressLocation::Owner => self.sign(&self.owner_path.clone(), digest, password),
            AddressLocation::Deposit => self.sign(&self.deposit_path.clone(), digest, password),
            AddressLocation::CrDeposit => self.sign(&self.cr_deposit_path.clone(), digest, password),
            AddressLocation::Did => self.sign(&self.did_path.clone(), digest, password),
        }
    }
}

/// Verifies a detached ECDSA signature against a raw public key and
/// message bytes (sha256d-hashed first), per the public `verify_signature`
/// surface (spec §6).
pub fn verify_signature(pubkey: &PublicKey, msg: &[u8], signature: &[u8]) -> bool {
    use bitcoin_hashes::{sha256d, Hash};

    let digest = sha256d::Hash::hash(msg);
    let message = match Message::from_digest_slice(digest.as_byte_array()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let sig = match secp256k1::ecdsa::Signature::from_der(signature) {
        Ok(s) => s,
        Err(_) => return false,
    };
    SECP.verify_ecdsa(&message, &sig, pubkey).is_ok()
}
