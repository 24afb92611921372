//! Addresses and deterministic derivation with gap-limit discovery
//! (spec §3, §4.4).

use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use bitcoin_hashes::{hash160, Hash};
use serde::{Deserialize, Serialize};

use crate::error::{WalletError, WalletResult};
use crate::subaccount::SubAccount;

/// BIP44-style chain selector: external (receive) or internal (change).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    External = 0,
    Internal = 1,
}

/// The address variant, encoded as the prefix byte of the program hash
/// (spec §3: "addresses carry a one-byte prefix identifying the variant").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressKind {
    ReceiveExternal,
    ChangeInternal,
    Deposit,
    CrDeposit,
    Owner,
    Did,
}

impl AddressKind {
    fn prefix_byte(self) -> u8 {
        match self {
            AddressKind::ReceiveExternal => 0x21,
            AddressKind::ChangeInternal => 0x4b,
            AddressKind::Deposit => 0x12,
            AddressKind::CrDeposit => 0x1c,
            AddressKind::Owner => 0x67,
            AddressKind::Did => 0x38,
        }
    }
}

impl TryFrom<u8> for AddressKind {
    type Error = WalletError;

    fn try_from(byte: u8) -> WalletResult<AddressKind> {
        match byte {
            0x21 => Ok(AddressKind::ReceiveExternal),
            0x4b => Ok(AddressKind::ChangeInternal),
            0x12 => Ok(AddressKind::Deposit),
            0x1c => Ok(AddressKind::CrDeposit),
            0x67 => Ok(AddressKind::Owner),
            0x38 => Ok(AddressKind::Did),
            other => Err(WalletError::InvalidArgument(format!("unknown address prefix byte {:#x}", other))),
        }
    }
}

/// 21-byte program hash: one prefix byte followed by a 160-bit hash.
pub type ProgramHash = [u8; 21];

/// A derived wallet address. Equality and ordering are over the full
/// encoded form (prefix byte + hash160), matching spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    kind: AddressKind,
    hash160: [u8; 20],
}

impl Address {
    pub fn from_pubkey(kind: AddressKind, pubkey: &PublicKey) -> Address {
        let hash = hash160::Hash::hash(&pubkey.serialize());
        Address {
            kind,
            hash160: *hash.as_byte_array(),
        }
    }

    pub fn from_raw_parts(kind: AddressKind, hash160: [u8; 20]) -> Address {
        Address { kind, hash160 }
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn program_hash(&self) -> ProgramHash {
        let mut out = [0u8; 21];
        out[0] = self.kind.prefix_byte();
        out[1..].copy_from_slice(&self.hash160);
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.program_hash()).with_check().into_string())
    }
}

impl FromStr for Address {
    type Err = WalletError;

    fn from_str(s: &str) -> WalletResult<Address> {
        let bytes = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| WalletError::InvalidArgument(format!("bad base58check address: {}", e)))?;
        if bytes.len() != 21 {
            return Err(WalletError::InvalidArgument("address payload must be 21 bytes".into()));
        }
        let kind = AddressKind::try_from(bytes[0])?;
        let mut hash160 = [0u8; 20];
        hash160.copy_from_slice(&bytes[1..]);
        Ok(Address { kind, hash160 })
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Address, D::Error> {
        let s = String::deserialize(d)?;
        Address::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Where an address's signing key lives, resolved by [`AddressBook::locate`]
/// so the transaction builder can ask the sub-account to sign without
/// knowing derivation paths itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressLocation {
    Chain(Chain, u32),
    Owner,
    Deposit,
    CrDeposit,
    Did,
}

struct DerivedChain {
    addresses: Vec<Address>,
    used: HashSet<Address>,
    gap_limit: u32,
}

impl DerivedChain {
    fn new(gap_limit: u32) -> DerivedChain {
        DerivedChain {
            addresses: Vec::new(),
            used: HashSet::new(),
            gap_limit,
        }
    }

    fn trailing_unused(&self) -> u32 {
        self.addresses
            .iter()
            .rev()
            .take_while(|a| !self.used.contains(a))
            .count() as u32
    }

    fn first_unused(&self) -> Option<Address> {
        self.addresses.iter().find(|a| !self.used.contains(a)).copied()
    }

    fn unused(&self) -> Vec<Address> {
        self.addresses.iter().filter(|a| !self.used.contains(a)).copied().collect()
    }
}

/// Tracks derived addresses for the external and internal chains, extending
/// each so that at least `gap_limit` trailing addresses stay unused.
pub struct AddressBook {
    sub_account: Arc<dyn SubAccount>,
    external: DerivedChain,
    internal: DerivedChain,
    specials: HashSet<Address>,
    did_addresses: HashSet<Address>,
}

impl AddressBook {
    pub fn new(sub_account: Arc<dyn SubAccount>, external_gap_limit: u32, internal_gap_limit: u32) -> AddressBook {
        let mut specials = HashSet::new();
        specials.insert(sub_account.deposit_address());
        specials.insert(sub_account.cr_deposit_address());
        specials.insert(sub_account.owner_address());

        let mut book = AddressBook {
            sub_account,
            external: DerivedChain::new(external_gap_limit),
            internal: DerivedChain::new(internal_gap_limit),
            specials,
            did_addresses: HashSet::new(),
        };
        book.top_up(Chain::External);
        book.top_up(Chain::Internal);
        book
    }

    fn chain_mut(&mut self, chain: Chain) -> &mut DerivedChain {
        match chain {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }

    fn chain(&self, chain: Chain) -> &DerivedChain {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    fn derive_next(&mut self, chain: Chain) -> WalletResult<Address> {
        let kind = match chain {
            Chain::External => AddressKind::ReceiveExternal,
            Chain::Internal => AddressKind::ChangeInternal,
        };
        let index = self.chain(chain).addresses.len() as u32;
        let pubkey = self.sub_account.derive_pubkey(chain, index)?;
        let address = Address::from_pubkey(kind, &pubkey);
        self.chain_mut(chain).addresses.push(address);
        Ok(address)
    }

    /// Derives addresses until the trailing-unused invariant holds.
    fn top_up(&mut self, chain: Chain) {
        while self.chain(chain).trailing_unused() < self.chain(chain).gap_limit {
            self.derive_next(chain).expect("bip32 child derivation does not realistically overflow here");
        }
    }

    pub fn receive_address(&mut self) -> Address {
        self.top_up(Chain::External);
        self.external.first_unused().expect("top_up guarantees an unused tail")
    }

    pub fn change_address(&mut self) -> Address {
        self.top_up(Chain::Internal);
        self.internal.first_unused().expect("top_up guarantees an unused tail")
    }

    /// The currently unused trailing addresses of the given chain (spec
    /// §4.4): length is always `>= gap_limit` after a `top_up`.
    pub fn unused_addresses(&self, internal: bool) -> Vec<Address> {
        if internal {
            self.internal.unused()
        } else {
            self.external.unused()
        }
    }

    pub fn all_addresses(&self, start: u32, count: u32, internal: bool) -> Vec<Address> {
        let chain = self.chain(if internal { Chain::Internal } else { Chain::External });
        chain
            .addresses
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .copied()
            .collect()
    }

    /// Idempotent; may extend the relevant chain to restore the gap-limit
    /// invariant.
    pub fn mark_used(&mut self, address: Address) {
        if self.specials.contains(&address) {
            return;
        }
        let is_internal = self.internal.addresses.contains(&address);
        let is_external = self.external.addresses.contains(&address);
        if !is_internal && !is_external {
            return;
        }
        let chain = if is_internal { Chain::Internal } else { Chain::External };
        self.chain_mut(chain).used.insert(address);
        self.top_up(chain);
        log::trace!("address marked used: {}", address);
    }

    /// True for any previously derived address, used or not, plus the
    /// special fixed-path addresses.
    pub fn contains(&self, address: &Address) -> bool {
        self.specials.contains(address)
            || self.external.addresses.contains(address)
            || self.internal.addresses.contains(address)
    }

    pub fn is_used(&self, address: &Address) -> bool {
        self.external.used.contains(address) || self.internal.used.contains(address)
    }

    pub fn owner_address(&self) -> Address {
        self.sub_account.owner_address()
    }

    pub fn deposit_address(&self) -> Address {
        self.sub_account.deposit_address()
    }

    pub fn cr_deposit_address(&self) -> Address {
        self.sub_account.cr_deposit_address()
    }

    /// Records a DID address observed in a processed `did` transaction so
    /// it later surfaces from [`AddressBook::all_did_addresses`] (spec
    /// supplement, SPEC_FULL.md §B.1).
    pub fn remember_did(&mut self, address: Address) {
        self.did_addresses.insert(address);
    }

    /// Resolves an address to the key location the sub-account needs to
    /// sign for it (spec §4.7 `sign`).
    pub fn locate(&self, address: &Address) -> Option<AddressLocation> {
        if *address == self.owner_address() {
            return Some(AddressLocation::Owner);
        }
        if *address == self.deposit_address() {
            return Some(AddressLocation::Deposit);
        }
        if *address == self.cr_deposit_address() {
            return Some(AddressLocation::CrDeposit);
        }
        if *address == self.sub_account.own_did_address() {
            return Some(AddressLocation::Did);
        }
        if let Some(idx) = self.external.addresses.iter().position(|a| a == address) {
            return Some(AddressLocation::Chain(Chain::External, idx as u32));
        }
        if let Some(idx) = self.internal.addresses.iter().position(|a| a == address) {
            return Some(AddressLocation::Chain(Chain::Internal, idx as u32));
        }
        None
    }

    pub fn all_did_addresses(&self) -> Vec<Address> {
        // DID addresses are derived on demand from arbitrary public keys
        // (see `SubAccount::did_address_for_pubkey`), not along a chain, so
        // the book only reports those it has been asked to remember via
        // `remember_did`.
        self.did_addresses.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subaccount::{Bip32SubAccount, SECP};
    use bitcoin::bip32::Xpriv;
    use bitcoin::Network;

    fn test_book() -> AddressBook {
        let seed = [7u8; 32];
        let xpriv = Xpriv::new_master(Network::Testnet, &seed).unwrap();
        let sub = Arc::new(Bip32SubAccount::from_xpriv(xpriv, "m/44'/0'/0'".parse().unwrap()));
        AddressBook::new(sub, 10, 5)
    }

    #[test]
    fn address_round_trips_through_base58check() {
        let mut book = test_book();
        let addr = book.receive_address();
        let encoded = addr.to_string();
        let decoded: Address = encoded.parse().unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn gap_limit_is_maintained_after_use() {
        let mut book = test_book();
        for _ in 0..15 {
            let addr = book.receive_address();
            book.mark_used(addr);
        }
        let unused = book.unused_addresses(false);
        assert!(unused.len() >= 10);
        let mut seen = HashSet::new();
        for a in &unused {
            assert!(seen.insert(*a), "addresses must be pairwise distinct");
        }
    }

    #[test]
    fn mark_used_is_idempotent() {
        let mut book = test_book();
        let addr = book.receive_address();
        book.mark_used(addr);
        book.mark_used(addr);
        assert!(book.is_used(&addr));
    }

    #[test]
    fn contains_covers_specials_and_derived() {
        let mut book = test_book();
        assert!(book.contains(&book.deposit_address()));
        let addr = book.receive_address();
        assert!(book.contains(&addr));
    }
}
