//! Asset registry (spec §4.2).

use std::collections::HashMap;

use bitcoin_hashes::sha256d;
use serde::{Deserialize, Serialize};

use crate::error::{WalletError, WalletResult};
use crate::money::Amount;

/// Opaque 32-byte asset identifier.
pub type AssetId = sha256d::Hash;

/// 21-byte controller program hash (version byte + 160-bit hash, as used
/// throughout the sidechain's script-address encoding).
pub type ProgramHash = [u8; 21];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub precision: u8,
    pub controller: ProgramHash,
    pub registration_amount: Amount,
}

/// Asset id → metadata, with case-insensitive name uniqueness (spec §4.2).
/// The native asset is installed at construction and can never be removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRegistry {
    native_asset_id: AssetId,
    assets: HashMap<AssetId, Asset>,
    names_lower: HashMap<String, AssetId>,
}

impl AssetRegistry {
    /// Installs the native asset and returns a registry containing only it.
    pub fn new(native_asset: Asset) -> AssetRegistry {
        let mut registry = AssetRegistry {
            native_asset_id: native_asset.id,
            assets: HashMap::new(),
            names_lower: HashMap::new(),
        };
        registry
            .insert(native_asset)
            .expect("installing the native asset into an empty registry cannot fail");
        registry
    }

    pub fn native_asset_id(&self) -> AssetId {
        self.native_asset_id
    }

    fn insert(&mut self, asset: Asset) -> WalletResult<()> {
        let lower = asset.name.to_lowercase();
        self.names_lower.insert(lower, asset.id);
        self.assets.insert(asset.id, asset);
        Ok(())
    }

    /// Triggered only by observing a `RegisterAsset` payload in a processed
    /// transaction (spec §4.2).
    pub fn register(&mut self, asset: Asset) -> WalletResult<()> {
        if self.assets.contains_key(&asset.id) {
            return Err(WalletError::Duplicate(format!("asset id {}", asset.id)));
        }
        if self.names_lower.contains_key(&asset.name.to_lowercase()) {
            return Err(WalletError::Duplicate(format!("asset name {}", asset.name)));
        }
        log::debug!("asset registered: {} ({})", asset.name, asset.id);
        self.insert(asset)
    }

    pub fn get(&self, id: &AssetId) -> WalletResult<&Asset> {
        self.assets
            .get(id)
            .ok_or_else(|| WalletError::NotFound(format!("asset {}", id)))
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.assets.contains_key(id)
    }

    pub fn name_exists(&self, name: &str) -> bool {
        self.names_lower.contains_key(&name.to_lowercase())
    }

    /// Stable sort by id.
    pub fn list(&self) -> Vec<&Asset> {
        let mut assets: Vec<&Asset> = self.assets.values().collect();
        assets.sort_by_key(|a| a.id);
        assets
    }
}
