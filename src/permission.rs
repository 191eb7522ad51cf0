//! Spending permissions and their durable store.
//!
//! A permission is an opaque, immutable bundle returned by the permission
//! issuer. Budget and expiry accounting is enforced by the execution relay,
//! so nothing here evicts or re-validates a stored permission; the transfer
//! executor checks its structure at use time.

use alloy::primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::db::{store_key, DurableStore, StoreError};

const PERMISSION_NAMESPACE: &str = "topup_permission";
const PERMISSION_INDEX_NAMESPACE: &str = "topup_permission_index";
const BOT_ADDRESS_NAMESPACE: &str = "topup_bot_address";

/// Asset key of the native-asset permission
pub const NATIVE_ASSET_KEY: &str = "native";

/// What a permission (and a transfer) moves
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "address", rename_all = "kebab-case")]
pub enum Asset {
    Native,
    Token(Address),
}

impl Asset {
    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => write!(f, "native"),
            Asset::Token(address) => write!(f, "token {address}"),
        }
    }
}

/// A scoped, time-boxed, rate-limited authorization granted by the owner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpendingPermission {
    pub chain_id: u64,
    pub asset: Asset,
    /// Maximum spendable per period, in the asset's smallest unit
    pub period_amount: U256,
    pub period_duration_secs: u64,
    /// Absolute expiry, unix seconds
    pub expiry: i64,
    /// Delegate the permission is bound to (the session smart account)
    pub delegate: Address,
    /// Delegation proof handed to the relay, opaque to us
    pub context: Bytes,
    /// Contract that redeems the delegation
    #[serde(default)]
    pub delegation_manager: Option<Address>,
    pub granted_at: i64,
}

impl SpendingPermission {
    /// Structural check: a usable permission carries a proof and its binding
    /// metadata. Budget and expiry are left to the relay.
    pub fn is_well_formed(&self) -> bool {
        !self.context.is_empty()
            && self.delegation_manager.is_some_and(|manager| manager != Address::ZERO)
            && self.delegate != Address::ZERO
    }

    pub fn is_expired_at(&self, unix_secs: i64) -> bool {
        unix_secs >= self.expiry
    }
}

/// Permission records keyed by (owner, asset key), plus the per-owner bot target
#[derive(Clone)]
pub struct PermissionStore {
    store: Arc<dyn DurableStore>,
}

impl PermissionStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub fn save(
        &self,
        owner: &Address,
        asset_key: &str,
        permission: &SpendingPermission,
    ) -> Result<(), StoreError> {
        let key = store_key(PERMISSION_NAMESPACE, owner, Some(asset_key));
        let record = serde_json::to_string(permission).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &record)?;

        let mut index = self.asset_index(owner)?;
        if !index.iter().any(|existing| existing == asset_key) {
            index.push(asset_key.to_string());
            self.write_asset_index(owner, &index)?;
        }
        Ok(())
    }

    pub fn load(
        &self,
        owner: &Address,
        asset_key: &str,
    ) -> Result<Option<SpendingPermission>, StoreError> {
        let key = store_key(PERMISSION_NAMESPACE, owner, Some(asset_key));
        match self.store.get(&key)? {
            Some(record) => serde_json::from_str(&record)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Asset keys that currently hold a permission for `owner`
    pub fn asset_keys(&self, owner: &Address) -> Result<Vec<String>, StoreError> {
        self.asset_index(owner)
    }

    /// Drop every permission for `owner` along with the stored bot target
    pub fn clear(&self, owner: &Address) -> Result<(), StoreError> {
        for asset_key in self.asset_index(owner)? {
            self.store
                .remove(&store_key(PERMISSION_NAMESPACE, owner, Some(&asset_key)))?;
        }
        // The grant flow always writes the native key; drop it even if the index was lost
        self.store
            .remove(&store_key(PERMISSION_NAMESPACE, owner, Some(NATIVE_ASSET_KEY)))?;
        self.store.remove(&store_key(PERMISSION_INDEX_NAMESPACE, owner, None))?;
        self.store.remove(&store_key(BOT_ADDRESS_NAMESPACE, owner, None))?;
        Ok(())
    }

    pub fn save_bot_address(&self, owner: &Address, bot: &Address) -> Result<(), StoreError> {
        self.store
            .set(&store_key(BOT_ADDRESS_NAMESPACE, owner, None), &bot.to_string())
    }

    pub fn load_bot_address(&self, owner: &Address) -> Result<Option<Address>, StoreError> {
        let key = store_key(BOT_ADDRESS_NAMESPACE, owner, None);
        match self.store.get(&key)? {
            Some(raw) => raw.parse().map(Some).map_err(|e| StoreError::Corrupt {
                key,
                reason: format!("{e}"),
            }),
            None => Ok(None),
        }
    }

    fn asset_index(&self, owner: &Address) -> Result<Vec<String>, StoreError> {
        let key = store_key(PERMISSION_INDEX_NAMESPACE, owner, None);
        match self.store.get(&key)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    fn write_asset_index(&self, owner: &Address, index: &[String]) -> Result<(), StoreError> {
        let key = store_key(PERMISSION_INDEX_NAMESPACE, owner, None);
        let raw = serde_json::to_string(index).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &raw)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub fn usdc() -> Address {
        "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238".parse().unwrap()
    }

    pub fn sample_permission(asset: Asset) -> SpendingPermission {
        SpendingPermission {
            chain_id: 11155111,
            asset,
            period_amount: U256::from(100_000_000u64),
            period_duration_secs: 86_400,
            expiry: 1_900_000_000,
            delegate: "0x2222222222222222222222222222222222222222".parse().unwrap(),
            context: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            delegation_manager: Some(
                "0xdb9B1e94B5b69Df7e401DDbedE43491141047dB3".parse().unwrap(),
            ),
            granted_at: 1_700_000_000,
        }
    }
}
