//! Session identity: the delegate signing key spending permissions are bound to.
//!
//! One key per (owner, chain), generated lazily and kept in the durable store.
//! It is never rotated implicitly; a new key would orphan every permission
//! granted to the old smart account.

use alloy::primitives::{keccak256, Address};
use alloy::signers::local::PrivateKeySigner;
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::SmartAccountParams;
use crate::db::{store_key, DurableStore, StoreError};

const SESSION_KEY_NAMESPACE: &str = "topup_session_key";

#[derive(Debug, Serialize, Deserialize)]
struct SessionKeyRecord {
    private_key: String,
    created_at: i64,
}

/// Public, comparable view of a session identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDescriptor {
    pub owner: Address,
    pub chain_id: u64,
    pub signer: Address,
    pub smart_account: Address,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SessionIdentity {
    descriptor: IdentityDescriptor,
    signer: PrivateKeySigner,
}

impl SessionIdentity {
    pub fn descriptor(&self) -> &IdentityDescriptor {
        &self.descriptor
    }

    /// Counterfactual smart-account address, the permission delegate
    pub fn smart_account(&self) -> Address {
        self.descriptor.smart_account
    }

    pub fn signer_address(&self) -> Address {
        self.descriptor.signer
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }
}

pub struct SessionIdentityHolder {
    store: Arc<dyn DurableStore>,
    chain_id: u64,
    params: SmartAccountParams,
}

impl SessionIdentityHolder {
    pub fn new(store: Arc<dyn DurableStore>, chain_id: u64, params: SmartAccountParams) -> Self {
        Self {
            store,
            chain_id,
            params,
        }
    }

    /// Return the owner's session identity, creating and persisting it on first use
    pub fn get_or_create(&self, owner: &Address) -> Result<SessionIdentity, StoreError> {
        if let Some(identity) = self.get(owner)? {
            return Ok(identity);
        }

        let signing_key = SigningKey::random(&mut OsRng);
        let record = SessionKeyRecord {
            private_key: format!("0x{}", hex::encode(signing_key.to_bytes())),
            created_at: chrono::Utc::now().timestamp(),
        };

        let key = self.key(owner);
        let raw = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&key, &raw)?;

        let identity = self.build(owner, &key, &record)?;
        info!(
            owner = %owner,
            signer = %identity.signer_address(),
            smart_account = %identity.smart_account(),
            "created session identity"
        );
        Ok(identity)
    }

    /// Load an existing identity without creating one
    pub fn get(&self, owner: &Address) -> Result<Option<SessionIdentity>, StoreError> {
        let key = self.key(owner);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };

        let record: SessionKeyRecord =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        self.build(owner, &key, &record).map(Some)
    }

    /// Explicitly discard the owner's key. Permissions bound to it become useless.
    pub fn clear(&self, owner: &Address) -> Result<(), StoreError> {
        self.store.remove(&self.key(owner))
    }

    fn key(&self, owner: &Address) -> String {
        store_key(SESSION_KEY_NAMESPACE, owner, Some(&self.chain_id.to_string()))
    }

    fn build(
        &self,
        owner: &Address,
        key: &str,
        record: &SessionKeyRecord,
    ) -> Result<SessionIdentity, StoreError> {
        let signer: PrivateKeySigner =
            record.private_key.parse().map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("invalid private key: {e}"),
            })?;
        let signer_address = signer.address();

        Ok(SessionIdentity {
            descriptor: IdentityDescriptor {
                owner: *owner,
                chain_id: self.chain_id,
                signer: signer_address,
                smart_account: derive_smart_account(&signer_address, &self.params),
                created_at: record.created_at,
            },
            signer,
        })
    }
}

/// CREATE2 address of the smart account the factory deploys for `signer`
pub fn derive_smart_account(signer: &Address, params: &SmartAccountParams) -> Address {
    let mut preimage = Vec::with_capacity(20 + params.deploy_salt.len());
    preimage.extend_from_slice(signer.as_slice());
    preimage.extend_from_slice(&params.deploy_salt);
    let salt = keccak256(&preimage);

    params.factory.create2(salt.0, params.init_code_hash.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use alloy::primitives::B256;

    struct UnavailableStore;

    impl DurableStore for UnavailableStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("no persistence context".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("no persistence context".to_string()))
        }

        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("no persistence context".to_string()))
        }
    }

    fn params() -> SmartAccountParams {
        SmartAccountParams {
            factory: "0x69Aa2f9fe1572F1B640E1bbc512f5c3a734fc77c".parse().unwrap(),
            init_code_hash: B256::repeat_byte(0x11),
            deploy_salt: Vec::new(),
        }
    }

    fn owner() -> Address {
        "0x8ba1f109551bD432803012645Ac136ddd64DBA72".parse().unwrap()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let holder = SessionIdentityHolder::new(Arc::new(MemoryStore::new()), 11155111, params());

        let first = holder.get_or_create(&owner()).unwrap();
        let second = holder.get_or_create(&owner()).unwrap();

        assert_eq!(first.descriptor(), second.descriptor());
        assert_eq!(first.signer().address(), second.signer().address());
    }

    #[test]
    fn test_identities_are_per_owner_and_chain() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let sepolia = SessionIdentityHolder::new(store.clone(), 11155111, params());
        let polygon = SessionIdentityHolder::new(store, 137, params());
        let other: Address = "0x3333333333333333333333333333333333333333".parse().unwrap();

        let a = sepolia.get_or_create(&owner()).unwrap();
        let b = sepolia.get_or_create(&other).unwrap();
        let c = polygon.get_or_create(&owner()).unwrap();

        assert_ne!(a.signer_address(), b.signer_address());
        assert_ne!(a.signer_address(), c.signer_address());
    }

    #[test]
    fn test_smart_account_is_derived_from_signer() {
        let holder = SessionIdentityHolder::new(Arc::new(MemoryStore::new()), 1, params());
        let identity = holder.get_or_create(&owner()).unwrap();

        assert_eq!(
            identity.smart_account(),
            derive_smart_account(&identity.signer_address(), &params())
        );
        assert_ne!(identity.smart_account(), identity.signer_address());
    }

    #[test]
    fn test_salt_changes_smart_account() {
        let signer: Address = "0x2222222222222222222222222222222222222222".parse().unwrap();
        let mut salted = params();
        salted.deploy_salt = vec![0x01];

        assert_ne!(
            derive_smart_account(&signer, &params()),
            derive_smart_account(&signer, &salted)
        );
    }

    #[test]
    fn test_get_does_not_create() {
        let holder = SessionIdentityHolder::new(Arc::new(MemoryStore::new()), 1, params());
        assert!(holder.get(&owner()).unwrap().is_none());
    }

    #[test]
    fn test_clear_rotates_key() {
        let holder = SessionIdentityHolder::new(Arc::new(MemoryStore::new()), 1, params());
        let before = holder.get_or_create(&owner()).unwrap();

        holder.clear(&owner()).unwrap();
        let after = holder.get_or_create(&owner()).unwrap();

        assert_ne!(before.signer_address(), after.signer_address());
    }

    #[test]
    fn test_unavailable_store_is_reported() {
        let holder = SessionIdentityHolder::new(Arc::new(UnavailableStore), 1, params());
        let result = holder.get_or_create(&owner());
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
