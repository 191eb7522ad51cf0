//! Permission grant flow.
//!
//! Run once per grant action from the owner's wallet session. The issuer
//! returns opaque permission bundles which are stored per asset key.

use alloy::primitives::{Address, Bytes, U256};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::{parse_amount, Config};
use crate::identity::SessionIdentity;
use crate::permission::{Asset, PermissionStore, SpendingPermission, NATIVE_ASSET_KEY};
use crate::rpc::JsonRpcClient;

const NATIVE_DECIMALS: u8 = 18;

/// One periodic allowance to ask the owner for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    pub asset_key: String,
    pub asset: Asset,
    pub period_amount: U256,
    pub period_duration_secs: u64,
    /// Absolute expiry, unix seconds
    pub expiry: i64,
    pub justification: String,
}

#[async_trait]
pub trait PermissionIssuer: Send + Sync {
    /// Returns one permission per request, in request order
    async fn request_permissions(
        &self,
        delegate: Address,
        requests: &[PermissionRequest],
    ) -> Result<Vec<SpendingPermission>>;
}

/// Build the native and (for token assets) token requests from configuration
pub fn build_requests(config: &Config, now_unix: i64) -> Result<Vec<PermissionRequest>> {
    let expiry_secs = i64::try_from(config.grant.expiry_days.saturating_mul(86_400))
        .context("grant.expiry_days is out of range")?;
    let expiry = now_unix.saturating_add(expiry_secs);

    let mut requests = vec![PermissionRequest {
        asset_key: NATIVE_ASSET_KEY.to_string(),
        asset: Asset::Native,
        period_amount: parse_amount(
            &config.grant.native_period_amount,
            NATIVE_DECIMALS,
            "grant.native_period_amount",
        )?,
        period_duration_secs: config.grant.period_duration_secs,
        expiry,
        justification: format!("{} (native)", config.grant.justification),
    }];

    let asset = config.asset()?;
    if let Asset::Token(_) = asset {
        if config.asset.key == NATIVE_ASSET_KEY {
            bail!("asset.key `{NATIVE_ASSET_KEY}` is reserved for the native permission");
        }
        requests.push(PermissionRequest {
            asset_key: config.asset.key.clone(),
            asset,
            period_amount: parse_amount(
                &config.grant.token_period_amount,
                config.asset.decimals,
                "grant.token_period_amount",
            )?,
            period_duration_secs: config.grant.period_duration_secs,
            expiry,
            justification: format!("{} ({})", config.grant.justification, config.asset.symbol),
        });
    }

    Ok(requests)
}

/// Ask the issuer for every request and store what comes back under each asset key
pub async fn grant_permissions(
    issuer: &dyn PermissionIssuer,
    store: &PermissionStore,
    owner: &Address,
    identity: &SessionIdentity,
    requests: &[PermissionRequest],
) -> Result<Vec<(String, SpendingPermission)>> {
    let delegate = identity.smart_account();
    let permissions = issuer
        .request_permissions(delegate, requests)
        .await
        .context("Permission request was not granted")?;

    if permissions.len() != requests.len() {
        bail!(
            "issuer returned {} permissions for {} requests",
            permissions.len(),
            requests.len()
        );
    }

    let mut granted = Vec::with_capacity(permissions.len());
    for (request, permission) in requests.iter().zip(permissions) {
        store
            .save(owner, &request.asset_key, &permission)
            .with_context(|| format!("Failed to store {} permission", request.asset_key))?;
        info!(
            owner = %owner,
            asset = %request.asset_key,
            delegate = %delegate,
            expiry = permission.expiry,
            "permission granted"
        );
        granted.push((request.asset_key.clone(), permission));
    }

    Ok(granted)
}

/// Issuer reached through the owner's wallet JSON-RPC endpoint
pub struct WalletRpcIssuer {
    client: JsonRpcClient,
    chain_id: u64,
}

impl WalletRpcIssuer {
    pub fn new(client: JsonRpcClient, chain_id: u64) -> Self {
        Self { client, chain_id }
    }
}

#[async_trait]
impl PermissionIssuer for WalletRpcIssuer {
    async fn request_permissions(
        &self,
        delegate: Address,
        requests: &[PermissionRequest],
    ) -> Result<Vec<SpendingPermission>> {
        let payload: Vec<serde_json::Value> = requests
            .iter()
            .map(|request| request_payload(self.chain_id, delegate, request))
            .collect();

        let responses: Vec<GrantedPermission> = self
            .client
            .call("wallet_grantPermissions", json!([payload]))
            .await?;

        let granted_at = chrono::Utc::now().timestamp();
        Ok(requests
            .iter()
            .zip(responses)
            .map(|(request, response)| response.into_permission(self.chain_id, delegate, request, granted_at))
            .collect())
    }
}

fn request_payload(chain_id: u64, delegate: Address, request: &PermissionRequest) -> serde_json::Value {
    let permission = match request.asset {
        Asset::Native => json!({
            "type": "native-token-periodic",
            "data": {
                "periodAmount": request.period_amount,
                "periodDuration": request.period_duration_secs,
                "justification": request.justification,
            }
        }),
        Asset::Token(token) => json!({
            "type": "erc20-token-periodic",
            "data": {
                "tokenAddress": token,
                "periodAmount": request.period_amount,
                "periodDuration": request.period_duration_secs,
                "justification": request.justification,
            }
        }),
    };

    json!({
        "chainId": format!("{chain_id:#x}"),
        "expiry": request.expiry,
        "signer": { "type": "account", "data": { "address": delegate } },
        "isAdjustmentAllowed": true,
        "permission": permission,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantedPermission {
    context: Bytes,
    #[serde(default)]
    expiry: Option<i64>,
    #[serde(default)]
    signer_meta: Option<SignerMeta>,
    #[serde(default)]
    permission: Option<GrantedBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignerMeta {
    #[serde(default)]
    delegation_manager: Option<Address>,
}

#[derive(Debug, Deserialize)]
struct GrantedBody {
    #[serde(default)]
    data: Option<GrantedTerms>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantedTerms {
    #[serde(default)]
    period_amount: Option<U256>,
    #[serde(default)]
    period_duration: Option<u64>,
}

impl GrantedPermission {
    /// The owner may adjust terms before approving; prefer what was granted over what was asked
    fn into_permission(
        self,
        chain_id: u64,
        delegate: Address,
        request: &PermissionRequest,
        granted_at: i64,
    ) -> SpendingPermission {
        let terms = self
            .permission
            .and_then(|body| body.data)
            .unwrap_or_default();

        SpendingPermission {
            chain_id,
            asset: request.asset,
            period_amount: terms.period_amount.unwrap_or(request.period_amount),
            period_duration_secs: terms.period_duration.unwrap_or(request.period_duration_secs),
            expiry: self.expiry.unwrap_or(request.expiry),
            delegate,
            context: self.context,
            delegation_manager: self.signer_meta.and_then(|meta| meta.delegation_manager),
            granted_at,
        }
    }
}
