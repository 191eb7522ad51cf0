//! Execution relay: submits delegated operations and reports settlement.
//!
//! The relay is the authority on permission budget and expiry. Its rejections
//! are classified here so callers can branch on them without string matching.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::signers::Signer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::executor::TransferIntent;
use crate::identity::SessionIdentity;
use crate::permission::SpendingPermission;
use crate::rpc::{JsonRpcClient, RpcError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("permission budget exhausted: {0}")]
    BudgetExhausted(String),
    #[error("permission expired: {0}")]
    PermissionExpired(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("operation reverted in transaction {0}")]
    Reverted(B256),
    #[error("relay unreachable: {0}")]
    Transport(String),
}

impl From<RpcError> for RelayError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Rejected { code, message, .. } => classify_rejection(code, &message),
            other => RelayError::Transport(other.to_string()),
        }
    }
}

/// Map a relay rejection onto the permission/funding taxonomy
pub fn classify_rejection(code: i64, message: &str) -> RelayError {
    let lower = message.to_lowercase();
    let detail = format!("{message} (code {code})");

    // Parse error, invalid request, method not found, invalid params, internal error
    if code == -32700 || (-32603..=-32600).contains(&code) {
        RelayError::Rejected(detail)
    } else if lower.contains("expired") || lower.contains("expiry") {
        RelayError::PermissionExpired(detail)
    } else if ["allowance", "period", "permission", "delegation", "caveat", "exceeded"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        RelayError::BudgetExhausted(detail)
    } else if lower.contains("insufficient") {
        RelayError::InsufficientFunds(detail)
    } else {
        RelayError::Rejected(detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeParams {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Relay-side handle of a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationRef(pub B256);

/// On-ledger confirmation of a settled operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementRef(pub B256);

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SettlementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait ExecutionRelay: Send + Sync {
    async fn fee_parameters(&self) -> Result<FeeParams, RelayError>;

    async fn submit_delegated_transfer(
        &self,
        identity: &SessionIdentity,
        permission: &SpendingPermission,
        intent: &TransferIntent,
        fees: &FeeParams,
    ) -> Result<OperationRef, RelayError>;

    /// Wait until the operation is included. Unbounded; callers apply their own timeout.
    async fn await_settlement(&self, operation: &OperationRef) -> Result<SettlementRef, RelayError>;
}

#[derive(Debug, Deserialize)]
struct GasPriceTiers {
    fast: FeeParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationReceipt {
    success: bool,
    #[serde(default)]
    reason: Option<String>,
    receipt: TransactionRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRef {
    transaction_hash: B256,
}

/// ERC-4337 bundler with delegated-operation support
pub struct BundlerRelay {
    client: JsonRpcClient,
    entry_point: Address,
    chain_id: u64,
    poll_interval: Duration,
}

impl BundlerRelay {
    pub fn new(client: JsonRpcClient, entry_point: Address, chain_id: u64, poll_interval: Duration) -> Self {
        Self {
            client,
            entry_point,
            chain_id,
            poll_interval: poll_interval.max(Duration::from_millis(100)),
        }
    }
}

#[async_trait]
impl ExecutionRelay for BundlerRelay {
    async fn fee_parameters(&self) -> Result<FeeParams, RelayError> {
        let tiers: GasPriceTiers = self
            .client
            .call("pimlico_getUserOperationGasPrice", json!([]))
            .await?;
        Ok(tiers.fast)
    }

    async fn submit_delegated_transfer(
        &self,
        identity: &SessionIdentity,
        permission: &SpendingPermission,
        intent: &TransferIntent,
        fees: &FeeParams,
    ) -> Result<OperationRef, RelayError> {
        let sender = identity.smart_account();
        let digest = operation_digest(self.chain_id, self.entry_point, sender, intent, fees);
        let signature = identity
            .signer()
            .sign_hash(&digest)
            .await
            .map_err(|e| RelayError::Rejected(format!("session signer failed: {e}")))?;

        let operation = DelegatedOperation::new(
            sender,
            permission,
            intent,
            fees,
            Bytes::from(signature.as_bytes().to_vec()),
        );

        let hash: B256 = self
            .client
            .call(
                "eth_sendUserOperationWithDelegation",
                json!([operation, self.entry_point]),
            )
            .await?;

        debug!(operation = %hash, sender = %sender, "submitted delegated operation");
        Ok(OperationRef(hash))
    }

    async fn await_settlement(&self, operation: &OperationRef) -> Result<SettlementRef, RelayError> {
        loop {
            let receipt: Option<OperationReceipt> = self
                .client
                .call_optional("eth_getUserOperationReceipt", json!([operation.0]))
                .await?;

            match receipt {
                Some(receipt) if receipt.success => {
                    return Ok(SettlementRef(receipt.receipt.transaction_hash))
                }
                Some(receipt) => {
                    debug!(
                        operation = %operation,
                        reason = receipt.reason.as_deref().unwrap_or("unknown"),
                        "operation reverted"
                    );
                    return Err(RelayError::Reverted(receipt.receipt.transaction_hash));
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

/// Wire shape of a delegated operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DelegatedOperation {
    sender: Address,
    calls: Vec<DelegatedCall>,
    max_fee_per_gas: U256,
    max_priority_fee_per_gas: U256,
    signature: Bytes,
}

/// Each call carries the delegation proof it is redeemed under
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DelegatedCall {
    to: Address,
    value: U256,
    data: Bytes,
    permissions_context: Bytes,
    delegation_manager: Option<Address>,
}

impl DelegatedOperation {
    fn new(
        sender: Address,
        permission: &SpendingPermission,
        intent: &TransferIntent,
        fees: &FeeParams,
        signature: Bytes,
    ) -> Self {
        Self {
            sender,
            calls: vec![DelegatedCall {
                to: intent.to,
                value: intent.value,
                data: intent.data.clone(),
                permissions_context: permission.context.clone(),
                delegation_manager: permission.delegation_manager,
            }],
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            signature,
        }
    }
}

/// Digest the session signer commits to: chain, entry point, sender, call and fees
fn operation_digest(
    chain_id: u64,
    entry_point: Address,
    sender: Address,
    intent: &TransferIntent,
    fees: &FeeParams,
) -> B256 {
    let mut preimage = Vec::with_capacity(8 + 20 * 3 + 32 * 3 + intent.data.len());
    preimage.extend_from_slice(&chain_id.to_be_bytes());
    preimage.extend_from_slice(entry_point.as_slice());
    preimage.extend_from_slice(sender.as_slice());
    preimage.extend_from_slice(intent.to.as_slice());
    preimage.extend_from_slice(&intent.value.to_be_bytes::<32>());
    preimage.extend_from_slice(&fees.max_fee_per_gas.to_be_bytes::<32>());
    preimage.extend_from_slice(&fees.max_priority_fee_per_gas.to_be_bytes::<32>());
    preimage.extend_from_slice(&intent.data);
    keccak256(&preimage)
}
