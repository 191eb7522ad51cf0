use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::balance::IERC20;
use crate::identity::SessionIdentity;
use crate::permission::{Asset, SpendingPermission};
use crate::relay::{ExecutionRelay, OperationRef, RelayError, SettlementRef};

/// Typed transfer failures. None of these is swallowed by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    #[error("permission budget or expiry exhausted: {0}")]
    InsufficientPermissionBudget(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("relay rejected the transfer: {0}")]
    Rejected(String),
    #[error("network submission failed: {0}")]
    NetworkSubmissionFailed(String),
    #[error("operation {operation} submitted but settlement not observed: {detail}")]
    SettlementTimeout {
        operation: OperationRef,
        detail: String,
    },
    #[error("transfer reverted on-ledger in {0}")]
    Reverted(SettlementRef),
}

impl TransferError {
    /// The owner has to grant a fresh permission before this can succeed
    pub fn needs_regrant(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidPermission(_) | TransferError::InsufficientPermissionBudget(_)
        )
    }

    /// Nothing was debited; resubmitting the same intent is safe
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::NetworkSubmissionFailed(_))
    }

    /// The operation may or may not have landed; reconcile by reading balances
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, TransferError::SettlementTimeout { .. })
    }

    fn from_submission(err: RelayError) -> Self {
        match err {
            RelayError::BudgetExhausted(detail) | RelayError::PermissionExpired(detail) => {
                TransferError::InsufficientPermissionBudget(detail)
            }
            RelayError::InsufficientFunds(detail) => TransferError::InsufficientFunds(detail),
            RelayError::Rejected(detail) => TransferError::Rejected(detail),
            RelayError::Reverted(tx) => TransferError::Reverted(SettlementRef(tx)),
            RelayError::Transport(detail) => TransferError::NetworkSubmissionFailed(detail),
        }
    }

    fn from_settlement(operation: OperationRef, err: RelayError) -> Self {
        match err {
            RelayError::Reverted(tx) => TransferError::Reverted(SettlementRef(tx)),
            other => TransferError::SettlementTimeout {
                operation,
                detail: other.to_string(),
            },
        }
    }
}

/// What a transfer does on-ledger: one call from the delegate's smart account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl TransferIntent {
    /// Native: value transfer to the recipient. Token: `transfer(to, amount)` on the token contract.
    pub fn for_asset(asset: &Asset, to: Address, amount: U256) -> Self {
        match asset {
            Asset::Native => Self {
                to,
                value: amount,
                data: Bytes::new(),
            },
            Asset::Token(token) => Self {
                to: *token,
                value: U256::ZERO,
                data: IERC20::transferCall { to, amount }.abi_encode().into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub to: Address,
    pub amount: U256,
    pub asset: Asset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub operation: OperationRef,
    pub settlement: SettlementRef,
}

/// Submits delegated transfers and waits, bounded, for their settlement
#[derive(Clone)]
pub struct TransferExecutor {
    relay: Arc<dyn ExecutionRelay>,
    settlement_timeout: Duration,
}

impl TransferExecutor {
    pub fn new(relay: Arc<dyn ExecutionRelay>, settlement_timeout: Duration) -> Self {
        Self {
            relay,
            settlement_timeout,
        }
    }

    pub async fn execute(
        &self,
        identity: &SessionIdentity,
        permission: Option<&SpendingPermission>,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let permission = validate_permission(identity, permission, &request.asset)?;

        let fees = self
            .relay
            .fee_parameters()
            .await
            .map_err(TransferError::from_submission)?;

        let intent = TransferIntent::for_asset(&request.asset, request.to, request.amount);
        let operation = self
            .relay
            .submit_delegated_transfer(identity, permission, &intent, &fees)
            .await
            .map_err(TransferError::from_submission)?;

        info!(operation = %operation, to = %request.to, amount = %request.amount, "transfer submitted");

        let settlement =
            match tokio::time::timeout(self.settlement_timeout, self.relay.await_settlement(&operation))
                .await
            {
                Ok(result) => result.map_err(|e| TransferError::from_settlement(operation, e))?,
                Err(_) => {
                    warn!(operation = %operation, waited = ?self.settlement_timeout, "settlement not observed");
                    return Err(TransferError::SettlementTimeout {
                        operation,
                        detail: format!("no receipt after {:?}", self.settlement_timeout),
                    });
                }
            };

        Ok(TransferReceipt {
            operation,
            settlement,
        })
    }
}

fn validate_permission<'a>(
    identity: &SessionIdentity,
    permission: Option<&'a SpendingPermission>,
    asset: &Asset,
) -> Result<&'a SpendingPermission, TransferError> {
    let permission = permission
        .ok_or_else(|| TransferError::InvalidPermission("no permission granted".to_string()))?;

    if !permission.is_well_formed() {
        return Err(TransferError::InvalidPermission(
            "missing delegation proof or binding metadata".to_string(),
        ));
    }
    if permission.asset != *asset {
        return Err(TransferError::InvalidPermission(format!(
            "permission covers {}, transfer needs {}",
            permission.asset, asset
        )));
    }
    if permission.delegate != identity.smart_account() {
        return Err(TransferError::InvalidPermission(format!(
            "permission delegated to {}, session account is {}",
            permission.delegate,
            identity.smart_account()
        )));
    }
    Ok(permission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::MemoryStore;
    use crate::identity::SessionIdentityHolder;
    use crate::permission::test_fixtures::*;
    use crate::relay::FeeParams;
    use alloy::primitives::B256;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedRelay {
        fee_error: Option<RelayError>,
        submit_error: Option<RelayError>,
        settle_error: Option<RelayError>,
        settle_delay: Duration,
        submissions: AtomicUsize,
        intents: Mutex<Vec<TransferIntent>>,
    }

    #[async_trait]
    impl ExecutionRelay for ScriptedRelay {
        async fn fee_parameters(&self) -> Result<FeeParams, RelayError> {
            match &self.fee_error {
                Some(err) => Err(err.clone()),
                None => Ok(FeeParams {
                    max_fee_per_gas: U256::from(2u64),
                    max_priority_fee_per_gas: U256::from(1u64),
                }),
            }
        }

        async fn submit_delegated_transfer(
            &self,
            _identity: &SessionIdentity,
            _permission: &SpendingPermission,
            intent: &TransferIntent,
            _fees: &FeeParams,
        ) -> Result<OperationRef, RelayError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            self.intents.lock().unwrap().push(intent.clone());
            match &self.submit_error {
                Some(err) => Err(err.clone()),
                None => Ok(OperationRef(B256::repeat_byte(0x01))),
            }
        }

        async fn await_settlement(&self, _operation: &OperationRef) -> Result<SettlementRef, RelayError> {
            tokio::time::sleep(self.settle_delay).await;
            match &self.settle_error {
                Some(err) => Err(err.clone()),
                None => Ok(SettlementRef(B256::repeat_byte(0x02))),
            }
        }
    }

    fn identity() -> SessionIdentity {
        let params = Config::default_config().smart_account_params().unwrap();
        SessionIdentityHolder::new(Arc::new(MemoryStore::new()), 11155111, params)
            .get_or_create(&"0x8ba1f109551bD432803012645Ac136ddd64DBA72".parse().unwrap())
            .unwrap()
    }

    fn bound_permission(identity: &SessionIdentity, asset: Asset) -> SpendingPermission {
        let mut permission = sample_permission(asset);
        permission.delegate = identity.smart_account();
        permission
    }

    fn request(asset: Asset) -> TransferRequest {
        TransferRequest {
            to: "0x1111111111111111111111111111111111111111".parse().unwrap(),
            amount: U256::from(1_000_000u64),
            asset,
        }
    }

    #[tokio::test]
    async fn test_execute_returns_settlement() {
        let relay = Arc::new(ScriptedRelay::default());
        let executor = TransferExecutor::new(relay.clone(), Duration::from_secs(120));
        let identity = identity();
        let permission = bound_permission(&identity, Asset::Token(usdc()));

        let receipt = executor
            .execute(&identity, Some(&permission), &request(Asset::Token(usdc())))
            .await
            .unwrap();

        assert_eq!(receipt.settlement, SettlementRef(B256::repeat_byte(0x02)));
        let intents = relay.intents.lock().unwrap();
        assert_eq!(intents[0].to, usdc());
        assert_eq!(intents[0].value, U256::ZERO);
    }

    #[tokio::test]
    async fn test_missing_permission_is_invalid() {
        let relay = Arc::new(ScriptedRelay::default());
        let executor = TransferExecutor::new(relay.clone(), Duration::from_secs(120));

        let err = executor
            .execute(&identity(), None, &request(Asset::Native))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InvalidPermission(_)));
        assert!(err.needs_regrant());
        assert_eq!(relay.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_or_mismatched_permission_is_invalid() {
        let executor = TransferExecutor::new(Arc::new(ScriptedRelay::default()), Duration::from_secs(120));
        let identity = identity();

        let mut no_proof = bound_permission(&identity, Asset::Native);
        no_proof.context = Bytes::new();
        let err = executor
            .execute(&identity, Some(&no_proof), &request(Asset::Native))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidPermission(_)));

        let wrong_asset = bound_permission(&identity, Asset::Native);
        let err = executor
            .execute(&identity, Some(&wrong_asset), &request(Asset::Token(usdc())))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidPermission(_)));

        let foreign = sample_permission(Asset::Native);
        let err = executor
            .execute(&identity, Some(&foreign), &request(Asset::Native))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidPermission(_)));
    }

    #[tokio::test]
    async fn test_budget_exhausted_needs_regrant() {
        let relay = Arc::new(ScriptedRelay {
            submit_error: Some(RelayError::BudgetExhausted("period limit".to_string())),
            ..Default::default()
        });
        let executor = TransferExecutor::new(relay, Duration::from_secs(120));
        let identity = identity();
        let permission = bound_permission(&identity, Asset::Native);

        let err = executor
            .execute(&identity, Some(&permission), &request(Asset::Native))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::InsufficientPermissionBudget(_)));
        assert!(err.needs_regrant());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_expired_permission_maps_to_budget() {
        let relay = Arc::new(ScriptedRelay {
            submit_error: Some(RelayError::PermissionExpired("expired".to_string())),
            ..Default::default()
        });
        let executor = TransferExecutor::new(relay, Duration::from_secs(120));
        let identity = identity();
        let permission = bound_permission(&identity, Asset::Native);

        let err = executor
            .execute(&identity, Some(&permission), &request(Asset::Native))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InsufficientPermissionBudget(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_retryable() {
        let relay = Arc::new(ScriptedRelay {
            fee_error: Some(RelayError::Transport("connection refused".to_string())),
            ..Default::default()
        });
        let executor = TransferExecutor::new(relay.clone(), Duration::from_secs(120));
        let identity = identity();
        let permission = bound_permission(&identity, Asset::Native);

        let err = executor
            .execute(&identity, Some(&permission), &request(Asset::Native))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::NetworkSubmissionFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(relay.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_settlement_times_out_as_unknown_outcome() {
        let relay = Arc::new(ScriptedRelay {
            settle_delay: Duration::from_secs(600),
            ..Default::default()
        });
        let executor = TransferExecutor::new(relay.clone(), Duration::from_secs(120));
        let identity = identity();
        let permission = bound_permission(&identity, Asset::Native);

        let err = executor
            .execute(&identity, Some(&permission), &request(Asset::Native))
            .await
            .unwrap_err();

        assert!(err.is_unknown_outcome());
        assert!(!err.is_retryable());
        assert_eq!(relay.submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_receipt_poll_is_unknown_outcome() {
        let relay = Arc::new(ScriptedRelay {
            settle_error: Some(RelayError::Transport("bundler went away".to_string())),
            ..Default::default()
        });
        let executor = TransferExecutor::new(relay, Duration::from_secs(120));
        let identity = identity();
        let permission = bound_permission(&identity, Asset::Native);

        let err = executor
            .execute(&identity, Some(&permission), &request(Asset::Native))
            .await
            .unwrap_err();
        assert!(err.is_unknown_outcome());
    }

    #[tokio::test]
    async fn test_revert_is_reported() {
        let relay = Arc::new(ScriptedRelay {
            settle_error: Some(RelayError::Reverted(B256::repeat_byte(0x03))),
            ..Default::default()
        });
        let executor = TransferExecutor::new(relay, Duration::from_secs(120));
        let identity = identity();
        let permission = bound_permission(&identity, Asset::Native);

        let err = executor
            .execute(&identity, Some(&permission), &request(Asset::Native))
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::Reverted(SettlementRef(B256::repeat_byte(0x03))));
    }

    #[test]
    fn test_native_intent_is_value_transfer() {
        let to: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let intent = TransferIntent::for_asset(&Asset::Native, to, U256::from(5u64));
        assert_eq!(intent.to, to);
        assert_eq!(intent.value, U256::from(5u64));
        assert!(intent.data.is_empty());
    }

    #[test]
    fn test_token_intent_encodes_transfer_call() {
        let to: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let intent = TransferIntent::for_asset(&Asset::Token(usdc()), to, U256::from(1_000_000u64));

        let decoded = IERC20::transferCall::abi_decode(&intent.data).unwrap();
        assert_eq!(decoded.to, to);
        assert_eq!(decoded.amount, U256::from(1_000_000u64));
    }
}
