pub mod balance;
pub mod cli;
pub mod config;
pub mod db;
pub mod executor;
pub mod grant;
pub mod identity;
pub mod monitor;
pub mod permission;
pub mod policy;
pub mod relay;
pub mod rpc;

pub use balance::{BalanceOracle, Balances, LedgerReader, RpcLedgerReader};
pub use config::{Config, MonitorSettings};
pub use db::{Database, DurableStore, MemoryStore, StoreError};
pub use executor::{TransferError, TransferExecutor, TransferIntent, TransferReceipt, TransferRequest};
pub use grant::{build_requests, grant_permissions, PermissionIssuer, PermissionRequest, WalletRpcIssuer};
pub use identity::{IdentityDescriptor, SessionIdentity, SessionIdentityHolder};
pub use monitor::{
    ActivityEntry, ActivityLog, Monitor, MonitorContext, MonitorHandle, MonitorState, MonitorStatus,
    RunStateJournal, RunStateRecord,
};
pub use permission::{Asset, PermissionStore, SpendingPermission, NATIVE_ASSET_KEY};
pub use policy::{decide, DecisionReason, PolicyInput, TopUpDecision};
pub use relay::{BundlerRelay, ExecutionRelay, FeeParams, OperationRef, RelayError, SettlementRef};
pub use rpc::{JsonRpcClient, RpcError};
