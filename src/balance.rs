//! Ledger reads: single-asset balances for the bot and the funding account.

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::sol;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::permission::Asset;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// Reads balances in the asset's smallest unit
#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn read_balance(&self, asset: &Asset, holder: Address) -> Result<U256>;
}

/// Ledger reader backed by a plain JSON-RPC node
pub struct RpcLedgerReader {
    rpc_url: String,
}

impl RpcLedgerReader {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
        }
    }
}

#[async_trait]
impl LedgerReader for RpcLedgerReader {
    async fn read_balance(&self, asset: &Asset, holder: Address) -> Result<U256> {
        let rpc_url = self
            .rpc_url
            .parse()
            .map_err(|e| anyhow!("Invalid RPC URL: {}", e))?;
        let provider = ProviderBuilder::new().connect_http(rpc_url);

        match asset {
            Asset::Native => provider
                .get_balance(holder)
                .await
                .context("Failed to get native balance"),
            Asset::Token(token) => {
                let contract = IERC20::new(*token, provider);
                contract
                    .balanceOf(holder)
                    .call()
                    .await
                    .context("Failed to get token balance")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balances {
    pub bot: U256,
    pub funder: U256,
}

/// Bounded-time balance reads for one monitored pair
#[derive(Clone)]
pub struct BalanceOracle {
    reader: Arc<dyn LedgerReader>,
    timeout: Duration,
}

impl BalanceOracle {
    pub fn new(reader: Arc<dyn LedgerReader>, timeout: Duration) -> Self {
        Self { reader, timeout }
    }

    pub async fn read(&self, asset: &Asset, holder: Address) -> Result<U256> {
        tokio::time::timeout(self.timeout, self.reader.read_balance(asset, holder))
            .await
            .map_err(|_| anyhow!("balance read for {holder} timed out after {:?}", self.timeout))?
    }

    /// Read bot and funder balances concurrently; either failing fails the pair
    pub async fn read_pair(&self, asset: &Asset, bot: Address, funder: Address) -> Result<Balances> {
        let (bot, funder) = tokio::try_join!(self.read(asset, bot), self.read(asset, funder))?;
        Ok(Balances { bot, funder })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedLedger {
        balances: Mutex<HashMap<Address, U256>>,
    }

    #[async_trait]
    impl LedgerReader for FixedLedger {
        async fn read_balance(&self, _asset: &Asset, holder: Address) -> Result<U256> {
            self.balances
                .lock()
                .unwrap()
                .get(&holder)
                .copied()
                .ok_or_else(|| anyhow!("unknown holder {holder}"))
        }
    }

    struct StalledLedger;

    #[async_trait]
    impl LedgerReader for StalledLedger {
        async fn read_balance(&self, _asset: &Asset, _holder: Address) -> Result<U256> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(U256::ZERO)
        }
    }

    fn bot() -> Address {
        "0x1111111111111111111111111111111111111111".parse().unwrap()
    }

    fn funder() -> Address {
        "0x8ba1f109551bD432803012645Ac136ddd64DBA72".parse().unwrap()
    }

    #[tokio::test]
    async fn test_read_pair() {
        let ledger = FixedLedger {
            balances: Mutex::new(HashMap::from([
                (bot(), U256::from(500_000u64)),
                (funder(), U256::from(42_000_000u64)),
            ])),
        };
        let oracle = BalanceOracle::new(Arc::new(ledger), Duration::from_secs(5));

        let balances = oracle.read_pair(&Asset::Native, bot(), funder()).await.unwrap();
        assert_eq!(balances.bot, U256::from(500_000u64));
        assert_eq!(balances.funder, U256::from(42_000_000u64));
    }

    #[tokio::test]
    async fn test_read_pair_fails_if_either_side_fails() {
        let ledger = FixedLedger {
            balances: Mutex::new(HashMap::from([(bot(), U256::from(1u64))])),
        };
        let oracle = BalanceOracle::new(Arc::new(ledger), Duration::from_secs(5));

        assert!(oracle.read_pair(&Asset::Native, bot(), funder()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let oracle = BalanceOracle::new(Arc::new(StalledLedger), Duration::from_secs(5));

        let err = oracle.read(&Asset::Native, bot()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_transfer_call_encoding() {
        use alloy::sol_types::SolCall;

        let call = IERC20::transferCall {
            to: bot(),
            amount: U256::from(1_000_000u64),
        };
        let data = call.abi_encode();
        // transfer(address,uint256)
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data.len(), 4 + 32 + 32);
    }
}
