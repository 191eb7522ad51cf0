use alloy::primitives::utils::{format_units, parse_units};
use alloy::primitives::{Address, B256, U256};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::permission::Asset;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub owner: OwnerConfig,
    pub network: NetworkConfig,
    pub asset: AssetConfig,
    pub monitor: MonitorConfig,
    pub grant: GrantConfig,
    pub storage: StorageConfig,
    pub smart_account: SmartAccountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerConfig {
    /// Human-controlled account that grants spending authority
    pub address: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    pub rpc_url: String,
    pub bundler_url: String,
    pub wallet_rpc_url: String,
    pub entry_point: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum AssetKind {
    Native,
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetConfig {
    pub kind: AssetKind,
    #[serde(default)]
    pub token_address: Option<String>,
    pub symbol: String,
    pub decimals: u8,
    /// Key the permission for this asset is stored under
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default)]
    pub bot_address: Option<String>,
    /// Trigger threshold in whole asset units (e.g. "1.5")
    pub threshold: String,
    /// Fixed amount sent per top-up, in whole asset units
    pub top_up_amount: String,
    pub tick_interval_secs: u64,
    pub cooldown_secs: u64,
    pub balance_timeout_secs: u64,
    pub settlement_timeout_secs: u64,
    pub settlement_poll_secs: u64,
    pub log_capacity: usize,
    #[serde(default = "default_true")]
    pub persist_run_state: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrantConfig {
    /// Per-period budget for the native asset, in whole units
    pub native_period_amount: String,
    /// Per-period budget for the token asset, in whole units
    pub token_period_amount: String,
    pub period_duration_secs: u64,
    pub expiry_days: u64,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmartAccountConfig {
    pub factory: String,
    pub init_code_hash: String,
    pub deploy_salt: String,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config TOML")
    }

    /// Create a default configuration (Sepolia, USDC)
    pub fn default_config() -> Self {
        Config {
            owner: OwnerConfig {
                address: "0x0000000000000000000000000000000000000000".to_string(),
                chain_id: 11155111,
            },
            network: NetworkConfig {
                rpc_url: "https://ethereum-sepolia-rpc.publicnode.com".to_string(),
                bundler_url: "https://api.pimlico.io/v2/11155111/rpc".to_string(),
                wallet_rpc_url: "http://127.0.0.1:8545".to_string(),
                entry_point: "0x0000000071727De22E5E9d8BAf0edAc6f37da032".to_string(),
            },
            asset: AssetConfig {
                kind: AssetKind::Token,
                token_address: Some("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238".to_string()),
                symbol: "USDC".to_string(),
                decimals: 6,
                key: "usdc".to_string(),
            },
            monitor: MonitorConfig {
                bot_address: None,
                threshold: "1".to_string(),
                top_up_amount: "1".to_string(),
                tick_interval_secs: 3,
                cooldown_secs: 30,
                balance_timeout_secs: 5,
                settlement_timeout_secs: 120,
                settlement_poll_secs: 2,
                log_capacity: 10,
                persist_run_state: true,
            },
            grant: GrantConfig {
                native_period_amount: "0.1".to_string(),
                token_period_amount: "100".to_string(),
                period_duration_secs: 86_400,
                expiry_days: 30,
                justification: "Bot wallet top-ups".to_string(),
            },
            storage: StorageConfig {
                database: PathBuf::from("~/.auto-topup/topup.db"),
            },
            smart_account: SmartAccountConfig {
                factory: "0x69Aa2f9fe1572F1B640E1bbc512f5c3a734fc77c".to_string(),
                init_code_hash: "0x0000000000000000000000000000000000000000000000000000000000000000"
                    .to_string(),
                deploy_salt: "0x".to_string(),
            },
        }
    }

    /// Write configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config to TOML")?;
        std::fs::write(path.as_ref(), contents)
            .context("Failed to write config file")?;
        Ok(())
    }

    /// Expand tilde in paths to home directory
    pub fn expand_paths(&mut self) {
        if let Some(home) = dirs::home_dir() {
            self.storage.database = expand_tilde(&self.storage.database, &home);
        }
    }

    pub fn owner_address(&self) -> Result<Address> {
        parse_address(&self.owner.address, "owner.address")
    }

    /// Resolve the configured asset into its tagged form
    pub fn asset(&self) -> Result<Asset> {
        match self.asset.kind {
            AssetKind::Native => Ok(Asset::Native),
            AssetKind::Token => {
                let raw = self
                    .asset
                    .token_address
                    .as_deref()
                    .context("asset.token_address is required for token assets")?;
                Ok(Asset::Token(parse_address(raw, "asset.token_address")?))
            }
        }
    }

    pub fn smart_account_params(&self) -> Result<SmartAccountParams> {
        let factory = parse_address(&self.smart_account.factory, "smart_account.factory")?;
        let init_code_hash: B256 = self
            .smart_account
            .init_code_hash
            .parse()
            .context("smart_account.init_code_hash must be a 32-byte hex value")?;
        let deploy_salt = hex::decode(self.smart_account.deploy_salt.trim_start_matches("0x"))
            .context("smart_account.deploy_salt must be hex")?;

        Ok(SmartAccountParams {
            factory,
            init_code_hash,
            deploy_salt,
        })
    }
}

/// Inputs to the counterfactual smart-account address derivation
#[derive(Debug, Clone, PartialEq)]
pub struct SmartAccountParams {
    pub factory: Address,
    pub init_code_hash: B256,
    pub deploy_salt: Vec<u8>,
}

/// Validated monitor configuration for one (owner, bot) pair.
///
/// Everything the loop consumes goes through `resolve`, so malformed input
/// never reaches the decision logic.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub bot: Address,
    pub threshold: U256,
    pub top_up_amount: U256,
    pub tick_interval: Duration,
    pub cooldown: Duration,
    pub balance_timeout: Duration,
    pub settlement_timeout: Duration,
    pub log_capacity: usize,
    pub persist_run_state: bool,
}

impl MonitorSettings {
    pub fn resolve(config: &Config, bot: &str) -> Result<Self> {
        let bot = parse_address(bot, "bot address")?;
        let decimals = config.asset.decimals;
        let threshold = parse_amount(&config.monitor.threshold, decimals, "monitor.threshold")?;
        let top_up_amount = parse_amount(&config.monitor.top_up_amount, decimals, "monitor.top_up_amount")?;

        let settings = Self {
            bot,
            threshold,
            top_up_amount,
            tick_interval: Duration::from_secs(config.monitor.tick_interval_secs),
            cooldown: Duration::from_secs(config.monitor.cooldown_secs),
            balance_timeout: Duration::from_secs(config.monitor.balance_timeout_secs.max(1)),
            settlement_timeout: Duration::from_secs(config.monitor.settlement_timeout_secs.max(1)),
            log_capacity: config.monitor.log_capacity,
            persist_run_state: config.monitor.persist_run_state,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Checks shared by `resolve` and live updates to a running monitor
    pub fn validate(&self) -> Result<()> {
        if self.bot == Address::ZERO {
            bail!("bot address must not be the zero address");
        }
        if self.threshold.is_zero() {
            bail!("monitor.threshold must be greater than zero");
        }
        if self.top_up_amount.is_zero() {
            bail!("monitor.top_up_amount must be greater than zero");
        }
        if self.tick_interval.is_zero() {
            bail!("monitor.tick_interval_secs must be at least 1");
        }
        if self.log_capacity == 0 {
            bail!("monitor.log_capacity must be at least 1");
        }
        Ok(())
    }
}

pub fn parse_address(raw: &str, field: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .with_context(|| format!("{field} must be a valid 0x-prefixed address, got `{raw}`"))
}

/// Parse a decimal amount in whole units into the asset's smallest unit
pub fn parse_amount(raw: &str, decimals: u8, field: &str) -> Result<U256> {
    let parsed = parse_units(raw.trim(), decimals)
        .with_context(|| format!("{field} must be a decimal amount, got `{raw}`"))?;
    if parsed.is_negative() {
        bail!("{field} must not be negative, got `{raw}`");
    }
    Ok(parsed.get_absolute())
}

pub fn parse_positive_amount(raw: &str, decimals: u8, field: &str) -> Result<U256> {
    let amount = parse_amount(raw, decimals, field)?;
    if amount.is_zero() {
        bail!("{field} must be greater than zero");
    }
    Ok(amount)
}

/// Render a smallest-unit amount in whole units, without trailing zeros
pub fn display_amount(amount: U256, decimals: u8) -> String {
    match format_units(amount, decimals) {
        Ok(formatted) if formatted.contains('.') => formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string(),
        Ok(formatted) => formatted,
        Err(_) => amount.to_string(),
    }
}

fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        home.join(stripped)
    } else {
        path.to_path_buf()
    }
}
