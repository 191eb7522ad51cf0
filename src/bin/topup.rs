use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use auto_topup::cli::{Cli, Commands};
use auto_topup::config::{display_amount, parse_address, parse_positive_amount};
use auto_topup::{
    build_requests, grant_permissions, BalanceOracle, BundlerRelay, Config, Database, DurableStore,
    JsonRpcClient, Monitor, MonitorContext, MonitorSettings, PermissionStore, RpcLedgerReader,
    SessionIdentity, SessionIdentityHolder, TransferExecutor, TransferRequest, WalletRpcIssuer,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// The owner approves grants interactively in their wallet
const GRANT_TIMEOUT: Duration = Duration::from_secs(300);
const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Init { path } => {
            let target_path = path.unwrap_or_else(|| PathBuf::from("."));
            init_command(&target_path)?;
        }
        Commands::Identity => {
            identity_command(&config)?;
        }
        Commands::Grant => {
            grant_command(&config).await?;
        }
        Commands::Permission => {
            permission_command(&config)?;
        }
        Commands::Clear { session_key } => {
            clear_command(&config, session_key)?;
        }
        Commands::SetBot { address } => {
            set_bot_command(&config, &address)?;
        }
        Commands::Balances { bot } => {
            balances_command(&config, bot).await?;
        }
        Commands::Send { amount, bot } => {
            send_command(&config, amount, bot).await?;
        }
        Commands::Monitor { bot, drain_secs } => {
            monitor_command(&config, bot, Duration::from_secs(drain_secs)).await?;
        }
    }

    Ok(())
}

fn load_config(config_path: Option<&PathBuf>) -> Result<Config> {
    let mut config = if let Some(path) = config_path {
        Config::from_file(path)?
    } else {
        // Try default locations
        let default_paths = vec![PathBuf::from("topup.toml"), PathBuf::from(".topup.toml")];

        match default_paths.into_iter().find(|path| path.exists()) {
            Some(path) => Config::from_file(&path)?,
            None => Config::default_config(),
        }
    };
    config.expand_paths();
    Ok(config)
}

/// Store handles for one owner
struct Workspace {
    owner: Address,
    store: Arc<dyn DurableStore>,
    permissions: PermissionStore,
    identities: SessionIdentityHolder,
}

impl Workspace {
    fn open(config: &Config) -> Result<Self> {
        let owner = config.owner_address()?;
        if owner == Address::ZERO {
            bail!("owner.address is not set; edit the configuration file first");
        }

        let store: Arc<dyn DurableStore> = Arc::new(
            Database::new(&config.storage.database).context("Failed to open topup database")?,
        );

        Ok(Self {
            owner,
            permissions: PermissionStore::new(store.clone()),
            identities: SessionIdentityHolder::new(
                store.clone(),
                config.owner.chain_id,
                config.smart_account_params()?,
            ),
            store,
        })
    }

    fn identity(&self) -> Result<SessionIdentity> {
        self.identities
            .get_or_create(&self.owner)
            .context("Session identity unavailable")
    }

    /// Bot target: command line, then config, then the stored target
    fn bot(&self, config: &Config, arg: Option<String>) -> Result<String> {
        if let Some(bot) = arg.or_else(|| config.monitor.bot_address.clone()) {
            return Ok(bot);
        }
        match self.permissions.load_bot_address(&self.owner)? {
            Some(bot) => Ok(bot.to_string()),
            None => bail!("no bot address; pass --bot or run `topup set-bot <ADDRESS>`"),
        }
    }
}

fn oracle(config: &Config, settings: &MonitorSettings) -> BalanceOracle {
    BalanceOracle::new(
        Arc::new(RpcLedgerReader::new(config.network.rpc_url.clone())),
        settings.balance_timeout,
    )
}

fn executor(config: &Config, settings: &MonitorSettings) -> Result<TransferExecutor> {
    let client = JsonRpcClient::new(config.network.bundler_url.clone(), RELAY_TIMEOUT)?;
    let relay = BundlerRelay::new(
        client,
        parse_address(&config.network.entry_point, "network.entry_point")?,
        config.owner.chain_id,
        Duration::from_secs(config.monitor.settlement_poll_secs),
    );
    Ok(TransferExecutor::new(Arc::new(relay), settings.settlement_timeout))
}

fn init_command(path: &PathBuf) -> Result<()> {
    println!("Initializing Auto Top-Up in {:?}", path);

    std::fs::create_dir_all(path).context("Failed to create target directory")?;

    let mut config = Config::default_config();
    let config_path = path.join("topup.toml");
    config.to_file(&config_path)?;
    println!("Created configuration: {:?}", config_path);

    config.expand_paths();
    let db = Database::new(&config.storage.database)?;
    println!(
        "Initialized database: {:?} ({} records)",
        config.storage.database,
        db.record_count()?
    );

    println!("\nInitialization complete!");
    println!("\nNext steps:");
    println!("1. Set owner.address in topup.toml to the funding account");
    println!("2. Point network.wallet_rpc_url at the owner's wallet and run 'topup grant'");
    println!("3. Run 'topup set-bot <ADDRESS>' for the wallet to keep funded");
    println!("4. Run 'topup monitor'");

    Ok(())
}

fn identity_command(config: &Config) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let identity = workspace.identity()?;
    let descriptor = identity.descriptor();

    println!("Owner:          {}", descriptor.owner);
    println!("Chain:          {}", descriptor.chain_id);
    println!("Session signer: {}", descriptor.signer);
    println!("Smart account:  {}", descriptor.smart_account);

    Ok(())
}

async fn grant_command(config: &Config) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let identity = workspace.identity()?;
    let requests = build_requests(config, chrono::Utc::now().timestamp())?;

    let client = JsonRpcClient::new(config.network.wallet_rpc_url.clone(), GRANT_TIMEOUT)?;
    println!(
        "Requesting {} permission(s) for delegate {} via {} - approve in your wallet",
        requests.len(),
        identity.smart_account(),
        client.url()
    );

    let issuer = WalletRpcIssuer::new(client, config.owner.chain_id);
    let granted =
        grant_permissions(&issuer, &workspace.permissions, &workspace.owner, &identity, &requests).await?;

    for (asset_key, permission) in granted {
        println!("✓ Granted {} permission ({})", asset_key, permission.asset);
    }

    Ok(())
}

fn permission_command(config: &Config) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let keys = workspace.permissions.asset_keys(&workspace.owner)?;
    let now = chrono::Utc::now().timestamp();

    if keys.is_empty() {
        println!("No permissions granted. Run 'topup grant'.");
    }

    for key in keys {
        let Some(permission) = workspace.permissions.load(&workspace.owner, &key)? else {
            continue;
        };
        let decimals = if permission.asset.is_native() { 18 } else { config.asset.decimals };
        let expiry = chrono::DateTime::from_timestamp(permission.expiry, 0)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| permission.expiry.to_string());

        println!("{}:", key);
        println!("  Asset:     {}", permission.asset);
        println!(
            "  Budget:    {} per {}s",
            display_amount(permission.period_amount, decimals),
            permission.period_duration_secs
        );
        println!("  Expires:   {}{}", expiry, if permission.is_expired_at(now) { " (expired)" } else { "" });
        println!("  Delegate:  {}", permission.delegate);
        println!("  Usable:    {}", permission.is_well_formed());
    }

    match workspace.permissions.load_bot_address(&workspace.owner)? {
        Some(bot) => println!("Bot target: {}", bot),
        None => println!("Bot target: not set"),
    }

    Ok(())
}

fn clear_command(config: &Config, session_key: bool) -> Result<()> {
    let workspace = Workspace::open(config)?;
    workspace.permissions.clear(&workspace.owner)?;
    println!("✓ Cleared permissions and bot target for {}", workspace.owner);

    if session_key {
        workspace.identities.clear(&workspace.owner)?;
        println!("✓ Discarded session key; run 'topup grant' again before monitoring");
    }

    Ok(())
}

fn set_bot_command(config: &Config, address: &str) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let bot = parse_address(address, "bot address")?;
    if bot == Address::ZERO {
        bail!("bot address must not be the zero address");
    }

    workspace.permissions.save_bot_address(&workspace.owner, &bot)?;
    println!("✓ Bot target set to {}", bot);

    Ok(())
}

async fn balances_command(config: &Config, bot: Option<String>) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let settings = MonitorSettings::resolve(config, &workspace.bot(config, bot)?)?;
    let asset = config.asset()?;

    let balances = oracle(config, &settings)
        .read_pair(&asset, settings.bot, workspace.owner)
        .await?;

    let symbol = &config.asset.symbol;
    let decimals = config.asset.decimals;
    println!("Bot {}:    {} {}", settings.bot, display_amount(balances.bot, decimals), symbol);
    println!("Funder {}: {} {}", workspace.owner, display_amount(balances.funder, decimals), symbol);
    println!("Threshold: {} {}", display_amount(settings.threshold, decimals), symbol);

    Ok(())
}

async fn send_command(config: &Config, amount: Option<String>, bot: Option<String>) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let settings = MonitorSettings::resolve(config, &workspace.bot(config, bot)?)?;
    let identity = workspace.identity()?;
    let asset = config.asset()?;
    let permission = workspace.permissions.load(&workspace.owner, &config.asset.key)?;

    let amount = match amount {
        Some(raw) => parse_positive_amount(&raw, config.asset.decimals, "--amount")?,
        None => settings.top_up_amount,
    };

    println!(
        "Sending {} {} to {}...",
        display_amount(amount, config.asset.decimals),
        config.asset.symbol,
        settings.bot
    );

    let request = TransferRequest {
        to: settings.bot,
        amount,
        asset,
    };
    match executor(config, &settings)?
        .execute(&identity, permission.as_ref(), &request)
        .await
    {
        Ok(receipt) => {
            println!("✓ Settled in {}", receipt.settlement);
            println!("  Operation: {}", receipt.operation);
        }
        Err(e) if e.needs_regrant() => bail!("{e}; run 'topup grant' to re-grant"),
        Err(e) if e.is_unknown_outcome() => {
            bail!("{e}; check the bot balance before sending again")
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

async fn monitor_command(config: &Config, bot: Option<String>, drain: Duration) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let settings = MonitorSettings::resolve(config, &workspace.bot(config, bot)?)?;
    let identity = workspace.identity()?;
    if workspace.permissions.load(&workspace.owner, &config.asset.key)?.is_none() {
        warn!(asset = %config.asset.key, "no permission stored; top-ups fail until 'topup grant'");
    }

    let ctx = MonitorContext {
        owner: workspace.owner,
        identity,
        permissions: workspace.permissions.clone(),
        asset_key: config.asset.key.clone(),
        asset: config.asset()?,
        symbol: config.asset.symbol.clone(),
        decimals: config.asset.decimals,
        oracle: oracle(config, &settings),
        executor: executor(config, &settings)?,
        settings,
        store: Some(workspace.store.clone()),
    };

    let handle = Monitor::start(ctx).context("Failed to start monitor")?;
    println!("Monitoring... press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    if let Some(pending) = handle.stop().await? {
        info!(drain = ?drain, "waiting for in-flight transfer");
        if tokio::time::timeout(drain, pending).await.is_err() {
            warn!("transfer still in flight at exit; it will be reconciled on the next start");
        }
    }

    Ok(())
}
