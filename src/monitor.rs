//! Monitoring loop for one (owner, bot) pair.
//!
//! A single task owns the run state and drives ticks off a fixed interval.
//! Transfers run in their own task so ticks keep refreshing balances while a
//! transfer settles; the in-flight flag is only touched by the loop task, so
//! a tick can never start a second transfer. Settings and the stored
//! permission are re-read while running, so owner edits and re-grants apply
//! without a restart.

use alloy::primitives::{Address, U256};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::balance::{BalanceOracle, Balances};
use crate::config::{display_amount, MonitorSettings};
use crate::db::{store_key, DurableStore, StoreError};
use crate::executor::{TransferError, TransferExecutor, TransferReceipt, TransferRequest};
use crate::identity::SessionIdentity;
use crate::permission::{Asset, PermissionStore};
use crate::policy::{decide, PolicyInput};

const RUN_STATE_NAMESPACE: &str = "topup_monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    Stopped,
    Idle,
    TransferPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Bounded, most-recent-first log of user-visible events
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.entries.push_front(ActivityEntry {
            at: Utc::now(),
            message: message.into(),
        });
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|entry| entry.message.contains(needle))
    }
}

pub type SharedActivityLog = Arc<Mutex<ActivityLog>>;

fn append(log: &SharedActivityLog, message: impl Into<String>) {
    let message = message.into();
    info!(target: "activity", "{message}");
    match log.lock() {
        Ok(mut log) => log.push(message),
        Err(poisoned) => poisoned.into_inner().push(message),
    }
}

/// Snapshot published on every tick and state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub bot: Address,
    pub bot_balance: Option<U256>,
    pub funder_balance: Option<U256>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_top_up: Option<DateTime<Utc>>,
}

/// Everything one monitored pair needs. Built once, owned by the loop.
pub struct MonitorContext {
    pub owner: Address,
    pub identity: SessionIdentity,
    /// Looked up under `asset_key` at every trigger
    pub permissions: PermissionStore,
    pub asset_key: String,
    pub asset: Asset,
    pub symbol: String,
    pub decimals: u8,
    /// Starting settings. Timeouts are fixed into `oracle` and `executor`;
    /// the rest can be replaced through `MonitorHandle::update_settings`.
    pub settings: MonitorSettings,
    pub oracle: BalanceOracle,
    pub executor: TransferExecutor,
    /// Run-state journal backing; ignored unless `settings.persist_run_state`
    pub store: Option<Arc<dyn DurableStore>>,
}

impl MonitorContext {
    fn amount(&self, amount: U256) -> String {
        display_amount(amount, self.decimals)
    }

    fn journal(&self, settings: &MonitorSettings) -> Option<RunStateJournal> {
        match (&self.store, settings.persist_run_state) {
            (Some(store), true) => Some(RunStateJournal::new(store.clone(), &self.owner, &settings.bot)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStateRecord {
    /// Wall-clock time of the last top-up, unix milliseconds
    pub last_top_up_ms: Option<i64>,
    pub in_flight: bool,
}

/// Durable copy of the loop's cooldown and in-flight state
#[derive(Clone)]
pub struct RunStateJournal {
    store: Arc<dyn DurableStore>,
    key: String,
}

impl RunStateJournal {
    pub fn new(store: Arc<dyn DurableStore>, owner: &Address, bot: &Address) -> Self {
        let bot = bot.to_string().to_lowercase();
        Self {
            store,
            key: store_key(RUN_STATE_NAMESPACE, owner, Some(&bot)),
        }
    }

    pub fn load(&self) -> Result<Option<RunStateRecord>, StoreError> {
        match self.store.get(&self.key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: self.key.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn save(&self, record: &RunStateRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            key: self.key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&self.key, &raw)
    }
}

/// Sent by a transfer task once its outcome has been logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferOutcome {
    Settled,
    Failed,
    /// Submitted but never observed settling; it may still land
    Unknown,
}

impl TransferOutcome {
    fn of(result: &Result<TransferReceipt, TransferError>) -> Self {
        match result {
            Ok(_) => TransferOutcome::Settled,
            Err(e) if e.is_unknown_outcome() => TransferOutcome::Unknown,
            Err(_) => TransferOutcome::Failed,
        }
    }
}

pub struct Monitor;

impl Monitor {
    /// Start the loop. Fails only if the persisted run state cannot be read.
    pub fn start(ctx: MonitorContext) -> Result<MonitorHandle, StoreError> {
        let settings = ctx.settings.clone();
        let log: SharedActivityLog = Arc::new(Mutex::new(ActivityLog::new(settings.log_capacity)));
        let journal = ctx.journal(&settings);

        let restored = match &journal {
            Some(journal) => journal.load()?,
            None => None,
        };

        append(&log, "Monitoring started");
        info!(
            owner = %ctx.owner,
            bot = %settings.bot,
            asset = %ctx.asset,
            tick = ?settings.tick_interval,
            "monitor starting"
        );

        let (status_tx, status_rx) = watch::channel(MonitorStatus {
            state: MonitorState::Idle,
            bot: settings.bot,
            bot_balance: None,
            funder_balance: None,
            last_checked: None,
            last_top_up: None,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let (settings_tx, settings_rx) = watch::channel(settings.clone());

        let mut run = MonitorLoop {
            ctx: Arc::new(ctx),
            settings,
            log: log.clone(),
            journal,
            status: status_tx,
            settled: settled_tx,
            in_flight: false,
            last_top_up: None,
            last_top_up_wall: None,
            pending: None,
        };
        if let Some(record) = restored {
            run.restore(record);
        }

        let task = tokio::spawn(run.run(shutdown_rx, settled_rx, settings_rx));

        Ok(MonitorHandle {
            shutdown: shutdown_tx,
            settings: settings_tx,
            task,
            log,
            status: status_rx,
        })
    }
}

pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    settings: watch::Sender<MonitorSettings>,
    task: JoinHandle<Option<JoinHandle<()>>>,
    log: SharedActivityLog,
    status: watch::Receiver<MonitorStatus>,
}

impl MonitorHandle {
    pub fn status(&self) -> MonitorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status.clone()
    }

    pub fn activity_log(&self) -> SharedActivityLog {
        self.log.clone()
    }

    /// Copy of the current log, most recent first
    pub fn log(&self) -> Vec<ActivityEntry> {
        match self.log.lock() {
            Ok(log) => log.entries().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().entries().cloned().collect(),
        }
    }

    /// Replace bot, threshold, top-up amount, cooldown or tick interval.
    /// Applied before the next tick.
    pub fn update_settings(&self, settings: MonitorSettings) -> Result<()> {
        settings.validate()?;
        self.settings
            .send(settings)
            .map_err(|_| anyhow!("monitor is no longer running"))
    }

    /// Stop ticking. A transfer already in flight keeps running; its task is
    /// returned so the caller can decide how long to wait for it.
    pub async fn stop(self) -> Result<Option<JoinHandle<()>>> {
        let _ = self.shutdown.send(true);
        self.task.await.context("Monitor task panicked")
    }
}

struct MonitorLoop {
    ctx: Arc<MonitorContext>,
    settings: MonitorSettings,
    log: SharedActivityLog,
    journal: Option<RunStateJournal>,
    status: watch::Sender<MonitorStatus>,
    settled: mpsc::UnboundedSender<TransferOutcome>,
    in_flight: bool,
    last_top_up: Option<Instant>,
    last_top_up_wall: Option<DateTime<Utc>>,
    pending: Option<JoinHandle<()>>,
}

impl MonitorLoop {
    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut settled: mpsc::UnboundedReceiver<TransferOutcome>,
        mut updates: watch::Receiver<MonitorSettings>,
    ) -> Option<JoinHandle<()>> {
        let mut ticker = new_ticker(self.settings.tick_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(outcome) = settled.recv() => self.on_settled(outcome),
                Ok(()) = updates.changed() => {
                    let next = updates.borrow_and_update().clone();
                    if next.tick_interval != self.settings.tick_interval {
                        ticker = new_ticker(next.tick_interval);
                    }
                    self.apply_settings(next);
                }
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.set_state(MonitorState::Stopped);
        append(&self.log, "Monitoring paused");
        info!(bot = %self.settings.bot, in_flight = self.in_flight, "monitor stopped");
        self.pending.take()
    }

    /// Rebuild cooldown state from the journal. A transfer that was in flight
    /// when the previous process exited has an unknown outcome; the next tick
    /// reconciles it by reading balances.
    fn restore(&mut self, record: RunStateRecord) {
        if let Some(at) = record.last_top_up_ms.and_then(DateTime::<Utc>::from_timestamp_millis) {
            let elapsed = (Utc::now() - at).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.settings.cooldown {
                let now = Instant::now();
                self.last_top_up = Some(now.checked_sub(elapsed).unwrap_or(now));
            }
            self.last_top_up_wall = Some(at);
            self.status.send_modify(|status| status.last_top_up = Some(at));
        }

        if record.in_flight {
            warn!(bot = %self.settings.bot, "previous run ended with a transfer in flight");
            append(&self.log, "Top-up outcome unknown - reconciling via balance read");
            self.journal_state(false);
        }
    }

    fn apply_settings(&mut self, next: MonitorSettings) {
        if next.bot != self.settings.bot {
            info!(from = %self.settings.bot, to = %next.bot, "bot target changed");
            self.status.send_modify(|status| {
                status.bot = next.bot;
                status.bot_balance = None;
                status.funder_balance = None;
            });
        }
        debug!(
            threshold = %next.threshold,
            top_up = %next.top_up_amount,
            cooldown = ?next.cooldown,
            "monitor settings updated"
        );
        self.journal = self.ctx.journal(&next);
        self.settings = next;
    }

    async fn tick(&mut self) {
        // Snapshot before any await; only this task flips it
        let in_flight = self.in_flight;
        let ctx = self.ctx.clone();
        let settings = self.settings.clone();

        debug!(bot = %settings.bot, "Checking balances...");
        let balances = match ctx
            .oracle
            .read_pair(&ctx.asset, settings.bot, ctx.owner)
            .await
        {
            Ok(balances) => balances,
            Err(e) => {
                warn!(error = %e, "balance read failed");
                append(&self.log, "Error checking balances");
                return;
            }
        };
        self.publish_balances(&balances);

        let decision = decide(&PolicyInput {
            current_balance: balances.bot,
            threshold: settings.threshold,
            top_up_amount: settings.top_up_amount,
            now: Instant::now(),
            last_top_up: self.last_top_up,
            cooldown: settings.cooldown,
            in_flight,
        });

        if !decision.trigger {
            debug!(reason = ?decision.reason, balance = %balances.bot, "no top-up");
            return;
        }

        self.begin_transfer(decision.amount);
    }

    fn begin_transfer(&mut self, amount: U256) {
        let ctx = self.ctx.clone();

        // Recorded before the transfer is awaited anywhere
        self.in_flight = true;
        self.last_top_up = Some(Instant::now());
        let wall = Utc::now();
        self.last_top_up_wall = Some(wall);
        self.journal_state(true);
        self.status.send_modify(|status| {
            status.state = MonitorState::TransferPending;
            status.last_top_up = Some(wall);
        });

        append(
            &self.log,
            format!(
                "Bot {sym} low! Topping up {amt} {sym}...",
                sym = ctx.symbol,
                amt = ctx.amount(amount)
            ),
        );

        let log = self.log.clone();
        let journal = self.journal.clone();
        let settled = self.settled.clone();
        let request = TransferRequest {
            to: self.settings.bot,
            amount,
            asset: ctx.asset,
        };

        let transfer = tokio::spawn(run_transfer(ctx, request, wall, log.clone(), journal));
        self.pending = Some(tokio::spawn(async move {
            // A panicked transfer still has to release the in-flight flag
            let outcome = match transfer.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "transfer task aborted");
                    append(&log, "Top-up failed: transfer task aborted");
                    TransferOutcome::Unknown
                }
            };
            let _ = settled.send(outcome);
        }));
    }

    fn on_settled(&mut self, outcome: TransferOutcome) {
        debug!(outcome = ?outcome, "transfer settled");
        self.in_flight = false;
        self.pending = None;

        if outcome == TransferOutcome::Unknown {
            // The operation may still land; no new transfer for a full cooldown from now
            self.last_top_up = Some(Instant::now());
            let wall = Utc::now();
            self.last_top_up_wall = Some(wall);
            self.status.send_modify(|status| status.last_top_up = Some(wall));
            self.journal_state(false);
        }

        self.set_state(MonitorState::Idle);
    }

    fn publish_balances(&self, balances: &Balances) {
        let checked = Utc::now();
        self.status.send_modify(|status| {
            status.bot_balance = Some(balances.bot);
            status.funder_balance = Some(balances.funder);
            status.last_checked = Some(checked);
        });
    }

    fn set_state(&self, state: MonitorState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn journal_state(&self, in_flight: bool) {
        let Some(journal) = &self.journal else {
            return;
        };
        let record = RunStateRecord {
            last_top_up_ms: self.last_top_up_wall.map(|at| at.timestamp_millis()),
            in_flight,
        };
        if let Err(e) = journal.save(&record) {
            warn!(error = %e, "failed to journal run state");
        }
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_transfer(
    ctx: Arc<MonitorContext>,
    request: TransferRequest,
    wall: DateTime<Utc>,
    log: SharedActivityLog,
    journal: Option<RunStateJournal>,
) -> TransferOutcome {
    let result = match ctx.permissions.load(&ctx.owner, &ctx.asset_key) {
        Ok(permission) => {
            ctx.executor
                .execute(&ctx.identity, permission.as_ref(), &request)
                .await
        }
        Err(e) => Err(TransferError::InvalidPermission(format!(
            "stored permission unreadable: {e}"
        ))),
    };
    let outcome = TransferOutcome::of(&result);
    report_outcome(&log, &ctx.symbol, result);

    if let Some(journal) = journal {
        let record = RunStateRecord {
            last_top_up_ms: Some(wall.timestamp_millis()),
            in_flight: false,
        };
        if let Err(e) = journal.save(&record) {
            warn!(error = %e, "failed to journal settled transfer");
        }
    }

    outcome
}

fn report_outcome(log: &SharedActivityLog, symbol: &str, result: Result<TransferReceipt, TransferError>) {
    match result {
        Ok(receipt) => {
            let tx = receipt.settlement.to_string();
            info!(operation = %receipt.operation, tx = %tx, "top-up settled");
            append(
                log,
                format!("{symbol} topped up! Tx: {}...", tx.get(..10).unwrap_or(&tx)),
            );
        }
        Err(e) if e.needs_regrant() => {
            error!(error = %e, "top-up rejected by permission");
            append(log, "Permission error - please re-grant");
        }
        Err(TransferError::InsufficientFunds(detail)) => {
            error!(detail = %detail, "top-up rejected for funds");
            append(log, "Insufficient balance");
        }
        Err(e) if e.is_unknown_outcome() => {
            warn!(error = %e, "top-up outcome unknown");
            append(log, "Top-up outcome unknown - reconciling via balance read");
        }
        Err(e) => {
            if e.is_retryable() {
                warn!(error = %e, "top-up not submitted; next qualifying tick retries");
            } else {
                error!(error = %e, "top-up failed");
            }
            append(log, format!("Top-up failed: {e}"));
        }
    }
}
