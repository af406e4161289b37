//! Grid Trading Engine
//!
//! Owns the active grid configuration, the in-memory pending-buy map and the
//! monitor task, and drives every order placement and fill processing step:
//! 1. Start-up placement of the buy ladder below the market price
//! 2. Monitor loop: sell-fill sweep, buy-fill sweep, empty-grid refill
//! 3. Periodic self-healing reconciliation against exchange balances
//! 4. Crash recovery from the contract ledger and live exchange state
//!
//! Concurrency model: one tokio mutex serializes every check-then-write
//! (buy fill, sell fill, atomic placement) against the ledger and the
//! pending-buy map. The monitor observes the shutdown flag between phases,
//! so in-flight RPCs drain before the task exits.

pub mod grid;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{Ledger, LedgerError};
use crate::exchange::{ExchangeApi, ExchangeError, OrderSide, OrderState};
use crate::metrics::names;
use crate::models::{Contract, NewContract, NewTrade, TradeKind};
use crate::notify::Notification;

use self::grid::{any_price_matches, GridConfig, GridConfigError};

pub const LAST_GRID_CONFIG_KEY: &str = "last_grid_config";

const MONITOR_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const RECONCILE_EVERY_TICKS: u64 = 30;
const RECENT_FILL_SCAN_LIMIT: u32 = 20;
const RESCUE_SCAN_LIMIT: u32 = 50;

/// Fraction of one grid amount the balance gap must reach before a rescue
/// scan runs; tolerates fee-induced fractional slippage.
fn rescue_gap_factor() -> Decimal {
    Decimal::new(9, 1)
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not idle")]
    NotIdle,

    #[error("engine has not completed recovery")]
    NotRecovered,

    #[error("engine has no grid configuration")]
    NotConfigured,

    #[error("no market price available for {0}")]
    NoPrice(String),

    #[error("invalid grid configuration: {0}")]
    Config(#[from] GridConfigError),

    #[error("config serialization: {0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub closed: usize,
    pub repaired: usize,
    pub adopted_pending: usize,
}

/// Point-in-time view for the operator console.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub lifecycle: Lifecycle,
    pub config: Option<GridConfig>,
    pub pending: Vec<(String, Decimal)>,
    pub latest_price: Option<Decimal>,
}

impl EngineSnapshot {
    pub fn running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }
}

struct MonitorHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

struct EngineInner {
    lifecycle: Lifecycle,
    recovered: bool,
    config: Option<GridConfig>,
    /// Live buy orders we placed that have not filled, keyed by exchange
    /// order id, valued with the quoted grid price.
    pending_buys: HashMap<String, Decimal>,
    monitor: Option<MonitorHandle>,
    price_rx: Option<watch::Receiver<Option<Decimal>>>,
}

pub struct GridEngine {
    exchange: Arc<dyn ExchangeApi>,
    ledger: Ledger,
    inner: Mutex<EngineInner>,
    notify_tx: broadcast::Sender<Notification>,
}

impl GridEngine {
    pub fn new(exchange: Arc<dyn ExchangeApi>, ledger: Ledger) -> Self {
        let (notify_tx, _) = broadcast::channel(256);
        Self {
            exchange,
            ledger,
            inner: Mutex::new(EngineInner {
                lifecycle: Lifecycle::Idle,
                recovered: false,
                config: None,
                pending_buys: HashMap::new(),
                monitor: None,
                price_rx: None,
            }),
            notify_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    fn notify(&self, notification: Notification) {
        if let Err(e) = self.notify_tx.send(notification) {
            debug!("No subscribers for notification: {}", e);
        }
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let inner = self.inner.lock().await;
        let latest_price = inner
            .price_rx
            .as_ref()
            .and_then(|rx| *rx.borrow());
        EngineSnapshot {
            lifecycle: inner.lifecycle,
            config: inner.config.clone(),
            pending: inner
                .pending_buys
                .iter()
                .map(|(id, price)| (id.clone(), *price))
                .collect(),
            latest_price,
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rebuild logical state from the ledger and the exchange. Must run once
    /// before the engine accepts `start`; it does not enter `Running`.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut inner = self.inner.lock().await;
        let mut report = RecoveryReport::default();

        info!("Starting state recovery");

        // 1. Settle or repair the sell leg of every active contract.
        let active = self.ledger.list_active().await?;
        info!("Found {} active contract(s) in the ledger", active.len());

        for contract in &active {
            match contract.current_order_id.as_deref() {
                // The sell leg was never posted (or a crash hit before the
                // sell id was recorded); post it now.
                None => {
                    self.repair_sell_order(contract).await?;
                    report.repaired += 1;
                }
                Some(id) if id == contract.buy_order_id => {
                    self.repair_sell_order(contract).await?;
                    report.repaired += 1;
                }
                Some(id) => match self.exchange.order_status(id).await? {
                    None => warn!(
                        "Sell order {} of contract {} not found on exchange",
                        id, contract.id
                    ),
                    Some(status) => match status.state {
                        OrderState::Wait => {
                            debug!("Contract {} sell order {} still open", contract.id, id)
                        }
                        OrderState::Done => {
                            info!("Contract {} sell order {} filled while down", contract.id, id);
                            let sell_price = status.price.unwrap_or(contract.target_price);
                            self.handle_sell_fill_locked(&mut inner, contract, sell_price)
                                .await?;
                            report.closed += 1;
                        }
                        OrderState::Cancel => {
                            warn!(
                                "Contract {} sell order {} was cancelled, re-placing",
                                contract.id, id
                            );
                            self.repair_sell_order(contract).await?;
                            report.repaired += 1;
                        }
                    },
                },
            }
        }

        // 2. Reload the last grid configuration, if any.
        if let Some(raw) = self.ledger.get_config(LAST_GRID_CONFIG_KEY).await? {
            match serde_json::from_str::<GridConfig>(&raw) {
                Ok(config) if config.validate().is_ok() => {
                    // 3. Re-adopt open bids that are not yet contracts.
                    let open = self.exchange.open_orders(&config.market).await?;
                    for order in open {
                        if order.side != OrderSide::Bid {
                            continue;
                        }
                        if inner.pending_buys.contains_key(&order.id) {
                            continue;
                        }
                        if self.ledger.exists_by_buy_order_id(&order.id).await? {
                            continue;
                        }
                        if let Some(price) = order.price {
                            inner.pending_buys.insert(order.id, price);
                            report.adopted_pending += 1;
                        }
                    }

                    if report.adopted_pending > 0 {
                        let mut prices: Vec<Decimal> =
                            inner.pending_buys.values().copied().collect();
                        prices.sort();
                        prices.dedup_by(|a, b| grid::prices_match(*a, *b));
                        info!(
                            "✅ Recovered {} pending buy order(s) at {:?}",
                            report.adopted_pending, prices
                        );
                    }

                    inner.config = Some(config);
                }
                Ok(config) => {
                    warn!("Stored grid config failed validation, ignoring: {:?}", config)
                }
                Err(e) => warn!("Stored grid config is not valid JSON, ignoring: {}", e),
            }
        }

        inner.recovered = true;
        info!(
            "Recovery complete: {} closed, {} repaired, {} pending adopted",
            report.closed, report.repaired, report.adopted_pending
        );
        Ok(report)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Validate the configuration, place the initial buy ladder and launch
    /// the monitor. Refuses unless the engine is idle and recovered.
    pub async fn start(self: &Arc<Self>, config: GridConfig) -> Result<(), EngineError> {
        config.validate()?;

        let mut inner = self.inner.lock().await;
        if !inner.recovered {
            return Err(EngineError::NotRecovered);
        }
        if inner.lifecycle != Lifecycle::Idle {
            return Err(EngineError::NotIdle);
        }
        inner.lifecycle = Lifecycle::Starting;

        // A stale monitor from a previous run must be gone before any new
        // order is placed.
        if let Some(handle) = inner.monitor.take() {
            let _ = handle.shutdown.send(true);
            handle.task.abort();
            let _ = handle.task.await;
        }
        inner.pending_buys.clear();

        self.ledger
            .set_config(LAST_GRID_CONFIG_KEY, &serde_json::to_string(&config)?)
            .await?;

        inner.price_rx = Some(self.exchange.subscribe_price(&config.market));
        inner.config = Some(config.clone());

        if let Err(e) = self.place_initial_orders(&mut inner, &config).await {
            inner.lifecycle = Lifecycle::Idle;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move { engine.monitor_loop(shutdown_rx).await });
        inner.monitor = Some(MonitorHandle {
            task,
            shutdown: shutdown_tx,
        });
        inner.lifecycle = Lifecycle::Running;

        info!(
            "Grid engine started on {} ({} pending buy order(s))",
            config.market,
            inner.pending_buys.len()
        );
        Ok(())
    }

    /// Request monitor shutdown and return immediately. The monitor drains
    /// its current phase and flips the engine back to idle.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.price_rx = None;
        if let Some(handle) = inner.monitor.as_ref() {
            let _ = handle.shutdown.send(true);
            inner.lifecycle = Lifecycle::Stopping;
            info!("Stop requested; monitor will drain and exit");
        } else {
            inner.lifecycle = Lifecycle::Idle;
        }
    }

    // ========================================================================
    // Start-up placement
    // ========================================================================

    /// Place a buy at every free grid line at or below the market price.
    /// Lines above the market stay empty until the re-entry path seeds them.
    async fn place_initial_orders(
        &self,
        inner: &mut EngineInner,
        config: &GridConfig,
    ) -> Result<(), EngineError> {
        let price = self
            .market_price(inner, &config.market)
            .await?
            .ok_or_else(|| EngineError::NoPrice(config.market.clone()))?;

        info!("Setting up grid, market price {}", price);

        let mut taken: Vec<Decimal> = self
            .ledger
            .list_active()
            .await?
            .iter()
            .map(|c| c.buy_price)
            .collect();
        taken.extend(
            self.exchange
                .open_orders(&config.market)
                .await?
                .into_iter()
                .filter(|o| o.side == OrderSide::Bid)
                .filter_map(|o| o.price),
        );

        for line in config.grid_lines() {
            if line > price {
                continue;
            }
            if any_price_matches(taken.iter().copied(), line) {
                debug!("Skipping grid {}: already occupied", line);
                continue;
            }
            match self
                .exchange
                .place_buy(&config.market, line, config.amount_per_grid)
                .await
            {
                Ok(id) => {
                    counter!(names::ORDERS_PLACED_TOTAL).increment(1);
                    info!("Placed initial buy at {} ({})", line, id);
                    inner.pending_buys.insert(id, line);
                }
                Err(e) => warn!("Initial buy at {} rejected: {}", line, e),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Monitor loop
    // ========================================================================

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Monitor loop started");
        let mut tick: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tick += 1;
            counter!(names::MONITOR_TICKS_TOTAL).increment(1);

            let backoff = match self.run_tick(tick, &shutdown).await {
                Ok(()) => MONITOR_INTERVAL,
                Err(e) => {
                    counter!(names::MONITOR_TICK_ERRORS_TOTAL).increment(1);
                    error!("Monitor tick failed: {:#}", anyhow::Error::new(e));
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
            }
        }

        let mut inner = self.inner.lock().await;
        inner.lifecycle = Lifecycle::Idle;
        inner.monitor = None;
        info!("Monitor loop stopped");
    }

    async fn run_tick(
        &self,
        tick: u64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        self.sweep_sell_fills().await?;
        if *shutdown.borrow() {
            return Ok(());
        }
        self.sweep_buy_fills().await?;
        if *shutdown.borrow() {
            return Ok(());
        }
        self.refill_empty_grids().await?;
        if *shutdown.borrow() {
            return Ok(());
        }
        if tick % RECONCILE_EVERY_TICKS == 0 {
            self.reconcile_balances().await?;
        }
        Ok(())
    }

    /// Phase A: settle filled sells, re-place cancelled or missing ones.
    async fn sweep_sell_fills(&self) -> Result<(), EngineError> {
        for contract in self.ledger.list_active().await? {
            match contract.current_order_id.as_deref() {
                None => {
                    let _guard = self.inner.lock().await;
                    self.repair_sell_order(&contract).await?;
                }
                // The recorded id is still the buy leg: the sell was never
                // posted. A `done` here is the buy fill, not a sell fill.
                Some(id) if id == contract.buy_order_id => {
                    let _guard = self.inner.lock().await;
                    self.repair_sell_order(&contract).await?;
                }
                Some(id) => match self.exchange.order_status(id).await? {
                    None => debug!("Sell order {} not yet visible", id),
                    Some(status) => match status.state {
                        OrderState::Wait => {}
                        OrderState::Done => {
                            let sell_price = status.price.unwrap_or(contract.target_price);
                            let mut inner = self.inner.lock().await;
                            self.handle_sell_fill_locked(&mut inner, &contract, sell_price)
                                .await?;
                        }
                        OrderState::Cancel => {
                            warn!(
                                "Sell order {} of contract {} cancelled, re-placing",
                                id, contract.id
                            );
                            let _guard = self.inner.lock().await;
                            self.repair_sell_order(&contract).await?;
                        }
                    },
                },
            }
        }
        Ok(())
    }

    /// Phase B: detect buy fills through the authoritative per-order probe
    /// and the recent-fills scan as a latency hedge. Both paths funnel into
    /// the idempotent fill handler.
    async fn sweep_buy_fills(&self) -> Result<(), EngineError> {
        let pending: Vec<(String, Decimal)> = {
            let inner = self.inner.lock().await;
            inner
                .pending_buys
                .iter()
                .map(|(id, price)| (id.clone(), *price))
                .collect()
        };

        for (order_id, grid_price) in pending {
            match self.exchange.order_status(&order_id).await? {
                None => debug!("Buy order {} not yet visible", order_id),
                Some(status) => match status.state {
                    OrderState::Wait => {}
                    OrderState::Done => {
                        let price = status.price.unwrap_or(grid_price);
                        let Some(volume) = status.executed_volume.or(status.volume) else {
                            warn!("Buy order {} done without a volume, skipping", order_id);
                            continue;
                        };
                        info!("Detected buy fill: {} @ {}, vol {}", order_id, price, volume);
                        let mut inner = self.inner.lock().await;
                        self.handle_buy_fill_locked(&mut inner, &order_id, price, volume)
                            .await?;
                    }
                    OrderState::Cancel => {
                        info!("Buy order {} cancelled externally, slot reopens", order_id);
                        let mut inner = self.inner.lock().await;
                        inner.pending_buys.remove(&order_id);
                    }
                },
            }
        }

        let market = {
            let inner = self.inner.lock().await;
            inner.config.as_ref().map(|c| c.market.clone())
        };
        let Some(market) = market else {
            return Ok(());
        };

        for status in self
            .exchange
            .completed_orders(&market, RECENT_FILL_SCAN_LIMIT)
            .await?
        {
            if status.side != OrderSide::Bid || status.state != OrderState::Done {
                continue;
            }
            let mut inner = self.inner.lock().await;
            let Some(grid_price) = inner.pending_buys.get(&status.id).copied() else {
                continue;
            };
            let price = status.price.unwrap_or(grid_price);
            let Some(volume) = status.executed_volume.or(status.volume) else {
                continue;
            };
            self.handle_buy_fill_locked(&mut inner, &status.id, price, volume)
                .await?;
        }

        Ok(())
    }

    /// Phase C: re-seed grid lines that lost their order to an external
    /// cancel or a desync. The whole scan runs under the engine mutex.
    async fn refill_empty_grids(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let Some(config) = inner.config.clone() else {
            return Ok(());
        };
        let Some(price) = self.market_price(&inner, &config.market).await? else {
            return Ok(());
        };

        let active: Vec<Decimal> = self
            .ledger
            .list_active()
            .await?
            .iter()
            .map(|c| c.buy_price)
            .collect();
        let open_bids: Vec<Decimal> = self
            .exchange
            .open_orders(&config.market)
            .await?
            .into_iter()
            .filter(|o| o.side == OrderSide::Bid)
            .filter_map(|o| o.price)
            .collect();

        let candidates: Vec<Decimal> = config
            .grid_lines()
            .into_iter()
            .filter(|line| *line <= price)
            .filter(|line| {
                !any_price_matches(active.iter().copied(), *line)
                    && !any_price_matches(inner.pending_buys.values().copied(), *line)
                    && !any_price_matches(open_bids.iter().copied(), *line)
            })
            .collect();

        for line in candidates {
            info!("Found empty grid at {} (market {})", line, price);
            self.place_buy_at_line(&mut inner, &config, line, &active, &open_bids)
                .await;
        }
        Ok(())
    }

    /// Atomic-place subroutine: re-check every occupancy set immediately
    /// before placing so a grid line never carries two live buys.
    async fn place_buy_at_line(
        &self,
        inner: &mut EngineInner,
        config: &GridConfig,
        line: Decimal,
        active: &[Decimal],
        open_bids: &[Decimal],
    ) {
        if any_price_matches(active.iter().copied(), line)
            || any_price_matches(inner.pending_buys.values().copied(), line)
            || any_price_matches(open_bids.iter().copied(), line)
        {
            debug!("Grid {} occupied at placement time, rejecting", line);
            return;
        }
        match self
            .exchange
            .place_buy(&config.market, line, config.amount_per_grid)
            .await
        {
            Ok(id) => {
                counter!(names::ORDERS_PLACED_TOTAL).increment(1);
                info!("Placed refill buy at {} ({})", line, id);
                inner.pending_buys.insert(id, line);
            }
            Err(e) => warn!("Refill buy at {} rejected: {}", line, e),
        }
    }

    /// Phase D: compare the exchange base balance against the bookkept sum
    /// of active contracts and replay any buy fills both sweeps missed.
    async fn reconcile_balances(&self) -> Result<(), EngineError> {
        let Some(config) = self.inner.lock().await.config.clone() else {
            return Ok(());
        };

        let total = self.exchange.total_balance(config.base_currency()).await?;
        let active = self.ledger.list_active().await?;
        let bookkept: Decimal = active.iter().map(|c| c.buy_amount).sum();
        let gap = total - bookkept;

        if gap < rescue_gap_factor() * config.amount_per_grid {
            debug!("Balance reconciliation clean (gap {})", gap);
            return Ok(());
        }

        warn!(
            "Balance gap {} on {} (total {}, bookkept {}), scanning for missed fills",
            gap, config.market, total, bookkept
        );

        let mut budget = (gap / config.amount_per_grid)
            .floor()
            .to_u64()
            .unwrap_or(0);
        let mut rescued = 0usize;

        for status in self
            .exchange
            .completed_orders(&config.market, RESCUE_SCAN_LIMIT)
            .await?
        {
            if budget == 0 {
                break;
            }
            if status.side != OrderSide::Bid || status.state != OrderState::Done {
                continue;
            }
            if self.ledger.exists_by_buy_order_id(&status.id).await? {
                continue;
            }
            let Some(price) = status.price else { continue };
            let Some(volume) = status.executed_volume.or(status.volume) else {
                continue;
            };

            warn!("Rescuing missed buy fill {} @ {}", status.id, price);
            let mut inner = self.inner.lock().await;
            self.handle_buy_fill_locked(&mut inner, &status.id, price, volume)
                .await?;
            counter!(names::RESCUED_FILLS_TOTAL).increment(1);
            rescued += 1;
            budget -= 1;
        }

        if rescued > 0 {
            self.notify(Notification::Rescue {
                market: config.market.clone(),
                rescued,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Fill handlers
    // ========================================================================

    /// Open a contract for a filled buy and post its take-profit sell.
    /// Replays of the same order id are dropped by the ledger's unique
    /// buy-order-id check.
    async fn handle_buy_fill_locked(
        &self,
        inner: &mut EngineInner,
        order_id: &str,
        price: Decimal,
        volume: Decimal,
    ) -> Result<(), EngineError> {
        if self.ledger.exists_by_buy_order_id(order_id).await? {
            debug!("Contract for buy order {} already exists, skipping", order_id);
            inner.pending_buys.remove(order_id);
            return Ok(());
        }
        if volume <= Decimal::ZERO {
            warn!("Buy fill {} reported non-positive volume {}", order_id, volume);
            return Ok(());
        }

        let config = inner.config.clone().ok_or(EngineError::NotConfigured)?;
        let target_price = price + config.profit_interval;

        let contract_id = match self
            .ledger
            .create_contract(&NewContract {
                market: config.market.clone(),
                buy_price: price,
                buy_amount: volume,
                target_price,
                buy_order_id: order_id.to_string(),
                // Provisional until the sell leg is accepted.
                current_order_id: Some(order_id.to_string()),
            })
            .await
        {
            Ok(id) => id,
            Err(LedgerError::DuplicateBuyOrderId(_)) => {
                inner.pending_buys.remove(order_id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        inner.pending_buys.remove(order_id);
        counter!(names::BUY_FILLS_TOTAL).increment(1);
        info!("Created contract {} for buy order {}", contract_id, order_id);

        self.ledger
            .append_trade(&NewTrade {
                contract_id,
                kind: TradeKind::Buy,
                price,
                amount: volume,
                fee: Decimal::ZERO,
                profit: Decimal::ZERO,
            })
            .await?;

        self.notify(Notification::BuyFilled {
            contract_id,
            market: config.market.clone(),
            price,
            amount: volume,
        });

        match self
            .exchange
            .place_sell(&config.market, target_price, volume)
            .await
        {
            Ok(sell_id) => {
                counter!(names::ORDERS_PLACED_TOTAL).increment(1);
                self.ledger
                    .update_current_order_id(contract_id, Some(&sell_id))
                    .await?;
                info!("Posted sell for contract {} at {} ({})", contract_id, target_price, sell_id);
            }
            Err(e) => {
                error!("Sell for contract {} failed: {}", contract_id, e);
                // Clear the provisional buy id so the sweep re-places
                // instead of misreading the filled buy as a sell fill.
                self.ledger
                    .update_current_order_id(contract_id, None)
                    .await?;
            }
        }

        Ok(())
    }

    /// Close a contract whose sell filled, record the settlement, and
    /// re-seed the grid line with a fresh buy at the original level.
    async fn handle_sell_fill_locked(
        &self,
        inner: &mut EngineInner,
        contract: &Contract,
        sell_price: Decimal,
    ) -> Result<(), EngineError> {
        let profit = (sell_price - contract.buy_price) * contract.buy_amount;
        let profit_rate = (sell_price - contract.buy_price) / contract.buy_price;

        let closed = self
            .ledger
            .close_contract(contract.id, sell_price, profit, profit_rate, Utc::now())
            .await?;
        if !closed {
            debug!("Contract {} already closed, skipping", contract.id);
            return Ok(());
        }
        counter!(names::SELL_FILLS_TOTAL).increment(1);
        info!("Closed contract {} with profit {}", contract.id, profit);

        self.ledger
            .append_trade(&NewTrade {
                contract_id: contract.id,
                kind: TradeKind::Sell,
                price: sell_price,
                amount: contract.buy_amount,
                fee: Decimal::ZERO,
                profit,
            })
            .await?;

        self.notify(Notification::TakeProfit {
            contract_id: contract.id,
            market: contract.market.clone(),
            sell_price,
            profit,
            profit_rate,
        });

        match self
            .exchange
            .place_buy(&contract.market, contract.buy_price, contract.buy_amount)
            .await
        {
            Ok(id) => {
                counter!(names::ORDERS_PLACED_TOTAL).increment(1);
                info!("Re-entry buy placed at {} ({})", contract.buy_price, id);
                inner.pending_buys.insert(id, contract.buy_price);
            }
            Err(e) => error!("Re-entry buy at {} failed: {}", contract.buy_price, e),
        }

        Ok(())
    }

    /// Post (or re-post) the take-profit sell for a contract whose sell leg
    /// is missing or dead, then record the new id.
    async fn repair_sell_order(&self, contract: &Contract) -> Result<(), EngineError> {
        match self
            .exchange
            .place_sell(&contract.market, contract.target_price, contract.buy_amount)
            .await
        {
            Ok(sell_id) => {
                counter!(names::ORDERS_PLACED_TOTAL).increment(1);
                info!(
                    "Re-placed sell for contract {} at {} ({})",
                    contract.id, contract.target_price, sell_id
                );
                self.ledger
                    .update_current_order_id(contract.id, Some(&sell_id))
                    .await?;
            }
            Err(e) => {
                warn!("Re-placing sell for contract {} failed: {}", contract.id, e);
                self.ledger
                    .update_current_order_id(contract.id, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Latest websocket tick when the stream is live, REST otherwise.
    async fn market_price(
        &self,
        inner: &EngineInner,
        market: &str,
    ) -> Result<Option<Decimal>, EngineError> {
        if let Some(rx) = &inner.price_rx {
            if let Some(price) = *rx.borrow() {
                return Ok(Some(price));
            }
        }
        Ok(self.exchange.current_price(market).await?)
    }
}
