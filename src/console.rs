//! Operator Console
//!
//! Transport-agnostic control surface: START / STOP / STATUS / REPORT plus
//! the notification subscription. The chat front end holds a `Console` and
//! renders whatever these operations return; nothing here knows about the
//! transport.

#![allow(dead_code)]

use rust_decimal::Decimal;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;

use crate::db::{Ledger, LedgerError};
use crate::engine::grid::GridConfig;
use crate::engine::{EngineError, GridEngine};
use crate::exchange::{ExchangeApi, ExchangeError};
use crate::models::Contract;
use crate::notify::Notification;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Readable funds estimate shown before a grid starts: roughly the average
/// grid price times the per-grid amount times the number of lines.
#[derive(Debug, Clone)]
pub struct FundsCheck {
    pub required: Decimal,
    pub balance: Decimal,
    pub currency: String,
    pub sufficient: bool,
}

impl FundsCheck {
    pub fn evaluate(config: &GridConfig, balance: Decimal) -> Self {
        let average_price = (config.min_price + config.max_price) / Decimal::TWO;
        let required =
            average_price * config.amount_per_grid * Decimal::from(config.grid_count() as u64);
        Self {
            required,
            balance,
            currency: config.quote_currency().to_string(),
            sufficient: balance >= required,
        }
    }

    pub fn render(&self) -> String {
        let verdict = if self.sufficient {
            "✅ Funds are sufficient.".to_string()
        } else {
            format!(
                "❌ Funds are short by {} {}.",
                self.required - self.balance,
                self.currency
            )
        };
        format!(
            "[Funds check]\n- required (est): {} {}\n- held: {} {}\n{}",
            self.required, self.currency, self.balance, self.currency, verdict
        )
    }
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub funds: FundsCheck,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub running: bool,
    pub market: Option<String>,
    pub current_price: Option<Decimal>,
    pub active_contracts: usize,
    pub pending_buys: usize,
    pub pending_prices: Vec<Decimal>,
    pub average_entry_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub realized_profit: Decimal,
    pub sell_trade_count: i64,
}

/// One row of the closed-contract report.
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub contract_id: i64,
    pub buy_price: Decimal,
    pub sell_price: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub profit_rate: Option<Decimal>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Contract> for ReportRow {
    fn from(contract: Contract) -> Self {
        Self {
            contract_id: contract.id,
            buy_price: contract.buy_price,
            sell_price: contract.sell_price,
            profit: contract.profit,
            profit_rate: contract.profit_rate,
            finished_at: contract.finished_at,
        }
    }
}

pub struct Console {
    engine: Arc<GridEngine>,
    ledger: Ledger,
    exchange: Arc<dyn ExchangeApi>,
}

impl Console {
    pub fn new(engine: Arc<GridEngine>, ledger: Ledger, exchange: Arc<dyn ExchangeApi>) -> Self {
        Self {
            engine,
            ledger,
            exchange,
        }
    }

    /// Validate, run the funds check and start the grid. A shortfall is
    /// reported but does not block the start; self-healing converges once
    /// funds arrive.
    pub async fn start(&self, config: GridConfig) -> Result<StartOutcome, ConsoleError> {
        config.validate().map_err(EngineError::from)?;

        let balance = self.exchange.free_balance(config.quote_currency()).await?;
        let funds = FundsCheck::evaluate(&config, balance);
        if !funds.sufficient {
            warn!("Starting despite shortfall: {}", funds.render());
        }

        self.engine.start(config).await?;

        let message = format!("{}\nTrading system started.", funds.render());
        Ok(StartOutcome { funds, message })
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ConsoleError> {
        let snapshot = self.engine.snapshot().await;
        let market = snapshot.config.as_ref().map(|c| c.market.clone());

        let current_price = match (snapshot.latest_price, &market) {
            (Some(price), _) => Some(price),
            (None, Some(market)) => self.exchange.current_price(market).await.ok().flatten(),
            (None, None) => None,
        };

        let active = self.ledger.list_active().await?;
        let profit = self.ledger.realized_profit_summary().await?;

        let mut pending_prices: Vec<Decimal> =
            snapshot.pending.iter().map(|(_, price)| *price).collect();
        pending_prices.sort();
        pending_prices.dedup();

        let average_entry_price = if active.is_empty() {
            None
        } else {
            let sum: Decimal = active.iter().map(|c| c.buy_price).sum();
            Some(sum / Decimal::from(active.len() as u64))
        };
        let unrealized_pnl = current_price.map(|price| {
            active
                .iter()
                .map(|c| (price - c.buy_price) * c.buy_amount)
                .sum()
        });

        Ok(StatusSnapshot {
            running: snapshot.running(),
            market,
            current_price,
            active_contracts: active.len(),
            pending_buys: snapshot.pending.len(),
            pending_prices,
            average_entry_price,
            unrealized_pnl,
            realized_profit: profit.total_profit,
            sell_trade_count: profit.sell_count,
        })
    }

    /// Last `limit` closed contracts, newest first.
    pub async fn report(&self, limit: i64) -> Result<Vec<ReportRow>, ConsoleError> {
        let closed = self.ledger.list_closed(limit).await?;
        Ok(closed.into_iter().map(ReportRow::from).collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.engine.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> GridConfig {
        GridConfig {
            market: "KRW-USDT".to_string(),
            min_price: dec!(1400),
            max_price: dec!(1500),
            grid_interval: dec!(20),
            amount_per_grid: dec!(5),
            profit_interval: dec!(5),
        }
    }

    #[test]
    fn test_funds_check_required_amount() {
        // ((1400 + 1500) / 2) * 5 * 6 grid lines
        let funds = FundsCheck::evaluate(&config(), dec!(50000));
        assert_eq!(funds.required, dec!(43500));
        assert_eq!(funds.currency, "KRW");
        assert!(funds.sufficient);
    }

    #[test]
    fn test_funds_check_shortfall() {
        let funds = FundsCheck::evaluate(&config(), dec!(40000));
        assert!(!funds.sufficient);
        let rendered = funds.render();
        assert!(rendered.contains("short by 3500 KRW"));
        assert!(rendered.contains("required (est): 43500 KRW"));
    }

    #[test]
    fn test_report_row_from_contract() {
        let contract = Contract {
            id: 3,
            market: "KRW-USDT".to_string(),
            buy_price: dec!(1420),
            buy_amount: dec!(5),
            target_price: dec!(1425),
            status: crate::models::ContractStatus::Closed,
            buy_order_id: "buy-1".to_string(),
            current_order_id: Some("sell-1".to_string()),
            created_at: Utc::now(),
            sell_price: Some(dec!(1425)),
            profit: Some(dec!(25)),
            profit_rate: Some(dec!(5) / dec!(1420)),
            finished_at: Some(Utc::now()),
        };

        let row = ReportRow::from(contract);
        assert_eq!(row.contract_id, 3);
        assert_eq!(row.sell_price, Some(dec!(1425)));
        assert_eq!(row.profit, Some(dec!(25)));
    }
}
