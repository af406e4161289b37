//! Grid Configuration & Price-Line Arithmetic
//!
//! The grid is the finite arithmetic sequence `min + k * interval <= max`.
//! Stored prices and freshly computed lines are compared through a fixed
//! epsilon in quote-currency units because they travel through text columns
//! and wire strings on the way back.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::market_currencies;

/// Two prices within this distance (quote units) occupy the same grid line.
pub fn price_epsilon() -> Decimal {
    Decimal::new(1, 4)
}

/// Epsilon equality for grid-line occupancy checks.
pub fn prices_match(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() < price_epsilon()
}

/// True when any price in `prices` sits on the grid line `target`.
pub fn any_price_matches<I>(prices: I, target: Decimal) -> bool
where
    I: IntoIterator<Item = Decimal>,
{
    prices.into_iter().any(|p| prices_match(p, target))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GridConfigError {
    #[error("market must be a QUOTE-BASE code, got: {0}")]
    BadMarket(String),

    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("min_price must be below max_price")]
    InvertedRange,
}

/// Active grid parameters. Persisted to the ledger as a JSON document on
/// start and validated again when loaded back during recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub market: String,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub grid_interval: Decimal,
    pub amount_per_grid: Decimal,
    pub profit_interval: Decimal,
}

impl GridConfig {
    pub fn validate(&self) -> Result<(), GridConfigError> {
        if market_currencies(&self.market).is_none() {
            return Err(GridConfigError::BadMarket(self.market.clone()));
        }
        if self.grid_interval <= Decimal::ZERO {
            return Err(GridConfigError::NonPositive("grid_interval"));
        }
        if self.amount_per_grid <= Decimal::ZERO {
            return Err(GridConfigError::NonPositive("amount_per_grid"));
        }
        if self.profit_interval <= Decimal::ZERO {
            return Err(GridConfigError::NonPositive("profit_interval"));
        }
        if self.min_price >= self.max_price {
            return Err(GridConfigError::InvertedRange);
        }
        Ok(())
    }

    /// All grid lines, ascending.
    pub fn grid_lines(&self) -> Vec<Decimal> {
        let mut lines = Vec::new();
        let mut price = self.min_price;
        while price <= self.max_price {
            lines.push(price);
            price += self.grid_interval;
        }
        lines
    }

    pub fn grid_count(&self) -> usize {
        self.grid_lines().len()
    }

    pub fn quote_currency(&self) -> &str {
        market_currencies(&self.market).map(|(q, _)| q).unwrap_or("")
    }

    pub fn base_currency(&self) -> &str {
        market_currencies(&self.market).map(|(_, b)| b).unwrap_or("")
    }
}
