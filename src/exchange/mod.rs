//! Exchange Client
//!
//! The only component that speaks the exchange protocol. The engine consumes
//! the [`ExchangeApi`] trait so tests can substitute a scripted exchange.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub mod upbit;
pub mod ws;

pub use upbit::UpbitClient;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("exchange api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("auth error: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Wait,
    Done,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy order.
    Bid,
    /// Sell order.
    Ask,
}

/// One order as reported by the exchange. Prices and volumes come over the
/// wire as strings and stay `None` when the exchange omits them.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderInfo {
    #[serde(rename = "uuid")]
    pub id: String,
    pub side: OrderSide,
    pub state: OrderState,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub volume: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub executed_volume: Option<Decimal>,
}

/// Split a `QUOTE-BASE` market code, e.g. `KRW-USDT` -> (`KRW`, `USDT`).
pub fn market_currencies(market: &str) -> Option<(&str, &str)> {
    market.split_once('-')
}

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Latest trade price, or `None` when the market has no ticker yet.
    async fn current_price(&self, market: &str) -> Result<Option<Decimal>, ExchangeError>;

    /// Place a limit buy; returns the exchange-assigned order id on accept.
    async fn place_buy(
        &self,
        market: &str,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String, ExchangeError>;

    /// Place a limit sell; returns the exchange-assigned order id on accept.
    async fn place_sell(
        &self,
        market: &str,
        price: Decimal,
        volume: Decimal,
    ) -> Result<String, ExchangeError>;

    /// Cancel by order id. `false` when the exchange does not know the id.
    async fn cancel(&self, order_id: &str) -> Result<bool, ExchangeError>;

    /// Single-order lookup. `None` when the id is not (yet) visible.
    async fn order_status(&self, order_id: &str) -> Result<Option<OrderInfo>, ExchangeError>;

    /// All open (`wait`) orders on the market.
    async fn open_orders(&self, market: &str) -> Result<Vec<OrderInfo>, ExchangeError>;

    /// Most recent completed (`done`) orders, newest first, up to `limit`.
    async fn completed_orders(
        &self,
        market: &str,
        limit: u32,
    ) -> Result<Vec<OrderInfo>, ExchangeError>;

    /// Available (unlocked) balance of a currency.
    async fn free_balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;

    /// Available plus locked balance of a currency.
    async fn total_balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;

    /// Streaming trade-price subscription. The returned channel carries the
    /// latest observed price; the underlying connection reconnects forever
    /// until every receiver is dropped.
    fn subscribe_price(&self, market: &str) -> watch::Receiver<Option<Decimal>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_currencies() {
        assert_eq!(market_currencies("KRW-USDT"), Some(("KRW", "USDT")));
        assert_eq!(market_currencies("KRW-BTC"), Some(("KRW", "BTC")));
        assert_eq!(market_currencies("KRW"), None);
    }

    #[test]
    fn test_order_info_deserialize() {
        let raw = r#"{
            "uuid": "cdd92199-2897-4e14-9448-f923320408ad",
            "side": "bid",
            "ord_type": "limit",
            "price": "1420.0",
            "state": "done",
            "market": "KRW-USDT",
            "volume": "5.0",
            "remaining_volume": "0.0",
            "executed_volume": "5.0"
        }"#;

        let info: OrderInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.id, "cdd92199-2897-4e14-9448-f923320408ad");
        assert_eq!(info.side, OrderSide::Bid);
        assert_eq!(info.state, OrderState::Done);
        assert_eq!(info.price, Some(dec!(1420.0)));
        assert_eq!(info.executed_volume, Some(dec!(5.0)));
    }

    #[test]
    fn test_order_info_missing_price() {
        let raw = r#"{"uuid": "x", "side": "ask", "state": "wait"}"#;
        let info: OrderInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.price, None);
        assert_eq!(info.volume, None);
    }
}
