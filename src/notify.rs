//! Operator Notifications
//!
//! Typed events rendered to human-readable text. The engine fans these out
//! on a broadcast channel; whatever transport the operator console uses
//! subscribes and forwards them.

use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone)]
pub enum Notification {
    /// A grid buy filled and a contract was opened.
    BuyFilled {
        contract_id: i64,
        market: String,
        price: Decimal,
        amount: Decimal,
    },
    /// A take-profit sell filled and the contract closed.
    TakeProfit {
        contract_id: i64,
        market: String,
        sell_price: Decimal,
        profit: Decimal,
        profit_rate: Decimal,
    },
    /// Self-healing reconciliation replayed missed buy fills.
    Rescue { market: String, rescued: usize },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::BuyFilled {
                contract_id,
                market,
                price,
                amount,
            } => write!(
                f,
                "🔔 Buy filled on {market}: {amount} @ {price} (contract #{contract_id})"
            ),
            Notification::TakeProfit {
                contract_id,
                market,
                sell_price,
                profit,
                profit_rate,
            } => {
                let percent = *profit_rate * Decimal::ONE_HUNDRED;
                write!(
                    f,
                    "💰 Take-profit on {market}: sold @ {sell_price}, profit {profit} ({percent:.2}%) (contract #{contract_id})"
                )
            }
            Notification::Rescue { market, rescued } => write!(
                f,
                "🛠 Self-healing on {market}: rescued {rescued} missed buy fill(s)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_render_take_profit() {
        let text = Notification::TakeProfit {
            contract_id: 7,
            market: "KRW-USDT".to_string(),
            sell_price: dec!(1425),
            profit: dec!(25),
            profit_rate: dec!(0.00352),
        }
        .to_string();

        assert!(text.contains("KRW-USDT"));
        assert!(text.contains("1425"));
        assert!(text.contains("25"));
        assert!(text.contains("#7"));
    }

    #[test]
    fn test_render_rescue() {
        let text = Notification::Rescue {
            market: "KRW-USDT".to_string(),
            rescued: 2,
        }
        .to_string();
        assert!(text.contains("rescued 2"));
    }
}
